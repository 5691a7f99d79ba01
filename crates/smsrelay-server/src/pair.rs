//! Coupled lifecycle for the WebSocket hub and its status responder.
//!
//! The two listeners form one unit: either both are serving or neither is.
//! A status bind failure therefore tears the freshly started hub back down
//! instead of leaving a half-started service running.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::info;

use smsrelay_core::StartError;

use crate::config::RelayConfig;
use crate::hub::{self, BroadcastHub, HubHandle};
use crate::status::{self, LocalAddrResolver, StatusHandle};

struct RunningPair {
    port: u16,
    hub_handle: HubHandle,
    status_handle: StatusHandle,
}

/// The relay's two listeners plus the shared hub, managed as a single
/// start/stop unit. The hub instance survives restarts; only the listeners
/// and the registry contents are torn down.
pub struct ServerPair {
    hub: Arc<BroadcastHub>,
    resolver: Arc<dyn LocalAddrResolver>,
    config: RelayConfig,
    running: AtomicBool,
    inner: Mutex<Option<RunningPair>>,
}

impl ServerPair {
    /// Pair that will serve with `config`, advertising addresses from
    /// `resolver` on the status page.
    pub fn new(config: RelayConfig, resolver: Arc<dyn LocalAddrResolver>) -> Self {
        let hub = Arc::new(BroadcastHub::new(config.send_queue_capacity));
        Self {
            hub,
            resolver,
            config,
            running: AtomicBool::new(false),
            inner: Mutex::new(None),
        }
    }

    /// Shared broadcast hub. Valid across restarts.
    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    /// Whether both listeners are currently up. Never blocks; safe to call
    /// from liveness checks while a start or stop is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start both listeners on `port` and `port + 1`, returning the event
    /// port that was actually bound. An already running pair is stopped
    /// first, so this doubles as a restart.
    ///
    /// On any bind failure nothing is left running and `is_running` stays
    /// `false`.
    pub async fn start(&self, port: u16) -> Result<u16, StartError> {
        let mut guard = self.inner.lock().await;
        if let Some(prev) = guard.take() {
            self.running.store(false, Ordering::SeqCst);
            self.shutdown_running(prev).await;
        }

        let mut effective = RelayConfig {
            port,
            ..self.config.clone()
        };
        let hub_handle = hub::start(self.hub(), &effective).await?;
        // Advertise the port that was actually bound, which matters when an
        // ephemeral port was requested.
        effective.port = hub_handle.local_addr().port();

        let status_handle =
            match status::start(self.hub(), Arc::clone(&self.resolver), &effective).await {
                Ok(handle) => handle,
                Err(err) => {
                    hub_handle.shutdown(self.config.shutdown_timeout()).await;
                    self.hub.disconnect_all();
                    return Err(err);
                }
            };

        let port = effective.port;
        *guard = Some(RunningPair {
            port,
            hub_handle,
            status_handle,
        });
        self.running.store(true, Ordering::SeqCst);
        info!(port, status_port = port.saturating_add(1), "server pair started");
        Ok(port)
    }

    /// Stop both listeners and drop every subscriber. Stopping an already
    /// stopped pair does nothing.
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        let Some(running) = guard.take() else {
            self.running.store(false, Ordering::SeqCst);
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_running(running).await;
    }

    async fn shutdown_running(&self, running: RunningPair) {
        running
            .hub_handle
            .shutdown(self.config.shutdown_timeout())
            .await;
        running
            .status_handle
            .shutdown(self.config.status_join_timeout())
            .await;
        self.hub.disconnect_all();
        info!(port = running.port, "server pair stopped");
    }
}
