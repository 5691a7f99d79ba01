//! Liveness supervision for the server pair.
//!
//! A periodic heartbeat checks the pair's health flag and restarts a dead
//! pair on its configured port. Connectivity-restored notifications trigger
//! the same check out of band, throttled to one attempt per window so
//! flapping networks cannot cause a restart storm. Heartbeat-driven checks
//! are paced by the heartbeat interval alone and skip the throttle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use smsrelay_core::StartError;

use crate::config::RelayConfig;
use crate::hub::BroadcastHub;
use crate::pair::ServerPair;
use crate::status::LocalAddrResolver;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No listeners; nothing is being watched.
    Stopped,
    /// Pair confirmed up at the last transition.
    Running,
    /// Pair detected down; a restart is pending or has failed and will be
    /// retried on the next trigger.
    Degraded,
}

struct ControlState {
    state: SupervisorState,
    port: Option<u16>,
}

struct Core {
    pair: Arc<ServerPair>,
    /// Serializes start, stop, and every restart check. Held across the
    /// awaits inside those operations, hence an async mutex.
    lifecycle: tokio::sync::Mutex<()>,
    control: Mutex<ControlState>,
    last_connectivity_trigger: Mutex<Option<Instant>>,
    restart_attempts: AtomicU64,
    connectivity_throttle: Duration,
}

struct HeartbeatTask {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Watches a [`ServerPair`] and brings it back up when it dies.
pub struct Supervisor {
    core: Arc<Core>,
    heartbeat_interval: Duration,
    heartbeat: Mutex<Option<HeartbeatTask>>,
}

impl Supervisor {
    /// Supervisor for a new pair serving with `config`.
    pub fn new(config: RelayConfig, resolver: Arc<dyn LocalAddrResolver>) -> Self {
        let heartbeat_interval = config.heartbeat_interval();
        let connectivity_throttle = config.connectivity_throttle();
        let pair = Arc::new(ServerPair::new(config, resolver));
        Self {
            core: Arc::new(Core {
                pair,
                lifecycle: tokio::sync::Mutex::new(()),
                control: Mutex::new(ControlState {
                    state: SupervisorState::Stopped,
                    port: None,
                }),
                last_connectivity_trigger: Mutex::new(None),
                restart_attempts: AtomicU64::new(0),
                connectivity_throttle,
            }),
            heartbeat_interval,
            heartbeat: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.core.control.lock().state
    }

    /// Total restart attempts made so far, successful or not.
    pub fn restarts_attempted(&self) -> u64 {
        self.core.restart_attempts.load(Ordering::Relaxed)
    }

    /// Broadcast hub of the supervised pair.
    pub fn hub(&self) -> Arc<BroadcastHub> {
        self.core.pair.hub()
    }

    /// The supervised pair itself.
    pub fn pair(&self) -> Arc<ServerPair> {
        Arc::clone(&self.core.pair)
    }

    /// Start the pair on `port` and begin heartbeat supervision. A second
    /// start while not `Stopped` is a no-op. If the pair fails to come up
    /// the state stays `Stopped` and the error is returned to the caller.
    pub async fn start(&self, port: u16) -> Result<(), StartError> {
        let _guard = self.core.lifecycle.lock().await;
        if self.core.control.lock().state != SupervisorState::Stopped {
            debug!("start requested while already running");
            return Ok(());
        }

        let bound = self.core.pair.start(port).await?;
        {
            let mut control = self.core.control.lock();
            control.state = SupervisorState::Running;
            control.port = Some(bound);
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(
            Arc::clone(&self.core),
            self.heartbeat_interval,
            token.clone(),
        ));
        *self.heartbeat.lock() = Some(HeartbeatTask { token, task });
        info!(port = bound, "supervisor running");
        Ok(())
    }

    /// Stop supervision and the pair. Idempotent: stopping twice leaves the
    /// same `Stopped` end state with no error.
    pub async fn stop(&self) {
        // Wind the heartbeat down before taking the lifecycle lock; an
        // in-flight check holds that lock and must be allowed to finish.
        let hb = self.heartbeat.lock().take();
        if let Some(hb) = hb {
            hb.token.cancel();
            let _ = hb.task.await;
        }

        let guard = self.core.lifecycle.lock().await;
        // A start racing the take above may have stored a fresh heartbeat
        // while we waited for the lock. Cancel it while still holding the
        // lock; the join has to wait until the lock is released because the
        // heartbeat's final check may be queued on this same lock.
        let late = self.heartbeat.lock().take();
        if let Some(hb) = &late {
            hb.token.cancel();
        }

        let was_running = {
            let mut control = self.core.control.lock();
            let was_running = control.state != SupervisorState::Stopped;
            control.state = SupervisorState::Stopped;
            control.port = None;
            was_running
        };
        if was_running {
            self.core.pair.stop().await;
            info!("supervisor stopped");
        }
        drop(guard);

        if let Some(hb) = late {
            let _ = hb.task.await;
        }
    }

    /// Stop and immediately re-start the pair on its last port. While
    /// `Stopped` this is a no-op that leaves the state unchanged.
    pub async fn restart(&self) -> Result<(), StartError> {
        let _guard = self.core.lifecycle.lock().await;
        let port = {
            let control = self.core.control.lock();
            if control.state == SupervisorState::Stopped {
                None
            } else {
                control.port
            }
        };
        let Some(port) = port else {
            debug!("restart requested while stopped, ignoring");
            return Ok(());
        };
        self.core.restart_on(port).await
    }

    /// Notification hook for the environment's connectivity-restored
    /// signal. Schedules a liveness check on the runtime unless one was
    /// already triggered this way within the throttle window.
    pub fn on_connectivity_restored(&self) {
        let now = Instant::now();
        {
            let mut last = self.core.last_connectivity_trigger.lock();
            let throttled =
                last.is_some_and(|prev| now.duration_since(prev) < self.core.connectivity_throttle);
            if throttled {
                debug!("connectivity restart suppressed by throttle");
                return;
            }
            *last = Some(now);
        }

        info!("connectivity restored, checking server liveness");
        let core = Arc::clone(&self.core);
        tokio::spawn(async move { core.check_and_restart().await });
    }
}

impl Core {
    /// One liveness check: if the pair reports dead while we are supposed
    /// to be running, mark `Degraded` and attempt a restart on the stored
    /// port. Serialized with start/stop via the lifecycle lock.
    async fn check_and_restart(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.pair.is_running() {
            debug!("liveness check passed");
            return;
        }

        let port = {
            let mut control = self.control.lock();
            if control.state == SupervisorState::Stopped {
                return;
            }
            control.state = SupervisorState::Degraded;
            control.port
        };
        let Some(port) = port else { return };
        warn!(port, "server pair found dead, restarting");
        let _ = self.restart_on(port).await;
    }

    /// Stop-then-start on `port`. Caller must hold the lifecycle lock.
    async fn restart_on(&self, port: u16) -> Result<(), StartError> {
        self.restart_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("smsrelay_restarts_total").increment(1);

        self.pair.stop().await;
        match self.pair.start(port).await {
            Ok(bound) => {
                let mut control = self.control.lock();
                control.state = SupervisorState::Running;
                control.port = Some(bound);
                info!(port = bound, "server pair restarted");
                Ok(())
            }
            Err(err) => {
                self.control.lock().state = SupervisorState::Degraded;
                error!(error = %err, "restart failed, retrying on next trigger");
                Err(err)
            }
        }
    }
}

/// Periodic liveness timer. The interval's immediate initial tick is
/// consumed up front, so the first check fires one full interval after
/// start.
async fn run_heartbeat(core: Arc<Core>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => core.check_and_restart().await,
        }
    }
    debug!("heartbeat task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use crate::status::FixedAddr;

    fn idle_supervisor() -> Arc<Supervisor> {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            ..RelayConfig::default()
        };
        Arc::new(Supervisor::new(
            config,
            Arc::new(FixedAddr(IpAddr::V4(Ipv4Addr::LOCALHOST))),
        ))
    }

    #[tokio::test]
    async fn stop_cancels_a_heartbeat_stored_while_it_waited() {
        let supervisor = idle_supervisor();

        // Hold the lifecycle lock so stop parks after its first slot take.
        let guard = supervisor.core.lifecycle.lock().await;
        let stopper = Arc::clone(&supervisor);
        let stop_task = tokio::spawn(async move { stopper.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // What a start finishing just ahead of stop's lock acquisition
        // leaves behind.
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        *supervisor.heartbeat.lock() = Some(HeartbeatTask {
            token: token.clone(),
            task,
        });

        drop(guard);
        stop_task.await.expect("stop task panicked");

        assert!(token.is_cancelled(), "late stored heartbeat kept running");
        assert!(supervisor.heartbeat.lock().is_none());
    }
}
