//! Plain-HTTP status responder on the companion port (event port + 1).
//!
//! Serves a single self-refreshing HTML page: connection details, the
//! current subscriber count, and an inline script that joins the WebSocket
//! feed and renders relayed messages live. Deliberately not a full HTTP
//! stack; one request line is read, headers are drained, and a fixed 200
//! response goes back on every request.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use smsrelay_core::{ConnectionError, FaultKind, StartError};

use crate::config::RelayConfig;
use crate::hub::BroadcastHub;

/// Pause after a failed accept. Keeps a persistent failure, fd exhaustion
/// for instance, from spinning the loop hot.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Source of the address advertised on the status page.
///
/// The responder queries this on every request so the page follows network
/// changes without a restart.
pub trait LocalAddrResolver: Send + Sync {
    /// Best-effort outward-facing IP. `None` falls back to loopback.
    fn local_ip(&self) -> Option<IpAddr>;
}

/// Resolver that always reports the same address.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddr(pub IpAddr);

impl LocalAddrResolver for FixedAddr {
    fn local_ip(&self) -> Option<IpAddr> {
        Some(self.0)
    }
}

#[derive(Clone)]
struct StatusContext {
    hub: Arc<BroadcastHub>,
    resolver: Arc<dyn LocalAddrResolver>,
    event_port: u16,
    accept_wait: Duration,
    request_timeout: Duration,
}

/// Running status responder. Stop it with [`StatusHandle::shutdown`].
#[derive(Debug)]
pub struct StatusHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusHandle {
    /// Address the responder actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop, waiting at most `join_timeout` for it to wind
    /// down before aborting it.
    pub async fn shutdown(mut self, join_timeout: Duration) {
        self.shutdown.cancel();
        match tokio::time::timeout(join_timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "status responder task failed"),
            Err(_) => {
                warn!("status responder did not stop in time, aborting");
                self.task.abort();
            }
        }
    }
}

/// Bind the companion port and start answering status requests.
///
/// `config.port` is the event port the page advertises; the responder itself
/// listens one above it.
pub async fn start(
    hub: Arc<BroadcastHub>,
    resolver: Arc<dyn LocalAddrResolver>,
    config: &RelayConfig,
) -> Result<StatusHandle, StartError> {
    let port = config.status_port();
    let addr = format!("{}:{}", config.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| StartError::from_bind(port, err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| StartError::from_bind(port, err))?;

    let ctx = StatusContext {
        hub,
        resolver,
        event_port: config.port,
        accept_wait: config.status_accept_wait(),
        request_timeout: config.status_request_timeout(),
    };
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

    info!(addr = %local_addr, "status page listening");
    Ok(StatusHandle {
        local_addr,
        shutdown,
        task,
    })
}

/// Where the accept loop takes connections from.
trait Accept {
    async fn next_conn(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

impl Accept for TcpListener {
    async fn next_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.accept().await
    }
}

/// Accept connections until cancelled. Accept waits are bounded so a stop
/// request is observed within one `accept_wait` window at worst.
async fn accept_loop(listener: impl Accept, ctx: StatusContext, token: CancellationToken) {
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            accepted = tokio::time::timeout(ctx.accept_wait, listener.next_conn()) => {
                match accepted {
                    Err(_) => {}
                    Ok(Ok((stream, peer))) => {
                        tokio::spawn(handle_request(stream, peer, ctx.clone()));
                    }
                    Ok(Err(err)) => {
                        warn!(error = %err, "status accept failed");
                        // Keep a persistent failure from spinning the loop
                        // hot; the pause still yields to a stop request.
                        tokio::select! {
                            () = token.cancelled() => break,
                            () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
    }
    debug!("status responder accept loop ended");
}

/// One request, bounded by the request timeout so a stalled client cannot
/// pin its task.
async fn handle_request(stream: TcpStream, peer: SocketAddr, ctx: StatusContext) {
    match tokio::time::timeout(ctx.request_timeout, respond(stream, peer, &ctx)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            let fault = FaultKind::classify(&err);
            debug!(%peer, fault = fault.as_str(), error = %err, "status request failed");
        }
        Err(_) => warn!(%peer, "status request timed out"),
    }
}

/// Socket failures surface as [`ConnectionError`]; they cost the one
/// request, never the responder.
async fn respond(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: &StatusContext,
) -> Result<(), ConnectionError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let request_line = lines.next_line().await?.unwrap_or_default();
    debug!(%peer, line = %request_line, "status request");
    while let Some(header) = lines.next_line().await? {
        if header.is_empty() {
            break;
        }
    }

    let ip = ctx
        .resolver
        .local_ip()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let ws_addr = format!("{ip}:{}", ctx.event_port);
    let body = render_status_page(&ws_addr, ctx.hub.subscriber_count());
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    write_half.write_all(response.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

fn render_status_page(ws_addr: &str, client_count: usize) -> String {
    PAGE_TEMPLATE
        .replace("__WS_ADDR__", ws_addr)
        .replace("__CLIENT_COUNT__", &client_count.to_string())
}

/// Status page served to browsers. Emojis are HTML entities so the page
/// renders correctly regardless of how the client sniffs the charset.
const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>SMS Receiver</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 20px; }
        .container { max-width: 600px; margin: 0 auto; }
        .status { padding: 10px; background-color: #f0f0f0; border-radius: 5px; margin-bottom: 20px; }
        .message { padding: 10px; border-left: 4px solid #2196F3; margin-bottom: 10px; background-color: #f9f9f9; }
        .sender { font-weight: bold; color: #2196F3; }
        .timestamp { color: #888; font-size: 0.8em; }
        .info { background-color: #e3f2fd; padding: 10px; border-radius: 5px; margin-bottom: 20px; }
    </style>
</head>
<body>
    <div class="container">
        <h1>&#128241; SMS Receiver</h1>
        <div class="info">
            <p>This is a WebSocket server for receiving SMS messages.</p>
            <p>WebSocket URL: <strong>ws://__WS_ADDR__</strong></p>
            <p>Connected clients: __CLIENT_COUNT__</p>
        </div>
        <div id="messages">
            <div class="status">Waiting for SMS messages...</div>
        </div>
        <script>
            const ws = new WebSocket("ws://__WS_ADDR__");

            ws.onopen = function(event) {
                console.log("Connected to WebSocket server");
                document.getElementById("messages").innerHTML += '<div class="status">&#9989; Connected to SMS Receiver</div>';
            };

            ws.onmessage = function(event) {
                console.log("Received message: " + event.data);
                try {
                    const data = JSON.parse(event.data);
                    if (data.type === "sms") {
                        const timestamp = new Date(data.timestamp).toLocaleString();
                        const messageHtml =
                            '<div class="message">' +
                            '<div class="sender">From: ' + data.sender + '</div>' +
                            '<div>' + data.message + '</div>' +
                            '<div class="timestamp">' + timestamp + '</div>' +
                            '</div>';
                        document.getElementById("messages").innerHTML += messageHtml;
                    } else {
                        document.getElementById("messages").innerHTML += '<div class="status">' + event.data + '</div>';
                    }
                } catch (e) {
                    document.getElementById("messages").innerHTML += '<div class="status">' + event.data + '</div>';
                }
            };

            ws.onclose = function(event) {
                console.log("Disconnected from WebSocket server");
                document.getElementById("messages").innerHTML += '<div class="status">&#10060; Disconnected from server</div>';
            };

            ws.onerror = function(error) {
                console.error("WebSocket error:", error);
                document.getElementById("messages").innerHTML += '<div class="status">&#10060; Error: ' + error.message + '</div>';
            };
        </script>
    </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    fn test_ctx() -> StatusContext {
        StatusContext {
            hub: Arc::new(BroadcastHub::new(8)),
            resolver: Arc::new(FixedAddr(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            event_port: 8060,
            accept_wait: Duration::from_millis(100),
            request_timeout: Duration::from_millis(100),
        }
    }

    /// Accept source that never produces a connection.
    struct FailingAccept {
        calls: Arc<AtomicUsize>,
    }

    impl Accept for FailingAccept {
        async fn next_conn(&self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("out of descriptors"))
        }
    }

    #[test]
    fn rendered_page_advertises_event_port() {
        let body = render_status_page("10.0.0.5:8060", 3);

        // Once in the info block, once in the embedded client script.
        assert_eq!(body.matches("ws://10.0.0.5:8060").count(), 2);
        assert!(body.contains("Connected clients: 3"));
        assert!(!body.contains("__WS_ADDR__"));
        assert!(!body.contains("__CLIENT_COUNT__"));
    }

    #[test]
    fn fixed_resolver_reports_its_address() {
        let resolver = FixedAddr(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(resolver.local_ip(), Some("10.0.0.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn accept_failures_back_off_instead_of_spinning() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let loop_task = tokio::spawn(accept_loop(
            FailingAccept {
                calls: Arc::clone(&calls),
            },
            test_ctx(),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert!(seen <= 2, "accept retried {seen} times in 300ms");

        // The backoff must not mask a stop request.
        token.cancel();
        tokio::time::timeout(Duration::from_millis(500), loop_task)
            .await
            .expect("accept loop ignored cancellation during backoff")
            .expect("accept loop task panicked");
    }

    #[tokio::test]
    async fn failed_request_io_maps_to_a_transient_fault() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        client.set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        let err = respond(stream, peer, &test_ctx())
            .await
            .expect_err("read from a reset connection succeeded");
        assert_matches!(err, ConnectionError::TransientIo(_));
        assert_eq!(FaultKind::classify(&err), FaultKind::NetworkError);
    }
}
