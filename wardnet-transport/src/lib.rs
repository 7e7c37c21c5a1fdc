//! Frame transport: a TCP listener for election/mutex traffic that a handler
//! may answer on the same connection, and a UDP socket for fire-and-forget
//! heartbeats. Every failure mode below `start()` is absorbed (logged) rather
//! than surfaced — callers of `send_tcp`/`send_udp` never see an I/O error,
//! only the absence of a reply.

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wardnet_common::Frame;

/// A single TCP payload is at most this many bytes.
pub const MAX_TCP_FRAME: usize = 4 * 1024;
/// A single UDP datagram is at most this many bytes.
pub const MAX_UDP_FRAME: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind tcp listener on {0}: {1}")]
    TcpBind(SocketAddr, std::io::Error),
    #[error("failed to bind udp socket on {0}: {1}")]
    UdpBind(SocketAddr, std::io::Error),
    #[error("transport already started")]
    AlreadyStarted,
}

/// Handles one inbound TCP frame, optionally producing a response frame
/// that the transport writes back on the same connection.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    async fn handle(&self, frame: Frame) -> Option<Frame>;
}

/// Handles one inbound UDP datagram. No response is ever sent.
#[async_trait]
pub trait UdpHandler: Send + Sync {
    async fn handle(&self, frame: Frame);
}

/// Owns the listening sockets for one node and dispatches inbound frames by
/// message type to whatever handler was registered for it.
pub struct Transport {
    bind_host: String,
    tcp_port: u16,
    udp_port: u16,
    tcp_handlers: DashMap<&'static str, Arc<dyn TcpHandler>>,
    udp_handlers: DashMap<&'static str, Arc<dyn UdpHandler>>,
    cancel: CancellationToken,
    local_tcp_addr: AsyncMutex<Option<SocketAddr>>,
    local_udp_addr: AsyncMutex<Option<SocketAddr>>,
}

impl Transport {
    pub fn new(bind_host: impl Into<String>, tcp_port: u16, udp_port: u16) -> Arc<Self> {
        Arc::new(Self {
            bind_host: bind_host.into(),
            tcp_port,
            udp_port,
            tcp_handlers: DashMap::new(),
            udp_handlers: DashMap::new(),
            cancel: CancellationToken::new(),
            local_tcp_addr: AsyncMutex::new(None),
            local_udp_addr: AsyncMutex::new(None),
        })
    }

    pub fn register_tcp(&self, message_type: &'static str, handler: Arc<dyn TcpHandler>) {
        self.tcp_handlers.insert(message_type, handler);
    }

    pub fn register_udp(&self, message_type: &'static str, handler: Arc<dyn UdpHandler>) {
        self.udp_handlers.insert(message_type, handler);
    }

    /// Begins listening on the configured TCP and UDP ports on all
    /// interfaces reachable from `bind_host` (use `"0.0.0.0"` for "all
    /// interfaces", or `"127.0.0.1"` plus port 0 in tests for an
    /// OS-assigned loopback port).
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let tcp_addr: SocketAddr = format!("{}:{}", self.bind_host, self.tcp_port)
            .parse()
            .expect("bind_host/tcp_port must form a valid socket address");
        let udp_addr: SocketAddr = format!("{}:{}", self.bind_host, self.udp_port)
            .parse()
            .expect("bind_host/udp_port must form a valid socket address");

        let tcp_listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|e| TransportError::TcpBind(tcp_addr, e))?;
        let udp_socket = UdpSocket::bind(udp_addr)
            .await
            .map_err(|e| TransportError::UdpBind(udp_addr, e))?;

        *self.local_tcp_addr.lock().await = tcp_listener.local_addr().ok();
        *self.local_udp_addr.lock().await = udp_socket.local_addr().ok();

        let tcp_self = self.clone();
        tokio::spawn(async move { tcp_self.tcp_accept_loop(tcp_listener).await });

        let udp_self = self.clone();
        tokio::spawn(async move { udp_self.udp_recv_loop(udp_socket).await });

        Ok(())
    }

    /// Closes sockets and terminates listener/receive loops. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn local_tcp_port(&self) -> u16 {
        self.local_tcp_addr
            .lock()
            .await
            .map(|a| a.port())
            .unwrap_or(self.tcp_port)
    }

    pub async fn local_udp_port(&self) -> u16 {
        self.local_udp_addr
            .lock()
            .await
            .map(|a| a.port())
            .unwrap_or(self.udp_port)
    }

    async fn tcp_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("tcp accept loop stopping");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_tcp_client(stream).await });
                        }
                        Err(e) => warn!("tcp accept error: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_tcp_client(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = vec![0u8; MAX_TCP_FRAME];
        let n = match stream.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                warn!("tcp read error: {e}");
                return;
            }
        };

        let frame: Frame = match serde_json::from_slice(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                warn!("malformed tcp frame ({n} bytes): {e}");
                return;
            }
        };

        let Some(handler) = self.tcp_handlers.get(frame.type_name()).map(|h| h.clone()) else {
            warn!(frame_type = frame.type_name(), "no handler registered, ignoring");
            return;
        };

        if let Some(response) = handler.handle(frame).await {
            match serde_json::to_vec(&response) {
                Ok(bytes) => {
                    if let Err(e) = stream.write_all(&bytes).await {
                        warn!("tcp write error: {e}");
                    }
                }
                Err(e) => warn!("failed to encode response frame: {e}"),
            }
        }
    }

    async fn udp_recv_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_UDP_FRAME];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("udp recv loop stopping");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, _from)) => {
                            let frame: Frame = match serde_json::from_slice(&buf[..n]) {
                                Ok(f) => f,
                                Err(e) => {
                                    warn!("malformed udp frame ({n} bytes): {e}");
                                    continue;
                                }
                            };
                            if let Some(handler) = self.udp_handlers.get(frame.type_name()).map(|h| h.clone()) {
                                handler.handle(frame).await;
                            } else {
                                warn!(frame_type = frame.type_name(), "no udp handler registered, ignoring");
                            }
                        }
                        Err(e) => warn!("udp recv error: {e}"),
                    }
                }
            }
        }
    }

    /// Opens a connection, sends one frame, optionally reads one response
    /// frame, closes. Returns `None` on any I/O or timeout failure — never
    /// raises to the caller.
    pub async fn send_tcp(
        &self,
        host: &str,
        port: u16,
        frame: &Frame,
        timeout: Duration,
    ) -> Option<Frame> {
        let attempt = async {
            let mut stream = TcpStream::connect((host, port)).await.ok()?;
            let bytes = serde_json::to_vec(frame).ok()?;
            stream.write_all(&bytes).await.ok()?;

            let mut buf = vec![0u8; MAX_TCP_FRAME];
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            serde_json::from_slice(&buf[..n]).ok()
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(frame) => frame,
            Err(_) => {
                debug!(host, port, frame_type = frame.type_name(), "tcp send timed out");
                None
            }
        }
    }

    /// Fire-and-forget datagram. Failures are logged but not surfaced.
    pub async fn send_udp(&self, host: &str, port: u16, frame: &Frame) {
        let bytes = match serde_json::to_vec(frame) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to encode udp frame: {e}");
                return;
            }
        };
        if bytes.len() > MAX_UDP_FRAME {
            warn!(len = bytes.len(), "udp frame exceeds {MAX_UDP_FRAME} bytes, sending anyway");
        }

        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to open udp socket: {e}");
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, (host, port)).await {
            warn!(host, port, "udp send failed: {e}");
        }
    }
}
