//! Inbound QUIC listener.
//!
//! Binds one dual-stack UDP socket, works out which addresses peers can reach
//! it on, and accepts sessions until cancelled. The server certificate is
//! swapped in place whenever its window ends, so established sessions are
//! never disturbed by rotation.

use crate::network::cert::{self, CertificateBundle};
use crate::network::client::is_benign;
use crate::network::connection::{Connection, RemoteAddr, TransportError};
use crate::network::ips::{self, PublicIps};
use crate::network::nat::{detect_reachability, PortMapper};
use crate::network::tls;
use crate::storage::PeerTable;
use quinn::{Endpoint, EndpointConfig, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Back-off before retrying a failed certificate rotation
const ROTATION_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Initializing,
    Listening,
    Rotating,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Port tried when none has been persisted
    pub default_port: u16,
    pub keep_alive: Duration,
}

pub struct TransportListener {
    endpoint: Endpoint,
    port: u16,
    keep_alive: Duration,
    bundle: CertificateBundle,
    public: PublicIps,
    state: ListenerState,
}

impl TransportListener {
    /// Bind the endpoint and resolve reachability.
    ///
    /// Falls back to an ephemeral port when the persisted one is taken and
    /// records the port actually bound. NAT failures are logged, never fatal.
    pub async fn bind(
        table: &PeerTable,
        config: &ListenerConfig,
        mapper: Option<&dyn PortMapper>,
    ) -> Result<Self, TransportError> {
        tracing::info!("📡 Listener state: {:?}", ListenerState::Initializing);

        let preferred = match table.listen_port().await {
            Ok(Some(port)) => port,
            Ok(None) => config.default_port,
            Err(e) => {
                tracing::warn!("Failed to read persisted listen port: {}", e);
                config.default_port
            }
        };

        let bundle = cert::issue(0)?;
        let server_config = tls::server_config(&bundle, config.keep_alive)?;

        let socket = match bind_udp(preferred) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(
                    "⚠️  Port {} unavailable ({}), falling back to an ephemeral port",
                    preferred,
                    e
                );
                bind_udp(0).map_err(|e| TransportError::Bind(e.to_string()))?
            }
        };
        let port = socket.local_addr()?.port();
        if port != preferred {
            if let Err(e) = table.set_listen_port(port).await {
                tracing::warn!("Failed to persist listen port {}: {}", port, e);
            }
        }

        let endpoint = Endpoint::new(
            EndpointConfig::default(),
            Some(server_config),
            socket,
            Arc::new(TokioRuntime),
        )?;

        let public = detect_reachability(ips::public_ips(), mapper, port).await;
        if public.is_empty() {
            tracing::warn!("⚠️  No public address found, listening on port {} anyway", port);
        } else {
            let addrs: Vec<String> = public.all().iter().map(|ip| ip.to_string()).collect();
            tracing::info!("🌐 Listening on {} port {}", addrs.join(", "), port);
        }

        Ok(Self {
            endpoint,
            port,
            keep_alive: config.keep_alive,
            bundle,
            public,
            state: ListenerState::Initializing,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn public_addresses(&self) -> &PublicIps {
        &self.public
    }

    fn transition(&mut self, state: ListenerState) {
        if self.state != state {
            tracing::info!("📡 Listener state: {:?}", state);
            self.state = state;
        }
    }

    /// Accept sessions into `connections` until `cancel` fires
    pub async fn serve(mut self, connections: mpsc::Sender<Connection>, cancel: CancellationToken) {
        let mut next_rotation = rotation_deadline(&self.bundle);

        loop {
            self.transition(ListenerState::Listening);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_rotation) => {
                    self.transition(ListenerState::Rotating);
                    next_rotation = match self.rotate() {
                        Ok(()) => rotation_deadline(&self.bundle),
                        Err(e) => {
                            tracing::error!("❌ Certificate rotation failed: {}", e);
                            tokio::time::Instant::now() + ROTATION_RETRY
                        }
                    };
                }
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => {
                        tokio::spawn(accept_session(incoming, connections.clone()));
                    }
                    None => {
                        tracing::warn!("Endpoint closed, listener stopping");
                        self.transition(ListenerState::Stopped);
                        return;
                    }
                },
            }
        }

        // Refuse new sessions; established ones keep running
        self.transition(ListenerState::Draining);
        self.endpoint.set_server_config(None);
        self.transition(ListenerState::Stopped);
    }

    fn rotate(&mut self) -> Result<(), TransportError> {
        let bundle = cert::issue(0)?;
        let config = tls::server_config(&bundle, self.keep_alive)?;
        self.endpoint.set_server_config(Some(config));
        tracing::info!("🔐 Rotated certificate: {:?}", bundle);
        self.bundle = bundle;
        Ok(())
    }
}

fn rotation_deadline(bundle: &CertificateBundle) -> tokio::time::Instant {
    let remaining = bundle.not_after.saturating_sub(cert::now_ms()).max(0) as u64;
    tokio::time::Instant::now() + Duration::from_millis(remaining + 1)
}

/// Dual-stack UDP socket, or IPv4-only where the host has no IPv6
fn bind_udp(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let dual_stack = || -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(false)?;
        socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
        Ok(socket)
    };
    let socket = match dual_stack() {
        Ok(socket) => socket,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return Err(e),
        Err(e) => {
            tracing::debug!("Dual-stack bind failed ({}), using IPv4 only", e);
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn accept_session(incoming: quinn::Incoming, connections: mpsc::Sender<Connection>) {
    let remote_addr = RemoteAddr::from_socket(incoming.remote_address());

    let session = match incoming.await {
        Ok(session) => session,
        Err(e) => {
            if is_benign(&e) {
                tracing::debug!("Handshake with {} ended: {}", remote_addr, e);
            } else {
                tracing::warn!("Handshake with {} failed: {}", remote_addr, e);
            }
            return;
        }
    };

    let (send, recv) = match session.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            let benign = is_benign(&e);
            let err = TransportError::NoStream(e.to_string());
            if benign {
                tracing::debug!("{}: {}", remote_addr, err);
            } else {
                tracing::warn!("{}: {}", remote_addr, err);
            }
            return;
        }
    };

    let conn = Connection {
        session,
        send,
        recv,
        remote_addr,
        incoming: true,
    };
    if connections.send(conn).await.is_err() {
        tracing::debug!("Peer supervisor gone, dropping session from {}", remote_addr);
    }
}
