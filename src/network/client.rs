//! Outbound QUIC dials pinned to the rotating certificate hashes.

use crate::network::cert;
use crate::network::connection::{Connection, RemoteAddr, TransportError};
use crate::network::tls;
use quinn::{ConnectionError, Endpoint};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::OnceCell;

/// TLS alerts surface as QUIC transport codes 0x100..=0x1ff
const CRYPTO_ERROR_RANGE: std::ops::Range<u64> = 0x100..0x200;

pub struct Dialer {
    dial_timeout: Duration,
    keep_alive: Duration,
    v4: OnceCell<Endpoint>,
    v6: OnceCell<Endpoint>,
}

impl Dialer {
    pub fn new(dial_timeout: Duration, keep_alive: Duration) -> Self {
        Self {
            dial_timeout,
            keep_alive,
            v4: OnceCell::new(),
            v6: OnceCell::new(),
        }
    }

    /// Dial `url` and open the session's single bidirectional stream
    pub async fn connect(&self, url: &str) -> Result<Connection, TransportError> {
        let remote_addr = RemoteAddr::from_url(url)?;
        let config = tls::client_config(cert::accepted_hashes()?, self.keep_alive)?;
        let endpoint = self.endpoint_for(remote_addr.address).await?;

        let attempt = async {
            let server_name = remote_addr.address.to_string();
            let session = endpoint
                .connect_with(config, remote_addr.socket_addr(), &server_name)
                .map_err(|e| TransportError::Connect(e.to_string()))?
                .await
                .map_err(map_connection_error)?;
            let (send, recv) = session.open_bi().await.map_err(map_connection_error)?;
            Ok(Connection {
                session,
                send,
                recv,
                remote_addr,
                incoming: false,
            })
        };

        match tokio::time::timeout(self.dial_timeout, attempt).await {
            Ok(result) => {
                if result.is_ok() {
                    tracing::debug!("✓ Connected to peer: {}", url);
                }
                result
            }
            Err(_) => Err(TransportError::Timeout(self.dial_timeout.as_secs())),
        }
    }

    async fn endpoint_for(&self, ip: IpAddr) -> Result<&Endpoint, TransportError> {
        let (cell, bind) = match ip {
            IpAddr::V4(_) => (&self.v4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V6(_) => (&self.v6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        };
        cell.get_or_try_init(|| async move {
            Endpoint::client(SocketAddr::new(bind, 0))
                .map_err(|e| TransportError::Bind(format!("client endpoint {}: {}", bind, e)))
        })
        .await
    }
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match &e {
        ConnectionError::TransportError(te)
            if CRYPTO_ERROR_RANGE.contains(&u64::from(te.code)) =>
        {
            TransportError::Handshake(e.to_string())
        }
        _ => TransportError::Connect(e.to_string()),
    }
}

/// Losses that are part of normal churn rather than faults
pub fn is_benign(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::TimedOut
            | ConnectionError::ApplicationClosed(_)
            | ConnectionError::ConnectionClosed(_)
            | ConnectionError::Reset
            | ConnectionError::LocallyClosed
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_rejected_before_dialing() {
        let dialer = Dialer::new(Duration::from_secs(1), Duration::from_secs(10));
        assert!(matches!(
            dialer.connect("not a url").await,
            Err(TransportError::InvalidUrl(_))
        ));
        assert!(matches!(
            dialer.connect("https://peer.example:3963").await,
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_benign_errors() {
        assert!(is_benign(&ConnectionError::TimedOut));
        assert!(is_benign(&ConnectionError::Reset));
        assert!(!is_benign(&ConnectionError::VersionMismatch));
    }
}
