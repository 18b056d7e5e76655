//! Established peer sessions and the addressing they are keyed by.

use crate::constants::transport::URL_SCHEME;
use crate::network::cert::CertError;
use crate::network::tls::TlsError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid peer URL: {0}")]
    InvalidUrl(String),
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Dial timed out after {0}s")]
    Timeout(u64),
    #[error("Peer opened no bidirectional stream: {0}")]
    NoStream(String),
    #[error("Failed to bind listener: {0}")]
    Bind(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
}

/// IP and port of the remote end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddr {
    pub address: IpAddr,
    pub port: u16,
}

impl RemoteAddr {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address: address.to_canonical(),
            port,
        }
    }

    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// Rebuild an address from raw octets as persisted or gossiped
    pub fn from_bytes(bytes: &[u8], port: u16) -> Option<Self> {
        let address = match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes.try_into().ok()?;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = bytes.try_into().ok()?;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return None,
        };
        Some(Self::new(address, port))
    }

    pub fn address_bytes(&self) -> Vec<u8> {
        match self.address {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Host part of a URL: IPv6 literals are bracketed
    pub fn host_string(&self) -> String {
        match self.address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        }
    }

    /// Unique peer key: scheme, host and port
    pub fn canonical_url(&self) -> String {
        format!("{}://{}:{}", URL_SCHEME, self.host_string(), self.port)
    }

    /// Parse a canonical URL back into an address
    pub fn from_url(url: &str) -> Result<Self, TransportError> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
        let authority = rest.trim_end_matches('/');
        let socket: SocketAddr = authority
            .parse()
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        Ok(Self::from_socket(socket))
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_string(), self.port)
    }
}

/// An established session with exactly one bidirectional stream.
///
/// Owned by whichever component produced it until it is handed to the peer
/// supervisor; the stream halves then move into the RPC channel.
pub struct Connection {
    pub session: quinn::Connection,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
    pub remote_addr: RemoteAddr,
    pub incoming: bool,
}

impl Connection {
    pub fn canonical_url(&self) -> String {
        self.remote_addr.canonical_url()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("incoming", &self.incoming)
            .finish()
    }
}
