//! UPnP port mapping for nodes behind a home router.

use crate::constants::transport::UPNP_LEASE_SECS;
use crate::network::ips::{is_reserved, PublicIps};
use igd_next::aio::tokio::{self as igd_tokio, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug)]
pub enum NatError {
    #[error("UPnP gateway not found: {0}")]
    Gateway(String),
    #[error("Failed to get external IP: {0}")]
    ExternalIp(String),
    #[error("Failed to map port {port}: {reason}")]
    Mapping { port: u16, reason: String },
    #[error("Failed to determine local address: {0}")]
    LocalAddress(String),
}

#[async_trait::async_trait]
pub trait PortMapper: Send + Sync {
    async fn external_ip(&self) -> Result<IpAddr, NatError>;
    /// Forward the external UDP `port` to the same local port
    async fn map_port(&self, port: u16) -> Result<(), NatError>;
}

pub struct UpnpPortMapper {
    search_timeout: Duration,
    gateway: OnceCell<Gateway<Tokio>>,
}

impl UpnpPortMapper {
    pub fn new(search_timeout: Duration) -> Self {
        Self {
            search_timeout,
            gateway: OnceCell::new(),
        }
    }

    async fn gateway(&self) -> Result<&Gateway<Tokio>, NatError> {
        self.gateway
            .get_or_try_init(|| async {
                let opts = SearchOptions {
                    timeout: Some(self.search_timeout),
                    ..Default::default()
                };
                igd_tokio::search_gateway(opts)
                    .await
                    .map_err(|e| NatError::Gateway(e.to_string()))
            })
            .await
    }
}

#[async_trait::async_trait]
impl PortMapper for UpnpPortMapper {
    async fn external_ip(&self) -> Result<IpAddr, NatError> {
        self.gateway()
            .await?
            .get_external_ip()
            .await
            .map_err(|e| NatError::ExternalIp(e.to_string()))
    }

    async fn map_port(&self, port: u16) -> Result<(), NatError> {
        let local_ip =
            local_ip_address::local_ip().map_err(|e| NatError::LocalAddress(e.to_string()))?;
        self.gateway()
            .await?
            .add_port(
                PortMappingProtocol::UDP,
                port,
                SocketAddr::new(local_ip, port),
                UPNP_LEASE_SECS,
                "tsnode QUIC",
            )
            .await
            .map_err(|e| NatError::Mapping {
                port,
                reason: e.to_string(),
            })
    }
}

/// Complete the advertised address set for `port`.
///
/// Only consults the mapper when no public IPv4 is bound locally. An
/// external address that is itself reserved means a second NAT sits in
/// front of the gateway; reachability is abandoned in that case.
pub async fn detect_reachability(
    mut public: PublicIps,
    mapper: Option<&dyn PortMapper>,
    port: u16,
) -> PublicIps {
    let Some(mapper) = mapper else {
        return public;
    };
    if !public.v4.is_empty() {
        return public;
    }

    let external = match mapper.external_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            tracing::debug!("NAT discovery failed: {}", e);
            return public;
        }
    };
    if is_reserved(external) {
        tracing::warn!(
            "⚠️  External address {} is reserved (double NAT), not advertising it",
            external
        );
        return public;
    }

    public.push(external);
    match mapper.map_port(port).await {
        Ok(()) => tracing::info!("🔓 Mapped UDP port {} via UPnP ({})", port, external),
        Err(e) => tracing::warn!("⚠️  {}", e),
    }
    public
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FakeMapper {
        external: IpAddr,
        mapped: Mutex<Vec<u16>>,
    }

    impl FakeMapper {
        fn new(external: &str) -> Self {
            Self {
                external: external.parse().unwrap(),
                mapped: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PortMapper for FakeMapper {
        async fn external_ip(&self) -> Result<IpAddr, NatError> {
            Ok(self.external)
        }

        async fn map_port(&self, port: u16) -> Result<(), NatError> {
            self.mapped.lock().push(port);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_maps_when_no_public_v4() {
        let mapper = FakeMapper::new("8.8.8.8");
        let public = detect_reachability(PublicIps::default(), Some(&mapper), 3963).await;
        assert_eq!(public.v4, vec!["8.8.8.8".parse::<std::net::Ipv4Addr>().unwrap()]);
        assert_eq!(*mapper.mapped.lock(), vec![3963]);
    }

    #[tokio::test]
    async fn test_double_nat_abandons_mapping() {
        let mapper = FakeMapper::new("100.64.1.1");
        let public = detect_reachability(PublicIps::default(), Some(&mapper), 3963).await;
        assert!(public.is_empty());
        assert!(mapper.mapped.lock().is_empty());
    }

    #[tokio::test]
    async fn test_skipped_when_public_v4_present() {
        let mapper = FakeMapper::new("8.8.8.8");
        let local = PublicIps::from_addrs(vec!["1.1.1.1".parse().unwrap()]);
        let public = detect_reachability(local.clone(), Some(&mapper), 3963).await;
        assert_eq!(public, local);
        assert!(mapper.mapped.lock().is_empty());
    }
}
