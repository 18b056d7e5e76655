//! Public address detection.
//!
//! An interface address is advertised only if it falls outside every
//! reserved range of its own family.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const RESERVED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(127, 0, 0, 1), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 88, 99, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(233, 252, 0, 0), 24),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

const RESERVED_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1), 128),
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0), 96),
    (Ipv6Addr::new(0, 0, 0, 0, 0xffff, 0, 0, 0), 96),
    (Ipv6Addr::new(0x64, 0xff9b, 0, 0, 0, 0, 0, 0), 96),
    (Ipv6Addr::new(0x64, 0xff9b, 1, 0, 0, 0, 0, 0), 48),
    (Ipv6Addr::new(0x100, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2001, 0x20, 0, 0, 0, 0, 0, 0), 28),
    (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0), 32),
    (Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0), 16),
    (Ipv6Addr::new(0x3fff, 0, 0, 0, 0, 0, 0, 0), 20),
    (Ipv6Addr::new(0x5f00, 0, 0, 0, 0, 0, 0, 0), 16),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 64),
    (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8),
];

fn v4_matches(addr: Ipv4Addr, base: Ipv4Addr, prefix: u8) -> bool {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    u32::from(addr) & mask == u32::from(base) & mask
}

fn v6_matches(addr: Ipv6Addr, base: Ipv6Addr, prefix: u8) -> bool {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    u128::from(addr) & mask == u128::from(base) & mask
}

pub fn is_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => RESERVED_V4
            .iter()
            .any(|(base, prefix)| v4_matches(v4, *base, *prefix)),
        IpAddr::V6(v6) => RESERVED_V6
            .iter()
            .any(|(base, prefix)| v6_matches(v6, *base, *prefix)),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicIps {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl PublicIps {
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut public = Self::default();
        for ip in addrs.into_iter().filter(|ip| !is_reserved(*ip)) {
            public.push(ip);
        }
        public
    }

    pub fn push(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => self.v4.push(v4),
            IpAddr::V6(v6) => self.v6.push(v6),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn all(&self) -> Vec<IpAddr> {
        self.v4
            .iter()
            .map(|ip| IpAddr::V4(*ip))
            .chain(self.v6.iter().map(|ip| IpAddr::V6(*ip)))
            .collect()
    }
}

/// Public addresses bound to local interfaces
pub fn public_ips() -> PublicIps {
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => PublicIps::from_addrs(ifaces.into_iter().map(|(_, ip)| ip)),
        Err(e) => {
            tracing::warn!("Failed to enumerate network interfaces: {}", e);
            PublicIps::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_reserved_v4() {
        for s in ["127.0.0.1", "10.1.2.3", "100.100.0.1", "172.31.255.255", "192.168.1.1", "255.255.255.255", "233.252.0.9"] {
            assert!(is_reserved(ip(s)), "{}", s);
        }
        for s in ["8.8.8.8", "172.32.0.1", "198.20.0.1", "1.1.1.1"] {
            assert!(!is_reserved(ip(s)), "{}", s);
        }
    }

    #[test]
    fn test_reserved_v6() {
        for s in ["::", "::1", "fe80::1", "fd00::1", "2001:db8::1", "ff02::1", "::ffff:1.2.3.4"] {
            assert!(is_reserved(ip(s)), "{}", s);
        }
        for s in ["2a01:4f8::1", "2606:4700::1111", "fe80:0:0:1::1"] {
            assert!(!is_reserved(ip(s)), "{}", s);
        }
    }

    #[test]
    fn test_public_ips_partition() {
        let public = PublicIps::from_addrs(vec![
            ip("127.0.0.1"),
            ip("8.8.4.4"),
            ip("fe80::1"),
            ip("2a01:4f8::1"),
        ]);
        assert_eq!(public.v4, vec!["8.8.4.4".parse::<Ipv4Addr>().unwrap()]);
        assert_eq!(public.v6, vec!["2a01:4f8::1".parse::<Ipv6Addr>().unwrap()]);
        assert_eq!(public.all().len(), 2);
    }
}
