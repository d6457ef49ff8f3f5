//! Deterministic VIP assignment.
//!
//! A hostname is hashed with SHA-256 and the first four digest bytes are
//! used as host bits inside the configured range. Every host computes the
//! same VIP for the same name without coordinating.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use sha2::{Digest, Sha256};

/// Assigns VIPs from a fixed IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VipProvider {
    cidr: Ipv4Net,
    base: [u8; 4],
    wildcard: [u8; 4],
}

impl VipProvider {
    /// Create a provider for `cidr`. Host bits of the base are ignored.
    pub fn new(cidr: Ipv4Net) -> Self {
        let cidr = cidr.trunc();
        Self {
            cidr,
            base: cidr.network().octets(),
            wildcard: cidr.hostmask().octets(),
        }
    }

    /// The range VIPs are drawn from.
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// The VIP for `hostname`. Total and pure.
    pub fn get(&self, hostname: &str) -> Ipv4Addr {
        let digest = Sha256::digest(hostname.as_bytes());

        let mut out = [0u8; 4];
        for (i, octet) in out.iter_mut().enumerate() {
            *octet = (digest[i] & self.wildcard[i]) | (self.base[i] & !self.wildcard[i]);
        }
        Ipv4Addr::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn provider(cidr: &str) -> VipProvider {
        VipProvider::new(cidr.parse().unwrap())
    }

    #[test]
    fn same_name_same_vip() {
        let vips = provider("127.128.0.0/9");
        let first = vips.get("potato");
        let second = vips.get("potato");
        assert_eq!(first, second);
        assert!(vips.cidr().contains(&first));
    }

    #[test]
    fn known_vip_for_potato() {
        // sha256("potato") starts with e9 1c 25 4a.
        let vips = provider("127.128.0.0/9");
        assert_eq!(vips.get("potato"), Ipv4Addr::new(127, 156, 37, 74));
    }

    #[test]
    fn independent_providers_agree() {
        let a = provider("127.128.0.0/9");
        let b = provider("127.128.0.0/9");
        for name in ["app1.apps.internal.", "potato", "x"] {
            assert_eq!(a.get(name), b.get(name));
        }
    }

    #[test]
    fn host_bits_of_base_are_ignored() {
        let a = provider("127.128.0.0/9");
        let b = provider("127.200.1.1/9");
        assert_eq!(a.get("potato"), b.get("potato"));
    }

    #[test]
    fn vips_stay_inside_range() {
        for cidr in ["127.128.0.0/9", "10.1.2.0/24", "192.168.0.0/16", "10.0.0.7/32"] {
            let vips = provider(cidr);
            for i in 0..2_000 {
                let vip = vips.get(&format!("app-{i}.apps.internal."));
                assert!(vips.cidr().contains(&vip), "{vip} not in {cidr}");
            }
        }
    }

    #[test]
    fn slash_32_always_returns_base() {
        let vips = provider("10.0.0.7/32");
        assert_eq!(vips.get("anything"), Ipv4Addr::new(10, 0, 0, 7));
    }

    #[test]
    fn vips_cover_the_whole_host_range() {
        let vips = provider("127.128.0.0/9");
        let mut second = HashSet::new();
        let mut third = HashSet::new();
        let mut fourth = HashSet::new();

        for i in 0..10_000 {
            let octets = vips.get(&format!("host-{i}")).octets();
            assert_eq!(octets[0], 127);
            second.insert(octets[1]);
            third.insert(octets[2]);
            fourth.insert(octets[3]);
        }

        assert_eq!(second.len(), 128);
        assert!(second.iter().all(|o| *o >= 128));
        assert_eq!(third.len(), 256);
        assert_eq!(fourth.len(), 256);
    }
}
