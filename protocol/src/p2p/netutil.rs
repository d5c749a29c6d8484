//! IP classification and per-subnet counting.
//!
//! LAN addresses get a pass on most anti-DoS limits (a private testnet
//! usually lives inside one /24), so almost every limit in the overlay asks
//! [`is_lan`] first.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Loopback or RFC1918/ULA/link-local space.
pub fn is_lan(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.octets()[0] == 0,
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_lan(&IpAddr::V4(v4));
            }
            let seg0 = v6.segments()[0];
            v6.is_loopback() || (seg0 & 0xfe00) == 0xfc00 || (seg0 & 0xffc0) == 0xfe80
        }
    }
}

/// Reserved ranges that never belong to a real peer.
pub fn is_special_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_broadcast()
                || v4.is_documentation()
                || (o[0] == 192 && o[1] == 0 && o[2] == 0)
                || (o[0] == 198 && (o[1] & 0xfe) == 18)
                || (o[0] == 192 && o[1] == 88 && o[2] == 99)
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            v6.is_multicast()
                || (s[0] == 0x2001 && s[1] == 0x0db8)
                || (s[0] == 0x0100 && s[1] == 0 && s[2] == 0 && s[3] == 0)
        }
    }
}

/// Why an address may not be relayed to `sender`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("zero address")]
    Unspecified,
    #[error("special network")]
    Special,
    #[error("loopback address from non-loopback host")]
    Loopback,
    #[error("LAN address from WAN host")]
    Lan,
}

/// Whether `addr` may be handed to a node that reached us from `sender`.
///
/// A WAN peer gets no LAN addresses and a non-loopback peer gets no
/// loopback addresses.
pub fn check_relay_ip(sender: &IpAddr, addr: &IpAddr) -> Result<(), RelayError> {
    if addr.is_unspecified() {
        return Err(RelayError::Unspecified);
    }
    if is_special_network(addr) {
        return Err(RelayError::Special);
    }
    if addr.is_loopback() && !sender.is_loopback() {
        return Err(RelayError::Loopback);
    }
    if is_lan(addr) && !is_lan(sender) {
        return Err(RelayError::Lan);
    }
    Ok(())
}

/// Masks `ip` down to its first `prefix` bits.
fn network_key(ip: &IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(*v4);
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix.min(32) as u32)
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return network_key(&IpAddr::V4(v4), prefix);
            }
            let bits = u128::from(*v6);
            // IPv6 prefixes are scaled so a /24 on v4 maps to a /56 on v6.
            let p = (prefix as u32 + 32).min(128);
            let mask = u128::MAX << (128 - p);
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

/// Counts addresses per subnet and refuses to go above `limit` in any one.
#[derive(Debug, Clone)]
pub struct DistinctNetSet {
    subnet: u8,
    limit: usize,
    members: HashMap<IpAddr, usize>,
}

impl DistinctNetSet {
    pub fn new(subnet: u8, limit: usize) -> Self {
        Self {
            subnet,
            limit,
            members: HashMap::new(),
        }
    }

    /// Adds `ip` if its subnet is below the limit. Returns whether it was added.
    pub fn add(&mut self, ip: &IpAddr) -> bool {
        let key = network_key(ip, self.subnet);
        let n = self.members.entry(key).or_insert(0);
        if *n < self.limit {
            *n += 1;
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, ip: &IpAddr) {
        let key = network_key(ip, self.subnet);
        if let Some(n) = self.members.get_mut(&key) {
            *n -= 1;
            if *n == 0 {
                self.members.remove(&key);
            }
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.members.contains_key(&network_key(ip, self.subnet))
    }

    /// Total number of tracked addresses.
    pub fn len(&self) -> usize {
        self.members.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A list of CIDR ranges, used for the dial white- and blacklists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Netlist {
    nets: Vec<(IpAddr, u8)>,
}

impl Netlist {
    /// Parses a list of `ip/prefix` entries. A bare IP is a host route.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            let (addr, prefix) = match entry.split_once('/') {
                Some((a, p)) => (a, Some(p)),
                None => (entry, None),
            };
            let ip: IpAddr = addr.parse().map_err(|_| format!("invalid CIDR {entry:?}"))?;
            let max = if ip.is_ipv4() { 32 } else { 128 };
            let prefix = match prefix {
                Some(p) => p
                    .parse::<u8>()
                    .ok()
                    .filter(|p| *p <= max)
                    .ok_or_else(|| format!("invalid prefix in {entry:?}"))?,
                None => max,
            };
            nets.push((mask(&ip, prefix), prefix));
        }
        Ok(Self { nets })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.nets
            .iter()
            .any(|(net, prefix)| net.is_ipv4() == ip.is_ipv4() && mask(ip, *prefix) == *net)
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

fn mask(ip: &IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let m = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix as u32) };
            IpAddr::V4(Ipv4Addr::from(u32::from(*v4) & m))
        }
        IpAddr::V6(v6) => {
            let m = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix as u32) };
            IpAddr::V6(Ipv6Addr::from(u128::from(*v6) & m))
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
    fn lan_classification() {
        assert!(is_lan(&ip("127.0.0.1")));
        assert!(is_lan(&ip("10.1.2.3")));
        assert!(is_lan(&ip("192.168.0.9")));
        assert!(is_lan(&ip("172.16.4.4")));
        assert!(is_lan(&ip("fe80::1")));
        assert!(!is_lan(&ip("8.8.8.8")));
        assert!(!is_lan(&ip("1.2.3.4")));
    }

    #[test]
    fn relay_rules() {
        let wan = ip("1.2.3.4");
        let lan = ip("10.0.0.1");
        assert_eq!(check_relay_ip(&wan, &ip("0.0.0.0")), Err(RelayError::Unspecified));
        assert_eq!(check_relay_ip(&wan, &lan), Err(RelayError::Lan));
        assert_eq!(check_relay_ip(&wan, &ip("127.0.0.1")), Err(RelayError::Loopback));
        assert_eq!(check_relay_ip(&wan, &ip("192.0.2.1")), Err(RelayError::Special));
        assert!(check_relay_ip(&lan, &ip("10.0.0.2")).is_ok());
        assert!(check_relay_ip(&wan, &ip("5.6.7.8")).is_ok());
    }

    #[test]
    fn distinct_net_set_enforces_limit() {
        let mut set = DistinctNetSet::new(24, 2);
        assert!(set.add(&ip("1.2.3.4")));
        assert!(set.add(&ip("1.2.3.5")));
        assert!(!set.add(&ip("1.2.3.6")));
        assert!(set.add(&ip("1.2.4.1")));
        assert_eq!(set.len(), 3);

        set.remove(&ip("1.2.3.4"));
        assert!(set.add(&ip("1.2.3.6")));
        assert!(set.contains(&ip("1.2.3.200")));
        assert!(!set.contains(&ip("9.9.9.9")));
    }

    #[test]
    fn netlist_matches_cidr_ranges() {
        let list = Netlist::parse(&["10.1.0.0/16", "8.8.8.8", "fd00::/8"]).unwrap();
        assert!(list.contains(&ip("10.1.200.3")));
        assert!(!list.contains(&ip("10.2.0.1")));
        assert!(list.contains(&ip("8.8.8.8")));
        assert!(!list.contains(&ip("8.8.8.9")));
        assert!(list.contains(&ip("fd12::1")));
        assert!(Netlist::parse(&["10.0.0.0/33"]).is_err());
        assert!(Netlist::parse(&["nonsense"]).is_err());
    }
}
