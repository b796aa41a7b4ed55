// src/routing.rs
use ipnet::IpNet;
use patricia_tree::PatriciaMap;
use std::net::IpAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::utils::IPPacketUtils;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cidr {
    pub address: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    pub fn from_string(s: &str) -> Result<Self, ipnet::AddrParseError> {
        let net: IpNet = s.trim().parse()?;
        Ok(Cidr {
            address: net.addr(),
            prefix: net.prefix_len(),
        })
    }

    // Binary string of the address cut to the prefix ("11000000..."), used
    // as the trie key.
    pub fn to_bit_string(&self) -> String {
        let bytes = match self.address {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        let mut bit_str = String::with_capacity(bytes.len() * 8);
        for byte in bytes {
            bit_str.push_str(&format!("{:08b}", byte));
        }
        let prefix = (self.prefix as usize).min(bit_str.len());
        bit_str[0..prefix].to_string()
    }
}

/// Longest prefix match table, one trie per family.
pub struct RoutingTable<T> {
    ipv4: RwLock<PatriciaMap<T>>,
    ipv6: RwLock<PatriciaMap<T>>,
}

impl<T: Clone> Default for RoutingTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> RoutingTable<T> {
    pub fn new() -> Self {
        Self {
            ipv4: RwLock::new(PatriciaMap::new()),
            ipv6: RwLock::new(PatriciaMap::new()),
        }
    }

    fn read(&self, v4: bool) -> RwLockReadGuard<'_, PatriciaMap<T>> {
        let lock = if v4 { &self.ipv4 } else { &self.ipv6 };
        match lock.read() { Ok(g) => g, Err(e) => e.into_inner() }
    }

    fn write(&self, v4: bool) -> RwLockWriteGuard<'_, PatriciaMap<T>> {
        let lock = if v4 { &self.ipv4 } else { &self.ipv6 };
        match lock.write() { Ok(g) => g, Err(e) => e.into_inner() }
    }

    pub fn insert(&self, cidr: &Cidr, value: T) {
        let key = cidr.to_bit_string();
        self.write(cidr.address.is_ipv4()).insert(key, value);
    }

    pub fn remove(&self, cidr: &Cidr) {
        let key = cidr.to_bit_string();
        self.write(cidr.address.is_ipv4()).remove(&key);
    }

    /// Removes the entry stored under exactly `cidr`, but only if `owned`
    /// accepts its value. Narrower or wider entries are left alone.
    pub fn remove_if(&self, cidr: &Cidr, owned: impl FnOnce(&T) -> bool) -> bool {
        let key = cidr.to_bit_string();
        let mut table = self.write(cidr.address.is_ipv4());
        match table.get(&key) {
            Some(value) if owned(value) => {
                table.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn find_best_match(&self, addr: IpAddr) -> Option<T> {
        let full_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let key = Cidr { address: addr, prefix: full_prefix }.to_bit_string();

        self.read(addr.is_ipv4())
            .get_longest_common_prefix(&key)
            .map(|(_k, v)| v.clone())
    }

    /// Value authorized for the source address of an inner IP packet.
    pub fn lookup_source(&self, packet: &[u8]) -> Option<T> {
        let source = IPPacketUtils::get_source_address(packet)?;
        self.find_best_match(source)
    }

    pub fn clear(&self) {
        self.write(true).clear();
        self.write(false).clear();
    }

    pub fn size(&self) -> usize {
        self.read(true).len() + self.read(false).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let table = RoutingTable::new();
        table.insert(&Cidr::from_string("10.0.0.0/8").unwrap(), "wide");
        table.insert(&Cidr::from_string("10.1.0.0/16").unwrap(), "narrow");
        table.insert(&Cidr::from_string("fd00::/64").unwrap(), "v6");

        assert_eq!(table.find_best_match("10.1.2.3".parse().unwrap()), Some("narrow"));
        assert_eq!(table.find_best_match("10.2.2.3".parse().unwrap()), Some("wide"));
        assert_eq!(table.find_best_match("fd00::1".parse().unwrap()), Some("v6"));
        assert_eq!(table.find_best_match("192.168.0.1".parse().unwrap()), None);
        assert_eq!(table.size(), 3);

        table.remove(&Cidr::from_string("10.1.0.0/16").unwrap());
        assert_eq!(table.find_best_match("10.1.2.3".parse().unwrap()), Some("wide"));
    }

    #[test]
    fn remove_if_matches_the_exact_prefix_only() {
        let table = RoutingTable::new();
        let wide = Cidr::from_string("10.0.0.0/8").unwrap();
        let narrow = Cidr::from_string("10.0.0.0/24").unwrap();
        table.insert(&wide, 1u32);
        table.insert(&narrow, 2u32);

        // Same network address, different owner under the narrower prefix.
        assert!(!table.remove_if(&wide, |v| *v == 2));
        assert!(table.remove_if(&wide, |v| *v == 1));
        assert_eq!(table.find_best_match("10.9.9.9".parse().unwrap()), None);
        assert_eq!(table.find_best_match("10.0.0.9".parse().unwrap()), Some(2));
        assert_eq!(table.size(), 1);

        assert!(!table.remove_if(&wide, |_| true));
    }

    #[test]
    fn lookup_by_inner_source() {
        let table = RoutingTable::new();
        table.insert(&Cidr::from_string("10.0.0.2/32").unwrap(), 7u32);

        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        assert_eq!(table.lookup_source(&packet), Some(7));

        packet[15] = 3;
        assert_eq!(table.lookup_source(&packet), None);
        assert_eq!(table.lookup_source(&packet[..10]), None);
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!(Cidr::from_string("10.0.0.0/33").is_err());
        assert!(Cidr::from_string("not-a-net").is_err());
    }
}
