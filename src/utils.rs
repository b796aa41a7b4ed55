// src/utils.rs
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const LABEL_MAC1: &[u8] = b"mac1----";
pub const LABEL_COOKIE: &[u8] = b"cookie--";

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const UDP_HEADER_LEN: usize = 8;

// Low two bits of the DS field.
pub const ECN_MASK: u8 = 0b11;
pub const ECN_CE: u8 = 0b11;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as i64
}

pub fn constant_time_equals(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        false
    } else {
        a.iter().zip(b.iter()).fold(0u8, |acc, (&x, &y)| acc | (x ^ y)) == 0
    }
}

pub struct IPPacketUtils;

impl IPPacketUtils {
    /// Version nibble of the first byte, if there is one.
    pub fn version(packet: &[u8]) -> Option<u8> {
        packet.first().map(|b| b >> 4)
    }

    pub fn get_source_address(packet: &[u8]) -> Option<IpAddr> {
        match Self::version(packet)? {
            4 => {
                if packet.len() < IPV4_HEADER_LEN { None } else {
                    let mut ip = [0u8; 4];
                    ip.copy_from_slice(&packet[12..16]);
                    Some(IpAddr::V4(Ipv4Addr::from(ip)))
                }
            }
            6 => {
                if packet.len() < IPV6_HEADER_LEN { None } else {
                    let mut ip = [0u8; 16];
                    ip.copy_from_slice(&packet[8..24]);
                    Some(IpAddr::V6(Ipv6Addr::from(ip)))
                }
            }
            _ => None,
        }
    }

    /// DS field (TOS / traffic class) of an IPv4 or IPv6 header. Caller has
    /// already checked the length for the family.
    pub fn ds_field(packet: &[u8]) -> u8 {
        match Self::version(packet) {
            Some(4) => packet[1],
            Some(6) => (packet[0] << 4) | (packet[1] >> 4),
            _ => 0,
        }
    }

    pub fn is_ce(ds: u8) -> bool {
        ds & ECN_MASK == ECN_CE
    }

    /// Marks an ECN capable IPv4 header as congestion experienced and patches
    /// the header checksum (RFC 1624). Not-ECT packets are left alone.
    pub fn ipv4_set_ce(header: &mut [u8]) -> bool {
        if header.len() < IPV4_HEADER_LEN {
            return false;
        }
        let tos = header[1];
        match tos & ECN_MASK {
            0 => return false,
            ECN_CE => return true,
            _ => {}
        }

        let old_word = u16::from_be_bytes([header[0], tos]);
        let new_word = u16::from_be_bytes([header[0], tos | ECN_CE]);
        let check = u16::from_be_bytes([header[10], header[11]]);

        let mut sum = (!check as u32) + (!old_word as u32) + new_word as u32;
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        let patched = !(sum as u16);

        header[1] = tos | ECN_CE;
        header[10..12].copy_from_slice(&patched.to_be_bytes());
        true
    }

    /// IPv6 has no header checksum, only the traffic class changes.
    pub fn ipv6_set_ce(header: &mut [u8]) -> bool {
        if header.len() < IPV6_HEADER_LEN {
            return false;
        }
        let ds = Self::ds_field(header);
        if ds & ECN_MASK == 0 {
            return false;
        }
        header[1] |= ECN_CE << 4;
        true
    }
}

/// Fixed window limiter for per-packet debug output, so a flood of junk does
/// not turn into a flood of log lines.
pub struct RateLimiter {
    per_window: u32,
    window_ms: i64,
    window_start: AtomicI64,
    count: AtomicU32,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        Self {
            per_window: per_second,
            window_ms: 1000,
            window_start: AtomicI64::new(now_ms()),
            count: AtomicU32::new(0),
        }
    }

    pub fn allow(&self) -> bool {
        let now = now_ms();
        let start = self.window_start.load(Ordering::Relaxed);
        if now - start >= self.window_ms
            && self.window_start.compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed).is_ok()
        {
            self.count.store(0, Ordering::Relaxed);
        }
        if self.count.load(Ordering::Relaxed) >= self.per_window {
            return false;
        }
        self.count.fetch_add(1, Ordering::Relaxed) < self.per_window
    }
}

macro_rules! debug_ratelimited {
    ($limiter:expr, $($arg:tt)+) => {
        if $limiter.allow() {
            log::debug!($($arg)+);
        }
    };
}
pub(crate) use debug_ratelimited;

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(header: &[u8]) -> u16 {
        let mut sum = 0u32;
        for (i, chunk) in header.chunks(2).enumerate() {
            if i == 5 { continue; }
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    fn ipv4_header(tos: u8) -> Vec<u8> {
        let mut h = vec![
            0x45, tos, 0x00, 0x54, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x01, 0x00, 0x00,
            10, 0, 0, 2, 10, 0, 0, 1,
        ];
        let c = checksum(&h);
        h[10..12].copy_from_slice(&c.to_be_bytes());
        h
    }

    #[test]
    fn ipv4_ce_marking_keeps_checksum_valid() {
        for tos in [0x01u8, 0x02, 0xb9, 0xba] {
            let mut h = ipv4_header(tos);
            assert!(IPPacketUtils::ipv4_set_ce(&mut h));
            assert_eq!(h[1] & ECN_MASK, ECN_CE);
            assert_eq!(u16::from_be_bytes([h[10], h[11]]), checksum(&h), "tos {:#x}", tos);
        }
    }

    #[test]
    fn ipv4_not_ect_is_untouched() {
        let mut h = ipv4_header(0xb8);
        let before = h.clone();
        assert!(!IPPacketUtils::ipv4_set_ce(&mut h));
        assert_eq!(h, before);
    }

    #[test]
    fn ipv6_ce_marking() {
        let mut h = vec![0u8; IPV6_HEADER_LEN];
        h[0] = 0x60;
        h[1] = 0x10; // ECT(1)
        assert!(IPPacketUtils::ipv6_set_ce(&mut h));
        assert!(IPPacketUtils::is_ce(IPPacketUtils::ds_field(&h)));

        let mut not_ect = vec![0u8; IPV6_HEADER_LEN];
        not_ect[0] = 0x60;
        assert!(!IPPacketUtils::ipv6_set_ce(&mut not_ect));
        assert_eq!(not_ect[1], 0);
    }

    #[test]
    fn source_address_needs_full_header() {
        let h = ipv4_header(0);
        assert_eq!(IPPacketUtils::get_source_address(&h), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(IPPacketUtils::get_source_address(&h[..19]), None);
        assert_eq!(IPPacketUtils::get_source_address(&[]), None);
        assert_eq!(IPPacketUtils::get_source_address(&[0x50; 40]), None);
    }

    #[test]
    fn rate_limiter_caps_window() {
        let limiter = RateLimiter::new(3);
        let allowed = (0..10).filter(|_| limiter.allow()).count();
        assert_eq!(allowed, 3);
    }
}
