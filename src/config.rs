// src/config.rs
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

pub const MAX_QUEUED_INCOMING_HANDSHAKES: usize = 4096;
pub const MAX_BURST_INCOMING_HANDSHAKES: usize = 16;
pub const REJECT_AFTER_TIME_MS: i64 = 180_000;
pub const KEEPALIVE_TIMEOUT_MS: i64 = 10_000;
pub const REKEY_TIMEOUT_MS: i64 = 5_000;
pub const DEFAULT_LOG_RATE_PER_SEC: u32 = 10;

/// Tunables of the receive path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveConfig {
    pub max_queued_handshakes: usize,
    pub max_burst_handshakes: usize,
    pub reject_after_time_ms: i64,
    pub keepalive_timeout_ms: i64,
    pub rekey_timeout_ms: i64,
    pub stat_shards: usize,
    pub log_rate_per_sec: u32,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            max_queued_handshakes: MAX_QUEUED_INCOMING_HANDSHAKES,
            max_burst_handshakes: MAX_BURST_INCOMING_HANDSHAKES,
            reject_after_time_ms: REJECT_AFTER_TIME_MS,
            keepalive_timeout_ms: KEEPALIVE_TIMEOUT_MS,
            rekey_timeout_ms: REKEY_TIMEOUT_MS,
            stat_shards: num_cpus::get().max(1),
            log_rate_per_sec: DEFAULT_LOG_RATE_PER_SEC,
        }
    }
}

impl ReceiveConfig {
    /// Age at which an initiator starts a last-minute rekey on receive.
    pub fn rekey_threshold_ms(&self) -> i64 {
        self.reject_after_time_ms - self.keepalive_timeout_ms - self.rekey_timeout_ms
    }

    pub fn with_handshake_limits(mut self, max_queued: usize, max_burst: usize) -> Self {
        self.max_queued_handshakes = max_queued.max(1);
        self.max_burst_handshakes = max_burst.max(1);
        self
    }

    /// Reads the `[Receive]` section of a configuration file. Every other
    /// section is skipped, missing keys keep their defaults.
    pub fn parse(file_path: &Path) -> io::Result<Self> {
        let file = File::open(file_path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut props: HashMap<String, String> = HashMap::new();
        let mut in_section = false;

        for line in reader.lines() {
            let line = line?.trim().to_string();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                in_section = line.to_lowercase() == "[receive]";
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                props.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let defaults = Self::default();
        let config = Self {
            max_queued_handshakes: field(&props, "maxqueuedhandshakes", defaults.max_queued_handshakes)?,
            max_burst_handshakes: field(&props, "maxbursthandshakes", defaults.max_burst_handshakes)?,
            reject_after_time_ms: field(&props, "rejectaftertimems", defaults.reject_after_time_ms)?,
            keepalive_timeout_ms: field(&props, "keepalivetimeoutms", defaults.keepalive_timeout_ms)?,
            rekey_timeout_ms: field(&props, "rekeytimeoutms", defaults.rekey_timeout_ms)?,
            stat_shards: field(&props, "statshards", defaults.stat_shards)?,
            log_rate_per_sec: field(&props, "lograte", defaults.log_rate_per_sec)?,
        };

        if config.max_queued_handshakes == 0 || config.max_burst_handshakes == 0 || config.stat_shards == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Queue, burst and shard counts must be positive"));
        }
        if config.rekey_threshold_ms() <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "RejectAfterTimeMs too small for keepalive and rekey timeouts"));
        }
        Ok(config)
    }
}

fn field<T: FromStr>(props: &HashMap<String, String>, key: &str, default: T) -> io::Result<T> {
    match props.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("Invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = ReceiveConfig::default();
        assert_eq!(config.max_queued_handshakes, 4096);
        assert_eq!(config.rekey_threshold_ms(), 165_000);
        assert!(config.stat_shards >= 1);
    }

    #[test]
    fn reads_only_receive_section() {
        let text = "\
[Interface]
PrivateKey = abc
MaxBurstHandshakes = 999

# tuning
[Receive]
MaxQueuedHandshakes = 128
maxbursthandshakes=64
LogRate = 0
";
        let config = ReceiveConfig::from_reader(text.as_bytes()).unwrap();
        assert_eq!(config.max_queued_handshakes, 128);
        assert_eq!(config.max_burst_handshakes, 64);
        assert_eq!(config.log_rate_per_sec, 0);
        assert_eq!(config.reject_after_time_ms, REJECT_AFTER_TIME_MS);
    }

    #[test]
    fn rejects_garbage_values() {
        let err = ReceiveConfig::from_reader("[Receive]\nMaxQueuedHandshakes = lots\n".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = ReceiveConfig::from_reader("[Receive]\nRejectAfterTimeMs = 1000\n".as_bytes()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
