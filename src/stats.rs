// src/stats.rs
use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Each receiving thread sticks to one shard for its lifetime.
    static SHARD: Cell<usize> = Cell::new(NEXT_SHARD.fetch_add(1, Ordering::Relaxed));
}

fn shard_of_current_thread(shards: usize) -> usize {
    SHARD.with(|s| s.get()) % shards
}

#[derive(Debug, Default)]
struct Shard {
    packets: AtomicU64,
    bytes: AtomicU64,
}

/// Per-CPU style rx packet and byte counters, summed on read.
#[derive(Debug)]
pub struct ShardedCounters {
    shards: Box<[Shard]>,
}

impl ShardedCounters {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::default()).collect(),
        }
    }

    pub fn add(&self, bytes: u64) {
        let shard = &self.shards[shard_of_current_thread(self.shards.len())];
        shard.packets.fetch_add(1, Ordering::Relaxed);
        shard.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// (packets, bytes)
    pub fn sum(&self) -> (u64, u64) {
        self.shards.iter().fold((0, 0), |(p, b), s| {
            (p + s.packets.load(Ordering::Relaxed), b + s.bytes.load(Ordering::Relaxed))
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

#[derive(Debug)]
pub struct DeviceStats {
    pub rx_errors: AtomicU64,
    pub rx_length_errors: AtomicU64,
    pub rx_frame_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub handshakes_dropped: AtomicU64,
    pub cookie_replies_sent: AtomicU64,
    pub last_rx: AtomicI64,
    rx: ShardedCounters,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_length_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_dropped: u64,
    pub handshakes_dropped: u64,
    pub cookie_replies_sent: u64,
    pub last_rx: i64,
}

impl DeviceStats {
    pub fn new(shards: usize) -> Self {
        Self {
            rx_errors: AtomicU64::new(0),
            rx_length_errors: AtomicU64::new(0),
            rx_frame_errors: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            handshakes_dropped: AtomicU64::new(0),
            cookie_replies_sent: AtomicU64::new(0),
            last_rx: AtomicI64::new(0),
            rx: ShardedCounters::new(shards),
        }
    }

    pub fn add_rx(&self, bytes: usize) {
        self.rx.add(bytes as u64);
    }

    pub fn length_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
        self.rx_length_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_error(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
        self.rx_frame_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shard_count(&self) -> usize {
        self.rx.shard_count()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (rx_packets, rx_bytes) = self.rx.sum();
        StatsSnapshot {
            rx_packets,
            rx_bytes,
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_length_errors: self.rx_length_errors.load(Ordering::Relaxed),
            rx_frame_errors: self.rx_frame_errors.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            handshakes_dropped: self.handshakes_dropped.load(Ordering::Relaxed),
            cookie_replies_sent: self.cookie_replies_sent.load(Ordering::Relaxed),
            last_rx: self.last_rx.load(Ordering::Relaxed),
        }
    }
}
