// src/device.rs
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info};
use smol::channel::{bounded, Receiver, Sender};
use smol::Executor;

use crate::config::ReceiveConfig;
use crate::cookie::CookieChecker;
use crate::error::ReceiveError;
use crate::handshake::HandshakeQueue;
use crate::message::Frame;
use crate::noise::NoiseEngine;
use crate::peer::Peer;
use crate::routing::{Cidr, RoutingTable};
use crate::stats::DeviceStats;
use crate::utils::RateLimiter;

// =========================================================================
// 1. COLLABORATOR TRAITS
// =========================================================================

/// Transmit side of the tunnel, as far as the receive path needs it.
pub trait PacketSender: Send + Sync {
    fn send_handshake_response(&self, peer: &Arc<Peer>);

    fn queue_handshake_initiation(&self, peer: &Arc<Peer>, is_retry: bool);

    /// Flushes packets that were waiting for a session. Returns how many
    /// went out.
    fn send_queue(&self, peer: &Arc<Peer>) -> usize;

    fn send_keepalive(&self, peer: &Arc<Peer>);

    /// Raw send, used for cookie replies which have no peer.
    fn send_to_endpoint(&self, endpoint: SocketAddr, packet: Bytes);
}

/// Timer bookkeeping hooks. Fire and forget.
pub trait Timers: Send + Sync {
    fn ephemeral_key_created(&self, peer: &Arc<Peer>);
    fn handshake_complete(&self, peer: &Arc<Peer>);
    fn any_authenticated_packet_received(&self, peer: &Arc<Peer>);
    fn any_authenticated_packet_traversal(&self, peer: &Arc<Peer>);
    fn data_received(&self, peer: &Arc<Peer>);
}

/// The host network stack decrypted packets are handed to.
pub trait NetStack: Send + Sync {
    fn deliver(&self, packet: Bytes) -> Result<(), ReceiveError>;
}

pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Deferred work queue. `work` must run later, never inside `queue_work`.
pub trait Scheduler: Send + Sync {
    fn queue_work(&self, work: Work);
}

/// Data message decryption. Implementations call
/// `Device::receive_data_packet` once they are done with `frame`, on
/// whatever thread suits them.
pub trait Decryptor: Send + Sync {
    fn consume_data(&self, device: &Arc<Device>, frame: Frame);
}

pub struct Collaborators {
    pub noise: Arc<dyn NoiseEngine>,
    pub cookies: Arc<dyn CookieChecker>,
    pub sender: Arc<dyn PacketSender>,
    pub decryptor: Arc<dyn Decryptor>,
    pub timers: Arc<dyn Timers>,
    pub stack: Arc<dyn NetStack>,
    pub scheduler: Arc<dyn Scheduler>,
}

// =========================================================================
// 2. DEVICE
// =========================================================================

/// One tunnel instance: peers, allowed-IP routes and the handshake queue.
pub struct Device {
    pub(crate) config: ReceiveConfig,
    pub(crate) collab: Collaborators,
    pub(crate) peers: DashMap<u64, Arc<Peer>>,
    pub(crate) routes: RoutingTable<Arc<Peer>>,
    pub(crate) handshakes: HandshakeQueue,
    pub(crate) stats: DeviceStats,
    pub(crate) log_limiter: RateLimiter,
}

impl Device {
    pub fn new(config: ReceiveConfig, collab: Collaborators) -> Arc<Self> {
        info!(
            "Receive path: handshake queue {} (burst {}), {} stat shards",
            config.max_queued_handshakes, config.max_burst_handshakes, config.stat_shards
        );
        Arc::new(Self {
            handshakes: HandshakeQueue::new(config.max_queued_handshakes),
            stats: DeviceStats::new(config.stat_shards),
            log_limiter: RateLimiter::new(config.log_rate_per_sec),
            peers: DashMap::new(),
            routes: RoutingTable::new(),
            collab,
            config,
        })
    }

    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn routes(&self) -> &RoutingTable<Arc<Peer>> {
        &self.routes
    }

    /// Registers a peer and the source ranges it may send from.
    pub fn add_peer(&self, peer: Arc<Peer>, allowed_ips: &[Cidr]) {
        for cidr in allowed_ips {
            self.routes.insert(cidr, peer.clone());
        }
        debug!("Peer {} added with {} allowed ranges", peer.internal_id, allowed_ips.len());
        self.peers.insert(peer.internal_id, peer);
    }

    pub fn remove_peer(&self, internal_id: u64, allowed_ips: &[Cidr]) -> Option<Arc<Peer>> {
        let (_, peer) = self.peers.remove(&internal_id)?;
        for cidr in allowed_ips {
            self.routes.remove_if(cidr, |routed| Arc::ptr_eq(routed, &peer));
        }
        debug!("Peer {} removed", internal_id);
        peer.keypairs.clear();
        Some(peer)
    }

    pub fn peer(&self, internal_id: u64) -> Option<Arc<Peer>> {
        self.peers.get(&internal_id).map(|p| p.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of handshake messages waiting for the worker.
    pub fn queued_handshakes(&self) -> usize {
        self.handshakes.depth()
    }
}

// =========================================================================
// 3. SMOL ADAPTERS
// =========================================================================

/// Runs handshake work on a smol executor, or on smol's global one.
#[derive(Clone, Default)]
pub struct SmolScheduler {
    executor: Option<Arc<Executor<'static>>>,
}

impl SmolScheduler {
    pub fn new(executor: Arc<Executor<'static>>) -> Self {
        Self { executor: Some(executor) }
    }
}

impl Scheduler for SmolScheduler {
    fn queue_work(&self, work: Work) {
        let task = async move { work() };
        match &self.executor {
            Some(ex) => ex.spawn(task).detach(),
            None => smol::spawn(task).detach(),
        }
    }
}

/// Hands decrypted packets to a bounded channel. A full channel drops the
/// packet rather than waiting.
pub struct ChannelNetStack {
    tx: Sender<Bytes>,
}

impl ChannelNetStack {
    pub fn bounded(capacity: usize) -> (Self, Receiver<Bytes>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NetStack for ChannelNetStack {
    fn deliver(&self, packet: Bytes) -> Result<(), ReceiveError> {
        self.tx.try_send(packet).map_err(|_| ReceiveError::DeliveryFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_stack_drops_when_full() {
        let (stack, rx) = ChannelNetStack::bounded(1);
        assert!(stack.deliver(Bytes::from_static(b"one")).is_ok());
        assert_eq!(stack.deliver(Bytes::from_static(b"two")), Err(ReceiveError::DeliveryFailure));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));

        drop(rx);
        assert_eq!(stack.deliver(Bytes::from_static(b"three")), Err(ReceiveError::DeliveryFailure));
    }

    #[test]
    fn smol_scheduler_runs_work() {
        let ex = Arc::new(Executor::new());
        let scheduler = SmolScheduler::new(ex.clone());
        let (tx, rx) = bounded(1);
        scheduler.queue_work(Box::new(move || {
            let _ = tx.try_send(7u32);
        }));
        let got = smol::block_on(ex.run(async { rx.recv().await }));
        assert_eq!(got, Ok(7));
    }
}
