// src/peer.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::info;

use crate::cryptography::Key;
use crate::utils::now_ms;

/// A session established by one completed handshake.
#[derive(Debug)]
pub struct KeyPair {
    pub local_index: u32,
    pub remote_index: u32,
    pub created_at: i64,
    pub i_am_the_initiator: bool,
    is_valid: AtomicBool,
}

impl KeyPair {
    pub fn new(local_index: u32, remote_index: u32, i_am_the_initiator: bool) -> Self {
        Self::with_birthdate(local_index, remote_index, i_am_the_initiator, now_ms())
    }

    pub fn with_birthdate(local_index: u32, remote_index: u32, i_am_the_initiator: bool, created_at: i64) -> Self {
        Self {
            local_index,
            remote_index,
            created_at,
            i_am_the_initiator,
            is_valid: AtomicBool::new(true),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.is_valid.store(false, Ordering::Release);
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.created_at
    }
}

type Slot = RwLock<Option<Arc<KeyPair>>>;

fn load(slot: &Slot) -> Option<Arc<KeyPair>> {
    match slot.read() { Ok(g) => g.clone(), Err(e) => e.into_inner().clone() }
}

fn store(slot: &Slot, value: Option<Arc<KeyPair>>) -> Option<Arc<KeyPair>> {
    let mut guard = match slot.write() { Ok(g) => g, Err(e) => e.into_inner() };
    std::mem::replace(&mut *guard, value)
}

/// The previous / current / next sessions of a peer. Readers clone the
/// `Arc` out of a slot, so a keypair stays alive for as long as anyone
/// holds it even after it has been rotated out.
#[derive(Debug, Default)]
pub struct Keypairs {
    previous: Slot,
    current: Slot,
    next: Slot,
    // Serializes writers so a rotation is never interleaved with another.
    update: Mutex<()>,
}

impl Keypairs {
    pub fn current(&self) -> Option<Arc<KeyPair>> {
        load(&self.current)
    }

    pub fn previous(&self) -> Option<Arc<KeyPair>> {
        load(&self.previous)
    }

    pub fn next(&self) -> Option<Arc<KeyPair>> {
        load(&self.next)
    }

    /// Publishes a freshly derived session. The initiator may use it right
    /// away; the responder has to wait for the first packet from the other
    /// side before it can be sure the initiator has it too.
    pub fn install_new(&self, keypair: Arc<KeyPair>) {
        let _writer = match self.update.lock() { Ok(g) => g, Err(e) => e.into_inner() };

        if keypair.i_am_the_initiator {
            let demoted = store(&self.next, None).or_else(|| self.current());
            store(&self.previous, demoted);
            store(&self.current, Some(keypair));
        } else {
            store(&self.next, Some(keypair));
            store(&self.previous, None);
        }
    }

    /// Called after `keypair` decrypted a packet. Returns true if that was
    /// the first use of a pending session and it has now become current.
    pub fn received_with(&self, keypair: &Arc<KeyPair>) -> bool {
        match self.next() {
            Some(next) if Arc::ptr_eq(&next, keypair) => {}
            _ => return false,
        }

        let _writer = match self.update.lock() { Ok(g) => g, Err(e) => e.into_inner() };
        let promoted = match self.next() {
            Some(next) if Arc::ptr_eq(&next, keypair) => next,
            _ => return false,
        };
        store(&self.previous, self.current());
        store(&self.current, Some(promoted));
        store(&self.next, None);
        true
    }

    /// Finds the session a data message was addressed to.
    pub fn lookup(&self, local_index: u32) -> Option<Arc<KeyPair>> {
        [self.current(), self.next(), self.previous()]
            .into_iter()
            .flatten()
            .find(|kp| kp.local_index == local_index)
    }

    pub fn clear(&self) {
        let _writer = match self.update.lock() { Ok(g) => g, Err(e) => e.into_inner() };
        for slot in [&self.previous, &self.current, &self.next] {
            if let Some(kp) = store(slot, None) {
                kp.invalidate();
            }
        }
    }
}

#[derive(Debug)]
pub struct Peer {
    pub internal_id: u64,
    pub public_key: Key,
    endpoint: RwLock<Option<SocketAddr>>,
    pub rx_bytes: AtomicU64,
    // Debounces the rekey started when the current session is about to expire.
    pub sent_lastminute_handshake: AtomicBool,
    pub keypairs: Keypairs,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.internal_id == other.internal_id
    }
}

impl Peer {
    pub fn new(internal_id: u64, public_key: Key, endpoint: Option<SocketAddr>) -> Arc<Self> {
        Arc::new(Self {
            internal_id,
            public_key,
            endpoint: RwLock::new(endpoint),
            rx_bytes: AtomicU64::new(0),
            sent_lastminute_handshake: AtomicBool::new(false),
            keypairs: Keypairs::default(),
        })
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        match self.endpoint.read() { Ok(g) => *g, Err(e) => *e.into_inner() }
    }

    /// Remembers the latest authenticated source of this peer.
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        if self.endpoint() == Some(endpoint) {
            return;
        }
        let mut guard = match self.endpoint.write() { Ok(g) => g, Err(e) => e.into_inner() };
        if *guard != Some(endpoint) {
            info!("Peer {}: endpoint updated to {}", self.internal_id, endpoint);
            *guard = Some(endpoint);
        }
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }
}
