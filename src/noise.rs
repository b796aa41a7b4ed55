// src/noise.rs
use std::sync::Arc;

use crate::peer::Peer;

/// The handshake state machine. The receive path only hands it messages
/// whose MACs already checked out and acts on the peer it returns.
pub trait NoiseEngine: Send + Sync {
    /// Consumes a handshake initiation. None if it does not authenticate or
    /// names no configured peer.
    fn consume_initiation(&self, payload: &[u8]) -> Option<Arc<Peer>>;

    /// Consumes a response to one of our own initiations.
    fn consume_response(&self, payload: &[u8]) -> Option<Arc<Peer>>;

    /// Derives the session keys for a completed handshake and publishes them
    /// into `peer.keypairs`. True iff a new keypair was installed.
    fn begin_session(&self, peer: &Arc<Peer>) -> bool;
}
