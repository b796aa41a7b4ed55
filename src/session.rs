// src/session.rs
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::device::Device;
use crate::peer::Peer;
use crate::utils::now_ms;

impl Device {
    /// Called after a handshake response was consumed. Returns true if the
    /// noise engine published a new current session.
    pub fn activate_session(&self, peer: &Arc<Peer>) -> bool {
        if !self.collab.noise.begin_session(peer) {
            return false;
        }
        self.collab.timers.ephemeral_key_created(peer);
        self.collab.timers.handshake_complete(peer);
        peer.sent_lastminute_handshake.store(false, Ordering::Release);

        // Queued traffic confirms the session by itself; otherwise the other
        // side gets a keepalive.
        let flushed = self.collab.sender.send_queue(peer);
        if flushed == 0 {
            self.collab.sender.send_keepalive(peer);
        }
        debug!("Peer {}: session activated, {} queued packets sent", peer.internal_id, flushed);
        true
    }

    /// Starts a rekey from the initiator's side shortly before the current
    /// session would expire. Returns true if an initiation was queued.
    pub fn keep_key_fresh(&self, peer: &Arc<Peer>) -> bool {
        self.keep_key_fresh_at(peer, now_ms())
    }

    pub(crate) fn keep_key_fresh_at(&self, peer: &Arc<Peer>, now: i64) -> bool {
        if peer.sent_lastminute_handshake.load(Ordering::Acquire) {
            return false;
        }

        let stale = match peer.keypairs.current() {
            Some(kp) => {
                kp.is_valid() && kp.i_am_the_initiator && kp.age_ms(now) >= self.config.rekey_threshold_ms()
            }
            None => false,
        };
        if !stale {
            return false;
        }

        // Another CPU may have seen the same stale session.
        if peer
            .sent_lastminute_handshake
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("Peer {}: session about to expire, starting rekey", peer.internal_id);
        self.collab.sender.queue_handshake_initiation(peer, false);
        true
    }
}
