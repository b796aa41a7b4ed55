// src/handshake.rs
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use log::debug;

use crate::cookie::MacState;
use crate::device::Device;
use crate::error::ReceiveError;
use crate::message::{sender_index, Frame, MessageType};
use crate::utils::debug_ratelimited;

/// Bounded FIFO of handshake messages waiting for the worker.
pub struct HandshakeQueue {
    items: Mutex<VecDeque<Frame>>,
    // Mirrors items.len() so the load check never takes the lock.
    depth: AtomicUsize,
    capacity: usize,
    work_pending: AtomicBool,
    // Held for a whole burst so two invocations never drain concurrently.
    drain: Mutex<()>,
}

impl HandshakeQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            depth: AtomicUsize::new(0),
            capacity,
            work_pending: AtomicBool::new(false),
            drain: Mutex::new(()),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        match self.items.lock() { Ok(g) => g, Err(e) => e.into_inner() }
    }

    pub fn push(&self, frame: Frame) -> Result<(), ReceiveError> {
        let mut items = self.items();
        if items.len() >= self.capacity {
            return Err(ReceiveError::QueueOverflow);
        }
        items.push_back(frame);
        self.depth.store(items.len(), Ordering::Relaxed);
        Ok(())
    }

    pub fn pop(&self) -> Option<Frame> {
        let mut items = self.items();
        let frame = items.pop_front();
        self.depth.store(items.len(), Ordering::Relaxed);
        frame
    }

    /// Exact length, taken under the queue lock.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Best effort; a stale read only skews the cookie policy for one packet.
    pub fn is_under_load(&self) -> bool {
        self.depth() >= self.capacity / 2
    }

    /// True if the caller won the right to schedule the worker.
    fn mark_pending(&self) -> bool {
        !self.work_pending.swap(true, Ordering::AcqRel)
    }

    fn clear_pending(&self) {
        self.work_pending.store(false, Ordering::Release);
    }
}

impl Device {
    pub(crate) fn queue_handshake(self: &Arc<Self>, frame: Frame) -> Result<(), ReceiveError> {
        let endpoint = frame.endpoint;
        if let Err(e) = self.handshakes.push(frame) {
            self.stats.handshakes_dropped.fetch_add(1, Ordering::Relaxed);
            debug_ratelimited!(self.log_limiter, "Too many handshakes queued, dropping packet from {}", endpoint);
            return Err(e);
        }
        self.schedule_handshake_worker();
        Ok(())
    }

    fn schedule_handshake_worker(self: &Arc<Self>) {
        if !self.handshakes.mark_pending() {
            return;
        }
        let device = Arc::clone(self);
        self.collab
            .scheduler
            .queue_work(Box::new(move || device.process_queued_handshake_packets()));
    }

    /// Worker entry point. Handles at most one burst of queued handshakes
    /// and reschedules itself if more are waiting. Returns at once if
    /// another invocation is mid-burst.
    pub fn process_queued_handshake_packets(self: &Arc<Self>) {
        let serial = match self.handshakes.drain.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                // The running drain rechecks the queue once it lets go.
                self.handshakes.clear_pending();
                return;
            }
        };
        self.handshakes.clear_pending();

        let burst = self.config.max_burst_handshakes.max(1);
        let mut processed = 0;
        while processed < burst {
            let frame = match self.handshakes.pop() {
                Some(frame) => frame,
                None => break,
            };
            let endpoint = frame.endpoint;
            if let Err(e) = self.receive_handshake_packet(frame) {
                debug_ratelimited!(self.log_limiter, "Dropping handshake from {}: {}", endpoint, e);
            }
            processed += 1;
        }
        drop(serial);

        let left = self.handshakes.len();
        if left > 0 {
            debug!("Handshake burst of {} done, {} still queued", processed, left);
            self.schedule_handshake_worker();
        }
    }

    /// Applies the cookie policy to one dequeued handshake and, if it passes,
    /// runs it through the noise engine.
    pub fn receive_handshake_packet(&self, frame: Frame) -> Result<(), ReceiveError> {
        if !frame.kind.is_handshake() {
            return Err(ReceiveError::MalformedFraming("not a handshake message"));
        }

        let under_load = self.handshakes.is_under_load();
        let mac_state = self.collab.cookies.validate(&frame.payload, frame.endpoint, under_load);
        match (under_load, mac_state) {
            (true, MacState::ValidWithCookie) | (false, MacState::ValidNoCookie) => {}
            (true, MacState::ValidNoCookie) => return self.send_cookie_reply(&frame),
            (_, MacState::Invalid) => return Err(ReceiveError::AuthenticationFailure("invalid MAC")),
            (false, MacState::ValidWithCookie) => {
                return Err(ReceiveError::AuthenticationFailure("cookie presented while not under load"))
            }
        }

        let peer = if frame.kind == MessageType::HandshakeInitiation {
            let peer = self
                .collab
                .noise
                .consume_initiation(&frame.payload)
                .ok_or(ReceiveError::AuthenticationFailure("invalid handshake initiation"))?;
            peer.set_endpoint(frame.endpoint);
            debug_ratelimited!(
                self.log_limiter,
                "Receiving handshake initiation from peer {} ({})",
                peer.internal_id,
                frame.endpoint
            );
            self.collab.sender.send_handshake_response(&peer);
            peer
        } else {
            let peer = self
                .collab
                .noise
                .consume_response(&frame.payload)
                .ok_or(ReceiveError::AuthenticationFailure("invalid handshake response"))?;
            peer.set_endpoint(frame.endpoint);
            debug_ratelimited!(
                self.log_limiter,
                "Receiving handshake response from peer {} ({})",
                peer.internal_id,
                frame.endpoint
            );
            self.activate_session(&peer);
            peer
        };

        self.rx_stats(&peer, frame.payload.len());
        self.collab.timers.any_authenticated_packet_received(&peer);
        self.collab.timers.any_authenticated_packet_traversal(&peer);
        Ok(())
    }

    fn send_cookie_reply(&self, frame: &Frame) -> Result<(), ReceiveError> {
        let index = sender_index(&frame.payload)
            .ok_or(ReceiveError::MalformedFraming("handshake without sender index"))?;
        let reply = self
            .collab
            .cookies
            .create_reply(&frame.payload, index, frame.endpoint)
            .ok_or(ReceiveError::AuthenticationFailure("could not build cookie reply"))?;

        debug_ratelimited!(self.log_limiter, "Sending cookie reply to {} (index {})", frame.endpoint, index);
        self.collab.sender.send_to_endpoint(frame.endpoint, reply);
        self.stats.cookie_replies_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(n: u8) -> Frame {
        Frame {
            kind: MessageType::HandshakeInitiation,
            payload: Bytes::from(vec![n; 4]),
            endpoint: "192.0.2.1:1".parse().unwrap(),
            ds: 0,
        }
    }

    #[test]
    fn queue_is_bounded_and_fifo() {
        let q = HandshakeQueue::new(3);
        for n in 0..3 {
            q.push(frame(n)).unwrap();
        }
        assert_eq!(q.push(frame(9)), Err(ReceiveError::QueueOverflow));
        assert_eq!(q.depth(), 3);

        let order: Vec<u8> = std::iter::from_fn(|| q.pop()).map(|f| f.payload[0]).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn load_threshold_is_half_capacity() {
        let q = HandshakeQueue::new(4);
        q.push(frame(0)).unwrap();
        assert!(!q.is_under_load());
        q.push(frame(1)).unwrap();
        assert!(q.is_under_load());
    }

    #[test]
    fn pending_flag_is_single_flight() {
        let q = HandshakeQueue::new(4);
        assert!(q.mark_pending());
        assert!(!q.mark_pending());
        q.clear_pending();
        assert!(q.mark_pending());
    }
}
