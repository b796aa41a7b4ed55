// src/receive.rs
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::device::Device;
use crate::error::ReceiveError;
use crate::message::{classify, MessageType};
use crate::peer::Peer;
use crate::utils::{debug_ratelimited, now_ms, IPPacketUtils, IPV4_HEADER_LEN, IPV6_HEADER_LEN};

/// What a decryptor hands back for one data message.
#[derive(Debug)]
pub struct DecryptedPacket {
    /// Inner IP packet, padding already stripped. Empty for a keepalive.
    pub buffer: BytesMut,
    /// Outer DS field, from `Frame::ds`.
    pub ds: u8,
    pub peer: Option<Arc<Peer>>,
    pub endpoint: Option<SocketAddr>,
    /// The packet was the first one received with a pending session.
    pub used_new_key: bool,
    pub result: Result<(), ReceiveError>,
}

impl Device {
    /// Entry point for every UDP datagram, outer IP header included.
    pub fn receive(self: &Arc<Self>, datagram: Bytes) -> Result<(), ReceiveError> {
        let frame = classify(&datagram).map_err(|e| {
            debug_ratelimited!(self.log_limiter, "Dropping datagram: {}", e);
            e
        })?;

        match frame.kind {
            MessageType::CookieReply => {
                debug_ratelimited!(self.log_limiter, "Receiving cookie reply from {}", frame.endpoint);
                self.collab.cookies.consume_reply(&frame.payload).map_err(|e| {
                    debug_ratelimited!(self.log_limiter, "Ignoring cookie reply from {}: {}", frame.endpoint, e);
                    e
                })
            }
            MessageType::HandshakeInitiation | MessageType::HandshakeResponse => self.queue_handshake(frame),
            MessageType::Data => {
                self.collab.decryptor.consume_data(self, frame);
                Ok(())
            }
        }
    }

    pub(crate) fn rx_stats(&self, peer: &Peer, len: usize) {
        self.stats.add_rx(len);
        peer.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Completion of a data message decryption: checks the inner packet and
    /// hands it to the host stack.
    pub fn receive_data_packet(&self, packet: DecryptedPacket) -> Result<(), ReceiveError> {
        let DecryptedPacket { mut buffer, ds, peer, endpoint, used_new_key, result } = packet;

        result?;
        let (peer, endpoint) = match (peer, endpoint) {
            (Some(peer), Some(endpoint)) => (peer, endpoint),
            _ => return Err(ReceiveError::DecryptionFailed),
        };

        peer.set_endpoint(endpoint);
        if used_new_key {
            peer.sent_lastminute_handshake.store(false, Ordering::Release);
            self.collab.sender.send_queue(&peer);
        }
        self.keep_key_fresh(&peer);

        let outcome = self.validate_and_deliver(&peer, endpoint, &mut buffer, ds);

        self.collab.timers.any_authenticated_packet_received(&peer);
        self.collab.timers.any_authenticated_packet_traversal(&peer);
        outcome
    }

    fn validate_and_deliver(
        &self,
        peer: &Arc<Peer>,
        endpoint: SocketAddr,
        buffer: &mut BytesMut,
        ds: u8,
    ) -> Result<(), ReceiveError> {
        if buffer.is_empty() {
            debug_ratelimited!(self.log_limiter, "Receiving keepalive from peer {} ({})", peer.internal_id, endpoint);
            return Ok(());
        }

        let congested = IPPacketUtils::is_ce(ds);
        match IPPacketUtils::version(buffer) {
            Some(4) if buffer.len() >= IPV4_HEADER_LEN => {
                if congested {
                    IPPacketUtils::ipv4_set_ce(buffer);
                }
            }
            Some(6) if buffer.len() >= IPV6_HEADER_LEN => {
                if congested {
                    IPPacketUtils::ipv6_set_ce(buffer);
                }
            }
            _ => {
                self.stats.length_error();
                debug_ratelimited!(
                    self.log_limiter,
                    "Packet neither IPv4 nor IPv6 from peer {} ({})",
                    peer.internal_id,
                    endpoint
                );
                return Err(ReceiveError::MalformedFraming("inner packet neither IPv4 nor IPv6"));
            }
        }

        self.collab.timers.data_received(peer);

        let routed = self.routes.lookup_source(buffer);
        if !routed.map_or(false, |routed| Arc::ptr_eq(&routed, peer)) {
            self.stats.frame_error();
            debug_ratelimited!(
                self.log_limiter,
                "Packet has unallowed src IP ({:?}) from peer {} ({})",
                IPPacketUtils::get_source_address(buffer),
                peer.internal_id,
                endpoint
            );
            return Err(ReceiveError::BindingViolation);
        }

        let len = buffer.len();
        self.stats.last_rx.store(now_ms(), Ordering::Relaxed);
        match self.collab.stack.deliver(buffer.split().freeze()) {
            Ok(()) => {
                self.rx_stats(peer, len);
                Ok(())
            }
            Err(e) => {
                self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
                debug_ratelimited!(
                    self.log_limiter,
                    "Failed to give packet to the host stack from peer {} ({})",
                    peer.internal_id,
                    endpoint
                );
                Err(e)
            }
        }
    }
}
