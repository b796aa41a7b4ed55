// src/message.rs
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ReceiveError;
use crate::utils::{IPPacketUtils, IPV4_HEADER_LEN, IPV6_HEADER_LEN, UDP_HEADER_LEN};

pub const MESSAGE_HEADER_LEN: usize = 4;
pub const HANDSHAKE_INITIATION_LEN: usize = 148;
pub const HANDSHAKE_RESPONSE_LEN: usize = 92;
pub const COOKIE_REPLY_LEN: usize = 64;
// 16 byte data header plus the 16 byte auth tag of an empty payload.
pub const DATA_MIN_LEN: usize = 32;
pub const MAC_LEN: usize = 16;
pub const COOKIE_NONCE_LEN: usize = 24;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MessageType {
    HandshakeInitiation = 1,
    HandshakeResponse = 2,
    CookieReply = 3,
    Data = 4,
}

impl MessageType {
    /// Reads the little-endian tag and checks the payload has the size that
    /// tag demands. Handshake messages are fixed size, data has a floor.
    pub fn determine(payload: &[u8]) -> Option<Self> {
        if payload.len() < MESSAGE_HEADER_LEN {
            return None;
        }
        let tag = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        match (tag, payload.len()) {
            (1, HANDSHAKE_INITIATION_LEN) => Some(MessageType::HandshakeInitiation),
            (2, HANDSHAKE_RESPONSE_LEN) => Some(MessageType::HandshakeResponse),
            (3, COOKIE_REPLY_LEN) => Some(MessageType::CookieReply),
            (4, n) if n >= DATA_MIN_LEN => Some(MessageType::Data),
            _ => None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, MessageType::HandshakeInitiation | MessageType::HandshakeResponse)
    }
}

/// A classified datagram. `payload` is a zero-copy slice of the received
/// buffer starting at the message tag.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Bytes,
    /// Outer source address and UDP source port.
    pub endpoint: SocketAddr,
    /// Outer TOS / traffic class, carried to the data validator for ECN.
    pub ds: u8,
}

/// Locates the UDP payload of a raw IPv4/IPv6 datagram and classifies it.
/// Only reads bytes that have been bounds checked first.
pub fn classify(datagram: &Bytes) -> Result<Frame, ReceiveError> {
    let len = datagram.len();
    if len < IPV4_HEADER_LEN {
        return Err(ReceiveError::MalformedFraming("shorter than an IP header"));
    }

    let (header_len, source) = match IPPacketUtils::version(datagram) {
        Some(4) => {
            let ihl = (datagram[0] & 0x0f) as usize * 4;
            if ihl < IPV4_HEADER_LEN || ihl > len {
                return Err(ReceiveError::MalformedFraming("bad IPv4 header length"));
            }
            let src = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
            (ihl, IpAddr::V4(src))
        }
        Some(6) => {
            if len < IPV6_HEADER_LEN {
                return Err(ReceiveError::MalformedFraming("shorter than an IPv6 header"));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&datagram[8..24]);
            (IPV6_HEADER_LEN, IpAddr::V6(Ipv6Addr::from(ip)))
        }
        _ => return Err(ReceiveError::MalformedFraming("neither IPv4 nor IPv6")),
    };

    let udp_offset = header_len;
    if udp_offset + UDP_HEADER_LEN > len {
        return Err(ReceiveError::MalformedFraming("too small to hold UDP fields"));
    }

    let mut udp = &datagram[udp_offset..udp_offset + UDP_HEADER_LEN];
    let src_port = udp.get_u16();
    let _dst_port = udp.get_u16();
    let udp_len = udp.get_u16() as usize;

    if udp_len < UDP_HEADER_LEN {
        return Err(ReceiveError::MalformedFraming("UDP length smaller than its header"));
    }
    if udp_len != len - udp_offset {
        return Err(ReceiveError::MalformedFraming("UDP length disagrees with datagram"));
    }

    let payload_offset = udp_offset + UDP_HEADER_LEN;
    if udp_len - UDP_HEADER_LEN < MESSAGE_HEADER_LEN {
        return Err(ReceiveError::MalformedFraming("no room for a message header"));
    }
    let payload = datagram.slice(payload_offset..len);

    let kind = MessageType::determine(&payload)
        .ok_or(ReceiveError::MalformedFraming("unknown message type"))?;

    Ok(Frame {
        kind,
        payload,
        endpoint: SocketAddr::new(source, src_port),
        ds: IPPacketUtils::ds_field(datagram),
    })
}

/// Sender index of an initiation or response (right after the tag).
pub fn sender_index(payload: &[u8]) -> Option<u32> {
    let mut cursor = payload.get(MESSAGE_HEADER_LEN..MESSAGE_HEADER_LEN + 4)?;
    Some(cursor.get_u32_le())
}

/// The (mac1, mac2) trailer every handshake message ends with.
pub fn macs(payload: &[u8]) -> Option<(&[u8], &[u8])> {
    if payload.len() < MESSAGE_HEADER_LEN + 2 * MAC_LEN {
        return None;
    }
    let mac1_at = payload.len() - 2 * MAC_LEN;
    let mac2_at = payload.len() - MAC_LEN;
    Some((&payload[mac1_at..mac2_at], &payload[mac2_at..]))
}

#[derive(Clone, Debug)]
pub struct CookieReplyMessage {
    pub receiver_index: u32,
    pub nonce: Bytes,
    pub encrypted_cookie: Bytes,
}

impl CookieReplyMessage {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COOKIE_REPLY_LEN);
        buf.put_u32_le(MessageType::CookieReply as u32);
        buf.put_u32_le(self.receiver_index);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.encrypted_cookie);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != COOKIE_REPLY_LEN {
            return None;
        }
        let mut cursor = bytes;
        let _tag = cursor.get_u32_le();
        let receiver_index = cursor.get_u32_le();
        let nonce = Bytes::copy_from_slice(&cursor[..COOKIE_NONCE_LEN]);
        cursor.advance(COOKIE_NONCE_LEN);
        let encrypted_cookie = Bytes::copy_from_slice(cursor);

        Some(Self {
            receiver_index,
            nonce,
            encrypted_cookie,
        })
    }
}

/// Header of a transport data message, for decryptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl DataHeader {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < DATA_MIN_LEN {
            return None;
        }
        let mut cursor = &payload[MESSAGE_HEADER_LEN..];
        Some(Self {
            receiver_index: cursor.get_u32_le(),
            counter: cursor.get_u64_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_v4(src: [u8; 4], port: u16, tos: u8, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0x45);
        buf.put_u8(tos);
        buf.put_u16((IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16);
        buf.put_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
        buf.put_slice(&src);
        buf.put_slice(&[10, 0, 0, 1]);
        buf.put_u16(port);
        buf.put_u16(51820);
        buf.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
        buf.put_u16(0);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn message(tag: u32, len: usize) -> Vec<u8> {
        let mut m = vec![0u8; len];
        m[..4].copy_from_slice(&tag.to_le_bytes());
        m
    }

    #[test]
    fn classifies_each_kind() {
        let cases = [
            (1, HANDSHAKE_INITIATION_LEN, MessageType::HandshakeInitiation),
            (2, HANDSHAKE_RESPONSE_LEN, MessageType::HandshakeResponse),
            (3, COOKIE_REPLY_LEN, MessageType::CookieReply),
            (4, DATA_MIN_LEN + 20, MessageType::Data),
        ];
        for (tag, len, kind) in cases {
            let frame = classify(&udp_v4([192, 0, 2, 7], 4444, 0, &message(tag, len))).unwrap();
            assert_eq!(frame.kind, kind);
            assert_eq!(frame.payload.len(), len);
            assert_eq!(frame.endpoint, "192.0.2.7:4444".parse().unwrap());
        }
    }

    #[test]
    fn short_buffers_are_malformed() {
        for n in 0..IPV4_HEADER_LEN {
            let buf = Bytes::from(vec![0x45; n]);
            assert!(matches!(classify(&buf), Err(ReceiveError::MalformedFraming(_))));
        }
    }

    #[test]
    fn rejects_unknown_ip_version() {
        let mut raw = udp_v4([192, 0, 2, 7], 1, 0, &message(4, 40)).to_vec();
        raw[0] = 0x55;
        assert!(matches!(classify(&Bytes::from(raw)), Err(ReceiveError::MalformedFraming(_))));
    }

    #[test]
    fn rejects_udp_length_mismatch() {
        let good = udp_v4([192, 0, 2, 7], 1, 0, &message(4, 40)).to_vec();

        let mut longer = good.clone();
        longer[24..26].copy_from_slice(&((UDP_HEADER_LEN + 41) as u16).to_be_bytes());
        assert!(classify(&Bytes::from(longer)).is_err());

        let mut shorter = good.clone();
        shorter[24..26].copy_from_slice(&((UDP_HEADER_LEN + 39) as u16).to_be_bytes());
        assert!(classify(&Bytes::from(shorter)).is_err());

        let mut tiny = good;
        tiny[24..26].copy_from_slice(&4u16.to_be_bytes());
        assert!(classify(&Bytes::from(tiny)).is_err());
    }

    #[test]
    fn header_options_move_the_payload_offset() {
        let plain = udp_v4([192, 0, 2, 7], 1, 0, &message(4, 40)).to_vec();
        let mut with_options = plain[..IPV4_HEADER_LEN].to_vec();
        with_options[0] = 0x4f;
        with_options.extend_from_slice(&[1u8; 40]);
        with_options.extend_from_slice(&plain[IPV4_HEADER_LEN..]);

        let frame = classify(&Bytes::from(with_options.clone())).unwrap();
        assert_eq!(frame.kind, MessageType::Data);
        assert_eq!(frame.payload.len(), 40);

        // Largest IHL, but the buffer ends inside the options.
        with_options.truncate(50);
        assert!(matches!(classify(&Bytes::from(with_options)), Err(ReceiveError::MalformedFraming(_))));
    }

    #[test]
    fn rejects_wrong_sized_handshakes_and_unknown_tags() {
        for payload in [message(1, 147), message(2, 93), message(3, 65), message(4, 31), message(9, 64), vec![1, 0]] {
            assert!(classify(&udp_v4([192, 0, 2, 7], 1, 0, &payload)).is_err());
        }
    }

    #[test]
    fn ipv6_endpoint_and_traffic_class() {
        let payload = message(4, 48);
        let mut buf = BytesMut::new();
        buf.put_u32(0x6000_0000 | (0x03 << 20));
        buf.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
        buf.put_u8(17);
        buf.put_u8(64);
        let src: Ipv6Addr = "2001:db8::9".parse().unwrap();
        buf.put_slice(&src.octets());
        buf.put_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.put_u16(9000);
        buf.put_u16(51820);
        buf.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
        buf.put_u16(0);
        buf.put_slice(&payload);

        let frame = classify(&buf.freeze()).unwrap();
        assert_eq!(frame.kind, MessageType::Data);
        assert_eq!(frame.endpoint, SocketAddr::new(IpAddr::V6(src), 9000));
        assert!(IPPacketUtils::is_ce(frame.ds));
    }

    #[test]
    fn cookie_reply_layout() {
        let reply = CookieReplyMessage {
            receiver_index: 77,
            nonce: Bytes::from(vec![1u8; COOKIE_NONCE_LEN]),
            encrypted_cookie: Bytes::from(vec![2u8; 32]),
        };
        let wire = reply.to_bytes();
        assert_eq!(wire.len(), COOKIE_REPLY_LEN);
        assert_eq!(MessageType::determine(&wire), Some(MessageType::CookieReply));
        assert_eq!(CookieReplyMessage::from_bytes(&wire).unwrap().receiver_index, 77);
    }
}
