// src/cookie.rs
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cryptography::{hash, mac, xchacha20_poly1305_decrypt, xchacha20_poly1305_encrypt, Key};
use crate::error::ReceiveError;
use crate::message::{macs, CookieReplyMessage, COOKIE_NONCE_LEN, MAC_LEN};
use crate::utils::{constant_time_equals, now_ms, LABEL_COOKIE, LABEL_MAC1};

pub const COOKIE_SECRET_MAX_AGE_MS: i64 = 120_000;
pub const COOKIE_SECRET_LATENCY_MS: i64 = 5_000;
const COOKIE_USABLE_MS: i64 = COOKIE_SECRET_MAX_AGE_MS - COOKIE_SECRET_LATENCY_MS;

/// Outcome of checking the MAC trailer of a handshake message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacState {
    Invalid,
    ValidNoCookie,
    ValidWithCookie,
}

pub trait CookieChecker: Send + Sync {
    /// Checks mac1, and mac2 as well when `under_load` asks for a cookie.
    fn validate(&self, payload: &[u8], source: SocketAddr, under_load: bool) -> MacState;

    /// Builds a cookie reply to `payload`, addressed to `sender_index`.
    fn create_reply(&self, payload: &[u8], sender_index: u32, source: SocketAddr) -> Option<Bytes>;

    /// Takes in a cookie reply sent back for one of our own handshakes.
    fn consume_reply(&self, payload: &[u8]) -> Result<(), ReceiveError>;
}

struct PendingInitiation {
    cookie_key: Key,
    mac1: Bytes,
    sent_at: i64,
}

/// MAC and cookie handling keyed on the local static public key.
pub struct MacCookieChecker {
    mac1_key: Bytes,
    cookie_key: Key,
    secret: RwLock<Bytes>,
    secret_birth: AtomicI64,
    pending: DashMap<u32, PendingInitiation>,
    cookies: DashMap<u32, (Bytes, i64)>,
}

fn random_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

fn source_bytes(source: SocketAddr) -> Vec<u8> {
    let mut out = match source.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&source.port().to_be_bytes());
    out
}

impl MacCookieChecker {
    pub fn new(local_static_public: &Key) -> Self {
        Self {
            mac1_key: hash(&[LABEL_MAC1, &local_static_public.0]),
            cookie_key: Key(hash(&[LABEL_COOKIE, &local_static_public.0])),
            secret: RwLock::new(random_bytes(32)),
            secret_birth: AtomicI64::new(now_ms()),
            pending: DashMap::new(),
            cookies: DashMap::new(),
        }
    }

    /// Fills in the mac1/mac2 trailer of an outgoing handshake message bound
    /// for `remote_static_public`. Returns the mac1 that was written.
    pub fn stamp(message: &mut [u8], remote_static_public: &Key, cookie: Option<&[u8]>) -> Option<Bytes> {
        if message.len() < 2 * MAC_LEN {
            return None;
        }
        let mac1_at = message.len() - 2 * MAC_LEN;
        let mac2_at = message.len() - MAC_LEN;

        let mac1_key = hash(&[LABEL_MAC1, &remote_static_public.0]);
        let mac1 = mac(&mac1_key, &[&message[..mac1_at]])?;
        message[mac1_at..mac2_at].copy_from_slice(&mac1);

        let mac2 = match cookie {
            Some(cookie) => mac(cookie, &[&message[..mac2_at]])?,
            None => Bytes::from(vec![0u8; MAC_LEN]),
        };
        message[mac2_at..].copy_from_slice(&mac2);
        Some(mac1)
    }

    /// Records an initiation we sent so a cookie reply to it can be opened.
    pub fn remember_initiation(&self, sender_index: u32, remote_static_public: &Key, mac1: Bytes) {
        self.remember_initiation_at(sender_index, remote_static_public, mac1, now_ms());
    }

    pub(crate) fn remember_initiation_at(&self, sender_index: u32, remote_static_public: &Key, mac1: Bytes, now: i64) {
        // No responder answers with a cookie older than its secret.
        self.pending.retain(|_, p| now - p.sent_at < COOKIE_SECRET_MAX_AGE_MS);
        self.cookies.retain(|_, (_, received_at)| now - *received_at < COOKIE_USABLE_MS);
        self.pending.insert(
            sender_index,
            PendingInitiation {
                cookie_key: Key(hash(&[LABEL_COOKIE, &remote_static_public.0])),
                mac1,
                sent_at: now,
            },
        );
    }

    pub fn forget_initiation(&self, sender_index: u32) {
        self.pending.remove(&sender_index);
    }

    pub fn pending_initiations(&self) -> usize {
        self.pending.len()
    }

    /// The cookie a responder handed us for `sender_index`, while it is still
    /// young enough to be accepted.
    pub fn cookie_for(&self, sender_index: u32) -> Option<Bytes> {
        self.cookie_for_at(sender_index, now_ms())
    }

    pub(crate) fn cookie_for_at(&self, sender_index: u32, now: i64) -> Option<Bytes> {
        self.cookies
            .remove_if(&sender_index, |_, (_, received_at)| now - *received_at >= COOKIE_USABLE_MS);
        self.cookies.get(&sender_index).map(|entry| entry.value().0.clone())
    }

    fn current_secret(&self) -> Bytes {
        let now = now_ms();
        let birth = self.secret_birth.load(Ordering::Acquire);
        if now - birth > COOKIE_SECRET_MAX_AGE_MS
            && self.secret_birth.compare_exchange(birth, now, Ordering::AcqRel, Ordering::Acquire).is_ok()
        {
            let mut guard = match self.secret.write() { Ok(g) => g, Err(e) => e.into_inner() };
            *guard = random_bytes(32);
            info!("Cookie secret rotated.");
        }
        match self.secret.read() { Ok(g) => g.clone(), Err(e) => e.into_inner().clone() }
    }

    fn make_cookie(&self, source: SocketAddr) -> Option<Bytes> {
        mac(&self.current_secret(), &[&source_bytes(source)])
    }
}

impl CookieChecker for MacCookieChecker {
    fn validate(&self, payload: &[u8], source: SocketAddr, under_load: bool) -> MacState {
        let (their_mac1, their_mac2) = match macs(payload) {
            Some(m) => m,
            None => return MacState::Invalid,
        };
        let mac1_at = payload.len() - 2 * MAC_LEN;
        let mac2_at = payload.len() - MAC_LEN;

        match mac(&self.mac1_key, &[&payload[..mac1_at]]) {
            Some(expected) if constant_time_equals(&expected, their_mac1) => {}
            _ => return MacState::Invalid,
        }
        if !under_load {
            return MacState::ValidNoCookie;
        }

        let expected_mac2 = self
            .make_cookie(source)
            .and_then(|cookie| mac(&cookie, &[&payload[..mac2_at]]));
        match expected_mac2 {
            Some(expected) if constant_time_equals(&expected, their_mac2) => MacState::ValidWithCookie,
            _ => MacState::ValidNoCookie,
        }
    }

    fn create_reply(&self, payload: &[u8], sender_index: u32, source: SocketAddr) -> Option<Bytes> {
        let (their_mac1, _) = macs(payload)?;
        let cookie = self.make_cookie(source)?;
        let nonce = random_bytes(COOKIE_NONCE_LEN);
        let encrypted_cookie = xchacha20_poly1305_encrypt(&self.cookie_key, &nonce, &cookie, their_mac1)?;

        Some(
            CookieReplyMessage {
                receiver_index: sender_index,
                nonce,
                encrypted_cookie,
            }
            .to_bytes(),
        )
    }

    fn consume_reply(&self, payload: &[u8]) -> Result<(), ReceiveError> {
        let reply = CookieReplyMessage::from_bytes(payload)
            .ok_or(ReceiveError::MalformedFraming("cookie reply has wrong size"))?;

        let cookie = {
            let pending = self
                .pending
                .get(&reply.receiver_index)
                .ok_or(ReceiveError::AuthenticationFailure("cookie reply for unknown index"))?;
            xchacha20_poly1305_decrypt(&pending.cookie_key, &reply.nonce, &reply.encrypted_cookie, &pending.mac1)
                .ok_or(ReceiveError::AuthenticationFailure("could not decrypt cookie reply"))?
        };

        // Forged replies leave the initiation in place.
        self.pending.remove(&reply.receiver_index);
        debug!("Stored cookie for handshake index {}", reply.receiver_index);
        self.cookies.insert(reply.receiver_index, (cookie, now_ms()));
        Ok(())
    }
}
