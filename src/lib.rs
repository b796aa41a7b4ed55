// src/lib.rs
//! Receive side of a WireGuard style tunnel.
//!
//! Datagrams enter through [`Device::receive`]. Handshake messages are queued
//! and drained by a deferred worker that applies the under-load cookie
//! policy; data messages go to a [`Decryptor`], which reports back through
//! [`Device::receive_data_packet`].

pub mod config;
pub mod cookie;
pub mod cryptography;
pub mod device;
pub mod error;
pub mod handshake;
pub mod message;
pub mod noise;
pub mod peer;
pub mod receive;
pub mod routing;
pub mod session;
pub mod stats;
pub mod utils;

pub use config::ReceiveConfig;
pub use cookie::{CookieChecker, MacCookieChecker, MacState};
pub use device::{
    ChannelNetStack, Collaborators, Decryptor, Device, NetStack, PacketSender, Scheduler, SmolScheduler, Timers, Work,
};
pub use error::ReceiveError;
pub use message::{classify, Frame, MessageType};
pub use noise::NoiseEngine;
pub use peer::{KeyPair, Keypairs, Peer};
pub use receive::DecryptedPacket;
pub use routing::{Cidr, RoutingTable};
pub use stats::{DeviceStats, StatsSnapshot};
