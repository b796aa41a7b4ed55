// src/error.rs
use thiserror::Error;

/// Reasons a received packet is discarded.
///
/// None of these are fatal. By the time one is returned the packet has been
/// dropped and, where the kernel would, a device counter has been bumped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiveError {
    /// Structurally invalid outer framing or message layout
    #[error("malformed framing: {0}")]
    MalformedFraming(&'static str),

    /// Bad MAC, bad cookie or a handshake the noise engine rejected
    #[error("authentication failure: {0}")]
    AuthenticationFailure(&'static str),

    /// Handshake queue is full
    #[error("too many handshakes queued")]
    QueueOverflow,

    /// Inner source address is not routed to the decrypting peer
    #[error("source address not allowed for peer")]
    BindingViolation,

    /// The host stack refused the packet
    #[error("host stack rejected packet")]
    DeliveryFailure,

    /// Decryption failed or came back without a peer/endpoint
    #[error("decryption failed")]
    DecryptionFailed,
}
