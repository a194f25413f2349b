//! Network error types.

use thiserror::Error;

use crate::identity::AccountId;

/// Errors that can occur in the ayria_network crate.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// An I/O error occurred (socket setup, send, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The relational store rejected an operation.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A packet could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The outbound send queue is full; the packet was not queued.
    #[error("Send queue is full")]
    QueueFull,

    /// Socket setup failed earlier, so this process runs without networking.
    #[error("Networking is disabled")]
    NetworkingDisabled,

    /// No LAN client with the given account id is known.
    #[error("Unknown LAN client: {0}")]
    UnknownClient(AccountId),

    /// Endpoint names must look like `Namespace::Verb`.
    #[error("Invalid endpoint name: {0}")]
    InvalidEndpoint(String),

    /// A remote endpoint call got no response before its deadline.
    #[error("No response from remote endpoint {0}")]
    RpcTimeout(String),
}

/// Errors raised while (de)serializing wire packets.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before a complete field could be read.
    #[error("Truncated packet: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// The block compressor failed on either side.
    #[error("Compression error: {0}")]
    Compression(String),

    /// The decompressed payload would exceed the fixed limit.
    #[error("Decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: usize },

    /// The encoded packet does not fit in one UDP datagram.
    #[error("Encoded packet is {size} bytes, datagram limit is {limit}")]
    DatagramTooLarge { size: usize, limit: usize },

    /// The armored payload is not valid text-safe encoding.
    #[error("Armor decode failed: {0}")]
    Armor(#[from] base64::DecodeError),

    /// An unknown bit was set in the LAN flag byte.
    #[error("Invalid flag byte: {0:#04x}")]
    InvalidFlags(u8),
}

/// Why a received packet was discarded.
///
/// Drops never propagate past the poll loop; they are counted and traced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DropReason {
    /// Our own multicast echo.
    #[error("own loopback packet")]
    Loopback,

    /// Sender session is on the blacklist.
    #[error("blacklisted session {0:#010x}")]
    Blacklisted(u32),

    /// Targeted at another account.
    #[error("targeted at another account")]
    NotForUs,

    /// Truncated, undecodable or otherwise malformed bytes.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// Signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// Decryption failed.
    #[error("decryption failed")]
    Undecryptable,

    /// Timestamp lies in the receiver's future.
    #[error("timestamp {timestamp} is ahead of local clock {now}")]
    FutureTimestamp { timestamp: u64, now: u64 },

    /// Non-hello LAN packet from a session we have no record for.
    #[error("unknown sender session {0:#010x}")]
    UnknownSender(u32),

    /// Unicast datagram from an address outside the router set.
    #[error("datagram from untrusted router {0}")]
    UntrustedRouter(std::net::SocketAddr),

    /// Encrypted LAN packet without a target.
    #[error("encrypted packet without target")]
    UntargetedEncryption,

    /// A `Clienthello` that is structurally invalid or self-inconsistent.
    /// The sender is blacklisted.
    #[error("invalid client hello: {0}")]
    InvalidHello(String),

    /// A `Clienthello` for a known session carrying a different signing key.
    #[error("session {0:#010x} is bound to another key")]
    SessionConflict(u32),
}

impl From<CodecError> for DropReason {
    fn from(e: CodecError) -> Self {
        DropReason::Malformed(e.to_string())
    }
}
