//! Message topics: the closed set of built-in protocol messages plus an
//! escape case for plugin-defined topics.
//!
//! On the wire a topic travels only as its 32-bit [`TopicHash`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hash a topic name into its wire representation.
pub const fn hash_name(name: &str) -> u32 {
    xxhash_rust::const_xxh32::xxh32(name.as_bytes(), 0)
}

/// The 32-bit message-type hash carried in every packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicHash(pub u32);

impl fmt::Display for TopicHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A message topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    // ── LAN session lifecycle ───────────────────────────────────────
    /// Periodic session announcement carrying the client record.
    ClientHello,
    /// Session teardown.
    ClientGoodbye,

    // ── Services ────────────────────────────────────────────────────
    PresenceUpdate,
    GroupUpdate,
    MatchmakingUpdate,
    InstantMessage,
    FileshareUpdate,

    // ── Remote endpoint calls ───────────────────────────────────────
    /// A Layer-3 endpoint call addressed to one peer or to everyone.
    RpcRequest,
    /// The endpoint's answer, addressed back to the caller.
    RpcResponse,

    // ── Extensible ──────────────────────────────────────────────────
    /// Externally registered topic, e.g. from a plugin.
    Custom(String),
}

const CLIENT_HELLO: &str = "Clienthello";
const CLIENT_GOODBYE: &str = "Clientgoodbye";
const PRESENCE_UPDATE: &str = "Presence::Update";
const GROUP_UPDATE: &str = "Group::Update";
const MATCHMAKING_UPDATE: &str = "Matchmaking::Update";
const INSTANT_MESSAGE: &str = "Messaging::Instant";
const FILESHARE_UPDATE: &str = "Fileshare::Update";
const RPC_REQUEST: &str = "Rpc::Request";
const RPC_RESPONSE: &str = "Rpc::Response";

impl Topic {
    /// The topic's canonical name.
    pub fn name(&self) -> &str {
        match self {
            Self::ClientHello => CLIENT_HELLO,
            Self::ClientGoodbye => CLIENT_GOODBYE,
            Self::PresenceUpdate => PRESENCE_UPDATE,
            Self::GroupUpdate => GROUP_UPDATE,
            Self::MatchmakingUpdate => MATCHMAKING_UPDATE,
            Self::InstantMessage => INSTANT_MESSAGE,
            Self::FileshareUpdate => FILESHARE_UPDATE,
            Self::RpcRequest => RPC_REQUEST,
            Self::RpcResponse => RPC_RESPONSE,
            Self::Custom(name) => name,
        }
    }

    /// Map a name to its built-in variant, or wrap it as [`Topic::Custom`].
    pub fn from_name(name: &str) -> Self {
        match name {
            CLIENT_HELLO => Self::ClientHello,
            CLIENT_GOODBYE => Self::ClientGoodbye,
            PRESENCE_UPDATE => Self::PresenceUpdate,
            GROUP_UPDATE => Self::GroupUpdate,
            MATCHMAKING_UPDATE => Self::MatchmakingUpdate,
            INSTANT_MESSAGE => Self::InstantMessage,
            FILESHARE_UPDATE => Self::FileshareUpdate,
            RPC_REQUEST => Self::RpcRequest,
            RPC_RESPONSE => Self::RpcResponse,
            other => Self::Custom(other.to_string()),
        }
    }

    /// The wire hash used for dispatch.
    pub fn hash(&self) -> TopicHash {
        TopicHash(hash_name(self.name()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
