//! Ayria Network: serverless message bus and LAN presence.
//!
//! This crate lets processes on a network discover each other and exchange
//! authenticated, optionally encrypted messages without a central broker.
//!
//! # Architecture
//!
//! - **Bus**: signed, compressed packets multicast to a group derived from
//!   the project name, plus best-effort unicast to trusted routers.
//! - **LAN**: session-scoped presence with `Clienthello`/`Clientgoodbye`,
//!   targeted, signed, and encrypted packets.
//! - **Dispatch**: raw topic handlers (Layer 2), JSON endpoints (Layer 3),
//!   and local notifications (Layer 4). Endpoints on other peers are
//!   called over the bus with `AyriaNode::call_remote`.
//! - **Scheduling**: one cooperative thread polls every socket on a fixed
//!   period with a small packet budget; sends go through a worker pool.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ayria_network::{AyriaConfig, AyriaNode, Identity, SqliteStore, Topic};
//!
//! # async fn example() -> Result<(), ayria_network::NetworkError> {
//! let store = Arc::new(SqliteStore::open(std::path::Path::new("ayria.db"))?);
//! let mut node = AyriaNode::start(AyriaConfig::default(), Arc::new(Identity::generate()), store);
//!
//! node.on_message(&Topic::PresenceUpdate, Arc::new(|_ts, sender, payload| {
//!     println!("{sender}: {}", String::from_utf8_lossy(payload));
//!     true
//! }));
//! node.publish(&Topic::PresenceUpdate, br#"{"online":true}"#)?;
//!
//! let (_stop, shutdown) = tokio::sync::broadcast::channel(1);
//! node.run(shutdown).await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod lan;
pub mod node;
pub mod notify;
pub mod router;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod topic;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use bus::{BusContext, BusPublisher};
pub use codec::Armored;
pub use config::AyriaConfig;
pub use error::{CodecError, DropReason, NetworkError};
pub use identity::{AccountId, Identity};
pub use lan::{LanContext, LanEvent, SendOptions};
pub use node::AyriaNode;
pub use notify::{NotificationHub, events};
pub use router::{DispatchOutcome, MessageHandler};
pub use rpc::{RemoteCall, RpcClient};
pub use store::{MessageRecord, MessageStore, SqliteStore};
pub use topic::{Topic, TopicHash};
pub use transport::{DatagramSocket, MemorySocket, TransportStats};

/// Current UTC time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
