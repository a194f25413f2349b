//! Network configuration for an Ayria node.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Derive a multicast endpoint from a name.
///
/// Every compatible client hashes the same name, so all agree on the group
/// without configuration. Addresses fall in the administratively scoped
/// `239.0.0.0/8` block.
pub fn derive_group(name: &str) -> SocketAddrV4 {
    let hash = xxhash_rust::xxh32::xxh32(name.as_bytes(), 0);
    let [a, b, c, _] = hash.to_be_bytes();
    let port = 1024 + (hash % (u16::MAX as u32 - 1024)) as u16;
    SocketAddrV4::new(Ipv4Addr::new(239, a, b, c), port)
}

/// Configuration for the Ayria networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AyriaConfig {
    /// Name both multicast groups are derived from.
    pub project_name: String,

    /// Whether to open any sockets at all.
    pub networking_enabled: bool,

    /// Whether the LAN presence transport runs.
    pub lan_enabled: bool,

    /// Trusted relay addresses used to extend the bus beyond multicast reach.
    pub routers: Vec<SocketAddr>,

    /// Local port for the router (unicast) socket. `0` picks an ephemeral port.
    pub router_port: u16,

    /// Period of the receive polls.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Period of the LAN `Clienthello` announcement.
    #[serde(with = "duration_ms")]
    pub announce_interval: Duration,

    /// LAN clients silent for longer than this are dropped.
    #[serde(with = "duration_ms")]
    pub client_timeout: Duration,

    /// Packets dequeued per poll from the bus multicast socket.
    pub multicast_budget: usize,

    /// Packets dequeued per poll from the bus router socket.
    pub router_budget: usize,

    /// Packets dequeued per poll from the LAN socket.
    pub lan_budget: usize,

    /// Number of background send workers.
    pub send_workers: usize,

    /// Capacity of the outbound queue shared by the send workers.
    pub send_queue_capacity: usize,

    /// Multicast TTL; `1` keeps traffic on the local segment.
    pub multicast_ttl: u32,

    /// Display name announced to LAN peers.
    pub username: String,
}

impl Default for AyriaConfig {
    fn default() -> Self {
        Self {
            project_name: "Ayria".to_string(),
            networking_enabled: true,
            lan_enabled: true,
            routers: Vec::new(),
            router_port: 0,
            poll_interval: Duration::from_millis(200),
            announce_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(30),
            multicast_budget: 5,
            router_budget: 10,
            lan_budget: 10,
            send_workers: 2,
            send_queue_capacity: 64,
            multicast_ttl: 1,
            username: "Ayria user".to_string(),
        }
    }
}

impl AyriaConfig {
    /// Multicast endpoint of the global bus.
    pub fn bus_group(&self) -> SocketAddrV4 {
        derive_group(&self.project_name)
    }

    /// Multicast endpoint of the LAN presence transport.
    pub fn lan_group(&self) -> SocketAddrV4 {
        derive_group(&format!("{}::LAN", self.project_name))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<AyriaConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
