//! Global bus transport.
//!
//! Publishing signs the packet, persists it as a local message record, and
//! hands the encoded bytes to the send pool. Receiving is split into two
//! budgeted polls: one over the multicast group, one over the unicast router
//! socket. Both feed the same acceptance pipeline:
//!
//! ```text
//! verify signature -> reject future timestamp -> touch sender -> persist
//!                  -> dearmor -> Layer-2 dispatch
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Armored, BusPacket};
use crate::config::AyriaConfig;
use crate::error::{DropReason, NetworkError};
use crate::identity::{self, Identity};
use crate::router::{DispatchOutcome, MessageHandler, MessageRouter};
use crate::store::{MessageRecord, MessageStore};
use crate::topic::Topic;
use crate::transport::{self, Datagram, DatagramSocket, SendPool, SendQueue, SendTarget, TransportStats};

/// Cloneable publishing handle.
///
/// Publishing never touches the sockets directly: the packet is signed,
/// persisted, and queued for the send workers.
#[derive(Clone)]
pub struct BusPublisher {
    identity: Arc<Identity>,
    store: Arc<dyn MessageStore>,
    outbox: Option<SendQueue>,
}

impl BusPublisher {
    /// Armor `payload` and publish it on `topic`.
    pub fn publish(&self, topic: &Topic, payload: &[u8]) -> Result<(), NetworkError> {
        self.publish_armored(topic, Armored::wrap(payload))
    }

    /// Publish a payload that is already armored.
    ///
    /// A payload that could not be delivered is rejected before anything is
    /// persisted. With networking disabled (or after shutdown) the record is
    /// still persisted and the call succeeds.
    pub fn publish_armored(&self, topic: &Topic, payload: Armored) -> Result<(), NetworkError> {
        let packet = BusPacket::sign(&self.identity, topic.hash(), crate::now_millis(), payload);
        let bytes = packet.encode()?;

        let record = MessageRecord {
            owner_id: self.identity.long_id().to_string(),
            topic: packet.topic,
            timestamp: packet.timestamp,
            signature: codec::armor_signature(&packet.signature),
            payload: packet.payload.as_str().to_string(),
            is_local: true,
        };
        if let Err(e) = self.store.record_message(&record) {
            warn!("Failed to persist outgoing {topic} message: {e}");
        }

        let Some(outbox) = &self.outbox else {
            trace!("Networking disabled, {topic} kept local");
            return Ok(());
        };
        match outbox.enqueue(bytes) {
            Err(NetworkError::NetworkingDisabled) => {
                trace!("Send queue closed, {topic} kept local");
                Ok(())
            }
            result => result,
        }
    }

    pub fn is_networked(&self) -> bool {
        self.outbox.as_ref().is_some_and(SendQueue::is_open)
    }
}

/// State of the global bus, owned by the poll thread.
pub struct BusContext {
    identity: Arc<Identity>,
    sender_tag: u32,
    multicast: Option<Arc<dyn DatagramSocket>>,
    unicast: Option<Arc<dyn DatagramSocket>>,
    routers: Arc<RwLock<HashSet<SocketAddr>>>,
    local_addr: Arc<OnceLock<SocketAddr>>,
    store: Arc<dyn MessageStore>,
    handlers: MessageRouter,
    pool: Option<SendPool>,
    publisher: BusPublisher,
    multicast_budget: usize,
    router_budget: usize,
    scratch: Vec<u8>,
    stats: TransportStats,
}

impl BusContext {
    /// Bind the bus sockets described by `config`.
    ///
    /// A socket that fails to bind disables that path with a warning; the
    /// context still persists locally published messages. Must be called
    /// from within a tokio runtime.
    pub fn bind(config: &AyriaConfig, identity: Arc<Identity>, store: Arc<dyn MessageStore>) -> Self {
        if !config.networking_enabled {
            info!("Networking disabled by configuration");
            return Self::with_sockets(config, identity, store, None, None);
        }

        let multicast: Option<Arc<dyn DatagramSocket>> =
            match transport::bind_multicast(config.bus_group(), config.multicast_ttl) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("Bus multicast setup failed, networking disabled: {e}");
                    None
                }
            };

        let unicast: Option<Arc<dyn DatagramSocket>> = match multicast {
            Some(_) => match transport::bind_unicast(config.router_port) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("Router socket setup failed, relays unavailable: {e}");
                    None
                }
            },
            None => None,
        };

        Self::with_sockets(config, identity, store, multicast, unicast)
    }

    /// Build a context over caller-supplied sockets.
    ///
    /// Without a multicast socket no send pool is started and the context
    /// runs offline. With one, this must be called from within a tokio
    /// runtime.
    pub fn with_sockets(
        config: &AyriaConfig,
        identity: Arc<Identity>,
        store: Arc<dyn MessageStore>,
        multicast: Option<Arc<dyn DatagramSocket>>,
        unicast: Option<Arc<dyn DatagramSocket>>,
    ) -> Self {
        let sender_tag: u32 = rand::random();
        let routers = Arc::new(RwLock::new(config.routers.iter().copied().collect::<HashSet<_>>()));

        let pool = multicast.as_ref().map(|multicast| {
            SendPool::spawn(
                config.send_workers,
                config.send_queue_capacity,
                SendTarget {
                    multicast: Arc::clone(multicast),
                    unicast: unicast.clone(),
                    group: SocketAddr::V4(config.bus_group()),
                    routers: Arc::clone(&routers),
                    sender_tag,
                },
            )
        });

        let publisher = BusPublisher {
            identity: Arc::clone(&identity),
            store: Arc::clone(&store),
            outbox: pool.as_ref().map(SendPool::queue),
        };

        debug!(
            "Bus context for {} (tag {sender_tag:#010x}, {} router(s))",
            identity.long_id(),
            routers.read().len()
        );

        Self {
            identity,
            sender_tag,
            multicast,
            unicast,
            routers,
            local_addr: Arc::new(OnceLock::new()),
            store,
            handlers: MessageRouter::new(),
            pool,
            publisher,
            multicast_budget: config.multicast_budget,
            router_budget: config.router_budget,
            scratch: vec![0u8; transport::DEFAULT_SCRATCH_LEN],
            stats: TransportStats::default(),
        }
    }

    /// A context with no sockets at all.
    pub fn offline(config: &AyriaConfig, identity: Arc<Identity>, store: Arc<dyn MessageStore>) -> Self {
        Self::with_sockets(config, identity, store, None, None)
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn sender_tag(&self) -> u32 {
        self.sender_tag
    }

    pub fn is_networked(&self) -> bool {
        self.pool.is_some()
    }

    /// Our own address, once learned from a multicast echo.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub(crate) fn local_addr_handle(&self) -> Arc<OnceLock<SocketAddr>> {
        Arc::clone(&self.local_addr)
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn publisher(&self) -> BusPublisher {
        self.publisher.clone()
    }

    pub fn publish(&self, topic: &Topic, payload: &[u8]) -> Result<(), NetworkError> {
        self.publisher.publish(topic, payload)
    }

    /// Register a Layer-2 handler for bus packets on `topic`.
    pub fn on_message(&mut self, topic: &Topic, handler: MessageHandler) {
        self.handlers.register(topic, handler);
    }

    // -- Router set --------------------------------------------------------

    pub fn add_router(&self, addr: SocketAddr) -> bool {
        self.routers.write().insert(addr)
    }

    pub fn remove_router(&self, addr: SocketAddr) -> bool {
        self.routers.write().remove(&addr)
    }

    pub fn is_router(&self, addr: &SocketAddr) -> bool {
        self.routers.read().contains(addr)
    }

    /// Current router set, sorted.
    pub fn routers(&self) -> Vec<SocketAddr> {
        let mut routers: Vec<_> = self.routers.read().iter().copied().collect();
        routers.sort();
        routers
    }

    pub(crate) fn router_handle(&self) -> Arc<RwLock<HashSet<SocketAddr>>> {
        Arc::clone(&self.routers)
    }

    // -- Receive -----------------------------------------------------------

    /// Drain up to the multicast budget. Returns datagrams processed.
    pub fn poll_multicast(&mut self) -> usize {
        let Some(socket) = self.multicast.clone() else {
            return 0;
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        let processed = transport::drain_budget(socket.as_ref(), &mut scratch, self.multicast_budget, |d| {
            let result = self.handle_multicast(&d);
            self.record(&d, result);
        });
        self.scratch = scratch;
        processed
    }

    /// Drain up to the router budget. Returns datagrams processed.
    pub fn poll_routers(&mut self) -> usize {
        let Some(socket) = self.unicast.clone() else {
            return 0;
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        let processed = transport::drain_budget(socket.as_ref(), &mut scratch, self.router_budget, |d| {
            let result = self.handle_router(&d);
            self.record(&d, result);
        });
        self.scratch = scratch;
        processed
    }

    fn record(&mut self, datagram: &Datagram, result: Result<DispatchOutcome, DropReason>) {
        match result {
            Ok(outcome) => self.stats.record_accepted(outcome.interpreted()),
            Err(reason) => {
                self.stats.record_dropped();
                trace!(from = %datagram.from, "Dropped bus packet: {reason}");
            }
        }
    }

    /// Run one multicast datagram through the pipeline.
    pub fn handle_multicast(&mut self, datagram: &Datagram) -> Result<DispatchOutcome, DropReason> {
        let (tag, body) = codec::split_overhead(&datagram.data)?;
        if tag == self.sender_tag {
            if self.local_addr.set(datagram.from).is_ok() {
                debug!("Learned own bus address {}", datagram.from);
            }
            return Err(DropReason::Loopback);
        }
        let packet = BusPacket::decode(body)?;
        self.accept(packet)
    }

    /// Run one router datagram through the pipeline. Only addresses in the
    /// router set are trusted.
    pub fn handle_router(&mut self, datagram: &Datagram) -> Result<DispatchOutcome, DropReason> {
        if !self.is_router(&datagram.from) {
            return Err(DropReason::UntrustedRouter(datagram.from));
        }
        let packet = BusPacket::decode(&datagram.data)?;
        // Routers relay our own packets back to us.
        if packet.public_key == self.identity.public_key() {
            return Err(DropReason::Loopback);
        }
        self.accept(packet)
    }

    fn accept(&mut self, packet: BusPacket) -> Result<DispatchOutcome, DropReason> {
        if !packet.verify() {
            return Err(DropReason::BadSignature);
        }
        let now = crate::now_millis();
        if packet.timestamp > now {
            return Err(DropReason::FutureTimestamp {
                timestamp: packet.timestamp,
                now,
            });
        }

        let sender = packet.sender_long_id();
        if let Err(e) = self
            .store
            .touch_client(&sender, identity::short_id_of(&sender), packet.timestamp)
        {
            warn!("Failed to update last-seen for {sender}: {e}");
        }
        let record = MessageRecord {
            owner_id: sender.clone(),
            topic: packet.topic,
            timestamp: packet.timestamp,
            signature: codec::armor_signature(&packet.signature),
            payload: packet.payload.as_str().to_string(),
            is_local: false,
        };
        if let Err(e) = self.store.record_message(&record) {
            warn!("Failed to persist message from {sender}: {e}");
        }

        let payload = packet.payload.decode()?;
        Ok(self.handlers.dispatch(packet.topic, packet.timestamp, &sender, &payload))
    }

    /// Stop accepting publishes and let queued packets drain.
    pub async fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
