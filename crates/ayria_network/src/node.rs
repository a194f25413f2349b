//! AyriaNode: top-level coordinator for the overlay.
//!
//! [`AyriaNode`] owns both transports and the three dispatch layers:
//! - Layer 2: raw topic handlers on the bus and on the LAN
//! - Layer 3: named JSON endpoints, callable locally or over the bus
//! - Layer 4: local notifications
//!
//! All receive paths are driven from one cooperative [`Scheduler`]; only
//! the bus send workers run elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::{BusContext, BusPublisher};
use crate::config::AyriaConfig;
use crate::endpoints::{Endpoint, EndpointRegistry, error_response};
use crate::error::NetworkError;
use crate::identity::Identity;
use crate::lan::{LanContext, SendOptions};
use crate::notify::{NotificationHub, Subscriber, SubscriptionId};
use crate::router::MessageHandler;
use crate::rpc::{self, RemoteCall, RpcClient};
use crate::scheduler::Scheduler;
use crate::store::{MessageRecord, MessageStore};
use crate::topic::Topic;

pub struct AyriaNode {
    identity: Arc<Identity>,
    config: AyriaConfig,
    store: Arc<dyn MessageStore>,
    bus: BusContext,
    /// `None` when the LAN transport is disabled by configuration.
    lan: Option<LanContext>,
    endpoints: Arc<EndpointRegistry>,
    rpc: RpcClient,
    notifications: Arc<NotificationHub>,
}

impl AyriaNode {
    /// Bind every socket `config` asks for. Socket failures degrade to
    /// offline operation rather than failing. Must be called from within a
    /// tokio runtime.
    pub fn start(config: AyriaConfig, identity: Arc<Identity>, store: Arc<dyn MessageStore>) -> Self {
        let notifications = Arc::new(NotificationHub::new());
        let bus = BusContext::bind(&config, Arc::clone(&identity), Arc::clone(&store));
        let lan = config
            .lan_enabled
            .then(|| LanContext::bind(&config, Arc::clone(&identity), Arc::clone(&notifications)));
        info!(
            "Ayria node {} started (bus {}, LAN {})",
            identity.long_id(),
            if bus.is_networked() { "online" } else { "offline" },
            match &lan {
                Some(lan) if lan.is_networked() => "online",
                Some(_) => "offline",
                None => "disabled",
            }
        );
        Self::from_parts(config, identity, store, bus, lan, notifications)
    }

    /// A node without sockets. Publishing still persists locally.
    pub fn offline(config: AyriaConfig, identity: Arc<Identity>, store: Arc<dyn MessageStore>) -> Self {
        let notifications = Arc::new(NotificationHub::new());
        let bus = BusContext::offline(&config, Arc::clone(&identity), Arc::clone(&store));
        let lan = config.lan_enabled.then(|| {
            LanContext::with_socket(&config, Arc::clone(&identity), Arc::clone(&notifications), None)
        });
        Self::from_parts(config, identity, store, bus, lan, notifications)
    }

    /// Assemble a node from prebuilt transports. `lan` must publish to
    /// `notifications`.
    pub fn from_parts(
        config: AyriaConfig,
        identity: Arc<Identity>,
        store: Arc<dyn MessageStore>,
        mut bus: BusContext,
        lan: Option<LanContext>,
        notifications: Arc<NotificationHub>,
    ) -> Self {
        let endpoints = Arc::new(EndpointRegistry::new());
        let rpc = RpcClient::new(identity.long_id(), bus.publisher());
        bus.on_message(&Topic::RpcResponse, rpc.response_handler());
        bus.on_message(
            &Topic::RpcRequest,
            rpc::request_handler(identity.long_id().to_string(), Arc::clone(&endpoints), bus.publisher()),
        );

        let node = Self {
            identity,
            config,
            store,
            bus,
            lan,
            endpoints,
            rpc,
            notifications,
        };
        node.register_builtin_endpoints();
        node
    }

    fn register_builtin_endpoints(&self) {
        let identity = Arc::clone(&self.identity);
        let session_id = self.lan.as_ref().map(LanContext::session_id);
        let sender_tag = self.bus.sender_tag();
        let networked = self.bus.is_networked();
        let local_addr = self.bus.local_addr_handle();
        let routers = self.bus.router_handle();
        let info: Endpoint = Arc::new(move |_| {
            let mut router_list: Vec<String> = routers.read().iter().map(ToString::to_string).collect();
            router_list.sort();
            json!({
                "LongID": identity.long_id(),
                "ShortID": identity.short_id(),
                "AccountID": identity.account_id().to_string(),
                "SessionID": session_id,
                "SenderTag": sender_tag,
                "LocalAddress": local_addr.get().map(ToString::to_string),
                "Networked": networked,
                "Routers": router_list,
            })
        });

        let routers = self.bus.router_handle();
        let add_router: Endpoint = Arc::new(move |request| match parse_address(&request) {
            Ok(addr) => {
                let added = routers.write().insert(addr);
                if added {
                    info!("Router {addr} added");
                }
                json!({ "Added": added })
            }
            Err(response) => response,
        });

        let routers = self.bus.router_handle();
        let remove_router: Endpoint = Arc::new(move |request| match parse_address(&request) {
            Ok(addr) => {
                let removed = routers.write().remove(&addr);
                if removed {
                    info!("Router {addr} removed");
                }
                json!({ "Removed": removed })
            }
            Err(response) => response,
        });

        for (name, endpoint) in [
            ("Network::Info", info),
            ("Network::Addrouter", add_router),
            ("Network::Removerouter", remove_router),
        ] {
            if let Err(e) = self.endpoints.add_endpoint(name, endpoint) {
                warn!("Failed to register built-in endpoint {name}: {e}");
            }
        }
    }

    // -- Accessors ---------------------------------------------------------

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn config(&self) -> &AyriaConfig {
        &self.config
    }

    pub fn bus(&self) -> &BusContext {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut BusContext {
        &mut self.bus
    }

    pub fn lan(&self) -> Option<&LanContext> {
        self.lan.as_ref()
    }

    pub fn lan_mut(&mut self) -> Option<&mut LanContext> {
        self.lan.as_mut()
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn notifications(&self) -> &Arc<NotificationHub> {
        &self.notifications
    }

    // -- Layer 2 -----------------------------------------------------------

    pub fn publish(&self, topic: &Topic, payload: &[u8]) -> Result<(), NetworkError> {
        self.bus.publish(topic, payload)
    }

    /// A cloneable handle for publishing from other threads.
    pub fn publisher(&self) -> BusPublisher {
        self.bus.publisher()
    }

    pub fn on_message(&mut self, topic: &Topic, handler: MessageHandler) {
        self.bus.on_message(topic, handler);
    }

    /// Register a LAN handler. Returns `false` if the LAN transport is
    /// disabled.
    pub fn on_lan_message(&mut self, topic: &Topic, handler: MessageHandler) -> bool {
        match &mut self.lan {
            Some(lan) => {
                lan.on_message(topic, handler);
                true
            }
            None => false,
        }
    }

    pub fn send_lan(&self, topic: &Topic, body: &[u8], options: SendOptions) -> Result<(), NetworkError> {
        self.lan
            .as_ref()
            .ok_or(NetworkError::NetworkingDisabled)?
            .send(topic, body, options)
    }

    /// Persisted messages on `topic` since `since` (ms), oldest first.
    pub fn history(&self, topic: &Topic, since: u64) -> Result<Vec<MessageRecord>, NetworkError> {
        self.store.messages_since(topic.hash(), since)
    }

    // -- Layer 3 -----------------------------------------------------------

    pub fn add_endpoint(&self, name: &str, endpoint: Endpoint) -> Result<(), NetworkError> {
        self.endpoints.add_endpoint(name, endpoint)
    }

    pub fn call_endpoint(&self, name: &str, request: &str) -> String {
        self.endpoints.call(name, request)
    }

    /// Call an endpoint on other peers over the bus. `target` is the long id
    /// of the one peer that should answer; `None` takes the first answer.
    pub fn call_remote(&self, target: Option<&str>, name: &str, request: Value) -> Result<RemoteCall, NetworkError> {
        self.rpc.call(target, name, request)
    }

    // -- Layer 4 -----------------------------------------------------------

    pub fn subscribe(&self, event: &str, subscriber: Subscriber) -> SubscriptionId {
        self.notifications.subscribe(event, subscriber)
    }

    pub fn notify(&self, event: &str, payload: &Value) -> usize {
        self.notifications.publish(event, payload)
    }

    // -- Periodic work -----------------------------------------------------

    /// One pass over every receive path. Returns datagrams processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = self.bus.poll_multicast() + self.bus.poll_routers();
        if let Some(lan) = &mut self.lan {
            processed += lan.poll();
        }
        processed
    }

    /// Broadcast our `Clienthello`, if the LAN is up.
    pub fn announce(&self) {
        if let Some(lan) = self.lan.as_ref().filter(|lan| lan.is_networked()) {
            if let Err(e) = lan.announce() {
                debug!("LAN announce failed: {e}");
            }
        }
    }

    pub fn prune_clients(&mut self) -> usize {
        self.lan.as_mut().map_or(0, LanContext::prune_stale)
    }

    /// The standard task set: receive polls, LAN announcements, and stale
    /// client pruning.
    pub fn scheduler(&self) -> Scheduler<AyriaNode> {
        let mut scheduler = Scheduler::new();
        scheduler.enqueue_task("bus-multicast", self.config.poll_interval, |node: &mut AyriaNode| {
            node.bus.poll_multicast();
        });
        scheduler.enqueue_task("bus-routers", self.config.poll_interval, |node: &mut AyriaNode| {
            node.bus.poll_routers();
        });
        if self.lan.is_some() {
            scheduler.enqueue_task("lan-poll", self.config.poll_interval, |node: &mut AyriaNode| {
                if let Some(lan) = &mut node.lan {
                    lan.poll();
                }
            });
            scheduler.enqueue_task("lan-announce", self.config.announce_interval, |node: &mut AyriaNode| {
                node.announce();
            });
            scheduler.enqueue_task("lan-prune", self.config.announce_interval, |node: &mut AyriaNode| {
                node.prune_clients();
            });
        }
        scheduler
    }

    /// Announce, then run the scheduler until `shutdown` fires, then shut
    /// down.
    pub async fn run(&mut self, shutdown: broadcast::Receiver<()>) {
        self.announce();
        let mut scheduler = self.scheduler();
        scheduler.run(self, shutdown).await;
        self.shutdown().await;
    }

    /// Say goodbye on the LAN and drain the bus send queue.
    pub async fn shutdown(&mut self) {
        if let Some(lan) = self.lan.as_ref().filter(|lan| lan.is_networked()) {
            if let Err(e) = lan.send_goodbye() {
                debug!("LAN goodbye failed: {e}");
            }
        }
        self.bus.shutdown().await;
        info!("Ayria node {} stopped", self.identity.long_id());
    }
}

fn parse_address(request: &Value) -> Result<SocketAddr, Value> {
    let text = request
        .get("Address")
        .and_then(Value::as_str)
        .ok_or_else(|| error_response("Missing Address"))?;
    text.parse()
        .map_err(|_| error_response(format!("Invalid address: {text}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn node() -> AyriaNode {
        AyriaNode::offline(
            AyriaConfig::default(),
            Arc::new(Identity::generate()),
            Arc::new(SqliteStore::in_memory().unwrap()),
        )
    }

    fn call(node: &AyriaNode, name: &str, request: &str) -> Value {
        serde_json::from_str(&node.call_endpoint(name, request)).unwrap()
    }

    #[test]
    fn test_builtin_endpoints_registered() {
        let node = node();
        let names = node.endpoints().list();
        assert!(names.contains(&"Network::Info".to_string()));
        assert!(names.contains(&"Network::Addrouter".to_string()));
        assert!(names.contains(&"Network::Removerouter".to_string()));
    }

    #[test]
    fn test_network_info() {
        let node = node();
        let info = call(&node, "Network::Info", "{}");
        assert_eq!(info["LongID"], node.identity().long_id());
        assert_eq!(info["Networked"], false);
        assert_eq!(info["SessionID"], node.lan().unwrap().session_id());
        assert!(info["LocalAddress"].is_null());
    }

    #[test]
    fn test_router_endpoints() {
        let node = node();
        let added = call(&node, "Network::Addrouter", r#"{"Address":"192.168.1.5:4201"}"#);
        assert_eq!(added["Added"], true);
        assert_eq!(node.bus().routers(), vec!["192.168.1.5:4201".parse().unwrap()]);

        let info = call(&node, "Network::Info", "{}");
        assert_eq!(info["Routers"][0], "192.168.1.5:4201");

        let removed = call(&node, "Network::Removerouter", r#"{"Address":"192.168.1.5:4201"}"#);
        assert_eq!(removed["Removed"], true);
        assert!(node.bus().routers().is_empty());
    }

    #[test]
    fn test_router_endpoint_bad_request() {
        let node = node();
        assert!(call(&node, "Network::Addrouter", "{}")["Error"].is_string());
        assert!(call(&node, "Network::Addrouter", r#"{"Address":"nowhere"}"#)["Error"].is_string());
    }

    #[test]
    fn test_history_includes_own_publish() {
        let node = node();
        node.publish(&Topic::PresenceUpdate, br#"{"online":true}"#).unwrap();
        let history = node.history(&Topic::PresenceUpdate, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].owner_id, node.identity().long_id());
    }

    #[test]
    fn test_remote_call_is_published() {
        let node = node();
        let call = node.call_remote(None, "Network::Info", json!({})).unwrap();
        let history = node.history(&Topic::RpcRequest, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].owner_id, node.identity().long_id());

        let raw = crate::codec::Armored::from_text(history[0].payload.clone())
            .unwrap()
            .decode()
            .unwrap();
        let request: rpc::RpcRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(request.endpoint, "Network::Info");
        assert_eq!(request.nonce, call.nonce());
        assert_eq!(request.target, None);
    }

    #[test]
    fn test_lan_disabled() {
        let config = AyriaConfig {
            lan_enabled: false,
            ..AyriaConfig::default()
        };
        let mut node = AyriaNode::offline(
            config,
            Arc::new(Identity::generate()),
            Arc::new(SqliteStore::in_memory().unwrap()),
        );
        assert!(node.lan().is_none());
        assert!(!node.on_lan_message(&Topic::InstantMessage, Arc::new(|_, _, _| true)));
        assert!(matches!(
            node.send_lan(&Topic::InstantMessage, b"x", SendOptions::broadcast()),
            Err(NetworkError::NetworkingDisabled)
        ));
        assert_eq!(node.scheduler().len(), 2);
    }

    #[test]
    fn test_default_scheduler_tasks() {
        let node = node();
        let names: Vec<_> = node.scheduler().tasks().iter().map(|t| t.name.clone()).collect();
        assert_eq!(
            names,
            vec!["bus-multicast", "bus-routers", "lan-poll", "lan-announce", "lan-prune"]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut node = node();
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        node.run(rx).await;
    }
}
