//! LAN presence transport.
//!
//! Peers on the local segment announce themselves with a signed
//! `Clienthello` carrying their signing and encryption keys. After that,
//! packets may be targeted at one account, signed with the sender's key,
//! and encrypted with a key agreed between the two sessions.
//!
//! Receive order for one datagram:
//!
//! 1. header, then blacklist (our own session is always blacklisted)
//! 2. target check, before anything else is parsed
//! 3. hello handling, or lookup of the known sender
//! 4. signature, then decryption
//! 5. goodbye handling, or Layer-2 dispatch

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::client::{ClientHello, ClientRecord, ClientRegistry};
use crate::codec::{self, LanFlags, LanHeader, LanPacket};
use crate::config::AyriaConfig;
use crate::crypto::{self, EncryptionKeypair};
use crate::error::{DropReason, NetworkError};
use crate::identity::{AccountId, Identity};
use crate::notify::{NotificationHub, events};
use crate::router::{DispatchOutcome, MessageHandler, MessageRouter};
use crate::topic::Topic;
use crate::transport::{self, DatagramSocket, TransportStats};

/// How an outgoing LAN packet is addressed and protected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub target: Option<AccountId>,
    pub encrypt: bool,
    pub sign: bool,
}

impl SendOptions {
    /// Untargeted, unsigned, in the clear.
    pub fn broadcast() -> Self {
        Self::default()
    }

    pub fn to(target: AccountId) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    pub fn signed(mut self) -> Self {
        self.sign = true;
        self
    }

    /// Encrypt for the target. Requires [`to`](Self::to).
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

/// What an accepted LAN datagram did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanEvent {
    Joined(u32),
    Refreshed(u32),
    Left(u32),
    Dispatched(DispatchOutcome),
}

impl LanEvent {
    fn interpreted(&self) -> bool {
        match self {
            LanEvent::Dispatched(outcome) => outcome.interpreted(),
            _ => true,
        }
    }
}

/// State of the LAN transport, owned by the poll thread.
pub struct LanContext {
    identity: Arc<Identity>,
    session_id: u32,
    encryption: EncryptionKeypair,
    username: String,
    socket: Option<Arc<dyn DatagramSocket>>,
    group: SocketAddr,
    blacklist: HashSet<u32>,
    clients: ClientRegistry,
    handlers: MessageRouter,
    notifications: Arc<NotificationHub>,
    budget: usize,
    client_timeout: Duration,
    scratch: Vec<u8>,
    stats: TransportStats,
}

impl LanContext {
    /// Join the LAN group. A setup failure leaves the context offline.
    pub fn bind(config: &AyriaConfig, identity: Arc<Identity>, notifications: Arc<NotificationHub>) -> Self {
        let socket: Option<Arc<dyn DatagramSocket>> = if config.networking_enabled {
            match transport::bind_multicast(config.lan_group(), config.multicast_ttl) {
                Ok(socket) => Some(Arc::new(socket)),
                Err(e) => {
                    warn!("LAN multicast setup failed, LAN transport offline: {e}");
                    None
                }
            }
        } else {
            None
        };
        Self::with_socket(config, identity, notifications, socket)
    }

    pub fn with_socket(
        config: &AyriaConfig,
        identity: Arc<Identity>,
        notifications: Arc<NotificationHub>,
        socket: Option<Arc<dyn DatagramSocket>>,
    ) -> Self {
        let session_id = loop {
            let id: u32 = rand::random();
            if id != 0 {
                break id;
            }
        };
        debug!("LAN session {session_id:#010x} for {}", identity.long_id());

        Self {
            identity,
            session_id,
            encryption: EncryptionKeypair::generate(),
            username: config.username.clone(),
            socket,
            group: SocketAddr::V4(config.lan_group()),
            blacklist: HashSet::from([session_id]),
            clients: ClientRegistry::new(),
            handlers: MessageRouter::new(),
            notifications,
            budget: config.lan_budget,
            client_timeout: config.client_timeout,
            scratch: vec![0u8; transport::DEFAULT_SCRATCH_LEN],
            stats: TransportStats::default(),
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn account_id(&self) -> AccountId {
        self.identity.account_id()
    }

    pub fn encryption_key(&self) -> [u8; 32] {
        self.encryption.public_key()
    }

    pub fn is_networked(&self) -> bool {
        self.socket.is_some()
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn on_message(&mut self, topic: &Topic, handler: MessageHandler) {
        self.handlers.register(topic, handler);
    }

    pub fn is_blocked(&self, session_id: u32) -> bool {
        self.blacklist.contains(&session_id)
    }

    /// Ignore every future packet from `session_id` and forget the session.
    pub fn block_client(&mut self, session_id: u32) {
        if self.blacklist.insert(session_id) {
            info!("Blacklisted LAN session {session_id:#010x}");
        }
        if let Some(client) = self.clients.remove(session_id) {
            self.notifications.publish(events::CLIENT_LEFT, &client.to_json());
        }
    }

    // -- Send --------------------------------------------------------------

    /// Build an outgoing packet without sending it.
    pub fn build_packet(&self, topic: &Topic, body: &[u8], options: SendOptions) -> Result<LanPacket, NetworkError> {
        let body = match (options.encrypt, options.target) {
            (false, _) => body.to_vec(),
            (true, None) => {
                return Err(NetworkError::Crypto("encrypted packets need a target".to_string()));
            }
            (true, Some(target)) => {
                let client = self
                    .clients
                    .find_by_account(target)
                    .ok_or(NetworkError::UnknownClient(target))?;
                self.encryption.derive_shared(&client.encryption_key)?.encrypt(body)?
            }
        };
        let signature = options.sign.then(|| self.identity.sign(&body));

        Ok(LanPacket {
            header: LanHeader {
                session_id: self.session_id,
                topic: topic.hash(),
                flags: LanFlags {
                    encrypted: options.encrypt,
                    targeted: options.target.is_some(),
                    signed: options.sign,
                },
            },
            target: options.target,
            body,
            signature,
        })
    }

    /// Send a packet to the LAN group.
    pub fn send(&self, topic: &Topic, body: &[u8], options: SendOptions) -> Result<(), NetworkError> {
        let socket = self.socket.as_ref().ok_or(NetworkError::NetworkingDisabled)?;
        let packet = self.build_packet(topic, body, options)?;
        socket.try_send_datagram(&packet.encode(), self.group)?;
        Ok(())
    }

    /// Our own `Clienthello`, signed.
    pub fn hello_packet(&self) -> Result<LanPacket, NetworkError> {
        let hello = ClientHello::new(
            self.identity.long_id(),
            &self.username,
            &self.identity.public_key(),
            &self.encryption.public_key(),
        );
        let body = serde_json::to_vec(&hello)?;
        self.build_packet(&Topic::ClientHello, &body, SendOptions::broadcast().signed())
    }

    pub fn goodbye_packet(&self) -> Result<LanPacket, NetworkError> {
        self.build_packet(&Topic::ClientGoodbye, &[], SendOptions::broadcast().signed())
    }

    /// Broadcast our `Clienthello`.
    pub fn announce(&self) -> Result<(), NetworkError> {
        let socket = self.socket.as_ref().ok_or(NetworkError::NetworkingDisabled)?;
        socket.try_send_datagram(&self.hello_packet()?.encode(), self.group)?;
        trace!("Announced LAN session {:#010x}", self.session_id);
        Ok(())
    }

    /// Broadcast our `Clientgoodbye`.
    pub fn send_goodbye(&self) -> Result<(), NetworkError> {
        let socket = self.socket.as_ref().ok_or(NetworkError::NetworkingDisabled)?;
        socket.try_send_datagram(&self.goodbye_packet()?.encode(), self.group)?;
        debug!("Sent LAN goodbye for session {:#010x}", self.session_id);
        Ok(())
    }

    // -- Receive -----------------------------------------------------------

    /// Drain up to the LAN budget. Returns datagrams processed.
    pub fn poll(&mut self) -> usize {
        let Some(socket) = self.socket.clone() else {
            return 0;
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        let processed = transport::drain_budget(socket.as_ref(), &mut scratch, self.budget, |d| {
            match self.handle_datagram(&d.data) {
                Ok(event) => self.stats.record_accepted(event.interpreted()),
                Err(reason) => {
                    self.stats.record_dropped();
                    trace!(from = %d.from, "Dropped LAN packet: {reason}");
                }
            }
        });
        self.scratch = scratch;
        processed
    }

    /// Run one LAN datagram through the receive pipeline.
    pub fn handle_datagram(&mut self, bytes: &[u8]) -> Result<LanEvent, DropReason> {
        let (header, rest) = LanHeader::decode(bytes)?;
        let session_id = header.session_id;
        if self.blacklist.contains(&session_id) {
            return Err(DropReason::Blacklisted(session_id));
        }

        let flags = header.flags;
        if flags.encrypted && !flags.targeted {
            return Err(DropReason::UntargetedEncryption);
        }
        let rest = if flags.targeted {
            let (target, rest) = codec::split_target(rest)?;
            if target != self.identity.account_id() {
                return Err(DropReason::NotForUs);
            }
            rest
        } else {
            rest
        };
        let (body, signature) = if flags.signed {
            let (body, signature) = codec::split_signature(rest)?;
            (body, Some(signature))
        } else {
            (rest, None)
        };

        if header.topic == Topic::ClientHello.hash() {
            return self.handle_hello(session_id, body, signature);
        }

        let client = self
            .clients
            .get(session_id)
            .ok_or(DropReason::UnknownSender(session_id))?;
        if let Some(signature) = &signature {
            if !crypto::verify_with(&client.signing_key, signature, body) {
                return Err(DropReason::BadSignature);
            }
        }
        let plaintext = if flags.encrypted {
            self.encryption
                .derive_shared(&client.encryption_key)
                .and_then(|key| key.decrypt(body))
                .map_err(|_| DropReason::Undecryptable)?
        } else {
            body.to_vec()
        };
        let sender = client.long_id.clone();

        if header.topic == Topic::ClientGoodbye.hash() {
            // A goodbye must prove it comes from the session's owner.
            if signature.is_none() {
                return Err(DropReason::BadSignature);
            }
            if let Some(client) = self.clients.remove(session_id) {
                info!("LAN client {} ({session_id:#010x}) left", client.username);
                self.notifications.publish(events::CLIENT_LEFT, &client.to_json());
            }
            return Ok(LanEvent::Left(session_id));
        }

        self.clients.touch(session_id);
        let outcome = self
            .handlers
            .dispatch(header.topic, crate::now_millis(), &sender, &plaintext);
        Ok(LanEvent::Dispatched(outcome))
    }

    fn handle_hello(
        &mut self,
        session_id: u32,
        body: &[u8],
        signature: Option<[u8; 64]>,
    ) -> Result<LanEvent, DropReason> {
        let validated = serde_json::from_slice::<ClientHello>(body)
            .map_err(|e| e.to_string())
            .and_then(|hello| hello.validate().map(|keys| (hello, keys)));
        let (hello, (signing_key, encryption_key)) = match validated {
            Ok(v) => v,
            Err(reason) => {
                self.block_client(session_id);
                return Err(DropReason::InvalidHello(reason));
            }
        };

        let Some(signature) = signature else {
            return Err(DropReason::BadSignature);
        };
        if !crypto::verify_with(&signing_key, &signature, body) {
            return Err(DropReason::BadSignature);
        }
        // A known session keeps the key it first announced.
        if let Some(existing) = self.clients.get(session_id) {
            if existing.signing_key != signing_key {
                warn!("Rejected hello rebinding LAN session {session_id:#010x} to {}", hello.long_id);
                return Err(DropReason::SessionConflict(session_id));
            }
        }

        let now = Utc::now();
        let record = ClientRecord {
            session_id,
            long_id: hello.long_id,
            account_id: AccountId::of(&signing_key),
            username: hello.username,
            signing_key,
            encryption_key,
            first_seen: now,
            last_seen: now,
        };
        let json = record.to_json();
        let username = record.username.clone();

        if self.clients.upsert(record) {
            info!("LAN client {username} ({session_id:#010x}) joined");
            self.notifications.publish(events::CLIENT_JOINED, &json);
            Ok(LanEvent::Joined(session_id))
        } else {
            Ok(LanEvent::Refreshed(session_id))
        }
    }

    /// Forget clients silent for longer than the configured timeout.
    /// Returns how many were removed.
    pub fn prune_stale(&mut self) -> usize {
        let timeout = chrono::Duration::from_std(self.client_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return 0;
        };
        let stale = self.clients.prune_stale(cutoff);
        for client in &stale {
            debug!("LAN client {} ({:#010x}) timed out", client.username, client.session_id);
            self.notifications.publish(events::CLIENT_LEFT, &client.to_json());
        }
        stale.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> LanContext {
        LanContext::with_socket(
            &AyriaConfig::default(),
            Arc::new(Identity::generate()),
            Arc::new(NotificationHub::new()),
            None,
        )
    }

    /// Make `a` and `b` known to each other.
    fn introduce(a: &mut LanContext, b: &mut LanContext) {
        let hello_a = a.hello_packet().unwrap().encode();
        let hello_b = b.hello_packet().unwrap().encode();
        assert_eq!(b.handle_datagram(&hello_a), Ok(LanEvent::Joined(a.session_id())));
        assert_eq!(a.handle_datagram(&hello_b), Ok(LanEvent::Joined(b.session_id())));
    }

    #[test]
    fn test_own_session_is_blacklisted() {
        let mut lan = context();
        let hello = lan.hello_packet().unwrap().encode();
        assert_eq!(
            lan.handle_datagram(&hello),
            Err(DropReason::Blacklisted(lan.session_id()))
        );
    }

    #[test]
    fn test_hello_registers_and_notifies() {
        let mut a = context();
        let b = context();
        let joined = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&joined);
        a.notifications
            .subscribe(events::CLIENT_JOINED, Arc::new(move |v| sink.lock().push(v.clone())));

        let hello = b.hello_packet().unwrap().encode();
        assert_eq!(a.handle_datagram(&hello), Ok(LanEvent::Joined(b.session_id())));
        assert_eq!(a.handle_datagram(&hello), Ok(LanEvent::Refreshed(b.session_id())));

        assert_eq!(joined.lock().len(), 1);
        assert_eq!(joined.lock()[0]["SessionID"], b.session_id());
        assert_eq!(a.clients().get(b.session_id()).unwrap().account_id, b.account_id());
    }

    #[test]
    fn test_hello_cannot_rebind_known_session() {
        let mut bob = context();
        let mut alice = context();
        let mallory = context();
        introduce(&mut alice, &mut bob);
        let alice_long_id = alice.identity.long_id().to_string();

        // Mallory's own valid hello, stamped with Alice's session id.
        let mut forged = mallory.hello_packet().unwrap();
        forged.header.session_id = alice.session_id();
        assert_eq!(
            bob.handle_datagram(&forged.encode()),
            Err(DropReason::SessionConflict(alice.session_id()))
        );
        assert_eq!(bob.clients().get(alice.session_id()).unwrap().long_id, alice_long_id);
        assert!(!bob.is_blocked(alice.session_id()));

        // Alice's genuine traffic still verifies.
        let packet = alice
            .build_packet(&Topic::InstantMessage, b"still me", SendOptions::broadcast().signed())
            .unwrap();
        assert!(matches!(
            bob.handle_datagram(&packet.encode()),
            Ok(LanEvent::Dispatched(_))
        ));
    }

    #[test]
    fn test_unsigned_hello_rejected() {
        let mut a = context();
        let b = context();
        let mut packet = b.hello_packet().unwrap();
        packet.header.flags.signed = false;
        packet.signature = None;
        assert_eq!(a.handle_datagram(&packet.encode()), Err(DropReason::BadSignature));
        assert!(!a.is_blocked(b.session_id()));
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let mut a = context();
        let b = context();
        let packet = b
            .build_packet(&Topic::InstantMessage, b"hi", SendOptions::broadcast())
            .unwrap();
        assert_eq!(
            a.handle_datagram(&packet.encode()),
            Err(DropReason::UnknownSender(b.session_id()))
        );
    }

    #[test]
    fn test_signed_message_dispatched() {
        let mut a = context();
        let mut b = context();
        introduce(&mut a, &mut b);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        let expected_sender = b.identity.long_id().to_string();
        a.on_message(
            &Topic::InstantMessage,
            Arc::new(move |_, sender, payload| {
                assert_eq!(sender, expected_sender);
                assert_eq!(payload, b"hi");
                seen_in.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        let packet = b
            .build_packet(&Topic::InstantMessage, b"hi", SendOptions::broadcast().signed())
            .unwrap();
        let event = a.handle_datagram(&packet.encode()).unwrap();
        assert!(matches!(event, LanEvent::Dispatched(o) if o.interpreted()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forged_signature_rejected() {
        let mut a = context();
        let mut b = context();
        introduce(&mut a, &mut b);

        let mut packet = b
            .build_packet(&Topic::InstantMessage, b"hi", SendOptions::broadcast().signed())
            .unwrap();
        packet.body = b"ho".to_vec();
        assert_eq!(a.handle_datagram(&packet.encode()), Err(DropReason::BadSignature));
    }

    #[test]
    fn test_encrypted_targeted_roundtrip() {
        let mut a = context();
        let mut b = context();
        introduce(&mut a, &mut b);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        a.on_message(
            &Topic::InstantMessage,
            Arc::new(move |_, _, payload| {
                sink.lock().push(payload.to_vec());
                true
            }),
        );

        let packet = b
            .build_packet(
                &Topic::InstantMessage,
                b"secret",
                SendOptions::to(a.account_id()).encrypted().signed(),
            )
            .unwrap();
        assert_ne!(packet.body, b"secret");
        a.handle_datagram(&packet.encode()).unwrap();
        assert_eq!(received.lock().as_slice(), &[b"secret".to_vec()]);
    }

    #[test]
    fn test_target_mismatch_dropped_before_parsing() {
        let mut a = context();
        let b = context();
        // Not even introduced: the target check comes first.
        let packet = b
            .build_packet(&Topic::InstantMessage, b"x", SendOptions::to(AccountId(42)))
            .unwrap();
        assert_eq!(a.handle_datagram(&packet.encode()), Err(DropReason::NotForUs));
    }

    #[test]
    fn test_untargeted_encryption_dropped() {
        let mut a = context();
        let b = context();
        let mut packet = b
            .build_packet(&Topic::InstantMessage, b"x", SendOptions::broadcast())
            .unwrap();
        packet.header.flags.encrypted = true;
        assert_eq!(
            a.handle_datagram(&packet.encode()),
            Err(DropReason::UntargetedEncryption)
        );
    }

    #[test]
    fn test_encrypt_requires_known_target() {
        let lan = context();
        let err = lan
            .build_packet(&Topic::InstantMessage, b"x", SendOptions::to(AccountId(7)).encrypted())
            .unwrap_err();
        assert!(matches!(err, NetworkError::UnknownClient(AccountId(7))));

        let err = lan
            .build_packet(&Topic::InstantMessage, b"x", SendOptions::broadcast().encrypted())
            .unwrap_err();
        assert!(matches!(err, NetworkError::Crypto(_)));
    }

    #[test]
    fn test_goodbye_removes_client() {
        let mut a = context();
        let mut b = context();
        introduce(&mut a, &mut b);
        let left = Arc::new(AtomicUsize::new(0));
        let left_in = Arc::clone(&left);
        a.notifications
            .subscribe(events::CLIENT_LEFT, Arc::new(move |_| {
                left_in.fetch_add(1, Ordering::SeqCst);
            }));

        let goodbye = b.goodbye_packet().unwrap().encode();
        assert_eq!(a.handle_datagram(&goodbye), Ok(LanEvent::Left(b.session_id())));
        assert!(!a.clients().contains(b.session_id()));
        assert_eq!(left.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_hello_blacklists() {
        let mut a = context();
        let b = context();
        let packet = b
            .build_packet(&Topic::ClientHello, b"{not json", SendOptions::broadcast().signed())
            .unwrap();
        assert!(matches!(
            a.handle_datagram(&packet.encode()),
            Err(DropReason::InvalidHello(_))
        ));
        assert!(a.is_blocked(b.session_id()));

        let valid = b.hello_packet().unwrap().encode();
        assert_eq!(
            a.handle_datagram(&valid),
            Err(DropReason::Blacklisted(b.session_id()))
        );
    }

    #[test]
    fn test_prune_stale_clients() {
        let config = AyriaConfig {
            client_timeout: Duration::ZERO,
            ..AyriaConfig::default()
        };
        let mut a = LanContext::with_socket(
            &config,
            Arc::new(Identity::generate()),
            Arc::new(NotificationHub::new()),
            None,
        );
        let b = context();
        a.handle_datagram(&b.hello_packet().unwrap().encode()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(a.prune_stale(), 1);
        assert!(a.clients().is_empty());
    }

    #[test]
    fn test_offline_send_reports_disabled() {
        let lan = context();
        assert!(matches!(lan.announce(), Err(NetworkError::NetworkingDisabled)));
    }
}
