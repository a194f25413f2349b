//! Layer-3 endpoint calls carried over the bus.
//!
//! A caller publishes an `Rpc::Request` naming an endpoint, a request body,
//! a nonce and optionally the long id of the one peer that should answer.
//! Each addressed peer runs the call through its local [`EndpointRegistry`]
//! and publishes an `Rpc::Response` addressed back to the caller. A missing
//! endpoint answers with the usual `{"Error": ...}` object.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::bus::BusPublisher;
use crate::endpoints::{EndpointRegistry, error_response, is_valid_endpoint_name};
use crate::error::NetworkError;
use crate::router::MessageHandler;
use crate::topic::Topic;

/// Body of an `Rpc::Request` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcRequest {
    pub endpoint: String,
    pub request: Value,
    pub nonce: u64,
    /// Long id of the peer that should answer; `None` asks everyone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Body of an `Rpc::Response` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcResponse {
    pub nonce: u64,
    /// Long id of the caller.
    pub target: String,
    pub response: Value,
}

struct PendingCall {
    responder: Option<String>,
    tx: oneshot::Sender<Value>,
}

type PendingCalls = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// Layer-2 handler that answers `Rpc::Request` packets from `endpoints`.
pub fn request_handler(
    long_id: String,
    endpoints: Arc<EndpointRegistry>,
    publisher: BusPublisher,
) -> MessageHandler {
    Arc::new(move |_, sender, payload| {
        let request = match serde_json::from_slice::<RpcRequest>(payload) {
            Ok(request) => request,
            Err(e) => {
                trace!("Ignoring malformed RPC request from {sender}: {e}");
                return false;
            }
        };
        if request.target.as_deref().is_some_and(|target| target != long_id) {
            return false;
        }

        let response = if request.request.is_object() {
            endpoints.call_value(&request.endpoint, request.request)
        } else {
            error_response("Request must be a JSON object")
        };
        let answer = RpcResponse {
            nonce: request.nonce,
            target: sender.to_string(),
            response,
        };
        let published = serde_json::to_vec(&answer)
            .map_err(NetworkError::from)
            .and_then(|body| publisher.publish(&Topic::RpcResponse, &body));
        match published {
            Ok(()) => {
                debug!("Answered {} for {sender}", request.endpoint);
                true
            }
            Err(e) => {
                debug!("Failed to answer {} for {sender}: {e}", request.endpoint);
                false
            }
        }
    })
}

/// Caller side: publishes requests and matches responses to them.
#[derive(Clone)]
pub struct RpcClient {
    long_id: String,
    publisher: BusPublisher,
    next_nonce: Arc<AtomicU64>,
    pending: PendingCalls,
}

impl RpcClient {
    pub fn new(long_id: impl Into<String>, publisher: BusPublisher) -> Self {
        Self {
            long_id: long_id.into(),
            publisher,
            next_nonce: Arc::new(AtomicU64::new(rand::random())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a call to `endpoint`. With a `target`, only that peer answers
    /// and only its answer is accepted.
    pub fn call(&self, target: Option<&str>, endpoint: &str, request: Value) -> Result<RemoteCall, NetworkError> {
        if !is_valid_endpoint_name(endpoint) {
            return Err(NetworkError::InvalidEndpoint(endpoint.to_string()));
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&RpcRequest {
            endpoint: endpoint.to_string(),
            request,
            nonce,
            target: target.map(str::to_string),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            nonce,
            PendingCall {
                responder: target.map(str::to_string),
                tx,
            },
        );
        if let Err(e) = self.publisher.publish(&Topic::RpcRequest, &body) {
            self.pending.lock().remove(&nonce);
            return Err(e);
        }

        Ok(RemoteCall {
            endpoint: endpoint.to_string(),
            nonce,
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Calls still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Layer-2 handler that resolves `Rpc::Response` packets addressed to us.
    pub fn response_handler(&self) -> MessageHandler {
        let long_id = self.long_id.clone();
        let pending = Arc::clone(&self.pending);
        Arc::new(move |_, sender, payload| {
            let Ok(answer) = serde_json::from_slice::<RpcResponse>(payload) else {
                return false;
            };
            if answer.target != long_id {
                return false;
            }

            let mut pending = pending.lock();
            let expected = pending
                .get(&answer.nonce)
                .is_some_and(|call| call.responder.as_deref().is_none_or(|responder| responder == sender));
            if !expected {
                trace!("Unexpected RPC response {} from {sender}", answer.nonce);
                return false;
            }
            pending
                .remove(&answer.nonce)
                .is_some_and(|call| call.tx.send(answer.response).is_ok())
        })
    }
}

/// An outstanding remote call.
pub struct RemoteCall {
    endpoint: String,
    nonce: u64,
    rx: oneshot::Receiver<Value>,
    pending: PendingCalls,
}

impl RemoteCall {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Wait up to `timeout` for the first accepted answer.
    pub async fn wait(self, timeout: Duration) -> Result<Value, NetworkError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.pending.lock().remove(&self.nonce);
                Err(NetworkError::RpcTimeout(self.endpoint))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
