//! Layer 3: named request/response endpoints.
//!
//! Endpoints are JSON-in, JSON-out functions named `Namespace::Verb`.
//! Application failures come back as an object with an `"Error"` string,
//! never as a Rust error crossing the call boundary.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::NetworkError;

/// An endpoint: JSON request in, JSON response out.
pub type Endpoint = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Build the standard error response.
pub fn error_response(message: impl Into<String>) -> Value {
    json!({ "Error": message.into() })
}

/// Whether `name` follows the `Namespace::Verb` convention.
pub fn is_valid_endpoint_name(name: &str) -> bool {
    match name.split_once("::") {
        Some((namespace, verb)) => {
            !namespace.is_empty() && !verb.is_empty() && !verb.contains("::")
        }
        None => false,
    }
}

/// Registry of endpoints, shareable across threads.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an endpoint.
    pub fn add_endpoint(&self, name: &str, endpoint: Endpoint) -> Result<(), NetworkError> {
        if !is_valid_endpoint_name(name) {
            return Err(NetworkError::InvalidEndpoint(name.to_string()));
        }
        debug!("Registering endpoint {name}");
        self.endpoints.write().insert(name.to_string(), endpoint);
        Ok(())
    }

    pub fn remove_endpoint(&self, name: &str) -> bool {
        self.endpoints.write().remove(name).is_some()
    }

    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(name)
    }

    /// Names of all registered endpoints, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.endpoints.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Call an endpoint with an already-parsed request.
    pub fn call_value(&self, name: &str, request: Value) -> Value {
        // Clone the handle so the endpoint may itself use the registry.
        let endpoint = self.endpoints.read().get(name).cloned();
        match endpoint {
            Some(endpoint) => endpoint(request),
            None => error_response(format!("Missing endpoint: {name}")),
        }
    }

    /// Call an endpoint with a JSON request string, returning a JSON string.
    pub fn call(&self, name: &str, request: &str) -> String {
        let response = match serde_json::from_str::<Value>(request) {
            Ok(value) if value.is_object() => self.call_value(name, value),
            Ok(_) => error_response("Request must be a JSON object"),
            Err(e) => error_response(format!("Malformed JSON request: {e}")),
        };
        response.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
