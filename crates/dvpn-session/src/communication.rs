//! Request/response channel seam
//!
//! A [`RequestConsumer`] handles one typed endpoint; the
//! [`RequestDispatcher`] owns the JSON framing and routes raw payloads to
//! the registered consumers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of a request endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestEndpoint(pub &'static str);

impl RequestEndpoint {
    /// Wire name of the endpoint
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for RequestEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Typed handler for one endpoint
pub trait RequestConsumer: Send + Sync {
    type Request: DeserializeOwned;
    type Response: Serialize;
    type Error: fmt::Display;

    fn endpoint(&self) -> RequestEndpoint;

    fn consume(&self, request: Self::Request) -> Result<Self::Response, Self::Error>;
}

trait ErasedConsumer: Send + Sync {
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, DispatchError>;
}

impl<C: RequestConsumer> ErasedConsumer for C {
    fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let endpoint = self.endpoint();
        let request: C::Request = serde_json::from_slice(payload)
            .map_err(|source| DispatchError::MalformedRequest { endpoint, source })?;
        let response = self
            .consume(request)
            .map_err(|e| DispatchError::Consumer {
                endpoint,
                reason: e.to_string(),
            })?;
        serde_json::to_vec(&response).map_err(|source| DispatchError::Encode { endpoint, source })
    }
}

/// Routes raw request payloads to registered consumers
#[derive(Default)]
pub struct RequestDispatcher {
    consumers: HashMap<&'static str, Arc<dyn ErasedConsumer>>,
}

impl RequestDispatcher {
    /// Dispatcher with no consumers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under its endpoint; one consumer per endpoint
    pub fn register<C>(&mut self, consumer: C) -> Result<(), DispatchError>
    where
        C: RequestConsumer + 'static,
    {
        let endpoint = consumer.endpoint();
        if self.consumers.contains_key(endpoint.name()) {
            return Err(DispatchError::DuplicateEndpoint(endpoint));
        }
        debug!("Registered consumer for {}", endpoint);
        self.consumers.insert(endpoint.name(), Arc::new(consumer));
        Ok(())
    }

    /// Decode, handle and encode one request
    pub fn dispatch(&self, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let consumer = self
            .consumers
            .get(endpoint)
            .ok_or_else(|| DispatchError::UnknownEndpoint(endpoint.to_string()))?;
        consumer.handle(payload).inspect_err(|e| warn!("{}", e))
    }

    /// Names of the registered endpoints
    pub fn endpoints(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.consumers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Channel-level errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No consumer for endpoint {0}")]
    UnknownEndpoint(String),

    #[error("Endpoint {0} already has a consumer")]
    DuplicateEndpoint(RequestEndpoint),

    #[error("Malformed {endpoint} request: {source}")]
    MalformedRequest {
        endpoint: RequestEndpoint,
        #[source]
        source: serde_json::Error,
    },

    #[error("{endpoint} consumer failed: {reason}")]
    Consumer {
        endpoint: RequestEndpoint,
        reason: String,
    },

    #[error("Failed to encode {endpoint} response: {source}")]
    Encode {
        endpoint: RequestEndpoint,
        #[source]
        source: serde_json::Error,
    },
}
