//! Session Negotiator
//!
//! Handles `session-create` requests: resolves the service config, asks the
//! [`Creator`] for a session and maps the outcome onto one of three
//! responses.

use crate::communication::{RequestConsumer, RequestEndpoint};
use crate::dto::{CreateRequest, CreateResponse};
use crate::session::{DestroyCallback, Identity, ServiceConfiguration, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Endpoint of session creation
pub const ENDPOINT_SESSION_CREATE: RequestEndpoint = RequestEndpoint("session-create");

/// Builds sessions for accepted requests
pub trait Creator: Send + Sync {
    fn create(
        &self,
        consumer_id: Identity,
        proposal_id: i64,
        config: ServiceConfiguration,
        destroy_callback: DestroyCallback,
    ) -> Result<Session, CreateError>;
}

/// Session creation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreateError {
    #[error("Proposal doesn't exist")]
    InvalidProposal,

    #[error("Session creation failed: {0}")]
    Failed(String),
}

/// Turns a raw wire config into a typed one plus its release hook
pub trait ConfigProvider: Send + Sync {
    fn provide(
        &self,
        config: &[u8],
    ) -> Result<(ServiceConfiguration, DestroyCallback), ConfigProviderError>;
}

impl<F> ConfigProvider for F
where
    F: Fn(&[u8]) -> Result<(ServiceConfiguration, DestroyCallback), ConfigProviderError>
        + Send
        + Sync,
{
    fn provide(
        &self,
        config: &[u8],
    ) -> Result<(ServiceConfiguration, DestroyCallback), ConfigProviderError> {
        self(config)
    }
}

/// Config provider errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigProviderError {
    #[error("Invalid service config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Config unavailable: {0}")]
    Unavailable(String),
}

/// Decodes the wire config as JSON into `T`; nothing to release.
pub struct JsonConfigProvider<T> {
    _config: PhantomData<fn() -> T>,
}

impl<T> JsonConfigProvider<T> {
    /// Provider for configs of type `T`
    pub fn new() -> Self {
        Self {
            _config: PhantomData,
        }
    }
}

impl<T> Default for JsonConfigProvider<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConfigProvider for JsonConfigProvider<T>
where
    T: DeserializeOwned + Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn provide(
        &self,
        config: &[u8],
    ) -> Result<(ServiceConfiguration, DestroyCallback), ConfigProviderError> {
        let typed: T = serde_json::from_slice(config)?;
        Ok((ServiceConfiguration::new(typed), DestroyCallback::noop()))
    }
}

/// `session-create` protocol handler.
///
/// Holds nothing but its bound collaborators, so one instance can serve
/// concurrent requests.
pub struct SessionNegotiator {
    peer_id: Identity,
    creator: Arc<dyn Creator>,
    config_provider: Arc<dyn ConfigProvider>,
}

impl SessionNegotiator {
    /// Negotiator answering on behalf of `peer_id`
    pub fn new(
        peer_id: Identity,
        creator: Arc<dyn Creator>,
        config_provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            peer_id,
            creator,
            config_provider,
        }
    }

    /// Identity this negotiator answers for
    pub fn peer_id(&self) -> &Identity {
        &self.peer_id
    }

    /// Answer one create request
    pub fn handle(&self, request: CreateRequest) -> CreateResponse {
        let (config, destroy_callback) =
            match self.config_provider.provide(request.config.as_bytes()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("Config for proposal {} rejected: {}", request.proposal_id, e);
                    return CreateResponse::internal_error();
                }
            };

        let session = match self.creator.create(
            self.peer_id.clone(),
            request.proposal_id,
            config,
            destroy_callback,
        ) {
            Ok(session) => session,
            Err(CreateError::InvalidProposal) => {
                debug!("Proposal {} doesn't exist", request.proposal_id);
                return CreateResponse::invalid_proposal();
            }
            Err(e) => {
                warn!("Session for proposal {} not created: {}", request.proposal_id, e);
                return CreateResponse::internal_error();
            }
        };

        match session.config.to_wire() {
            Ok(config) => {
                debug!("Session {} created for {}", session.id, self.peer_id);
                CreateResponse::with_session(session.id.as_str(), config)
            }
            Err(e) => {
                warn!("Session {} config not serializable: {}", session.id, e);
                CreateResponse::internal_error()
            }
        }
    }
}

impl RequestConsumer for SessionNegotiator {
    type Request = CreateRequest;
    type Response = CreateResponse;
    type Error = Infallible;

    fn endpoint(&self) -> RequestEndpoint {
        ENDPOINT_SESSION_CREATE
    }

    fn consume(&self, request: CreateRequest) -> Result<CreateResponse, Infallible> {
        Ok(self.handle(request))
    }
}
