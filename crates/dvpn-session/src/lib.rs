//! dVPN Session - consumer/provider session negotiation
//!
//! - [`Session`] with its balance tracking and destroy hook
//! - `session-create` wire messages
//! - [`SessionNegotiator`], the create-request handler
//! - [`RequestDispatcher`], the typed endpoint seam of the message channel

mod communication;
mod dto;
mod negotiator;
mod session;

pub use communication::{DispatchError, RequestConsumer, RequestDispatcher, RequestEndpoint};
pub use dto::{
    CreateRequest, CreateResponse, LastPromise, RawConfig, ResponseKind, SessionDto,
    MESSAGE_INTERNAL_ERROR, MESSAGE_INVALID_PROPOSAL,
};
pub use negotiator::{
    ConfigProvider, ConfigProviderError, CreateError, Creator, JsonConfigProvider,
    SessionNegotiator, ENDPOINT_SESSION_CREATE,
};
pub use session::{
    BalanceError, BalanceKeeper, ConfigPayload, DestroyCallback, Identity, ServiceConfiguration,
    Session, SessionId, UntrackedBalance,
};
