//! Session model
//!
//! A session is the logical agreement between consumer and provider. It
//! outlives neither its balance tracking nor its destroy callback: both are
//! released by [`Session::end`], once.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Session identifier assigned by the provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a session id issued by the provider
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Node identity (account address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Identity from its address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Typed service configuration that can go back on the wire.
///
/// Implemented for every `Serialize` type, so service code only needs to
/// define its own config struct.
pub trait ConfigPayload: fmt::Debug + Send + Sync + 'static {
    /// Serialize for the remote party
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<T> ConfigPayload for T
where
    T: Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Service configuration carried by a session
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    payload: Arc<dyn ConfigPayload>,
}

impl ServiceConfiguration {
    /// Wrap a serializable service config
    pub fn new<T: ConfigPayload>(payload: T) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// JSON bytes of the payload
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        self.payload.to_wire()
    }

    /// Typed view for the service that produced the config
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }
}

type DestroyFn = Box<dyn FnOnce() + Send>;

/// Callback run when the session ends.
///
/// Clones share the same callback; whichever clone is invoked first runs
/// it and every later call does nothing.
#[derive(Clone, Default)]
pub struct DestroyCallback {
    inner: Arc<Mutex<Option<DestroyFn>>>,
}

impl DestroyCallback {
    /// Wrap `callback` to run when the session ends
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Some(Box::new(callback)))),
        }
    }

    /// Callback with nothing to release
    pub fn noop() -> Self {
        Self::default()
    }

    /// Run the callback unless it already ran
    pub fn invoke(&self) {
        let callback = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// True once the callback has run (or there never was one)
    pub fn is_spent(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for DestroyCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyCallback")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// Accounting hook whose lifetime matches the session
pub trait BalanceKeeper: Send + Sync {
    fn track(&self) -> Result<(), BalanceError>;

    fn stop(&self);
}

/// Balance keeper for sessions without accounting
#[derive(Debug, Default, Clone, Copy)]
pub struct UntrackedBalance;

impl BalanceKeeper for UntrackedBalance {
    fn track(&self) -> Result<(), BalanceError> {
        Ok(())
    }

    fn stop(&self) {}
}

/// Balance tracking errors
#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("Balance tracking failed: {0}")]
    Tracking(String),

    #[error("Session {0} already ended")]
    SessionEnded(SessionId),
}

/// Consumer-provider session
#[derive(Clone)]
pub struct Session {
    pub id: SessionId,
    pub config: ServiceConfiguration,
    pub consumer_id: Identity,
    pub destroy_callback: DestroyCallback,
    pub balance_keeper: Arc<dyn BalanceKeeper>,
    ended: Arc<AtomicBool>,
}

impl Session {
    /// Session with no balance tracking
    pub fn new(
        id: SessionId,
        config: ServiceConfiguration,
        consumer_id: Identity,
        destroy_callback: DestroyCallback,
    ) -> Self {
        Self {
            id,
            config,
            consumer_id,
            destroy_callback,
            balance_keeper: Arc::new(UntrackedBalance),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track the balance with `keeper` instead
    pub fn with_balance_keeper(mut self, keeper: Arc<dyn BalanceKeeper>) -> Self {
        self.balance_keeper = keeper;
        self
    }

    /// Start balance tracking
    pub fn begin(&self) -> Result<(), BalanceError> {
        if self.is_ended() {
            return Err(BalanceError::SessionEnded(self.id.clone()));
        }
        self.balance_keeper.track()
    }

    /// Stop balance tracking and run the destroy callback.
    ///
    /// Only the first call on any clone of the session has an effect.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Ending session {}", self.id);
        self.balance_keeper.stop();
        self.destroy_callback.invoke();
    }

    /// Whether `end` already ran
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("consumer_id", &self.consumer_id)
            .field("config", &self.config)
            .field("ended", &self.is_ended())
            .finish()
    }
}
