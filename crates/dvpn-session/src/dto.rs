//! Wire messages of the session-create exchange
//!
//! JSON with camelCase keys. Service configs travel as embedded raw JSON so
//! the negotiator never needs to know their shape.

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;

/// Message of the invalid-proposal response
pub const MESSAGE_INVALID_PROPOSAL: &str = "Proposal doesn't exist";

/// Message of the internal-error response
pub const MESSAGE_INTERNAL_ERROR: &str = "Internal error";

/// Raw JSON bytes embedded as-is in a message.
///
/// Empty bytes are written as `null`, and `null` reads back as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig(pub Vec<u8>);

impl RawConfig {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for RawConfig {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for RawConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_empty() {
            return serializer.serialize_none();
        }
        let text = std::str::from_utf8(&self.0).map_err(S::Error::custom)?;
        let raw: &RawValue = serde_json::from_str(text).map_err(S::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RawConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<Box<RawValue>>::deserialize(deserializer)
            .map_err(|e| D::Error::custom(format!("invalid config: {}", e)))?;
        Ok(Self(
            raw.map(|raw| raw.get().as_bytes().to_vec()).unwrap_or_default(),
        ))
    }
}

/// Consumer's request to create a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub proposal_id: i64,
    #[serde(default)]
    pub config: RawConfig,
}

/// Session part of a create response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDto {
    pub id: String,
    #[serde(default)]
    pub config: RawConfig,
}

/// Accounting checkpoint handed out at session creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPromise {
    pub sequence_id: u64,
    pub amount: u64,
}

impl LastPromise {
    /// Checkpoint of a freshly created session
    pub fn bootstrap() -> Self {
        Self {
            sequence_id: 1,
            amount: 0,
        }
    }
}

/// Which of the three responses a [`CreateResponse`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    InvalidProposal,
    InternalError,
}

/// Provider's answer to a [`CreateRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub session: SessionDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_promise: Option<LastPromise>,
}

impl CreateResponse {
    /// Accepted session with its serialized config
    pub fn with_session(id: impl Into<String>, config: Vec<u8>) -> Self {
        Self {
            success: true,
            message: None,
            session: SessionDto {
                id: id.into(),
                config: RawConfig(config),
            },
            last_promise: Some(LastPromise::bootstrap()),
        }
    }

    /// Rejection of an unknown or malformed proposal
    pub fn invalid_proposal() -> Self {
        Self::failure(MESSAGE_INVALID_PROPOSAL)
    }

    /// Failure on the provider side
    pub fn internal_error() -> Self {
        Self::failure(MESSAGE_INTERNAL_ERROR)
    }

    fn failure(message: &str) -> Self {
        Self {
            success: false,
            message: Some(message.to_string()),
            session: SessionDto::default(),
            last_promise: None,
        }
    }

    /// Outcome carried by this response
    pub fn kind(&self) -> ResponseKind {
        if self.success {
            ResponseKind::Success
        } else if self.message.as_deref() == Some(MESSAGE_INVALID_PROPOSAL) {
            ResponseKind::InvalidProposal
        } else {
            ResponseKind::InternalError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_embeds_raw_config() {
        let request: CreateRequest =
            serde_json::from_str(r#"{"proposalId":7,"config":{"publicKey":"abc","ports":[1,2]}}"#)
                .unwrap();
        assert_eq!(request.proposal_id, 7);
        assert_eq!(
            request.config.as_bytes(),
            br#"{"publicKey":"abc","ports":[1,2]}"#
        );
    }

    #[test]
    fn test_request_without_config() {
        let request: CreateRequest = serde_json::from_str(r#"{"proposalId":3}"#).unwrap();
        assert!(request.config.is_empty());

        let request: CreateRequest =
            serde_json::from_str(r#"{"proposalId":3,"config":null}"#).unwrap();
        assert!(request.config.is_empty());
    }

    #[test]
    fn test_success_response_json() {
        let response = CreateResponse::with_session("abc", br#"{"k":"v"}"#.to_vec());
        assert_eq!(response.kind(), ResponseKind::Success);
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"success":true,"session":{"id":"abc","config":{"k":"v"}},"lastPromise":{"sequenceId":1,"amount":0}}"#
        );
    }

    #[test]
    fn test_failure_responses() {
        let invalid = CreateResponse::invalid_proposal();
        assert_eq!(invalid.kind(), ResponseKind::InvalidProposal);
        assert_eq!(
            serde_json::to_string(&invalid).unwrap(),
            r#"{"success":false,"message":"Proposal doesn't exist","session":{"id":"","config":null}}"#
        );

        let internal = CreateResponse::internal_error();
        assert_eq!(internal.kind(), ResponseKind::InternalError);
        assert_ne!(invalid, internal);
    }

    #[test]
    fn test_invalid_raw_bytes_fail_to_serialize() {
        let response = CreateResponse::with_session("abc", b"{not json".to_vec());
        assert!(serde_json::to_vec(&response).is_err());
    }

    #[test]
    fn test_response_reads_back() {
        let response = CreateResponse::with_session("abc", br#"[1,2,3]"#.to_vec());
        let bytes = serde_json::to_vec(&response).unwrap();
        let decoded: CreateResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}
