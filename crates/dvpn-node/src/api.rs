//! Client-facing DTOs
//!
//! JSON shapes handed to local clients (CLI, UI). camelCase keys.

use crate::history::SessionHistoryRecord;
use dvpn_session::Identity;
use dvpn_tunnel::{ConnectionState, SessionStatistics};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, UNIX_EPOCH};

/// Connection status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDto {
    pub status: String,
    pub session_id: String,
}

impl StatusDto {
    /// State report for the client, with the session id when connected
    pub fn new(state: ConnectionState, session_id: Option<&str>) -> Self {
        Self {
            status: state.as_str().to_string(),
            session_id: session_id.unwrap_or_default().to_string(),
        }
    }
}

/// Traffic and duration of a session, duration in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsDto {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duration: u64,
}

impl StatisticsDto {
    /// Traffic counters and elapsed time of a session
    pub fn new(stats: SessionStatistics, duration: Duration) -> Self {
        Self {
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            duration: duration.as_secs(),
        }
    }
}

impl From<&SessionHistoryRecord> for StatisticsDto {
    fn from(record: &SessionHistoryRecord) -> Self {
        Self::new(record.data_stats, record.duration())
    }
}

/// Provider location
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocationDto {
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinitionDto {
    pub location_originate: LocationDto,
}

/// Service offer of a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDto {
    pub id: i64,
    pub provider_id: String,
    pub service_definition: ServiceDefinitionDto,
}

impl fmt::Display for ProposalDto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id: {} , Provider: {}, Country: {}",
            self.id, self.provider_id, self.service_definition.location_originate.country
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProposalList {
    pub proposals: Vec<ProposalDto>,
}

/// Identity address, keyed `id` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityDto {
    #[serde(rename = "id")]
    pub address: String,
}

impl From<&Identity> for IdentityDto {
    fn from(identity: &Identity) -> Self {
        Self {
            address: identity.address().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityList {
    pub identities: Vec<IdentityDto>,
}

/// One past session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryDto {
    pub session_id: String,
    pub provider_id: String,
    pub service_type: String,
    pub provider_country: String,
    /// Unix seconds
    pub date_started: u64,
    pub statistics: StatisticsDto,
}

impl From<&SessionHistoryRecord> for SessionHistoryDto {
    fn from(record: &SessionHistoryRecord) -> Self {
        Self {
            session_id: record.session_id.to_string(),
            provider_id: record.provider_id.to_string(),
            service_type: record.service_type.clone(),
            provider_country: record.provider_country.clone(),
            date_started: record
                .time_started
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            statistics: record.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionHistoryDto>,
}

impl SessionList {
    /// Client listing of recorded sessions, in storage order
    pub fn from_records(records: &[SessionHistoryRecord]) -> Self {
        Self {
            sessions: records.iter().map(SessionHistoryDto::from).collect(),
        }
    }
}
