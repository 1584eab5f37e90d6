//! Session history
//!
//! One record per connected session: who served it, when it started, when
//! it was last updated and how much traffic it carried. Duration is always
//! derived from the two timestamps.

use dvpn_session::{Identity, SessionId};
use dvpn_tunnel::SessionStatistics;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Persisted history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistoryRecord {
    pub session_id: SessionId,
    pub provider_id: Identity,
    pub service_type: String,
    pub provider_country: String,
    pub time_started: SystemTime,
    /// Set on disconnect
    pub time_updated: Option<SystemTime>,
    pub data_stats: SessionStatistics,
}

impl SessionHistoryRecord {
    /// Record for a session starting now
    pub fn started(
        session_id: SessionId,
        provider_id: Identity,
        service_type: impl Into<String>,
        provider_country: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            provider_id,
            service_type: service_type.into(),
            provider_country: provider_country.into(),
            time_started: SystemTime::now(),
            time_updated: None,
            data_stats: SessionStatistics::default(),
        }
    }

    /// Time between start and last update; zero until updated
    pub fn duration(&self) -> Duration {
        self.time_updated
            .and_then(|updated| updated.duration_since(self.time_started).ok())
            .unwrap_or_default()
    }
}

/// History persistence
pub trait SessionStorage: Send + Sync {
    /// Store a new record
    fn save(&self, record: SessionHistoryRecord) -> Result<(), HistoryError>;

    /// Set the update time and traffic of an existing record
    fn update(
        &self,
        session_id: &SessionId,
        time_updated: SystemTime,
        stats: SessionStatistics,
    ) -> Result<(), HistoryError>;

    /// All records in insertion order
    fn get_all(&self) -> Result<Vec<SessionHistoryRecord>, HistoryError>;
}

/// History errors
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Session {0} already recorded")]
    Duplicate(SessionId),

    #[error("Session {0} not found")]
    NotFound(SessionId),

    #[error("Session {0} updated before it started")]
    UpdatedBeforeStart(SessionId),

    #[error("History I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("History file corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

fn insert_record(
    records: &mut Vec<SessionHistoryRecord>,
    record: SessionHistoryRecord,
) -> Result<(), HistoryError> {
    if records.iter().any(|r| r.session_id == record.session_id) {
        return Err(HistoryError::Duplicate(record.session_id));
    }
    records.push(record);
    Ok(())
}

fn update_record(
    records: &mut [SessionHistoryRecord],
    session_id: &SessionId,
    time_updated: SystemTime,
    stats: SessionStatistics,
) -> Result<(), HistoryError> {
    let record = records
        .iter_mut()
        .find(|r| &r.session_id == session_id)
        .ok_or_else(|| HistoryError::NotFound(session_id.clone()))?;
    if time_updated < record.time_started {
        return Err(HistoryError::UpdatedBeforeStart(session_id.clone()));
    }
    record.time_updated = Some(time_updated);
    record.data_stats = stats;
    Ok(())
}

fn lock(records: &Mutex<Vec<SessionHistoryRecord>>) -> MutexGuard<'_, Vec<SessionHistoryRecord>> {
    match records.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// History kept in memory only
#[derive(Debug, Default)]
pub struct MemorySessionStorage {
    records: Mutex<Vec<SessionHistoryRecord>>,
}

impl MemorySessionStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemorySessionStorage {
    fn save(&self, record: SessionHistoryRecord) -> Result<(), HistoryError> {
        insert_record(&mut lock(&self.records), record)
    }

    fn update(
        &self,
        session_id: &SessionId,
        time_updated: SystemTime,
        stats: SessionStatistics,
    ) -> Result<(), HistoryError> {
        update_record(&mut lock(&self.records), session_id, time_updated, stats)
    }

    fn get_all(&self) -> Result<Vec<SessionHistoryRecord>, HistoryError> {
        Ok(lock(&self.records).clone())
    }
}

/// History in a JSON file, rewritten on every change
#[derive(Debug)]
pub struct JsonFileSessionStorage {
    path: PathBuf,
    records: Mutex<Vec<SessionHistoryRecord>>,
}

impl JsonFileSessionStorage {
    /// Open the store, reading existing records if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => Vec::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };
        info!("Session history at {} ({} records)", path.display(), records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// File backing this storage
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the old one
    fn persist(&self, records: &[SessionHistoryRecord]) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("Wrote {} history records to {}", records.len(), self.path.display());
        Ok(())
    }

    /// Apply `change` to a copy and keep it only if it was persisted
    fn modify<F>(&self, change: F) -> Result<(), HistoryError>
    where
        F: FnOnce(&mut Vec<SessionHistoryRecord>) -> Result<(), HistoryError>,
    {
        let mut records = lock(&self.records);
        let mut next = records.clone();
        change(&mut next)?;
        self.persist(&next)?;
        *records = next;
        Ok(())
    }
}

impl SessionStorage for JsonFileSessionStorage {
    fn save(&self, record: SessionHistoryRecord) -> Result<(), HistoryError> {
        self.modify(|records| insert_record(records, record))
    }

    fn update(
        &self,
        session_id: &SessionId,
        time_updated: SystemTime,
        stats: SessionStatistics,
    ) -> Result<(), HistoryError> {
        self.modify(|records| update_record(records, session_id, time_updated, stats))
    }

    fn get_all(&self) -> Result<Vec<SessionHistoryRecord>, HistoryError> {
        Ok(lock(&self.records).clone())
    }
}
