#![forbid(unsafe_code)]

//! In-process backing with the same compare-and-set semantics as the SQLite
//! store. Handles cloned from one another share state, which is how tests
//! model several members without a database file.

use crate::backend::StorageBackend;
use crate::store::{CasOutcome, EventAppend, EventRow, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tl_core::{Latch, Lease, LogName, LogRecord, RecordKey, RecoveryGroup, ServerIdentity};

#[derive(Clone, Debug)]
struct StoredLease {
    recovery_group: String,
    owner: String,
    lease_time_ms: i64,
    latch: Option<i64>,
    backend_url: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    leases: BTreeMap<String, StoredLease>,
    logs: BTreeMap<(String, LogName), Vec<LogRecord>>,
    events: Vec<EventRow>,
    busy_failures: u32,
}

#[derive(Clone, Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    peer_locking_enabled: bool,
}

impl MemoryStore {
    pub fn new(peer_locking_enabled: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            peer_locking_enabled,
        }
    }

    /// Another handle on the same state, read with its own latch semantics.
    pub fn member(&self, peer_locking_enabled: bool) -> Self {
        Self {
            state: Arc::clone(&self.state),
            peer_locking_enabled,
        }
    }

    /// Makes the next `count` operations fail with a busy error.
    pub fn inject_busy(&self, count: u32) {
        self.state.lock().busy_failures = count;
    }

    /// Writes a lease row verbatim, bypassing every check.
    pub fn put_raw_lease(
        &self,
        identity: &str,
        group: &str,
        owner: &str,
        lease_time_ms: i64,
        latch: Option<i64>,
    ) {
        self.state.lock().leases.insert(
            identity.to_string(),
            StoredLease {
                recovery_group: group.to_string(),
                owner: owner.to_string(),
                lease_time_ms,
                latch,
                backend_url: None,
            },
        );
    }

    /// Appends a record verbatim, bypassing ownership and duplicate checks.
    pub fn push_raw_record(&self, identity: &str, log: LogName, record: LogRecord) {
        self.state
            .lock()
            .logs
            .entry((identity.to_string(), log))
            .or_default()
            .push(record);
    }

    fn enter(&self) -> Result<parking_lot::MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.state.lock();
        if state.busy_failures > 0 {
            state.busy_failures -= 1;
            return Err(StoreError::Sql(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("injected busy".to_string()),
            )));
        }
        Ok(state)
    }

    fn decode(&self, identity: &str, stored: &StoredLease) -> Result<Lease, StoreError> {
        let malformed = |field: &str, err: tl_core::IdentityError| {
            StoreError::MalformedRow(format!("lease {identity:?} {field}: {err}"))
        };
        Ok(Lease {
            server_identity: ServerIdentity::try_new(identity)
                .map_err(|err| malformed("server_identity", err))?,
            recovery_group: RecoveryGroup::try_new(stored.recovery_group.as_str())
                .map_err(|err| malformed("recovery_group", err))?,
            owner: ServerIdentity::try_new(owner_part(&stored.owner))
                .map_err(|err| malformed("owner", err))?,
            lease_time_ms: stored.lease_time_ms,
            latch: Latch::decode(stored.latch, self.peer_locking_enabled).latch,
            raw_latch: stored.latch,
            backend_url: stored.backend_url.clone(),
        })
    }
}

/// Same reading of a legacy `owner,backendURL` value as the SQLite store.
fn owner_part(raw: &str) -> &str {
    raw.split(',').next().unwrap_or_default().trim()
}

fn matches_expected(stored: &StoredLease, expected: &Lease) -> bool {
    owner_part(&stored.owner) == expected.owner.as_str()
        && stored.lease_time_ms == expected.lease_time_ms
        && stored.latch == expected.raw_latch
}

fn to_stored(lease: &Lease) -> StoredLease {
    StoredLease {
        recovery_group: lease.recovery_group.as_str().to_string(),
        owner: lease.owner.as_str().to_string(),
        lease_time_ms: lease.lease_time_ms,
        latch: lease.raw_latch,
        backend_url: lease.backend_url.clone(),
    }
}

fn enforce_owner(
    state: &MemoryState,
    identity: &ServerIdentity,
    writer: &ServerIdentity,
) -> Result<(), StoreError> {
    match state.leases.get(identity.as_str()) {
        Some(stored) if owner_part(&stored.owner) == writer.as_str() => Ok(()),
        Some(stored) => Err(StoreError::LeaseNotHeld {
            identity: identity.to_string(),
            owner: Some(owner_part(&stored.owner).to_string()),
        }),
        None => Err(StoreError::LeaseNotHeld {
            identity: identity.to_string(),
            owner: None,
        }),
    }
}

impl StorageBackend for MemoryStore {
    fn peer_locking_enabled(&self) -> bool {
        self.peer_locking_enabled
    }

    fn read_lease(&mut self, identity: &ServerIdentity) -> Result<Option<Lease>, StoreError> {
        let state = self.enter()?;
        state
            .leases
            .get(identity.as_str())
            .map(|stored| self.decode(identity.as_str(), stored))
            .transpose()
    }

    fn list_leases(&mut self, group: &RecoveryGroup) -> Result<Vec<Lease>, StoreError> {
        let state = self.enter()?;
        state
            .leases
            .iter()
            .filter(|(_, stored)| stored.recovery_group == group.as_str())
            .map(|(identity, stored)| self.decode(identity, stored))
            .collect()
    }

    fn insert_lease(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        let key = lease.server_identity.as_str().to_string();
        if state.leases.contains_key(&key) {
            return Ok(false);
        }
        state.leases.insert(key, to_stored(lease));
        Ok(true)
    }

    fn conditional_write_lease(
        &mut self,
        expected: &Lease,
        new: &Lease,
    ) -> Result<CasOutcome, StoreError> {
        if expected.server_identity != new.server_identity {
            return Err(StoreError::InvalidInput(
                "conditional lease write must not change server_identity",
            ));
        }
        let mut state = self.enter()?;
        let key = expected.server_identity.as_str();
        let current = match state.leases.get(key) {
            Some(stored) if matches_expected(stored, expected) => None,
            Some(stored) => Some(Some(self.decode(key, stored)?)),
            None => Some(None),
        };
        if let Some(current) = current {
            return Ok(CasOutcome::Conflict { current });
        }
        state.leases.insert(key.to_string(), to_stored(new));
        Ok(CasOutcome::Applied)
    }

    fn delete_lease(&mut self, expected: &Lease) -> Result<bool, StoreError> {
        let mut state = self.enter()?;
        let key = expected.server_identity.as_str();
        let unchanged = state
            .leases
            .get(key)
            .is_some_and(|stored| matches_expected(stored, expected));
        if unchanged {
            state.leases.remove(key);
        }
        Ok(unchanged)
    }

    fn read_log_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let state = self.enter()?;
        let mut records = state
            .logs
            .get(&(identity.as_str().to_string(), log))
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|record| record.key);
        Ok(records)
    }

    fn write_log_record(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        record: &LogRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.enter()?;
        enforce_owner(&state, identity, writer)?;
        let records = state
            .logs
            .entry((identity.as_str().to_string(), log))
            .or_default();
        if records.iter().any(|existing| existing.key == record.key) {
            return Err(StoreError::DuplicateRecord {
                identity: identity.to_string(),
                log,
                key: record.key,
            });
        }
        records.push(record.clone());
        Ok(())
    }

    fn remove_log_records(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        keys: &[RecordKey],
    ) -> Result<usize, StoreError> {
        let mut state = self.enter()?;
        enforce_owner(&state, identity, writer)?;
        let Some(records) = state.logs.get_mut(&(identity.as_str().to_string(), log)) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|record| !keys.contains(&record.key));
        Ok(before - records.len())
    }

    fn find_duplicate_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let state = self.enter()?;
        Ok(state
            .logs
            .get(&(identity.as_str().to_string(), log))
            .map(|records| tl_core::duplicate_keys(records))
            .unwrap_or_default())
    }

    fn append_event(&mut self, event: &EventAppend) -> Result<(), StoreError> {
        let mut state = self.enter()?;
        let seq = state.events.len() as i64 + 1;
        state.events.push(EventRow {
            seq,
            ts_ms: event.ts_ms,
            server_identity: event.server_identity.clone(),
            event_type: event.event_type.clone(),
            payload_json: event.payload_json.clone(),
        });
        Ok(())
    }

    fn list_events(
        &mut self,
        identity: Option<&ServerIdentity>,
        limit: usize,
    ) -> Result<Vec<EventRow>, StoreError> {
        let state = self.enter()?;
        Ok(state
            .events
            .iter()
            .filter(|event| identity.is_none_or(|id| event.server_identity == id.as_str()))
            .take(limit.clamp(1, 1_000))
            .cloned()
            .collect())
    }
}
