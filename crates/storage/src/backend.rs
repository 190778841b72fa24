#![forbid(unsafe_code)]

use crate::store::{CasOutcome, EventAppend, EventRow, SqliteStore, StoreError};
use tl_core::{Lease, LogName, LogRecord, RecordKey, RecoveryGroup, ServerIdentity};

/// Storage capability the locking protocol is written against.
///
/// Every lease mutation is a compare-and-set on the whole row, so any store
/// with a conditional write (a version token, a guarded UPDATE, a conditional
/// PUT) can back it. Latch values are decoded by the implementation according
/// to [`StorageBackend::peer_locking_enabled`]; callers never see raw bytes.
pub trait StorageBackend {
    fn peer_locking_enabled(&self) -> bool;

    fn read_lease(&mut self, identity: &ServerIdentity) -> Result<Option<Lease>, StoreError>;

    /// Lease rows of one recovery group, ordered by identity.
    fn list_leases(&mut self, group: &RecoveryGroup) -> Result<Vec<Lease>, StoreError>;

    /// Inserts `lease` unless a row for its identity already exists.
    /// Returns whether the row was created.
    fn insert_lease(&mut self, lease: &Lease) -> Result<bool, StoreError>;

    /// Replaces the row with `new` only if its owner, lease time and raw latch
    /// still equal those of `expected`.
    fn conditional_write_lease(
        &mut self,
        expected: &Lease,
        new: &Lease,
    ) -> Result<CasOutcome, StoreError>;

    /// Deletes the row only if it still equals `expected`.
    fn delete_lease(&mut self, expected: &Lease) -> Result<bool, StoreError>;

    fn read_log_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<LogRecord>, StoreError>;

    /// Appends a record. Fails with `LeaseNotHeld` unless `writer` owns the
    /// identity's lease, and with `DuplicateRecord` if the key is taken.
    fn write_log_record(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        record: &LogRecord,
    ) -> Result<(), StoreError>;

    /// Removes records by key under the same ownership check as writes.
    fn remove_log_records(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        keys: &[RecordKey],
    ) -> Result<usize, StoreError>;

    fn find_duplicate_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<RecordKey>, StoreError>;

    fn append_event(&mut self, event: &EventAppend) -> Result<(), StoreError>;

    fn list_events(
        &mut self,
        identity: Option<&ServerIdentity>,
        limit: usize,
    ) -> Result<Vec<EventRow>, StoreError>;
}

impl StorageBackend for SqliteStore {
    fn peer_locking_enabled(&self) -> bool {
        self.options().peer_locking_enabled
    }

    fn read_lease(&mut self, identity: &ServerIdentity) -> Result<Option<Lease>, StoreError> {
        self.lease_get(identity)
    }

    fn list_leases(&mut self, group: &RecoveryGroup) -> Result<Vec<Lease>, StoreError> {
        self.leases_list(group)
    }

    fn insert_lease(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        self.lease_insert(lease)
    }

    fn conditional_write_lease(
        &mut self,
        expected: &Lease,
        new: &Lease,
    ) -> Result<CasOutcome, StoreError> {
        self.lease_compare_and_set(expected, new)
    }

    fn delete_lease(&mut self, expected: &Lease) -> Result<bool, StoreError> {
        self.lease_delete(expected)
    }

    fn read_log_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<LogRecord>, StoreError> {
        self.log_records(identity, log)
    }

    fn write_log_record(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        record: &LogRecord,
    ) -> Result<(), StoreError> {
        self.log_record_append(writer, identity, log, record)
    }

    fn remove_log_records(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        keys: &[RecordKey],
    ) -> Result<usize, StoreError> {
        self.log_records_remove(writer, identity, log, keys)
    }

    fn find_duplicate_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<RecordKey>, StoreError> {
        self.log_duplicate_keys(identity, log)
    }

    fn append_event(&mut self, event: &EventAppend) -> Result<(), StoreError> {
        self.event_append(event).map(|_| ())
    }

    fn list_events(
        &mut self,
        identity: Option<&ServerIdentity>,
        limit: usize,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.events_list(identity, limit)
    }
}
