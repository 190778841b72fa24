#![forbid(unsafe_code)]

use super::super::super::super::StoreError;
use super::util::add_column_if_missing;
use rusqlite::Connection;

/// Lease tables created before peer locking have neither a latch nor a
/// backend column, and the oldest ones have no recovery group either. The
/// latch and backend are added as nullable so existing rows read back as
/// legacy-latched and ownerless of any endpoint; missing groups become the
/// default group.
pub(super) fn apply(conn: &Connection) -> Result<(), StoreError> {
    add_column_if_missing(conn, "recovery_leases", "recovery_group", "TEXT NOT NULL DEFAULT ''")?;
    add_column_if_missing(conn, "recovery_leases", "latch", "INTEGER")?;
    add_column_if_missing(conn, "recovery_leases", "backend_url", "TEXT")?;
    Ok(())
}
