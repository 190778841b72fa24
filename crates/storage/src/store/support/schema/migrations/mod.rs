#![forbid(unsafe_code)]

mod leases;
mod util;

use super::super::super::StoreError;
use rusqlite::Connection;

pub(super) fn apply(conn: &Connection) -> Result<(), StoreError> {
    leases::apply(conn)?;
    Ok(())
}
