#![forbid(unsafe_code)]

use super::*;
use rusqlite::params;
use tl_core::ServerIdentity;

const MAX_EVENTS_LIMIT: usize = 1_000;

fn read_event_row(row: &rusqlite::Row<'_>) -> Result<EventRow, rusqlite::Error> {
    Ok(EventRow {
        seq: row.get(0)?,
        ts_ms: row.get(1)?,
        server_identity: row.get(2)?,
        event_type: row.get(3)?,
        payload_json: row.get(4)?,
    })
}

impl SqliteStore {
    pub fn event_append(&mut self, event: &EventAppend) -> Result<i64, StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO recovery_events(ts_ms, server_identity, event_type, payload_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.ts_ms,
                event.server_identity,
                event.event_type,
                event.payload_json
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest first. `identity` narrows to one server's events.
    pub fn events_list(
        &mut self,
        identity: Option<&ServerIdentity>,
        limit: usize,
    ) -> Result<Vec<EventRow>, StoreError> {
        let limit = limit.clamp(1, MAX_EVENTS_LIMIT) as i64;
        let mut stmt = self.conn.prepare(
            r#"
            SELECT seq, ts_ms, server_identity, event_type, payload_json
            FROM recovery_events
            WHERE (?1 IS NULL OR server_identity=?1)
            ORDER BY seq ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![identity.map(ServerIdentity::as_str), limit],
            read_event_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
