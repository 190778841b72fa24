#![forbid(unsafe_code)]

use super::leases::enforce_lease_owner_tx;
use super::*;
use rusqlite::{OptionalExtension, params};
use tl_core::{LogName, LogRecord, RecordKey, ServerIdentity};

fn read_log_record(row: &rusqlite::Row<'_>) -> Result<LogRecord, rusqlite::Error> {
    Ok(LogRecord {
        key: RecordKey {
            record_id: row.get(0)?,
            section_id: row.get(1)?,
            section_data_index: row.get(2)?,
        },
        data: row.get(3)?,
    })
}

fn record_exists_tx(
    tx: &Transaction<'_>,
    identity: &ServerIdentity,
    log: LogName,
    key: RecordKey,
) -> Result<bool, StoreError> {
    Ok(tx
        .query_row(
            r#"
            SELECT 1 FROM recovery_log_records
            WHERE server_identity=?1 AND log_name=?2
              AND record_id=?3 AND section_id=?4 AND section_data_index=?5
            LIMIT 1
            "#,
            params![
                identity.as_str(),
                log.as_str(),
                key.record_id,
                key.section_id,
                key.section_data_index
            ],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

impl SqliteStore {
    pub fn log_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<LogRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT record_id, section_id, section_data_index, data
            FROM recovery_log_records
            WHERE server_identity=?1 AND log_name=?2
            ORDER BY record_id ASC, section_id ASC, section_data_index ASC, rowid ASC
            "#,
        )?;
        let rows = stmt.query_map(params![identity.as_str(), log.as_str()], read_log_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn log_record_append(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        record: &LogRecord,
    ) -> Result<(), StoreError> {
        let tx = self.write_tx()?;
        enforce_lease_owner_tx(&tx, identity, writer)?;

        if record_exists_tx(&tx, identity, log, record.key)? {
            return Err(StoreError::DuplicateRecord {
                identity: identity.to_string(),
                log,
                key: record.key,
            });
        }

        tx.execute(
            r#"
            INSERT INTO recovery_log_records(
              server_identity, log_name, record_id, section_id, section_data_index, data
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                identity.as_str(),
                log.as_str(),
                record.key.record_id,
                record.key.section_id,
                record.key.section_data_index,
                record.data,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn log_records_remove(
        &mut self,
        writer: &ServerIdentity,
        identity: &ServerIdentity,
        log: LogName,
        keys: &[RecordKey],
    ) -> Result<usize, StoreError> {
        let tx = self.write_tx()?;
        enforce_lease_owner_tx(&tx, identity, writer)?;

        let mut removed = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                DELETE FROM recovery_log_records
                WHERE server_identity=?1 AND log_name=?2
                  AND record_id=?3 AND section_id=?4 AND section_data_index=?5
                "#,
            )?;
            for key in keys {
                removed += stmt.execute(params![
                    identity.as_str(),
                    log.as_str(),
                    key.record_id,
                    key.section_id,
                    key.section_data_index
                ])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn log_duplicate_keys(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
    ) -> Result<Vec<RecordKey>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT record_id, section_id, section_data_index
            FROM recovery_log_records
            WHERE server_identity=?1 AND log_name=?2
            GROUP BY record_id, section_id, section_data_index
            HAVING COUNT(*) > 1
            ORDER BY record_id ASC, section_id ASC, section_data_index ASC
            "#,
        )?;
        let rows = stmt.query_map(params![identity.as_str(), log.as_str()], |row| {
            Ok(RecordKey {
                record_id: row.get(0)?,
                section_id: row.get(1)?,
                section_data_index: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
