#![forbid(unsafe_code)]

use super::*;
use rusqlite::{OptionalExtension, params};
use tl_core::{Latch, Lease, RecoveryGroup, ServerIdentity};

const LEASE_COLUMNS: &str =
    "server_identity, recovery_group, owner, lease_time_ms, latch, backend_url";

/// Lease row as stored, before identities are validated and the latch decoded.
struct RawLease {
    server_identity: String,
    recovery_group: String,
    owner: String,
    lease_time_ms: i64,
    latch: Option<i64>,
    backend_url: Option<String>,
}

fn read_raw_lease(row: &rusqlite::Row<'_>) -> Result<RawLease, rusqlite::Error> {
    Ok(RawLease {
        server_identity: row.get(0)?,
        recovery_group: row.get(1)?,
        owner: row.get(2)?,
        lease_time_ms: row.get(3)?,
        latch: row.get(4)?,
        backend_url: row.get(5)?,
    })
}

impl RawLease {
    fn into_lease(self, peer_locking_enabled: bool) -> Result<Lease, StoreError> {
        let server_identity = ServerIdentity::try_new(self.server_identity.as_str())
            .map_err(|err| {
                StoreError::MalformedRow(format!(
                    "recovery_leases.server_identity {:?}: {err}",
                    self.server_identity
                ))
            })?;
        let recovery_group = RecoveryGroup::try_new(self.recovery_group.as_str()).map_err(|err| {
            StoreError::MalformedRow(format!(
                "recovery_leases.recovery_group {:?}: {err}",
                self.recovery_group
            ))
        })?;
        let owner = parse_owner(&self.owner)?;

        let decoded = Latch::decode(self.latch, peer_locking_enabled);
        if !decoded.recognized {
            tracing::warn!(
                identity = %server_identity,
                raw_latch = ?self.latch,
                "unrecognized latch value, treating row as legacy"
            );
        }

        Ok(Lease {
            server_identity,
            recovery_group,
            owner,
            lease_time_ms: self.lease_time_ms,
            latch: decoded.latch,
            raw_latch: self.latch,
            backend_url: self.backend_url,
        })
    }
}

/// Older writers stored `owner,backendURL` in the owner column; only the part
/// before the first comma names the owner.
fn parse_owner(raw: &str) -> Result<ServerIdentity, StoreError> {
    let owner = raw.split(',').next().unwrap_or_default().trim();
    ServerIdentity::try_new(owner)
        .map_err(|err| StoreError::MalformedRow(format!("recovery_leases.owner {raw:?}: {err}")))
}

pub(super) fn load_lease_tx(
    tx: &Transaction<'_>,
    identity: &str,
    peer_locking_enabled: bool,
) -> Result<Option<Lease>, StoreError> {
    tx.query_row(
        &format!("SELECT {LEASE_COLUMNS} FROM recovery_leases WHERE server_identity=?1"),
        params![identity],
        read_raw_lease,
    )
    .optional()?
    .map(|raw| raw.into_lease(peer_locking_enabled))
    .transpose()
}

/// Fails unless `writer` is the recorded owner of `identity`.
pub(super) fn enforce_lease_owner_tx(
    tx: &Transaction<'_>,
    identity: &ServerIdentity,
    writer: &ServerIdentity,
) -> Result<(), StoreError> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT owner FROM recovery_leases WHERE server_identity=?1",
            params![identity.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(stored) = stored else {
        return Err(StoreError::LeaseNotHeld {
            identity: identity.to_string(),
            owner: None,
        });
    };
    let owner = parse_owner(&stored)?;
    if &owner == writer {
        return Ok(());
    }
    Err(StoreError::LeaseNotHeld {
        identity: identity.to_string(),
        owner: Some(owner.into_string()),
    })
}

impl SqliteStore {
    pub fn lease_get(&mut self, identity: &ServerIdentity) -> Result<Option<Lease>, StoreError> {
        let peer_locking_enabled = self.options.peer_locking_enabled;
        let tx = self.conn.transaction()?;
        let lease = load_lease_tx(&tx, identity.as_str(), peer_locking_enabled)?;
        tx.commit()?;
        Ok(lease)
    }

    pub fn leases_list(&mut self, group: &RecoveryGroup) -> Result<Vec<Lease>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM recovery_leases \
             WHERE recovery_group=?1 \
             ORDER BY server_identity ASC"
        ))?;
        let rows = stmt.query_map(params![group.as_str()], read_raw_lease)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_lease(self.options.peer_locking_enabled)?);
        }
        Ok(out)
    }

    pub fn lease_insert(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        let tx = self.write_tx()?;
        let inserted = tx.execute(
            r#"
            INSERT INTO recovery_leases(
              server_identity, recovery_group, owner, lease_time_ms, latch, backend_url
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(server_identity) DO NOTHING
            "#,
            params![
                lease.server_identity.as_str(),
                lease.recovery_group.as_str(),
                lease.owner.as_str(),
                lease.lease_time_ms,
                lease.raw_latch,
                lease.backend_url.as_deref(),
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }

    pub fn lease_compare_and_set(
        &mut self,
        expected: &Lease,
        new: &Lease,
    ) -> Result<CasOutcome, StoreError> {
        if expected.server_identity != new.server_identity {
            return Err(StoreError::InvalidInput(
                "conditional lease write must not change server_identity",
            ));
        }
        let peer_locking_enabled = self.options.peer_locking_enabled;
        let tx = self.write_tx()?;

        // The guard compares the stored owner column verbatim, so a row still
        // carrying an `owner,backendURL` value is matched on its full text.
        let stored_owner: Option<String> = tx
            .query_row(
                "SELECT owner FROM recovery_leases WHERE server_identity=?1",
                params![expected.server_identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let owner_matches = stored_owner
            .as_deref()
            .map(parse_owner)
            .transpose()?
            .is_some_and(|owner| owner == expected.owner);

        let changed = if owner_matches {
            tx.execute(
                r#"
                UPDATE recovery_leases
                SET recovery_group=?2, owner=?3, lease_time_ms=?4, latch=?5, backend_url=?6
                WHERE server_identity=?1 AND owner=?7 AND lease_time_ms=?8 AND latch IS ?9
                "#,
                params![
                    new.server_identity.as_str(),
                    new.recovery_group.as_str(),
                    new.owner.as_str(),
                    new.lease_time_ms,
                    new.raw_latch,
                    new.backend_url.as_deref(),
                    stored_owner.as_deref(),
                    expected.lease_time_ms,
                    expected.raw_latch,
                ],
            )?
        } else {
            0
        };

        if changed == 1 {
            tx.commit()?;
            return Ok(CasOutcome::Applied);
        }

        let current = load_lease_tx(&tx, expected.server_identity.as_str(), peer_locking_enabled)?;
        tx.commit()?;
        Ok(CasOutcome::Conflict { current })
    }

    pub fn lease_delete(&mut self, expected: &Lease) -> Result<bool, StoreError> {
        let peer_locking_enabled = self.options.peer_locking_enabled;
        let tx = self.write_tx()?;
        let current = load_lease_tx(&tx, expected.server_identity.as_str(), peer_locking_enabled)?;
        let unchanged = current.as_ref().is_some_and(|current| {
            current.owner == expected.owner
                && current.lease_time_ms == expected.lease_time_ms
                && current.raw_latch == expected.raw_latch
        });
        if !unchanged {
            return Ok(false);
        }
        let deleted = tx.execute(
            "DELETE FROM recovery_leases WHERE server_identity=?1",
            params![expected.server_identity.as_str()],
        )?;
        tx.commit()?;
        Ok(deleted == 1)
    }
}
