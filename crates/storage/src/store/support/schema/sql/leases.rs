#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- One control row per server identity.
        --
        -- `owner` is the identity of the process currently responsible for the
        -- row's logs; it differs from `server_identity` while a peer recovers them.
        -- Rows are only ever changed by a guarded UPDATE that compares
        -- owner/lease_time_ms/latch against what the writer last read.
        --
        -- `latch` is shared with members running without peer locking, which
        -- write 0/1. Lock-aware members write 2 (released) and 3 (held).
        CREATE TABLE IF NOT EXISTS recovery_leases (
          server_identity TEXT PRIMARY KEY,
          recovery_group TEXT NOT NULL DEFAULT '',
          owner TEXT NOT NULL,
          lease_time_ms INTEGER NOT NULL
        );
"#;
