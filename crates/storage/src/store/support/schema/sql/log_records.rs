#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Transaction and partner log records, partitioned by owning identity.
        --
        -- The key triple is intentionally not a UNIQUE constraint: tables written
        -- by older deployments may already hold collisions, and recovery has to
        -- detect and report those rather than fail to open the store.
        CREATE TABLE IF NOT EXISTS recovery_log_records (
          server_identity TEXT NOT NULL,
          log_name TEXT NOT NULL,
          record_id INTEGER NOT NULL,
          section_id INTEGER NOT NULL,
          section_data_index INTEGER NOT NULL,
          data BLOB NOT NULL
        );
"#;
