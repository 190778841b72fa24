#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Lifecycle signals (claims, recovery completion, peer attempts), kept for
        -- operators and tests. Append-only.
        CREATE TABLE IF NOT EXISTS recovery_events (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          ts_ms INTEGER NOT NULL,
          server_identity TEXT NOT NULL,
          event_type TEXT NOT NULL,
          payload_json TEXT NOT NULL
        );
"#;
