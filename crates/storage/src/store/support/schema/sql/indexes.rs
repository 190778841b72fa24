#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        CREATE INDEX IF NOT EXISTS idx_recovery_leases_group
          ON recovery_leases(recovery_group, server_identity);
        CREATE INDEX IF NOT EXISTS idx_recovery_log_records_key
          ON recovery_log_records(server_identity, log_name, record_id, section_id, section_data_index);
        CREATE INDEX IF NOT EXISTS idx_recovery_events_identity
          ON recovery_events(server_identity, seq);
"#;
