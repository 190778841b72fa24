#![forbid(unsafe_code)]

mod core;
mod events;
mod indexes;
mod leases;
mod log_records;
mod pragmas;

pub(super) fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(pragmas::SQL);
    sql.push_str(core::SQL);
    sql.push_str(leases::SQL);
    sql.push_str(log_records::SQL);
    sql.push_str(events::SQL);
    sql
}

/// Indexes reference columns that migrations may have just added.
pub(super) fn index_sql() -> &'static str {
    indexes::SQL
}
