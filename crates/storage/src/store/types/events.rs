#![forbid(unsafe_code)]

#[derive(Clone, Debug)]
pub struct EventAppend {
    pub ts_ms: i64,
    pub server_identity: String,
    pub event_type: String,
    pub payload_json: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRow {
    pub seq: i64,
    pub ts_ms: i64,
    pub server_identity: String,
    pub event_type: String,
    pub payload_json: String,
}
