#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogName {
    Transaction,
    Partner,
}

impl LogName {
    pub const ALL: [LogName; 2] = [LogName::Transaction, LogName::Partner];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "tranlog",
            Self::Partner => "partnerlog",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tranlog" => Some(Self::Transaction),
            "partnerlog" => Some(Self::Partner),
            _ => None,
        }
    }
}

impl fmt::Display for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique key of a record within one identity's log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub record_id: i64,
    pub section_id: i64,
    pub section_data_index: i32,
}

impl RecordKey {
    pub fn new(record_id: i64, section_id: i64, section_data_index: i32) -> Self {
        Self {
            record_id,
            section_id,
            section_data_index,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.record_id, self.section_id, self.section_data_index
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub key: RecordKey,
    pub data: Vec<u8>,
}

impl LogRecord {
    pub fn new(key: RecordKey, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }
}

/// Keys that occur more than once, in key order.
pub fn duplicate_keys(records: &[LogRecord]) -> Vec<RecordKey> {
    let mut counts = BTreeMap::<RecordKey, usize>::new();
    for record in records {
        *counts.entry(record.key).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(key, _)| key)
        .collect()
}
