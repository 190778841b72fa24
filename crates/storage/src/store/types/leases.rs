#![forbid(unsafe_code)]

use tl_core::Lease;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row changed since it was read; `current` is what is stored now.
    Conflict { current: Option<Lease> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}
