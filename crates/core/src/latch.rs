#![forbid(unsafe_code)]

//! Compatibility latch stored on every lease row.
//!
//! The column predates peer locking: lock-disabled members use it as a plain
//! "log in use" bit. Lock-enabled members reserve two further values for
//! their own held/released states. The raw value is decoded exactly once, at
//! the storage boundary, and nothing above that layer looks at the integer.

const RAW_LEGACY_CLEAR: i64 = 0;
const RAW_LEGACY_SET: i64 = 1;
const RAW_LOCK_RELEASED: i64 = 2;
const RAW_LOCK_HELD: i64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Held,
    Released,
}

impl LockState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Released => "released",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Latch {
    /// Written by a member running without peer locking.
    LegacyMarker(bool),
    /// Written by a member running with peer locking.
    LockAware(LockState),
}

/// Result of decoding a stored latch. `recognized` is false when a
/// lock-enabled reader found a value outside the known encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedLatch {
    pub latch: Latch,
    pub recognized: bool,
}

impl Latch {
    /// Latch a member writes when it takes or renews ownership.
    pub fn held(peer_locking_enabled: bool) -> Self {
        if peer_locking_enabled {
            Self::LockAware(LockState::Held)
        } else {
            Self::LegacyMarker(true)
        }
    }

    /// Latch a member writes when it gives ownership up.
    pub fn released(peer_locking_enabled: bool) -> Self {
        if peer_locking_enabled {
            Self::LockAware(LockState::Released)
        } else {
            Self::LegacyMarker(false)
        }
    }

    pub fn decode(raw: Option<i64>, peer_locking_enabled: bool) -> DecodedLatch {
        let value = raw.unwrap_or(RAW_LEGACY_CLEAR);
        let legacy_bit = value & 1 == 1;
        if !peer_locking_enabled {
            // Lock-aware values keep the in-use bit in the low bit, so the
            // legacy reader sees a sensible flag and nothing else.
            return DecodedLatch {
                latch: Self::LegacyMarker(legacy_bit),
                recognized: true,
            };
        }
        match value {
            RAW_LEGACY_CLEAR => DecodedLatch {
                latch: Self::LegacyMarker(false),
                recognized: true,
            },
            RAW_LEGACY_SET => DecodedLatch {
                latch: Self::LegacyMarker(true),
                recognized: true,
            },
            RAW_LOCK_RELEASED => DecodedLatch {
                latch: Self::LockAware(LockState::Released),
                recognized: true,
            },
            RAW_LOCK_HELD => DecodedLatch {
                latch: Self::LockAware(LockState::Held),
                recognized: true,
            },
            _ => DecodedLatch {
                latch: Self::LegacyMarker(legacy_bit),
                recognized: false,
            },
        }
    }

    pub fn encode(self) -> i64 {
        match self {
            Self::LegacyMarker(false) => RAW_LEGACY_CLEAR,
            Self::LegacyMarker(true) => RAW_LEGACY_SET,
            Self::LockAware(LockState::Released) => RAW_LOCK_RELEASED,
            Self::LockAware(LockState::Held) => RAW_LOCK_HELD,
        }
    }

    pub fn is_legacy(self) -> bool {
        matches!(self, Self::LegacyMarker(_))
    }

    pub fn is_released(self) -> bool {
        matches!(self, Self::LockAware(LockState::Released))
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::LegacyMarker(false) => "legacy:clear",
            Self::LegacyMarker(true) => "legacy:set",
            Self::LockAware(state) => match state {
                LockState::Held => "lock:held",
                LockState::Released => "lock:released",
            },
        }
    }
}
