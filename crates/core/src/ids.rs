#![forbid(unsafe_code)]

use std::fmt;

const MAX_IDENTITY_LEN: usize = 128;

/// Stable name of one logical cluster member. Survives restarts and is never
/// held by two live processes at once.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        validate_name(&value, false)?;
        Ok(Self(value))
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Partition of identities a member may recover on behalf of. The empty
/// string is the default group.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecoveryGroup(String);

impl RecoveryGroup {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        validate_name(&value, true)?;
        Ok(Self(value))
    }
}

impl fmt::Display for RecoveryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<default>")
        } else {
            f.write_str(&self.0)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityError {
    Empty,
    TooLong,
    InvalidFirstChar,
    InvalidChar { ch: char, index: usize },
}

impl IdentityError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Empty => "identity must not be empty",
            Self::TooLong => "identity is too long (max 128 bytes)",
            Self::InvalidFirstChar => "identity must start with an ASCII letter or digit",
            Self::InvalidChar { .. } => "identity contains an invalid character",
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChar { ch, index } => {
                write!(f, "{} ({ch:?} at {index})", self.message())
            }
            _ => f.write_str(self.message()),
        }
    }
}

impl std::error::Error for IdentityError {}

fn validate_name(value: &str, allow_empty: bool) -> Result<(), IdentityError> {
    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            Err(IdentityError::Empty)
        };
    }
    if value.len() > MAX_IDENTITY_LEN {
        return Err(IdentityError::TooLong);
    }
    let mut chars = value.chars().enumerate();
    let Some((_, first)) = chars.next() else {
        return Err(IdentityError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(IdentityError::InvalidFirstChar);
    }
    for (index, ch) in chars {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-') {
            continue;
        }
        return Err(IdentityError::InvalidChar { ch, index });
    }
    Ok(())
}
