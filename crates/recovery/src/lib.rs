#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod coordinator;
mod error;
pub mod lease_manager;
pub mod scanner;
pub mod signals;
pub mod worker;

pub use error::{ConfigError, RecoveryError};

#[cfg(test)]
mod tests;
