#![forbid(unsafe_code)]

mod ids;
mod latch;
mod lease;
mod log;
mod signal;
pub mod staleness;

pub use ids::*;
pub use latch::*;
pub use lease::*;
pub use log::*;
pub use signal::*;
