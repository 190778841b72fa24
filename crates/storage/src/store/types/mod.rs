#![forbid(unsafe_code)]

mod events;
mod leases;

pub use events::*;
pub use leases::*;
