#![forbid(unsafe_code)]

mod backend;
mod memory;
mod store;

pub use backend::*;
pub use memory::MemoryStore;
pub use store::*;
