//! Backend implementations of the capability traits that live in-process.
//!
//! Real SDK adapters live outside this crate and plug in through
//! `ClientFactory`.

mod in_memory;

pub use in_memory::{BackendCall, InMemoryPackageBackend};
