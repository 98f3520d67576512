//! Relay messaging core contracts and value types.
//!
//! This crate holds the records shared by the dispatch, scheduler, and storage
//! crates (instances, messages, groups, scheduled actions), the channel adapter
//! contract with its factory, the repository interfaces, and an in-memory
//! repository used by tests and single-process deployments.
pub mod adapter;
pub mod error;
pub mod factory;
pub mod memory;
pub mod repository;
pub mod subjects;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod types;

pub use adapter::*;
pub use error::*;
pub use factory::*;
pub use memory::*;
pub use repository::*;
pub use subjects::*;
pub use types::*;

/// Returns the semantic version advertised by this crate.
///
/// ```
/// assert_eq!(relay_core::version(), "0.4.18");
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
