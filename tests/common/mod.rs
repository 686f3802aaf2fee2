//! Common test utilities for dataset-fetch integration tests

#[allow(dead_code)]
pub mod events;
#[allow(dead_code)]
pub mod fixtures;

#[allow(unused_imports)]
pub use events::*;
#[allow(unused_imports)]
pub use fixtures::*;
