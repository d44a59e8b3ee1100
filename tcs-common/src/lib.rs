#![doc = "Shared building blocks for the tc-sidecar crates."]

pub mod backoff;
pub mod command;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backoff::ExponentialBackoff;
pub use command::{Executor, Runner};

/// Name of the intermediate interface carrying the shaping parameters of `ifb_id`.
pub fn ifb_device(ifb_id: &str) -> String {
    format!("ifb{ifb_id}")
}
