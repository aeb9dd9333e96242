//! Shared types for the uvmdisk crates.

pub mod errors;

pub use errors::{DiskError, DiskResult};
