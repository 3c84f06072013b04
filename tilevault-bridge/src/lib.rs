//! Platform abstraction layer for TileVault.
//!
//! This crate defines the leaf types and traits the rest of the workspace is
//! built against: resource cache validators, the network collaborator used to
//! fetch a single resource, retry policy, and the injectable connectivity
//! flag. It has no I/O of its own; concrete implementations live in
//! `tilevault-http` (and in test doubles).

pub mod connectivity;
pub mod error;
pub mod fetch;
pub mod validators;

pub use connectivity::Connectivity;
pub use error::{FetchError, Result};
pub use fetch::{FetchOutcome, ResourceFetcher, RetryPolicy};
pub use validators::ResourceValidators;
