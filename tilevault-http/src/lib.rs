//! Reqwest-based network collaborator for TileVault.
//!
//! Implements [`ResourceFetcher`] on top of `reqwest` with connection
//! pooling, conditional requests, and response-header validator parsing.

mod fetcher;

pub use fetcher::HttpResourceFetcher;
