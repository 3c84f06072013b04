//! Workspace placeholder crate.
//!
//! This crate exists so host applications can depend on a single package and
//! reach every TileVault component. It re-exports the individual workspace
//! crates (`tilevault-store`, `tilevault-offline`, ...) without adding any
//! behavior of its own.

pub use tilevault_bridge as bridge;
pub use tilevault_http as http;
pub use tilevault_offline as offline;
pub use tilevault_store as store;
