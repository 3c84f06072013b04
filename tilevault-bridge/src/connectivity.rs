//! Connectivity Flag
//!
//! Hosts (and tests) sometimes need to force the SDK into offline mode. That
//! used to be ambient global state; here it is an explicit, injectable handle
//! passed to the download orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cheap, cloneable connectivity switch.
///
/// All clones observe the same underlying flag. The default is connected.
#[derive(Debug, Clone, Default)]
pub struct Connectivity {
    offline: Arc<AtomicBool>,
}

impl Connectivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that starts in forced-offline mode.
    pub fn offline() -> Self {
        let handle = Self::new();
        handle.set_offline(true);
        handle
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}
