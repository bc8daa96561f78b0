//! Process-wide immutable context, constructed once at startup.
//!
//! A single `Context` value is constructed at startup and passed to every
//! component; singletons are retained only for the Persistent-ID Allocator
//! ([`crate::allocator::PersistentIdAllocator`]) and the Session Registry
//! ([`crate::session::SessionRegistry`]). Those two keep their own identity;
//! everything else that would otherwise be a global reaches the rest of the
//! system through a `Context` instead.

use std::sync::Arc;

use crate::config::Config;
use crate::storage::Storage;

/// Read-only state shared by every component of the control loop.
pub struct Context {
    config: Config,
    storage: Arc<dyn Storage>,
}

impl Context {
    /// Builds a context from a loaded config and an opened storage handle.
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Context {
        Context { config, storage }
    }

    /// The configuration loaded at startup.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The durable storage handle.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}
