//! Containers whose stop request outlived the watchdog.
//!
//! Entries are only ever added. A blacklisted container is skipped by every
//! later stop for as long as the store lives.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

pub trait BlacklistStore: Send + Sync {
    fn contains(&self, container_id: &str) -> bool;
    fn insert(&self, container_id: &str);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct MemBlacklist {
    ids: RwLock<HashSet<String>>,
}

impl MemBlacklist {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlacklistStore for MemBlacklist {
    fn contains(&self, container_id: &str) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(container_id)
    }

    fn insert(&self, container_id: &str) {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container_id.to_string());
    }

    fn len(&self) -> usize {
        self.ids.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
