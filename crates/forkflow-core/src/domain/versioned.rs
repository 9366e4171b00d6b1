//! Versioned entity wrapper used by flow-design tooling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Wraps an entity with a version number and a modified flag.
///
/// Readers get the inner value through `Deref`; every mutation goes through
/// [`Versioned::modify`], which bumps the version exactly once per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    value: T,
    version: u32,
    modified: bool,
    updated_at: DateTime<Utc>,
}

impl<T> Versioned<T> {
    /// Wrap a freshly created entity at version 1
    pub fn new(value: T) -> Self {
        Self {
            value,
            version: 1,
            modified: false,
            updated_at: Utc::now(),
        }
    }

    /// Apply a mutation, bump the version and mark the entity modified
    pub fn modify<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.value);
        self.version += 1;
        self.modified = true;
        self.updated_at = Utc::now();
        result
    }

    /// Clear the modified flag, typically after the entity was persisted
    pub fn clear_modified(&mut self) {
        self.modified = false;
    }

    /// Whether the entity changed since the flag was last cleared
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Current version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Last modification timestamp
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Unwrap the inner value
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Versioned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}
