/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A table of live endpoint objects, used to decide whether a notification
//! has anywhere to go.
//!
//! Entries live in a generational arena. A [`LiveHandle`] is an
//! `(index, generation)` pair: once its entry is removed, the slot may be
//! reused, but the stale handle never resolves again. Holding a handle
//! therefore never keeps anything alive, and "generation mismatch" is
//! indistinguishable from "object gone".

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use generational_arena::Arena;
use generational_arena::Index;

use crate::identifier::ContextId;

/// A weak handle to one live entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveHandle(Index);

impl fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (index, generation) = self.0.into_raw_parts();
        write!(f, "LiveHandle({}@{})", index, generation)
    }
}

#[derive(Debug)]
struct Entry<K> {
    key: K,
    context: ContextId,
}

/// Maps endpoint identifiers to the execution context currently running
/// the endpoint's object.
#[derive(Debug)]
pub(crate) struct LiveTable<K> {
    entries: Arena<Entry<K>>,
    by_key: HashMap<K, LiveHandle>,
}

impl<K> Default for LiveTable<K> {
    fn default() -> Self {
        Self {
            entries: Arena::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash + fmt::Display> LiveTable<K> {
    /// Record that `key` is live on `context`, replacing any previous entry
    /// for the key.
    pub(crate) fn insert(&mut self, key: K, context: ContextId) -> LiveHandle {
        if let Some(previous) = self.by_key.remove(&key) {
            tracing::debug!(%key, "replacing live entry {:?}", previous);
            self.entries.remove(previous.0);
        }
        let handle = LiveHandle(self.entries.insert(Entry { key, context }));
        self.by_key.insert(key, handle);
        handle
    }

    /// Remove the entry for `key`. When `handle` is provided, the entry is
    /// removed only if it is still the one that handle names, so a stale
    /// owner cannot evict a newer registration.
    pub(crate) fn remove(&mut self, key: &K, handle: Option<LiveHandle>) -> bool {
        let current = match self.by_key.get(key) {
            Some(current) => *current,
            None => return false,
        };
        if let Some(handle) = handle {
            if handle != current {
                tracing::debug!(%key, "ignoring stale removal {:?}", handle);
                return false;
            }
        }
        self.by_key.remove(key);
        self.entries.remove(current.0).is_some()
    }

    /// The context running `key`, if it is live.
    pub(crate) fn context_of(&self, key: &K) -> Option<ContextId> {
        let handle = self.by_key.get(key)?;
        self.resolve(*handle)
            .filter(|entry| entry.key == *key)
            .map(|entry| entry.context)
    }

    fn resolve(&self, handle: LiveHandle) -> Option<&Entry<K>> {
        self.entries.get(handle.0)
    }

    /// Whether `handle` still names a live entry.
    #[cfg(test)]
    pub(crate) fn is_live(&self, handle: LiveHandle) -> bool {
        self.resolve(handle).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
