/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Identifiers naming ports, broadcast members, and execution contexts.
//!
//! | Entity            | Identifier            |
//! |-------------------|-----------------------|
//! | Locality          | `proc<pid>`           |
//! | Port              | `proc<pid>.port[seq]` |
//! | Broadcast member  | `proc<pid>.bc[seq]`   |
//! | Execution context | `ctx[seq]`            |
//!
//! Sequence numbers are issued from process-wide monotonic counters, so two
//! identifiers minted in the same process never collide.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde::Deserialize;
use serde::Serialize;

static NEXT_PORT_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static NEXT_BROADCAST_SEQUENCE: AtomicU64 = AtomicU64::new(1);
static NEXT_CONTEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// An opaque locality tag: the process an endpoint is currently owned by.
/// No transport between localities is implemented; the tag is carried so
/// that ownership transfers can be checked.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct Locality(pub u64);

impl Locality {
    /// The locality of the current process.
    pub fn current() -> Self {
        Self(std::process::id() as u64)
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

/// Globally names one endpoint of a message channel. Immutable once minted;
/// equality and hashing are by value.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct PortIdentifier {
    /// The locality that minted this identifier.
    pub locality: Locality,
    /// Monotonically issued sequence number.
    pub sequence: u64,
}

impl PortIdentifier {
    /// Mint a fresh identifier in the provided locality.
    pub fn generate(locality: Locality) -> Self {
        Self {
            locality,
            sequence: NEXT_PORT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for PortIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.port[{}]", self.locality, self.sequence)
    }
}

/// Names one member of a broadcast group.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct BroadcastChannelId {
    /// The locality that minted this identifier.
    pub locality: Locality,
    /// Monotonically issued sequence number.
    pub sequence: u64,
}

impl BroadcastChannelId {
    /// Mint a fresh identifier in the provided locality.
    pub fn generate(locality: Locality) -> Self {
        Self {
            locality,
            sequence: NEXT_BROADCAST_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for BroadcastChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.bc[{}]", self.locality, self.sequence)
    }
}

/// Names an execution context (one thread with its own task queue).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub struct ContextId(pub u64);

impl ContextId {
    pub(crate) fn generate() -> Self {
        Self(NEXT_CONTEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx[{}]", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_display() {
        let id = PortIdentifier {
            locality: Locality(7),
            sequence: 3,
        };
        assert_eq!(id.to_string(), "proc7.port[3]");
        let id = BroadcastChannelId {
            locality: Locality(7),
            sequence: 9,
        };
        assert_eq!(id.to_string(), "proc7.bc[9]");
        assert_eq!(ContextId(2).to_string(), "ctx[2]");
    }

    #[test]
    fn test_generate_is_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..256)
                        .map(|_| PortIdentifier::generate(Locality(1)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate identifier {}", id);
            }
        }
        assert_eq!(seen.len(), 4 * 256);
    }

    #[test]
    fn test_serde() {
        let id = PortIdentifier::generate(Locality(11));
        let json = serde_json::to_string(&id).unwrap();
        let back: PortIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
