/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Messages as they travel through the channel registry.

use std::fmt;

use bytes::Bytes;

use crate::identifier::PortIdentifier;

/// An opaque serialized value, produced and consumed by a
/// [`crate::codec::Codec`]. Cloning is cheap: the bytes are shared, which
/// lets a broadcast fan out one payload to many members.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Wrap already-serialized bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Number of serialized bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// Describes a port being handed over, by ownership, inside a message: its
/// own identifier and its sibling's. The receiving context reconstructs a
/// port from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferredPort {
    /// The transferred endpoint.
    pub local: PortIdentifier,
    /// The endpoint it remains entangled with.
    pub remote: PortIdentifier,
}

/// A posted message: the payload plus any ports transferred with it.
#[derive(Debug, Clone)]
pub struct MessageWithPorts {
    /// The serialized value.
    pub payload: Payload,
    /// Ports transferred along with the value, in transfer-list order.
    pub transferred_ports: Vec<TransferredPort>,
}

impl MessageWithPorts {
    /// A message that transfers no ports.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            transferred_ports: Vec::new(),
        }
    }
}
