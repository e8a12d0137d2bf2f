/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The serialization collaborator. Ports never pass through a codec:
//! transferred ports travel beside the payload as
//! [`crate::message::TransferredPort`]s.

use std::fmt::Debug;

use crate::message::Payload;

/// The value type exchanged over ports and broadcast channels.
pub type Value = serde_json::Value;

/// Errors produced by a [`Codec`]. These are surfaced verbatim to the
/// caller of `post_message`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializationError {
    /// The value could not be serialized.
    #[error("serialize: {0}")]
    Serialize(String),

    /// A payload could not be turned back into a value.
    #[error("deserialize: {0}")]
    Deserialize(String),
}

/// Converts values to and from opaque payloads. A value accepted by
/// `serialize` must round-trip through `deserialize` to a structurally equal
/// value.
pub trait Codec: Send + Sync + Debug + 'static {
    /// Serialize a value into a payload.
    fn serialize(&self, value: &Value) -> Result<Payload, SerializationError>;

    /// Reconstruct a value from a payload.
    fn deserialize(&self, payload: &Payload) -> Result<Value, SerializationError>;
}

/// The default codec: JSON bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Payload, SerializationError> {
        serde_json::to_vec(value)
            .map(Payload::new)
            .map_err(|err| SerializationError::Serialize(err.to_string()))
    }

    fn deserialize(&self, payload: &Payload) -> Result<Value, SerializationError> {
        serde_json::from_slice(payload.as_bytes())
            .map_err(|err| SerializationError::Deserialize(err.to_string()))
    }
}
