/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Helpers for tests that drive ports across context threads.

use std::sync::mpsc;
use std::time::Duration;

use tracing::Level;

use crate::codec::Codec;
use crate::codec::SerializationError;
use crate::codec::Value;
use crate::message::Payload;

/// How long [`Inbox::recv`] waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Set up a tracing subscriber with a filter, so that logs at or above
/// `level` are printed.
///
/// This is better than the traced_test macro when logs_contain and
/// logs_assert are not needed, because that macro prints TRACE level logs,
/// which is too verbose.
pub fn set_tracing_env_filter(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level.as_str()))
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("a global subscriber is already installed");
    }
}

/// Collects values sent from listeners on context threads so the test
/// thread can assert on them.
#[derive(Debug)]
pub struct Inbox<T> {
    rx: mpsc::Receiver<T>,
}

/// The sending half of an [`Inbox`]; `Send`, so it can be moved into tasks
/// and captured by listeners.
#[derive(Debug)]
pub struct InboxSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for InboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> InboxSender<T> {
    /// Deliver `value` to the inbox. Values sent after the inbox is gone
    /// are dropped.
    pub fn send(&self, value: T) {
        let _ = self.tx.send(value);
    }
}

impl<T> Inbox<T> {
    /// A new inbox and its sender.
    pub fn new() -> (InboxSender<T>, Self) {
        let (tx, rx) = mpsc::channel();
        (InboxSender { tx }, Self { rx })
    }

    /// The next value. Panics after [`RECV_TIMEOUT`].
    pub fn recv(&self) -> T {
        match self.rx.recv_timeout(RECV_TIMEOUT) {
            Ok(value) => value,
            Err(err) => panic!("inbox: no value within {:?}: {}", RECV_TIMEOUT, err),
        }
    }

    /// The next `n` values, in order.
    pub fn recv_n(&self, n: usize) -> Vec<T> {
        (0..n).map(|_| self.recv()).collect()
    }

    /// Whether a value arrives within `wait`.
    pub fn try_recv_within(&self, wait: Duration) -> Option<T> {
        self.rx.recv_timeout(wait).ok()
    }
}

/// A codec that serializes as JSON but refuses to deserialize any payload
/// whose value is the string `"poison"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoisonCodec;

impl Codec for PoisonCodec {
    fn serialize(&self, value: &Value) -> Result<Payload, SerializationError> {
        crate::codec::JsonCodec.serialize(value)
    }

    fn deserialize(&self, payload: &Payload) -> Result<Value, SerializationError> {
        let value = crate::codec::JsonCodec.deserialize(payload)?;
        if value == Value::String("poison".to_string()) {
            return Err(SerializationError::Deserialize("poisoned payload".to_string()));
        }
        Ok(value)
    }
}
