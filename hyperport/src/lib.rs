/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hyperport carries messages between execution contexts: threads that each
//! run a single-threaded task queue and own the objects created on them.
//!
//! # Data model
//!
//! * A _channel_ is a pair of _ports_. A message posted on one port is
//!   delivered, in order, to the other, wherever it currently lives.
//! * Ports can be _transferred_ inside a message. The sending context gives
//!   the port up; the receiving context re-materializes it, still entangled
//!   with the same sibling, and no message is lost or reordered on the way.
//! * A _broadcast channel_ joins a named group. A message posted on one
//!   member reaches every other member of the group.
//!
//! All channel state lives in one [`registry`], a process-wide actor that
//! owns every message queue in flight. Execution contexts own only their
//! port objects; they reach the registry through a [`RegistryHandle`] and
//! are reached by it through a [`ContextHandle`].
//!
//! | Entity            | Identifier        |
//! |-------------------|-------------------|
//! | Locality          | `proc7`           |
//! | Port              | `proc7.port[3]`   |
//! | Broadcast channel | `proc7.bc[9]`     |
//! | Execution context | `ctx[2]`          |
//!
//! ```ignore
//! let runtime = PortRuntime::new(Config::default())?;
//! let context = runtime.spawn_context("worker")?;
//! context.post_task_and_wait(|scope| {
//!     let channel = MessageChannel::new(scope)?;
//!     channel.port1.post_message(&json!("hi"), &[])?;
//!     Ok::<_, PortError>(())
//! })??;
//! ```

#![deny(missing_docs)]

pub mod broadcast;
mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod identifier;
pub mod init;
pub mod listener;
pub mod message;
pub mod port;
pub mod registry;
pub mod runtime;
pub mod test_utils;

pub use broadcast::BroadcastChannel;
pub use codec::Codec;
pub use codec::JsonCodec;
pub use codec::SerializationError;
pub use codec::Value;
pub use config::Config;
pub use context::ContextDirectory;
pub use context::ContextError;
pub use context::ContextHandle;
pub use context::ExecutionContext;
pub use context::Scope;
pub use identifier::BroadcastChannelId;
pub use identifier::ContextId;
pub use identifier::Locality;
pub use identifier::PortIdentifier;
pub use init::initialize;
pub use listener::EventKind;
pub use listener::EventTarget;
pub use listener::Listener;
pub use listener::ListenerId;
pub use message::MessageWithPorts;
pub use message::Payload;
pub use message::TransferredPort;
pub use port::MessageChannel;
pub use port::MessageEvent;
pub use port::MessagePort;
pub use port::PortError;
pub use port::receive_message_on_port;
pub use registry::DeliveryToken;
pub use registry::LiveHandle;
pub use registry::RegistryError;
pub use registry::RegistryHandle;
pub use runtime::PortRuntime;
