/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The channel registry: the single authority over every channel.
//!
//! The registry is an actor confined to one "home" thread. Its state is
//! never shared: every operation is a message sent over an
//! unbounded queue. Mutations that callers must observe immediately
//! (create, entangle, disentangle, close, take) are *post-and-wait*: the
//! message carries a oneshot reply and the caller blocks on it. Posting a
//! message, completing a delivery batch, and broadcast fan-out are
//! *post-and-forget*.
//!
//! The registry itself never blocks on a context; contexts only ever block
//! on the registry. Notifications flowing back to contexts are therefore
//! always post-and-forget, which is what keeps the topology deadlock-free
//! regardless of how many contexts exist.
//!
//! A lookup miss is never an error here. It is the normal outcome of racing
//! closes and is logged at `trace`.

use std::collections::HashMap;
use std::io;
use std::ops::ControlFlow;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use generational_arena::Arena;
use generational_arena::Index;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::broadcast::groups::BroadcastChannelRegistry;
use crate::channel::Channel;
use crate::context::ContextDirectory;
use crate::context::ContextHandle;
use crate::identifier::BroadcastChannelId;
use crate::identifier::ContextId;
use crate::identifier::Locality;
use crate::identifier::PortIdentifier;
use crate::message::MessageWithPorts;
use crate::message::Payload;

pub(crate) mod live;

pub use live::LiveHandle;
use live::LiveTable;

/// Errors returned by registry calls.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry's home thread has shut down.
    #[error("channel registry stopped")]
    Stopped,
}

/// Messages served by the registry actor.
#[derive(Debug)]
pub(crate) enum RegistryMessage {
    CreateChannel {
        port1: PortIdentifier,
        port2: PortIdentifier,
        reply: oneshot::Sender<()>,
    },
    Entangle {
        local: PortIdentifier,
        remote: PortIdentifier,
        locality: Locality,
        context: ContextId,
        reply: oneshot::Sender<Option<LiveHandle>>,
    },
    Disentangle {
        local: PortIdentifier,
        handle: Option<LiveHandle>,
        reply: oneshot::Sender<()>,
    },
    Close {
        local: PortIdentifier,
        handle: Option<LiveHandle>,
        reply: oneshot::Sender<()>,
    },
    PostMessage {
        message: MessageWithPorts,
        remote: PortIdentifier,
    },
    TakeAllMessages {
        local: PortIdentifier,
        reply: oneshot::Sender<Option<Vec<MessageWithPorts>>>,
    },
    BatchDelivered {
        local: PortIdentifier,
    },
    TryTakeMessage {
        local: PortIdentifier,
        reply: oneshot::Sender<Option<MessageWithPorts>>,
    },
    RegisterBroadcast {
        name: String,
        id: BroadcastChannelId,
        context: ContextId,
        reply: oneshot::Sender<LiveHandle>,
    },
    UnregisterBroadcast {
        name: String,
        id: BroadcastChannelId,
        handle: Option<LiveHandle>,
        reply: oneshot::Sender<bool>,
    },
    PostBroadcast {
        name: String,
        source: BroadcastChannelId,
        payload: Payload,
    },
    ChannelCount {
        reply: oneshot::Sender<usize>,
    },
    PendingCount {
        port: PortIdentifier,
        reply: oneshot::Sender<usize>,
    },
    BroadcastMembers {
        name: String,
        reply: oneshot::Sender<Vec<BroadcastChannelId>>,
    },
    Sync {
        reply: oneshot::Sender<()>,
    },
    Stop,
}

/// Registry state. Only the home thread touches it.
#[derive(Debug)]
pub(crate) struct ChannelRegistry {
    channels: Arena<Channel>,
    by_port: HashMap<PortIdentifier, Index>,
    live_ports: LiveTable<PortIdentifier>,
    groups: BroadcastChannelRegistry,
    live_broadcasts: LiveTable<BroadcastChannelId>,
    directory: ContextDirectory,
    pending_warn_threshold: usize,
}

impl ChannelRegistry {
    pub(crate) fn new(directory: ContextDirectory, pending_warn_threshold: usize) -> Self {
        Self {
            channels: Arena::new(),
            by_port: HashMap::new(),
            live_ports: LiveTable::default(),
            groups: BroadcastChannelRegistry::default(),
            live_broadcasts: LiveTable::default(),
            directory,
            pending_warn_threshold,
        }
    }

    fn index_of(&self, port: &PortIdentifier) -> Option<Index> {
        self.by_port.get(port).copied()
    }

    pub(crate) fn create_channel(&mut self, port1: PortIdentifier, port2: PortIdentifier) {
        for port in [&port1, &port2] {
            assert!(
                !self.by_port.contains_key(port),
                "port {} already belongs to a channel",
                port
            );
        }
        let index = self.channels.insert(Channel::new(port1, port2));
        self.by_port.insert(port1, index);
        self.by_port.insert(port2, index);
        tracing::debug!(%port1, %port2, "created channel");
    }

    /// Attach `local` to `context`. Returns `None` when the channel is gone
    /// or the side has been closed, in which case the caller's port starts
    /// out closed.
    pub(crate) fn entangle(
        &mut self,
        local: PortIdentifier,
        remote: PortIdentifier,
        locality: Locality,
        context: ContextId,
    ) -> Option<LiveHandle> {
        let Some(index) = self.index_of(&local) else {
            tracing::trace!(port = %local, "entangle: no channel");
            return None;
        };
        let channel = &mut self.channels[index];
        let sibling = channel.sibling(&local);
        assert_eq!(
            sibling, remote,
            "port {} entangled with {} but its channel pairs it with {}",
            local, remote, sibling
        );
        if channel.is_port_closed(&local) {
            tracing::trace!(port = %local, "entangle: side already closed");
            return None;
        }
        channel.entangle_port_with_locality(&local, locality);
        let peer_closed = channel.is_port_closed(&sibling);
        let handle = self.live_ports.insert(local, context);
        tracing::debug!(port = %local, %context, "entangled");
        if peer_closed {
            self.notify_peer_closed(&local);
        }
        Some(handle)
    }

    pub(crate) fn disentangle(&mut self, local: PortIdentifier, handle: Option<LiveHandle>) {
        self.live_ports.remove(&local, handle);
        match self.index_of(&local) {
            Some(index) => self.channels[index].disentangle_port(&local),
            None => tracing::trace!(port = %local, "disentangle: no channel"),
        }
    }

    /// Close `local`. Ports carried by messages that can no longer be
    /// delivered are closed too, transitively. Each closed side's sibling,
    /// if still open and live, is told so.
    pub(crate) fn close(&mut self, local: PortIdentifier, handle: Option<LiveHandle>) {
        let mut worklist = vec![(local, handle)];
        while let Some((port, handle)) = worklist.pop() {
            self.live_ports.remove(&port, handle);
            let Some(index) = self.index_of(&port) else {
                tracing::trace!(%port, "close: no channel");
                continue;
            };
            let channel = &mut self.channels[index];
            let newly_closed = !channel.is_port_closed(&port);
            let sibling = channel.sibling(&port);
            let cleared = channel.close_port(&port);
            let notify_sibling = newly_closed && !channel.is_port_closed(&sibling);
            tracing::debug!(%port, cleared = cleared.len(), "closed");
            for message in cleared {
                worklist.extend(message.transferred_ports.iter().map(|t| (t.local, None)));
            }
            if notify_sibling {
                self.notify_peer_closed(&sibling);
            }
            self.reclaim(index);
        }
    }

    /// Drop a message that cannot be delivered, closing the ports it carried.
    fn discard(&mut self, message: MessageWithPorts) {
        for transferred in message.transferred_ports {
            tracing::debug!(port = %transferred.local, "closing orphaned transferred port");
            self.close(transferred.local, None);
        }
    }

    fn reclaim(&mut self, index: Index) {
        if !self
            .channels
            .get(index)
            .is_some_and(|channel| channel.is_reclaimable())
        {
            return;
        }
        if let Some(channel) = self.channels.remove(index) {
            let [port1, port2] = *channel.ports();
            self.by_port.remove(&port1);
            self.by_port.remove(&port2);
            tracing::debug!(%port1, %port2, "destroyed channel");
        }
    }

    pub(crate) fn post_message_to_remote(
        &mut self,
        message: MessageWithPorts,
        remote: PortIdentifier,
    ) {
        let Some(index) = self.index_of(&remote) else {
            tracing::trace!(port = %remote, "post: no channel, dropping message");
            self.discard(message);
            return;
        };
        let channel = &mut self.channels[index];
        match channel.post_message_to_remote(message, &remote) {
            Err(message) => {
                tracing::trace!(port = %remote, "post: target closed, dropping message");
                self.discard(message);
            }
            Ok(notify) => {
                let pending = channel.pending_len(&remote);
                if pending == self.pending_warn_threshold {
                    tracing::warn!(
                        port = %remote,
                        pending,
                        "pending message queue reached its warning threshold; queues are unbounded"
                    );
                }
                if notify {
                    self.notify_port(&remote);
                }
            }
        }
    }

    /// The context running `port`, if the port is live somewhere.
    fn live_context(&self, port: &PortIdentifier) -> Option<ContextHandle> {
        self.live_ports
            .context_of(port)
            .and_then(|context| self.directory.get(context))
    }

    /// Tell the context running `port`, if any, that messages are waiting.
    /// Without a live port the messages simply stay queued.
    fn notify_port(&self, port: &PortIdentifier) {
        match self.live_context(port) {
            Some(handle) => handle.message_available(*port),
            None => tracing::trace!(%port, "no live port to notify"),
        }
    }

    /// Tell the context running `port`, if any, that its sibling closed. A
    /// port entangled later learns of it from `entangle`.
    fn notify_peer_closed(&self, port: &PortIdentifier) {
        match self.live_context(port) {
            Some(handle) => handle.peer_closed(*port),
            None => tracing::trace!(%port, "no live port to tell of close"),
        }
    }

    /// Start a delivery batch. `None` means there is no channel, so no batch
    /// was started.
    pub(crate) fn take_all_messages(
        &mut self,
        local: PortIdentifier,
    ) -> Option<Vec<MessageWithPorts>> {
        let index = self.index_of(&local)?;
        Some(self.channels[index].take_all_messages_for_port(&local))
    }

    pub(crate) fn batch_delivered(&mut self, local: PortIdentifier) {
        let Some(index) = self.index_of(&local) else {
            tracing::warn!(port = %local, "batch completed for unknown channel");
            return;
        };
        self.channels[index].batch_delivered();
        self.reclaim(index);
    }

    pub(crate) fn try_take_message(&mut self, local: PortIdentifier) -> Option<MessageWithPorts> {
        let index = self.index_of(&local)?;
        self.channels[index].try_take_message_for_port(&local)
    }

    pub(crate) fn register_broadcast(
        &mut self,
        name: &str,
        id: BroadcastChannelId,
        context: ContextId,
    ) -> LiveHandle {
        self.groups.register_channel(name, id);
        tracing::debug!(name, %id, %context, "joined broadcast group");
        self.live_broadcasts.insert(id, context)
    }

    pub(crate) fn unregister_broadcast(
        &mut self,
        name: &str,
        id: BroadcastChannelId,
        handle: Option<LiveHandle>,
    ) -> bool {
        self.live_broadcasts.remove(&id, handle);
        let removed = self.groups.unregister_channel(name, &id);
        if !removed {
            tracing::trace!(name, %id, "unregister: not a member");
        }
        removed
    }

    /// Fan `payload` out to every member of `name` except `source`. Each
    /// member is an independent delivery.
    pub(crate) fn post_broadcast(&self, name: &str, source: BroadcastChannelId, payload: Payload) {
        for member in self.groups.recipients(name, &source) {
            let handle = self
                .live_broadcasts
                .context_of(&member)
                .and_then(|context| self.directory.get(context));
            match handle {
                Some(handle) => handle.deliver_broadcast(member, payload.clone()),
                None => tracing::trace!(name, %member, "no live broadcast member"),
            }
        }
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn pending_count(&self, port: &PortIdentifier) -> usize {
        self.index_of(port)
            .map_or(0, |index| self.channels[index].pending_len(port))
    }

    fn handle(&mut self, message: RegistryMessage) -> ControlFlow<()> {
        // A dropped reply receiver means the caller went away; nothing to do.
        match message {
            RegistryMessage::CreateChannel {
                port1,
                port2,
                reply,
            } => {
                self.create_channel(port1, port2);
                let _ = reply.send(());
            }
            RegistryMessage::Entangle {
                local,
                remote,
                locality,
                context,
                reply,
            } => {
                let handle = self.entangle(local, remote, locality, context);
                let _ = reply.send(handle);
            }
            RegistryMessage::Disentangle {
                local,
                handle,
                reply,
            } => {
                self.disentangle(local, handle);
                let _ = reply.send(());
            }
            RegistryMessage::Close {
                local,
                handle,
                reply,
            } => {
                self.close(local, handle);
                let _ = reply.send(());
            }
            RegistryMessage::PostMessage { message, remote } => {
                self.post_message_to_remote(message, remote);
            }
            RegistryMessage::TakeAllMessages { local, reply } => {
                let batch = self.take_all_messages(local);
                let started = batch.is_some();
                if reply.send(batch).is_err() && started {
                    // Nobody will complete this batch.
                    self.batch_delivered(local);
                }
            }
            RegistryMessage::BatchDelivered { local } => self.batch_delivered(local),
            RegistryMessage::TryTakeMessage { local, reply } => {
                let _ = reply.send(self.try_take_message(local));
            }
            RegistryMessage::RegisterBroadcast {
                name,
                id,
                context,
                reply,
            } => {
                let handle = self.register_broadcast(&name, id, context);
                let _ = reply.send(handle);
            }
            RegistryMessage::UnregisterBroadcast {
                name,
                id,
                handle,
                reply,
            } => {
                let removed = self.unregister_broadcast(&name, id, handle);
                let _ = reply.send(removed);
            }
            RegistryMessage::PostBroadcast {
                name,
                source,
                payload,
            } => self.post_broadcast(&name, source, payload),
            RegistryMessage::ChannelCount { reply } => {
                let _ = reply.send(self.channel_count());
            }
            RegistryMessage::PendingCount { port, reply } => {
                let _ = reply.send(self.pending_count(&port));
            }
            RegistryMessage::BroadcastMembers { name, reply } => {
                let _ = reply.send(self.groups.members(&name));
            }
            RegistryMessage::Sync { reply } => {
                let _ = reply.send(());
            }
            RegistryMessage::Stop => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Serve messages until stopped or until every sender is gone.
    pub(crate) async fn serve(mut self, mut rx: mpsc::UnboundedReceiver<RegistryMessage>) {
        while let Some(message) = rx.recv().await {
            if self.handle(message).is_break() {
                break;
            }
        }
        tracing::debug!(
            channels = self.channel_count(),
            live_ports = self.live_ports.len(),
            "channel registry stopped"
        );
    }
}

/// Spawn the registry on a dedicated home thread running a current-thread
/// tokio runtime.
pub(crate) fn spawn(
    thread_name: &str,
    locality: Locality,
    directory: ContextDirectory,
    pending_warn_threshold: usize,
) -> io::Result<(RegistryHandle, JoinHandle<()>)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let registry = ChannelRegistry::new(directory, pending_warn_threshold);
    let join = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || runtime.block_on(registry.serve(rx)))?;
    let handle = RegistryHandle {
        tx,
        locality,
        home: join.thread().id(),
    };
    Ok((handle, join))
}

/// Completes a delivery batch started by
/// [`RegistryHandle::take_all_messages_for_port`]. The batch is complete
/// when the token is completed or dropped, whichever comes first.
#[must_use = "dropping a delivery token completes its batch"]
#[derive(Debug)]
pub struct DeliveryToken {
    port: PortIdentifier,
    tx: Option<mpsc::UnboundedSender<RegistryMessage>>,
}

impl DeliveryToken {
    /// A token for a batch that was never started.
    fn inert(port: PortIdentifier) -> Self {
        Self { port, tx: None }
    }

    /// Signal that every message in the batch has been dispatched.
    pub fn complete(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            if tx
                .send(RegistryMessage::BatchDelivered { local: self.port })
                .is_err()
            {
                tracing::trace!(port = %self.port, "registry gone before batch completed");
            }
        }
    }
}

impl Drop for DeliveryToken {
    fn drop(&mut self) {
        self.signal();
    }
}

/// A cloneable, thread-safe handle to the registry actor.
///
/// Post-and-wait methods block the calling thread, so they must not be
/// called from inside an asynchronous runtime, and never from the
/// registry's own thread.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryMessage>,
    locality: Locality,
    home: ThreadId,
}

impl RegistryHandle {
    /// The locality ports created through this registry belong to.
    pub fn locality(&self) -> Locality {
        self.locality
    }

    fn call<R>(
        &self,
        message: impl FnOnce(oneshot::Sender<R>) -> RegistryMessage,
    ) -> Result<R, RegistryError> {
        assert_ne!(
            thread::current().id(),
            self.home,
            "post-and-wait issued on the registry's home thread"
        );
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .map_err(|_| RegistryError::Stopped)?;
        rx.blocking_recv().map_err(|_| RegistryError::Stopped)
    }

    fn post(&self, message: RegistryMessage) -> Result<(), RegistryError> {
        self.tx.send(message).map_err(|_| RegistryError::Stopped)
    }

    /// Register a new channel pairing `port1` with `port2`.
    pub fn create_channel(
        &self,
        port1: PortIdentifier,
        port2: PortIdentifier,
    ) -> Result<(), RegistryError> {
        self.call(|reply| RegistryMessage::CreateChannel {
            port1,
            port2,
            reply,
        })
    }

    /// Record that `local` now runs on `context`. Returns `None` if the
    /// side no longer exists or is closed.
    pub fn entangle(
        &self,
        local: PortIdentifier,
        remote: PortIdentifier,
        locality: Locality,
        context: ContextId,
    ) -> Result<Option<LiveHandle>, RegistryError> {
        self.call(|reply| RegistryMessage::Entangle {
            local,
            remote,
            locality,
            context,
            reply,
        })
    }

    /// Detach `local` from its context; its queue is retained.
    pub fn disentangle(
        &self,
        local: PortIdentifier,
        handle: Option<LiveHandle>,
    ) -> Result<(), RegistryError> {
        self.call(|reply| RegistryMessage::Disentangle {
            local,
            handle,
            reply,
        })
    }

    /// Close `local`, clearing its queue.
    pub fn close(
        &self,
        local: PortIdentifier,
        handle: Option<LiveHandle>,
    ) -> Result<(), RegistryError> {
        self.call(|reply| RegistryMessage::Close {
            local,
            handle,
            reply,
        })
    }

    /// Queue `message` for `remote`, notifying its context if needed.
    pub fn post_message_to_remote(
        &self,
        message: MessageWithPorts,
        remote: PortIdentifier,
    ) -> Result<(), RegistryError> {
        self.post(RegistryMessage::PostMessage { message, remote })
    }

    /// Take every message queued for `local`, in order, along with the token
    /// that completes the batch.
    pub fn take_all_messages_for_port(
        &self,
        local: PortIdentifier,
    ) -> Result<(Vec<MessageWithPorts>, DeliveryToken), RegistryError> {
        let batch = self.call(|reply| RegistryMessage::TakeAllMessages { local, reply })?;
        Ok(match batch {
            Some(messages) => (
                messages,
                DeliveryToken {
                    port: local,
                    tx: Some(self.tx.clone()),
                },
            ),
            None => (Vec::new(), DeliveryToken::inert(local)),
        })
    }

    /// Pop the oldest message queued for `local`.
    pub fn try_take_message_for_port(
        &self,
        local: PortIdentifier,
    ) -> Result<Option<MessageWithPorts>, RegistryError> {
        self.call(|reply| RegistryMessage::TryTakeMessage { local, reply })
    }

    /// Join broadcast group `name`.
    pub fn register_broadcast(
        &self,
        name: &str,
        id: BroadcastChannelId,
        context: ContextId,
    ) -> Result<LiveHandle, RegistryError> {
        self.call(|reply| RegistryMessage::RegisterBroadcast {
            name: name.to_string(),
            id,
            context,
            reply,
        })
    }

    /// Leave broadcast group `name`. Returns whether `id` was a member.
    pub fn unregister_broadcast(
        &self,
        name: &str,
        id: BroadcastChannelId,
        handle: Option<LiveHandle>,
    ) -> Result<bool, RegistryError> {
        self.call(|reply| RegistryMessage::UnregisterBroadcast {
            name: name.to_string(),
            id,
            handle,
            reply,
        })
    }

    /// Deliver `payload` to every other member of `name`.
    pub fn post_broadcast(
        &self,
        name: &str,
        source: BroadcastChannelId,
        payload: Payload,
    ) -> Result<(), RegistryError> {
        self.post(RegistryMessage::PostBroadcast {
            name: name.to_string(),
            source,
            payload,
        })
    }

    /// Number of channels the registry currently holds.
    pub fn channel_count(&self) -> Result<usize, RegistryError> {
        self.call(|reply| RegistryMessage::ChannelCount { reply })
    }

    /// Number of messages queued for `port`; zero if it has no channel.
    pub fn pending_message_count(&self, port: PortIdentifier) -> Result<usize, RegistryError> {
        self.call(|reply| RegistryMessage::PendingCount { port, reply })
    }

    /// Current members of broadcast group `name`, in registration order.
    pub fn broadcast_members(&self, name: &str) -> Result<Vec<BroadcastChannelId>, RegistryError> {
        self.call(|reply| RegistryMessage::BroadcastMembers {
            name: name.to_string(),
            reply,
        })
    }

    /// Wait until every message posted through this handle before the call
    /// has been processed, including the notifications it caused.
    pub fn sync(&self) -> Result<(), RegistryError> {
        self.call(|reply| RegistryMessage::Sync { reply })
    }

    pub(crate) fn stop(&self) {
        if self.post(RegistryMessage::Stop).is_err() {
            tracing::trace!("registry already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;
    use tracing_test::traced_test;

    use super::*;
    use crate::context::ContextTask;
    use crate::message::TransferredPort;

    const LOCALITY: Locality = Locality(1);

    fn ids() -> (PortIdentifier, PortIdentifier) {
        (
            PortIdentifier::generate(LOCALITY),
            PortIdentifier::generate(LOCALITY),
        )
    }

    fn message(text: &str) -> MessageWithPorts {
        MessageWithPorts::new(Payload::new(text.as_bytes().to_vec()))
    }

    /// A registry plus one detached context whose task queue the test reads.
    fn setup() -> (
        ChannelRegistry,
        ContextId,
        mpsc::UnboundedReceiver<ContextTask>,
    ) {
        let directory = ContextDirectory::default();
        let (handle, rx) = ContextHandle::detached();
        let context = handle.id();
        directory.insert(handle);
        (ChannelRegistry::new(directory, 3), context, rx)
    }

    fn drained(rx: &mut mpsc::UnboundedReceiver<ContextTask>) -> Vec<PortIdentifier> {
        let mut ports = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ContextTask::DrainPort(port)) => ports.push(port),
                Ok(other) => panic!("unexpected task {:?}", other),
                Err(TryRecvError::Empty) => return ports,
                Err(err) => panic!("{}", err),
            }
        }
    }

    #[test]
    fn test_notify_only_live_ports_once() {
        let (mut registry, context, mut rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);

        // No live port for b: the message waits silently.
        registry.post_message_to_remote(message("1"), b);
        assert!(drained(&mut rx).is_empty());
        assert_eq!(registry.pending_count(&b), 1);

        registry.entangle(b, a, LOCALITY, context).unwrap();
        assert_eq!(registry.take_all_messages(b).unwrap().len(), 1);
        registry.batch_delivered(b);

        // Empty queue notifies; the following posts coalesce.
        registry.post_message_to_remote(message("2"), b);
        registry.post_message_to_remote(message("3"), b);
        assert_eq!(drained(&mut rx), vec![b]);
    }

    #[test]
    fn test_channel_destroyed_after_both_closed_and_delivered() {
        let (mut registry, context, _rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);
        let handle = registry.entangle(a, b, LOCALITY, context);
        assert!(handle.is_some());
        registry.post_message_to_remote(message("x"), a);

        let batch = registry.take_all_messages(a).unwrap();
        assert_eq!(batch.len(), 1);
        registry.close(a, handle);
        registry.close(b, None);
        assert_eq!(registry.channel_count(), 1);

        registry.batch_delivered(a);
        assert_eq!(registry.channel_count(), 0);

        // Everything afterwards is a silent miss.
        registry.post_message_to_remote(message("late"), a);
        registry.close(a, None);
        assert!(registry.take_all_messages(a).is_none());
        assert_eq!(registry.entangle(a, b, LOCALITY, context), None);
    }

    #[test]
    fn test_entangle_closed_side_fails() {
        let (mut registry, context, _rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);
        registry.close(a, None);
        assert_eq!(registry.entangle(a, b, LOCALITY, context), None);
        assert!(registry.entangle(b, a, LOCALITY, context).is_some());
    }

    fn peer_closed(rx: &mut mpsc::UnboundedReceiver<ContextTask>) -> Vec<PortIdentifier> {
        let mut ports = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ContextTask::PeerClosed(port)) => ports.push(port),
                Ok(other) => panic!("unexpected task {:?}", other),
                Err(TryRecvError::Empty) => return ports,
                Err(err) => panic!("{}", err),
            }
        }
    }

    #[test]
    fn test_close_tells_live_sibling_once() {
        let (mut registry, context, mut rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);
        let handle_a = registry.entangle(a, b, LOCALITY, context);
        registry.entangle(b, a, LOCALITY, context).unwrap();

        registry.close(a, handle_a);
        assert_eq!(peer_closed(&mut rx), vec![b]);
        registry.close(a, None);
        assert!(peer_closed(&mut rx).is_empty());

        // The last side closing has nobody left to tell.
        registry.close(b, None);
        assert!(peer_closed(&mut rx).is_empty());
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_entangle_after_sibling_closed_tells_new_port() {
        let (mut registry, context, mut rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);

        // b is in transit when a closes: there is no one to tell yet.
        registry.close(a, None);
        assert!(peer_closed(&mut rx).is_empty());

        assert!(registry.entangle(b, a, LOCALITY, context).is_some());
        assert_eq!(peer_closed(&mut rx), vec![b]);
    }

    #[test]
    fn test_orphaned_transferred_ports_are_closed() {
        let (mut registry, _context, _rx) = setup();
        let (a, b) = ids();
        let (c, d) = ids();
        registry.create_channel(a, b);
        registry.create_channel(c, d);

        // c travels to b, but b closes before it is delivered.
        let mut carrier = message("carrier");
        carrier.transferred_ports.push(TransferredPort {
            local: c,
            remote: d,
        });
        registry.post_message_to_remote(carrier, b);
        registry.close(b, None);

        // c was closed along with the queue; closing d reclaims its channel.
        registry.close(d, None);
        registry.close(a, None);
        assert_eq!(registry.channel_count(), 0);
    }

    #[test]
    fn test_post_to_closed_side_discards() {
        let (mut registry, _context, _rx) = setup();
        let (a, b) = ids();
        let (c, d) = ids();
        registry.create_channel(a, b);
        registry.create_channel(c, d);
        registry.close(b, None);

        let mut carrier = message("carrier");
        carrier.transferred_ports.push(TransferredPort {
            local: c,
            remote: d,
        });
        registry.post_message_to_remote(carrier, b);
        assert_eq!(registry.pending_count(&b), 0);

        registry.close(d, None);
        assert_eq!(registry.channel_count(), 1);
    }

    #[test]
    #[should_panic(expected = "already belongs to a channel")]
    fn test_duplicate_port_panics() {
        let (mut registry, _context, _rx) = setup();
        let (a, b) = ids();
        let (c, _) = ids();
        registry.create_channel(a, b);
        registry.create_channel(c, a);
    }

    #[test]
    #[should_panic(expected = "but its channel pairs it with")]
    fn test_entangle_with_wrong_remote_panics() {
        let (mut registry, context, _rx) = setup();
        let (a, b) = ids();
        let (c, _) = ids();
        registry.create_channel(a, b);
        registry.entangle(a, c, LOCALITY, context);
    }

    #[test]
    fn test_broadcast_fan_out() {
        let directory = ContextDirectory::default();
        let (handle1, mut rx1) = ContextHandle::detached();
        let (handle2, mut rx2) = ContextHandle::detached();
        let (context1, context2) = (handle1.id(), handle2.id());
        directory.insert(handle1);
        directory.insert(handle2);
        let mut registry = ChannelRegistry::new(directory, 100);

        let c1 = BroadcastChannelId::generate(LOCALITY);
        let c2 = BroadcastChannelId::generate(LOCALITY);
        let c3 = BroadcastChannelId::generate(LOCALITY);
        registry.register_broadcast("x", c1, context1);
        registry.register_broadcast("x", c2, context1);
        let h3 = registry.register_broadcast("x", c3, context2);

        registry.post_broadcast("x", c1, Payload::new(&b"m"[..]));
        let mut first = Vec::new();
        while let Ok(ContextTask::DeliverBroadcast(id, payload)) = rx1.try_recv() {
            assert_eq!(payload.as_bytes(), b"m");
            first.push(id);
        }
        assert_eq!(first, vec![c2]);
        assert!(matches!(
            rx2.try_recv(),
            Ok(ContextTask::DeliverBroadcast(id, _)) if id == c3
        ));

        assert!(registry.unregister_broadcast("x", c3, Some(h3)));
        assert!(!registry.unregister_broadcast("x", c3, None));
        registry.post_broadcast("x", c1, Payload::new(&b"n"[..]));
        assert!(rx2.try_recv().is_err());
    }

    #[traced_test]
    #[test]
    fn test_pending_threshold_warns_once_per_crossing() {
        let (mut registry, _context, _rx) = setup();
        let (a, b) = ids();
        registry.create_channel(a, b);
        for text in ["1", "2", "3", "4"] {
            registry.post_message_to_remote(message(text), b);
        }
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("warning threshold"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one warning, got {}", n)),
            }
        });
    }

    #[test]
    fn test_actor_round_trip() {
        let (handle, join) = spawn(
            "test-registry",
            LOCALITY,
            ContextDirectory::default(),
            100,
        )
        .unwrap();
        let (a, b) = ids();
        handle.create_channel(a, b).unwrap();
        handle.post_message_to_remote(message("1"), b).unwrap();
        handle.post_message_to_remote(message("2"), b).unwrap();
        assert_eq!(handle.pending_message_count(b).unwrap(), 2);

        let first = handle.try_take_message_for_port(b).unwrap().unwrap();
        assert_eq!(first.payload.as_bytes(), b"1");

        let (batch, token) = handle.take_all_messages_for_port(b).unwrap();
        assert_eq!(batch.len(), 1);
        handle.close(a, None).unwrap();
        handle.close(b, None).unwrap();
        assert_eq!(handle.channel_count().unwrap(), 1);
        token.complete();
        assert_eq!(handle.channel_count().unwrap(), 0);

        handle.stop();
        join.join().unwrap();
        assert_eq!(handle.channel_count(), Err(RegistryError::Stopped));
    }
}
