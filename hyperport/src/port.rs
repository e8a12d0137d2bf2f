/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Message ports: the user-visible endpoints of a channel.
//!
//! A [`MessagePort`] lives on exactly one execution context. Its state
//! machine is:
//!
//! ```text
//! Entangled ──start()──▶ Started
//!     │                     │
//!     └────disentangle()────┴──▶ Disentangled  (re-entangled elsewhere)
//!
//! any state ──close()──▶ Closed
//! ```
//!
//! Messages posted to a port queue in the registry until the port is
//! started. Once started, each notification from the registry drains the
//! whole queue into the context's local task queue, one task per message,
//! so listeners observe messages in send order.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::codec::SerializationError;
use crate::codec::Value;
use crate::context::Scope;
use crate::identifier::PortIdentifier;
use crate::listener::EventKind;
use crate::listener::EventTarget;
use crate::listener::Listener;
use crate::listener::ListenerHost;
use crate::listener::ListenerId;
use crate::message::MessageWithPorts;
use crate::message::TransferredPort;
use crate::registry::LiveHandle;
use crate::registry::RegistryError;

/// Errors surfaced by port and broadcast channel operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    /// The transfer list is invalid.
    #[error("DataCloneError: {0}")]
    DataClone(String),

    /// The object is not in a state that allows the operation.
    #[error("InvalidStateError: {0}")]
    InvalidState(String),

    /// The value could not be serialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The registry is gone.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A delivered message, a message that failed to deserialize, or the
/// closing of the port's channel.
#[derive(Debug)]
pub struct MessageEvent {
    /// [`EventKind::Message`], [`EventKind::MessageError`] when the
    /// payload could not be deserialized, or [`EventKind::Close`].
    pub kind: EventKind,
    /// The message value; `Null` for a message error or close.
    pub data: Value,
    /// Ports transferred with the message, now entangled on the receiving
    /// context.
    pub ports: Vec<MessagePort>,
    /// Why deserialization failed.
    pub error: Option<SerializationError>,
}

impl MessageEvent {
    fn close() -> Self {
        Self {
            kind: EventKind::Close,
            data: Value::Null,
            ports: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug)]
struct PortState {
    entangled: bool,
    closed: bool,
    started: bool,
    /// The other side of the channel has been closed.
    peer_closed: bool,
    close_fired: bool,
    /// Dispatched batches whose deliveries have not all run yet.
    batches_in_flight: usize,
    live: Option<LiveHandle>,
    onmessage: Option<ListenerId>,
    onmessageerror: Option<ListenerId>,
}

struct PortInner {
    id: PortIdentifier,
    remote_id: PortIdentifier,
    scope: Scope,
    state: RefCell<PortState>,
    listeners: ListenerHost<MessageEvent>,
}

impl PortInner {
    fn close(&self) -> Result<(), PortError> {
        let (was_entangled, live, fire_close) = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.started = false;
            let fire_close = state.entangled && !state.close_fired;
            state.close_fired = true;
            (state.entangled, state.live.take(), fire_close)
        };
        if fire_close {
            self.listeners.fire(EventKind::Close, &MessageEvent::close());
        }
        self.listeners.deactivate();
        self.listeners.clear();
        if was_entangled {
            self.scope.forget_port(&self.id);
            self.scope.registry().close(self.id, live)?;
        }
        tracing::debug!(port = %self.id, "port closed");
        Ok(())
    }
}

impl Drop for PortInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(port = %self.id, "close on drop: {}", err);
        }
    }
}

/// One endpoint of a message channel. Cloning yields another reference to
/// the same port; the port closes when the last reference is dropped.
#[derive(Clone)]
pub struct MessagePort(Rc<PortInner>);

/// A non-owning reference kept in the context's live-port table.
#[derive(Clone)]
pub(crate) struct WeakMessagePort(Weak<PortInner>);

impl WeakMessagePort {
    pub(crate) fn upgrade(&self) -> Option<MessagePort> {
        self.0.upgrade().map(MessagePort)
    }
}

impl fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("MessagePort")
            .field("id", &self.0.id)
            .field("remote_id", &self.0.remote_id)
            .field("entangled", &state.entangled)
            .field("closed", &state.closed)
            .field("started", &state.started)
            .finish()
    }
}

impl MessagePort {
    /// Materialize a port for `transferred` on the scope's context. If the
    /// side no longer exists the port is created closed.
    pub fn entangle(scope: &Scope, transferred: TransferredPort) -> Result<Self, PortError> {
        let TransferredPort { local, remote } = transferred;
        let live = scope
            .registry()
            .entangle(local, remote, scope.locality(), scope.context_id())?;
        let port = Self(Rc::new(PortInner {
            id: local,
            remote_id: remote,
            scope: scope.clone(),
            state: RefCell::new(PortState {
                entangled: live.is_some(),
                closed: live.is_none(),
                started: false,
                peer_closed: false,
                close_fired: false,
                batches_in_flight: 0,
                live,
                onmessage: None,
                onmessageerror: None,
            }),
            listeners: ListenerHost::new(scope.handle().clone()),
        }));
        if live.is_some() {
            scope.remember_port(local, WeakMessagePort(Rc::downgrade(&port.0)));
        } else {
            tracing::debug!(port = %local, "entangled a port whose side is gone");
            port.0.listeners.deactivate();
        }
        Ok(port)
    }

    /// Materialize every port in `transferred`, in order.
    pub fn entangle_ports(
        scope: &Scope,
        transferred: Vec<TransferredPort>,
    ) -> Result<Vec<Self>, PortError> {
        transferred
            .into_iter()
            .map(|transferred| Self::entangle(scope, transferred))
            .collect()
    }

    /// Check that `ports` may be transferred: no duplicates, and every port
    /// currently entangled.
    fn validate_transfer(ports: &[MessagePort]) -> Result<(), PortError> {
        let mut seen = HashSet::new();
        for port in ports {
            if !seen.insert(port.id()) {
                return Err(PortError::DataClone(format!(
                    "port {} appears more than once in the transfer list",
                    port.id()
                )));
            }
            if !port.is_entangled() {
                return Err(PortError::DataClone(format!(
                    "port {} is not entangled",
                    port.id()
                )));
            }
        }
        Ok(())
    }

    /// Validate and disentangle `ports` for transfer.
    pub fn disentangle_ports(ports: &[MessagePort]) -> Result<Vec<TransferredPort>, PortError> {
        Self::validate_transfer(ports)?;
        ports.iter().map(MessagePort::disentangle).collect()
    }

    /// This port's identifier.
    pub fn id(&self) -> PortIdentifier {
        self.0.id
    }

    /// The identifier of the port this one is entangled with.
    pub fn remote_id(&self) -> PortIdentifier {
        self.0.remote_id
    }

    /// Whether the port is entangled and open.
    pub fn is_entangled(&self) -> bool {
        let state = self.0.state.borrow();
        state.entangled && !state.closed
    }

    /// Whether the port has been closed.
    pub fn is_closed(&self) -> bool {
        self.0.state.borrow().closed
    }

    /// Whether the port has been started.
    pub fn is_started(&self) -> bool {
        self.0.state.borrow().started
    }

    /// Begin delivering messages. Schedules a first drain; a no-op if the
    /// port is already started, closed, or transferred.
    pub fn start(&self) {
        {
            let mut state = self.0.state.borrow_mut();
            if !state.entangled || state.closed || state.started {
                return;
            }
            state.started = true;
        }
        let id = self.0.id;
        self.0.scope.post_local(move |scope| scope.drain_port(id));
    }

    /// Send `value` to the entangled port, transferring `transfer` with it.
    ///
    /// Posting on a port that is closed or has been transferred succeeds
    /// without effect, as does posting to a port whose other side is gone.
    pub fn post_message(&self, value: &Value, transfer: &[MessagePort]) -> Result<(), PortError> {
        for port in transfer {
            if port.id() == self.0.id {
                return Err(PortError::DataClone(
                    "transfer list contains the source port".to_string(),
                ));
            }
            if port.id() == self.0.remote_id {
                return Err(PortError::DataClone(
                    "transfer list contains the source port's entangled port".to_string(),
                ));
            }
        }
        Self::validate_transfer(transfer)?;

        let registry = self.0.scope.registry();
        let payload = self.0.scope.codec().serialize(value)?;
        let transferred_ports = transfer
            .iter()
            .map(MessagePort::disentangle)
            .collect::<Result<Vec<_>, _>>()?;

        if !self.is_entangled() {
            tracing::trace!(port = %self.0.id, "post on a port that is not entangled; dropping");
            for transferred in transferred_ports {
                registry.close(transferred.local, None)?;
            }
            return Ok(());
        }

        registry.post_message_to_remote(
            MessageWithPorts {
                payload,
                transferred_ports,
            },
            self.0.remote_id,
        )?;
        Ok(())
    }

    /// Detach this port from its context for transfer. The returned
    /// descriptor re-materializes it elsewhere. Messages of a batch already
    /// dispatched to this object are still delivered to its listeners; after
    /// that the object is inert.
    pub fn disentangle(&self) -> Result<TransferredPort, PortError> {
        let (live, idle) = {
            let mut state = self.0.state.borrow_mut();
            if !state.entangled || state.closed {
                return Err(PortError::DataClone(format!(
                    "port {} is not entangled",
                    self.0.id
                )));
            }
            state.entangled = false;
            state.started = false;
            (state.live.take(), state.batches_in_flight == 0)
        };
        self.0.scope.forget_port(&self.0.id);
        self.0.listeners.deactivate();
        if idle {
            self.0.listeners.clear();
        }
        self.0.scope.registry().disentangle(self.0.id, live)?;
        tracing::debug!(port = %self.0.id, "disentangled");
        Ok(TransferredPort {
            local: self.0.id,
            remote: self.0.remote_id,
        })
    }

    /// Turn a queued message into an event. A carried port that cannot be
    /// entangled is closed and left out; the message itself is still
    /// delivered.
    fn receive(&self, message: MessageWithPorts) -> MessageEvent {
        let scope = &self.0.scope;
        let mut ports = Vec::with_capacity(message.transferred_ports.len());
        for transferred in message.transferred_ports {
            match Self::entangle(scope, transferred) {
                Ok(port) => ports.push(port),
                Err(err) => {
                    tracing::warn!(
                        port = %self.0.id,
                        transferred = %transferred.local,
                        "failed to entangle a transferred port: {}",
                        err
                    );
                    if let Err(err) = scope.registry().close(transferred.local, None) {
                        tracing::debug!(port = %transferred.local, "close failed: {}", err);
                    }
                }
            }
        }
        match scope.codec().deserialize(&message.payload) {
            Ok(data) => MessageEvent {
                kind: EventKind::Message,
                data,
                ports,
                error: None,
            },
            Err(err) => {
                tracing::debug!(port = %self.0.id, "message failed to deserialize: {}", err);
                MessageEvent {
                    kind: EventKind::MessageError,
                    data: Value::Null,
                    ports,
                    error: Some(err),
                }
            }
        }
    }

    /// Pull every queued message and schedule one delivery task per
    /// message, in order. Runs on the port's context when the registry
    /// reports messages available.
    pub(crate) fn dispatch_messages(&self) -> Result<(), PortError> {
        {
            let state = self.0.state.borrow();
            if !state.entangled || state.closed || !state.started {
                return Ok(());
            }
        }
        let scope = &self.0.scope;
        if scope.handle().is_suspended() {
            tracing::trace!(port = %self.0.id, "suspended; deferring dispatch");
            return Ok(());
        }

        let (messages, token) = scope.registry().take_all_messages_for_port(self.0.id)?;
        tracing::trace!(port = %self.0.id, count = messages.len(), "dispatching");
        self.0.state.borrow_mut().batches_in_flight += 1;
        for message in messages {
            let event = self.receive(message);
            let port = self.clone();
            scope.post_local(move |_| port.deliver(event));
        }
        let port = self.clone();
        scope.post_local(move |_| {
            token.complete();
            port.batch_finished();
        });
        Ok(())
    }

    fn deliver(&self, event: MessageEvent) {
        if self.is_closed() {
            tracing::trace!(port = %self.0.id, "port closed before delivery; dropping message");
            return;
        }
        self.0.listeners.fire(event.kind, &event);
    }

    fn batch_finished(&self) {
        let transferred = {
            let mut state = self.0.state.borrow_mut();
            state.batches_in_flight -= 1;
            state.batches_in_flight == 0 && !state.entangled && !state.closed
        };
        if transferred {
            self.0.listeners.clear();
        }
    }

    /// The other side of the channel was closed. Fires `close` once the
    /// deliveries already queued on this context have run, and stops
    /// holding the event loop.
    pub(crate) fn peer_closed(&self) {
        {
            let mut state = self.0.state.borrow_mut();
            if !state.entangled || state.closed {
                return;
            }
            state.peer_closed = true;
        }
        if self.0.scope.handle().is_suspended() {
            tracing::trace!(port = %self.0.id, "suspended; deferring close event");
            return;
        }
        self.schedule_peer_close();
    }

    /// Re-schedule a close event deferred while the context was suspended.
    pub(crate) fn resume_peer_close(&self) {
        let pending = {
            let state = self.0.state.borrow();
            state.peer_closed && !state.close_fired && state.entangled && !state.closed
        };
        if pending {
            self.schedule_peer_close();
        }
    }

    fn schedule_peer_close(&self) {
        let port = self.clone();
        self.0.scope.post_local(move |_| port.fire_peer_close());
    }

    fn fire_peer_close(&self) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.close_fired || !state.entangled || state.closed {
                return;
            }
            state.close_fired = true;
        }
        tracing::debug!(port = %self.0.id, "other side closed");
        self.0.listeners.fire(EventKind::Close, &MessageEvent::close());
        self.0.listeners.deactivate();
    }

    /// Synchronously take the oldest queued message, if any, without
    /// firing listeners. Works whether or not the port is started.
    pub fn try_receive_message(&self) -> Result<Option<MessageEvent>, PortError> {
        if !self.is_entangled() {
            return Ok(None);
        }
        match self
            .0
            .scope
            .registry()
            .try_take_message_for_port(self.0.id)?
        {
            Some(message) => Ok(Some(self.receive(message))),
            None => Ok(None),
        }
    }

    /// Close the port. Idempotent. Messages queued for this port are
    /// discarded; the other side stays open but receives a close event.
    /// Listeners on this port see a close event before they are removed.
    pub fn close(&self) -> Result<(), PortError> {
        self.0.close()
    }

    /// Opt in or out of holding the context's event loop open while the
    /// port has listeners. Ports hold by default.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.0.listeners.set_keep_alive(keep_alive);
    }

    /// Whether the port is currently holding its context's event loop.
    pub fn has_ref(&self) -> bool {
        self.0.listeners.holds_event_loop()
    }

    /// Replace the message handler. Installing one starts the port.
    pub fn set_onmessage(&self, handler: Option<Listener<MessageEvent>>) {
        let previous = self.0.state.borrow_mut().onmessage.take();
        if let Some(previous) = previous {
            self.0.listeners.remove(previous);
        }
        if let Some(handler) = handler {
            let id = self.0.listeners.add(EventKind::Message, handler);
            self.0.state.borrow_mut().onmessage = Some(id);
            self.start();
        }
    }

    /// Replace the message error handler.
    pub fn set_onmessageerror(&self, handler: Option<Listener<MessageEvent>>) {
        let previous = self.0.state.borrow_mut().onmessageerror.take();
        if let Some(previous) = previous {
            self.0.listeners.remove(previous);
        }
        if let Some(handler) = handler {
            let id = self.0.listeners.add(EventKind::MessageError, handler);
            self.0.state.borrow_mut().onmessageerror = Some(id);
        }
    }
}

impl EventTarget for MessagePort {
    type Event = MessageEvent;

    fn listener_host(&self) -> &ListenerHost<MessageEvent> {
        &self.0.listeners
    }
}

/// A freshly created, entangled pair of ports.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    /// The first port.
    pub port1: MessagePort,
    /// The second port.
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Create a channel whose two ports live on the scope's context.
    pub fn new(scope: &Scope) -> Result<Self, PortError> {
        let locality = scope.locality();
        let id1 = PortIdentifier::generate(locality);
        let id2 = PortIdentifier::generate(locality);
        scope.registry().create_channel(id1, id2)?;
        let port1 = MessagePort::entangle(
            scope,
            TransferredPort {
                local: id1,
                remote: id2,
            },
        )?;
        let port2 = MessagePort::entangle(
            scope,
            TransferredPort {
                local: id2,
                remote: id1,
            },
        )?;
        Ok(Self { port1, port2 })
    }
}

/// Synchronously receive one message from `port`. See
/// [`MessagePort::try_receive_message`].
pub fn receive_message_on_port(port: &MessagePort) -> Result<Option<MessageEvent>, PortError> {
    port.try_receive_message()
}
