/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Named broadcast groups.
//!
//! A [`BroadcastChannel`] joins the group for its name on creation. A
//! message posted on one member is delivered to every other member of the
//! group, on whichever context each runs, and never to the sender. Each
//! member's delivery is independent of the others.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use crate::codec::Value;
use crate::context::Scope;
use crate::identifier::BroadcastChannelId;
use crate::listener::EventKind;
use crate::listener::EventTarget;
use crate::listener::Listener;
use crate::listener::ListenerHost;
use crate::listener::ListenerId;
use crate::message::Payload;
use crate::port::MessageEvent;
use crate::port::PortError;
use crate::registry::LiveHandle;

pub(crate) mod groups;

#[derive(Debug)]
struct BroadcastState {
    closed: bool,
    live: Option<LiveHandle>,
    /// Received while the context was suspended.
    deferred: VecDeque<Payload>,
    onmessage: Option<ListenerId>,
    onmessageerror: Option<ListenerId>,
}

struct BroadcastInner {
    id: BroadcastChannelId,
    name: String,
    scope: Scope,
    state: RefCell<BroadcastState>,
    listeners: ListenerHost<MessageEvent>,
}

impl BroadcastInner {
    fn close(&self) -> Result<(), PortError> {
        let live = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.deferred.clear();
            state.live.take()
        };
        self.listeners.deactivate();
        self.listeners.clear();
        self.scope.forget_broadcast(&self.id);
        self.scope
            .registry()
            .unregister_broadcast(&self.name, self.id, live)?;
        tracing::debug!(name = %self.name, id = %self.id, "broadcast channel closed");
        Ok(())
    }
}

impl Drop for BroadcastInner {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(id = %self.id, "close on drop: {}", err);
        }
    }
}

/// A member of a named broadcast group. Closes when the last reference is
/// dropped.
#[derive(Clone)]
pub struct BroadcastChannel(Rc<BroadcastInner>);

#[derive(Clone)]
pub(crate) struct WeakBroadcastChannel(Weak<BroadcastInner>);

impl WeakBroadcastChannel {
    pub(crate) fn upgrade(&self) -> Option<BroadcastChannel> {
        self.0.upgrade().map(BroadcastChannel)
    }
}

impl fmt::Debug for BroadcastChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastChannel")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("closed", &self.0.state.borrow().closed)
            .finish()
    }
}

impl BroadcastChannel {
    /// Join the group `name` from the scope's context.
    pub fn new(scope: &Scope, name: impl Into<String>) -> Result<Self, PortError> {
        let name = name.into();
        let id = BroadcastChannelId::generate(scope.locality());
        let live = scope
            .registry()
            .register_broadcast(&name, id, scope.context_id())?;
        let channel = Self(Rc::new(BroadcastInner {
            id,
            name,
            scope: scope.clone(),
            state: RefCell::new(BroadcastState {
                closed: false,
                live: Some(live),
                deferred: VecDeque::new(),
                onmessage: None,
                onmessageerror: None,
            }),
            listeners: ListenerHost::new(scope.handle().clone()),
        }));
        scope.remember_broadcast(id, WeakBroadcastChannel(Rc::downgrade(&channel.0)));
        Ok(channel)
    }

    /// The group name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// This member's identifier.
    pub fn id(&self) -> BroadcastChannelId {
        self.0.id
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.0.state.borrow().closed
    }

    /// Send `value` to every other member of the group.
    pub fn post_message(&self, value: &Value) -> Result<(), PortError> {
        if self.is_closed() {
            return Err(PortError::InvalidState(format!(
                "broadcast channel {} is closed",
                self.0.name
            )));
        }
        let payload = self.0.scope.codec().serialize(value)?;
        self.0
            .scope
            .registry()
            .post_broadcast(&self.0.name, self.0.id, payload)?;
        Ok(())
    }

    /// Leave the group. Idempotent.
    pub fn close(&self) -> Result<(), PortError> {
        self.0.close()
    }

    /// Accept a payload fanned out by the registry.
    pub(crate) fn dispatch_message(&self, payload: Payload) {
        if self.is_closed() {
            tracing::trace!(id = %self.0.id, "broadcast to a closed channel; dropping");
            return;
        }
        if self.0.scope.handle().is_suspended() {
            self.0.state.borrow_mut().deferred.push_back(payload);
            return;
        }
        self.flush_deferred();
        self.deliver(payload);
    }

    /// Deliver messages deferred while the context was suspended, in
    /// arrival order.
    pub(crate) fn flush_deferred(&self) {
        while !self.0.scope.handle().is_suspended() {
            let next = self.0.state.borrow_mut().deferred.pop_front();
            match next {
                Some(payload) => self.deliver(payload),
                None => break,
            }
        }
    }

    fn deliver(&self, payload: Payload) {
        if self.is_closed() {
            return;
        }
        let event = match self.0.scope.codec().deserialize(&payload) {
            Ok(data) => MessageEvent {
                kind: EventKind::Message,
                data,
                ports: Vec::new(),
                error: None,
            },
            Err(err) => {
                tracing::debug!(id = %self.0.id, "broadcast failed to deserialize: {}", err);
                MessageEvent {
                    kind: EventKind::MessageError,
                    data: Value::Null,
                    ports: Vec::new(),
                    error: Some(err),
                }
            }
        };
        self.0.listeners.fire(event.kind, &event);
    }

    /// Opt in or out of holding the context's event loop open while the
    /// channel has listeners.
    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.0.listeners.set_keep_alive(keep_alive);
    }

    /// Whether the channel is currently holding its context's event loop.
    pub fn has_ref(&self) -> bool {
        self.0.listeners.holds_event_loop()
    }

    /// Replace the message handler.
    pub fn set_onmessage(&self, handler: Option<Listener<MessageEvent>>) {
        let previous = self.0.state.borrow_mut().onmessage.take();
        if let Some(previous) = previous {
            self.0.listeners.remove(previous);
        }
        if let Some(handler) = handler {
            let id = self.0.listeners.add(EventKind::Message, handler);
            self.0.state.borrow_mut().onmessage = Some(id);
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

impl EventTarget for BroadcastChannel {
    type Event = MessageEvent;

    fn listener_host(&self) -> &ListenerHost<MessageEvent> {
        &self.0.listeners
    }
}
