/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Event listeners for ports and broadcast channels, and the keep-alive
//! signal derived from them.
//!
//! An object with at least one listener holds a reference on its context's
//! event loop, so the context does not exit while someone is still waiting
//! for messages. The hold is taken when the listener count leaves zero and
//! released when it returns to zero, when the listeners are cleared, or
//! when the object stops being able to receive (closed or transferred).

use std::cell::Cell;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::context::ContextHandle;

/// A registered listener.
pub type Listener<E> = Rc<dyn Fn(&E)>;

/// The kinds of event a port or broadcast channel fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A message was received and deserialized.
    Message,
    /// A message was received but could not be deserialized.
    MessageError,
    /// A port's channel was closed, from either side. Fired at most once
    /// per port; broadcast channels never fire it.
    Close,
}

/// Names one registered listener, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry<E> {
    id: ListenerId,
    kind: EventKind,
    listener: Listener<E>,
}

/// Holds a reference on a context's event loop while listeners exist.
struct KeepAlive {
    context: ContextHandle,
    /// Cleared by `unref()`-style opt-outs.
    enabled: Cell<bool>,
    /// Whether the owner can still receive events.
    active: Cell<bool>,
    held: Cell<bool>,
}

impl KeepAlive {
    fn update(&self, listeners: usize) {
        let hold = self.enabled.get() && self.active.get() && listeners > 0;
        if hold == self.held.replace(hold) {
            return;
        }
        if hold {
            self.context.ref_event_loop();
        } else {
            self.context.unref_event_loop();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if self.held.replace(false) {
            self.context.unref_event_loop();
        }
    }
}

/// A listener registry with an attached keep-alive signal. Thread-confined:
/// listeners run on the owning context's thread.
pub struct ListenerHost<E> {
    listeners: RefCell<Vec<Entry<E>>>,
    next_id: Cell<u64>,
    keep_alive: KeepAlive,
}

impl<E> fmt::Debug for ListenerHost<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHost")
            .field("listeners", &self.len())
            .field("holds_event_loop", &self.holds_event_loop())
            .finish()
    }
}

impl<E> ListenerHost<E> {
    pub(crate) fn new(context: ContextHandle) -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            keep_alive: KeepAlive {
                context,
                enabled: Cell::new(true),
                active: Cell::new(true),
                held: Cell::new(false),
            },
        }
    }

    /// Register `listener` for events of `kind`.
    pub fn add(&self, kind: EventKind, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let len = {
            let mut listeners = self.listeners.borrow_mut();
            listeners.push(Entry { id, kind, listener });
            listeners.len()
        };
        self.keep_alive.update(len);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let (removed, len) = {
            let mut listeners = self.listeners.borrow_mut();
            let removed = listeners
                .iter()
                .position(|entry| entry.id == id)
                .map(|position| listeners.remove(position));
            (removed, listeners.len())
        };
        self.keep_alive.update(len);
        // Dropped outside the borrow: a listener may own the last reference
        // to this host's object.
        removed.is_some()
    }

    /// Remove every listener, releasing the keep-alive hold exactly once.
    pub fn clear(&self) {
        let removed = mem::take(&mut *self.listeners.borrow_mut());
        self.keep_alive.update(0);
        drop(removed);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every listener for `kind`, in registration order. Listeners
    /// may add or remove listeners; changes apply from the next event.
    pub(crate) fn fire(&self, kind: EventKind, event: &E) -> usize {
        let targets: Vec<Listener<E>> = self
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Rc::clone(&entry.listener))
            .collect();
        for listener in &targets {
            listener(event);
        }
        targets.len()
    }

    pub(crate) fn set_keep_alive(&self, enabled: bool) {
        self.keep_alive.enabled.set(enabled);
        self.keep_alive.update(self.len());
    }

    /// Whether this host currently holds its context's event loop.
    pub fn holds_event_loop(&self) -> bool {
        self.keep_alive.held.get()
    }

    /// The owner can no longer receive; release any hold for good.
    pub(crate) fn deactivate(&self) {
        self.keep_alive.active.set(false);
        self.keep_alive.update(self.len());
    }
}

/// The listener capability shared by [`crate::MessagePort`] and
/// [`crate::BroadcastChannel`].
pub trait EventTarget {
    /// The event delivered to listeners.
    type Event: 'static;

    /// The object's listener host.
    fn listener_host(&self) -> &ListenerHost<Self::Event>;

    /// Register `listener` for events of `kind`.
    fn add_event_listener(
        &self,
        kind: EventKind,
        listener: impl Fn(&Self::Event) + 'static,
    ) -> ListenerId {
        self.listener_host().add(kind, Rc::new(listener))
    }

    /// Remove a listener. Returns false if it was not registered.
    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.listener_host().remove(id)
    }

    /// Remove every listener.
    fn remove_all_listeners(&self) {
        self.listener_host().clear()
    }

    /// Number of registered listeners.
    fn listener_count(&self) -> usize {
        self.listener_host().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> ListenerHost<u32> {
        let (context, _rx) = ContextHandle::detached();
        ListenerHost::new(context)
    }

    fn counter() -> (Rc<Cell<u32>>, Listener<u32>) {
        let seen = Rc::new(Cell::new(0));
        let listener: Listener<u32> = {
            let seen = Rc::clone(&seen);
            Rc::new(move |event: &u32| seen.set(seen.get() + *event))
        };
        (seen, listener)
    }

    #[test]
    fn test_fire_by_kind() {
        let host = host();
        let (messages, listener) = counter();
        let (errors, error_listener) = counter();
        host.add(EventKind::Message, listener);
        host.add(EventKind::MessageError, error_listener);

        assert_eq!(host.fire(EventKind::Message, &2), 1);
        assert_eq!(host.fire(EventKind::Message, &3), 1);
        assert_eq!(host.fire(EventKind::Close, &7), 0);
        assert_eq!(messages.get(), 5);
        assert_eq!(errors.get(), 0);
    }

    #[test]
    fn test_keep_alive_follows_listener_count() {
        let (context, _rx) = ContextHandle::detached();
        let host: ListenerHost<u32> = ListenerHost::new(context.clone());
        let (_, listener) = counter();

        let first = host.add(EventKind::Message, Rc::clone(&listener));
        let second = host.add(EventKind::Message, Rc::clone(&listener));
        assert_eq!(context.ref_count(), 1);
        assert!(host.holds_event_loop());

        assert!(host.remove(first));
        assert!(!host.remove(first));
        assert_eq!(context.ref_count(), 1);
        assert!(host.remove(second));
        assert_eq!(context.ref_count(), 0);
    }

    #[test]
    fn test_clear_releases_once() {
        let (context, _rx) = ContextHandle::detached();
        let host: ListenerHost<u32> = ListenerHost::new(context.clone());
        let (_, listener) = counter();
        for _ in 0..3 {
            host.add(EventKind::Message, Rc::clone(&listener));
        }
        assert_eq!(context.ref_count(), 1);
        host.clear();
        host.clear();
        assert_eq!(context.ref_count(), 0);
        assert!(host.is_empty());
    }

    #[test]
    fn test_disabled_or_inactive_never_holds() {
        let (context, _rx) = ContextHandle::detached();
        let host: ListenerHost<u32> = ListenerHost::new(context.clone());
        let (_, listener) = counter();

        host.set_keep_alive(false);
        host.add(EventKind::Message, Rc::clone(&listener));
        assert_eq!(context.ref_count(), 0);
        host.set_keep_alive(true);
        assert_eq!(context.ref_count(), 1);

        host.deactivate();
        assert_eq!(context.ref_count(), 0);
        host.add(EventKind::Message, listener);
        assert_eq!(context.ref_count(), 0);
    }

    #[test]
    fn test_drop_releases_hold() {
        let (context, _rx) = ContextHandle::detached();
        let host: ListenerHost<u32> = ListenerHost::new(context.clone());
        let (_, listener) = counter();
        host.add(EventKind::Message, listener);
        assert_eq!(context.ref_count(), 1);
        drop(host);
        assert_eq!(context.ref_count(), 0);
    }
}
