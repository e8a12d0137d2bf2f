/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Execution contexts: the threads ports and broadcast channels live on.
//!
//! Each [`ExecutionContext`] is one OS thread running a single-threaded,
//! cooperative task queue. Tasks from other threads arrive over an
//! unbounded queue. Tasks a context posts to itself go
//! to a local FIFO that may carry thread-confined values and is always
//! served first.
//!
//! Every task receives the context's [`Scope`], the thread-local view of
//! the runtime: registry, codec, live port and broadcast tables, and a
//! small store of named globals.
//!
//! A context's event loop exits once it has been asked to stop, both
//! queues are empty, and nothing holds a keep-alive reference. On exit,
//! every port and broadcast channel still open on the context is closed.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::broadcast::BroadcastChannel;
use crate::broadcast::WeakBroadcastChannel;
use crate::codec::Codec;
use crate::config::Config;
use crate::identifier::BroadcastChannelId;
use crate::identifier::ContextId;
use crate::identifier::Locality;
use crate::identifier::PortIdentifier;
use crate::message::Payload;
use crate::port::MessagePort;
use crate::port::WeakMessagePort;
use crate::registry::RegistryHandle;

/// Errors from posting work to a context.
#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    /// The context has exited.
    #[error("{0} has stopped")]
    Stopped(ContextId),

    /// The task panicked before producing a reply.
    #[error("task on {0} panicked")]
    Aborted(ContextId),

    /// A post-and-wait was issued from the context's own thread, which
    /// would wait forever.
    #[error("post-and-wait issued on {0}'s own thread")]
    Reentrant(ContextId),

    /// The context thread could not be started.
    #[error("failed to spawn context thread: {0}")]
    Spawn(#[from] io::Error),
}

/// A unit of work sent to a context from any thread.
pub(crate) enum ContextTask {
    Run(Box<dyn FnOnce(&Scope) + Send>),
    /// Messages are waiting for this port.
    DrainPort(PortIdentifier),
    /// The other side of this port's channel was closed.
    PeerClosed(PortIdentifier),
    DeliverBroadcast(BroadcastChannelId, Payload),
    /// The context was resumed; catch up on withheld deliveries.
    Resume,
    /// Re-evaluate whether a stopping loop may exit.
    Wake,
    Stop {
        force: bool,
    },
}

impl fmt::Debug for ContextTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextTask::Run(_) => write!(f, "Run(..)"),
            ContextTask::DrainPort(port) => write!(f, "DrainPort({})", port),
            ContextTask::PeerClosed(port) => write!(f, "PeerClosed({})", port),
            ContextTask::DeliverBroadcast(id, payload) => {
                write!(f, "DeliverBroadcast({}, {:?})", id, payload)
            }
            ContextTask::Resume => write!(f, "Resume"),
            ContextTask::Wake => write!(f, "Wake"),
            ContextTask::Stop { force } => write!(f, "Stop {{ force: {} }}", force),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    refs: AtomicUsize,
    suspended: AtomicBool,
    thread: OnceLock<ThreadId>,
}

/// A thread-safe handle to one execution context: the scheduling surface
/// the rest of the system uses to reach it.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    id: ContextId,
    tx: mpsc::UnboundedSender<ContextTask>,
    shared: Arc<Shared>,
}

impl ContextHandle {
    /// A handle with a fresh identifier, and the queue it feeds.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ContextTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: ContextId::generate(),
            tx,
            shared: Arc::new(Shared::default()),
        };
        (handle, rx)
    }

    /// The context's identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    fn send(&self, task: ContextTask) -> Result<(), ContextError> {
        self.tx.send(task).map_err(|_| ContextError::Stopped(self.id))
    }

    /// Run `task` on the context. Does not wait.
    pub fn post_task(
        &self,
        task: impl FnOnce(&Scope) + Send + 'static,
    ) -> Result<(), ContextError> {
        self.send(ContextTask::Run(Box::new(task)))
    }

    /// Run `task` on the context and wait for its result.
    pub fn post_task_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&Scope) -> R + Send + 'static,
    ) -> Result<R, ContextError> {
        if self.shared.thread.get() == Some(&thread::current().id()) {
            return Err(ContextError::Reentrant(self.id));
        }
        let id = self.id;
        let (reply, rx) = oneshot::channel();
        self.post_task(move |scope| {
            match panic::catch_unwind(AssertUnwindSafe(|| task(scope))) {
                Ok(value) => {
                    let _ = reply.send(Ok(value));
                }
                Err(payload) => {
                    let _ = reply.send(Err(ContextError::Aborted(id)));
                    panic::resume_unwind(payload);
                }
            }
        })?;
        rx.blocking_recv()
            .unwrap_or(Err(ContextError::Stopped(self.id)))
    }

    /// Hold the event loop open.
    pub fn ref_event_loop(&self) {
        self.shared.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Release a hold taken by [`ContextHandle::ref_event_loop`].
    pub fn unref_event_loop(&self) {
        let previous = self
            .shared
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| {
                refs.checked_sub(1)
            });
        match previous {
            Ok(1) => {
                // Last hold released; a stopping loop may now exit.
                let _ = self.send(ContextTask::Wake);
            }
            Ok(_) => (),
            Err(_) => tracing::error!(context = %self.id, "unbalanced unref_event_loop"),
        }
    }

    /// Number of outstanding keep-alive holds.
    pub fn ref_count(&self) -> usize {
        self.shared.refs.load(Ordering::SeqCst)
    }

    /// Withhold message notifications until [`ContextHandle::resume`].
    /// Messages keep queueing in the registry meanwhile.
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
    }

    /// Resume notifications and catch up on anything withheld.
    pub fn resume(&self) {
        if self.shared.suspended.swap(false, Ordering::SeqCst) {
            let _ = self.send(ContextTask::Resume);
        }
    }

    /// Whether the context is suspended.
    pub fn is_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst)
    }

    /// Notify the context that `port` has messages. Safe from any thread;
    /// touches no port state.
    pub(crate) fn message_available(&self, port: PortIdentifier) {
        if self.is_suspended() {
            tracing::trace!(context = %self.id, %port, "suspended; not scheduling drain");
            return;
        }
        if self.send(ContextTask::DrainPort(port)).is_err() {
            tracing::trace!(context = %self.id, %port, "context gone; not scheduling drain");
        }
    }

    /// Notify the context that the sibling of `port` was closed. Sent even
    /// while suspended; the port defers its close event itself.
    pub(crate) fn peer_closed(&self, port: PortIdentifier) {
        if self.send(ContextTask::PeerClosed(port)).is_err() {
            tracing::trace!(context = %self.id, %port, "context gone; dropping close notice");
        }
    }

    pub(crate) fn deliver_broadcast(&self, id: BroadcastChannelId, payload: Payload) {
        if self.send(ContextTask::DeliverBroadcast(id, payload)).is_err() {
            tracing::trace!(context = %self.id, %id, "context gone; dropping broadcast");
        }
    }

    pub(crate) fn stop(&self, force: bool) {
        let _ = self.send(ContextTask::Stop { force });
    }
}

/// The live contexts of a runtime, by identifier.
#[derive(Debug, Clone, Default)]
pub struct ContextDirectory(Arc<DashMap<ContextId, ContextHandle>>);

impl ContextDirectory {
    /// The handle for `id`, if the context is still running.
    pub fn get(&self, id: ContextId) -> Option<ContextHandle> {
        self.0.get(&id).map(|entry| entry.value().clone())
    }

    /// Post `task` to context `id`. Returns false, silently, if the
    /// context is gone.
    pub fn post_task(&self, id: ContextId, task: impl FnOnce(&Scope) + Send + 'static) -> bool {
        match self.get(id) {
            Some(handle) => handle.post_task(task).is_ok(),
            None => {
                tracing::trace!(context = %id, "post_task to missing context");
                false
            }
        }
    }

    /// Identifiers of every running context.
    pub fn ids(&self) -> Vec<ContextId> {
        self.0.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of running contexts.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no context is running.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&self, handle: ContextHandle) {
        self.0.insert(handle.id(), handle);
    }

    pub(crate) fn remove(&self, id: ContextId) {
        self.0.remove(&id);
    }

    /// Ask every context to exit now.
    pub(crate) fn stop_all(&self) {
        for handle in self.0.iter() {
            handle.value().stop(true);
        }
    }
}

type LocalTask = Box<dyn FnOnce(&Scope)>;

struct ScopeState {
    handle: ContextHandle,
    registry: RegistryHandle,
    codec: Arc<dyn Codec>,
    local: RefCell<VecDeque<LocalTask>>,
    ports: RefCell<HashMap<PortIdentifier, WeakMessagePort>>,
    broadcasts: RefCell<HashMap<BroadcastChannelId, WeakBroadcastChannel>>,
    globals: RefCell<HashMap<String, Box<dyn Any>>>,
}

/// The context-local view handed to every task. Not `Send`: a scope, and
/// everything created from it, stays on its context's thread.
#[derive(Clone)]
pub struct Scope(Rc<ScopeState>);

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("context", &self.0.handle.id())
            .field("ports", &self.0.ports.borrow().len())
            .field("broadcasts", &self.0.broadcasts.borrow().len())
            .finish()
    }
}

impl Scope {
    pub(crate) fn new(
        handle: ContextHandle,
        registry: RegistryHandle,
        codec: Arc<dyn Codec>,
    ) -> Self {
        Self(Rc::new(ScopeState {
            handle,
            registry,
            codec,
            local: RefCell::new(VecDeque::new()),
            ports: RefCell::new(HashMap::new()),
            broadcasts: RefCell::new(HashMap::new()),
            globals: RefCell::new(HashMap::new()),
        }))
    }

    /// This context's identifier.
    pub fn context_id(&self) -> ContextId {
        self.0.handle.id()
    }

    /// This context's handle.
    pub fn handle(&self) -> &ContextHandle {
        &self.0.handle
    }

    /// The channel registry.
    pub fn registry(&self) -> &RegistryHandle {
        &self.0.registry
    }

    /// The codec messages are serialized with.
    pub fn codec(&self) -> &dyn Codec {
        self.0.codec.as_ref()
    }

    /// The locality ports on this context belong to.
    pub fn locality(&self) -> Locality {
        self.0.registry.locality()
    }

    /// Queue `task` to run on this context after the current task, ahead
    /// of anything posted from other threads.
    pub fn post_local(&self, task: impl FnOnce(&Scope) + 'static) {
        self.0.local.borrow_mut().push_back(Box::new(task));
    }

    fn next_local(&self) -> Option<LocalTask> {
        self.0.local.borrow_mut().pop_front()
    }

    /// Store `value` under `name`, replacing (and dropping) any previous
    /// value. Globals live until the context exits.
    pub fn set_global<T: 'static>(&self, name: impl Into<String>, value: T) {
        let previous = self
            .0
            .globals
            .borrow_mut()
            .insert(name.into(), Box::new(value));
        drop(previous);
    }

    /// A clone of the global `name`, if it exists and has type `T`.
    pub fn global<T: Clone + 'static>(&self, name: &str) -> Option<T> {
        self.0.globals.borrow().get(name)?.downcast_ref::<T>().cloned()
    }

    /// Remove and return the global `name`, if it exists and has type `T`.
    pub fn take_global<T: 'static>(&self, name: &str) -> Option<T> {
        let mut globals = self.0.globals.borrow_mut();
        if !globals.get(name).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        let value = globals.remove(name)?.downcast::<T>().ok()?;
        Some(*value)
    }

    pub(crate) fn remember_port(&self, id: PortIdentifier, port: WeakMessagePort) {
        self.0.ports.borrow_mut().insert(id, port);
    }

    pub(crate) fn forget_port(&self, id: &PortIdentifier) {
        self.0.ports.borrow_mut().remove(id);
    }

    /// The live port `id` on this context.
    pub fn port(&self, id: &PortIdentifier) -> Option<MessagePort> {
        let weak = self.0.ports.borrow().get(id).cloned()?;
        weak.upgrade()
    }

    /// Every live port on this context.
    pub fn ports(&self) -> Vec<MessagePort> {
        let weak: Vec<_> = self.0.ports.borrow().values().cloned().collect();
        weak.iter().filter_map(WeakMessagePort::upgrade).collect()
    }

    pub(crate) fn remember_broadcast(&self, id: BroadcastChannelId, channel: WeakBroadcastChannel) {
        self.0.broadcasts.borrow_mut().insert(id, channel);
    }

    pub(crate) fn forget_broadcast(&self, id: &BroadcastChannelId) {
        self.0.broadcasts.borrow_mut().remove(id);
    }

    fn broadcast(&self, id: &BroadcastChannelId) -> Option<BroadcastChannel> {
        let weak = self.0.broadcasts.borrow().get(id).cloned()?;
        weak.upgrade()
    }

    /// Every open broadcast channel on this context.
    pub fn broadcast_channels(&self) -> Vec<BroadcastChannel> {
        let weak: Vec<_> = self.0.broadcasts.borrow().values().cloned().collect();
        weak.iter()
            .filter_map(WeakBroadcastChannel::upgrade)
            .collect()
    }

    pub(crate) fn drain_port(&self, id: PortIdentifier) {
        match self.port(&id) {
            Some(port) => {
                if let Err(err) = port.dispatch_messages() {
                    tracing::warn!(port = %id, "failed to dispatch messages: {}", err);
                }
            }
            None => tracing::trace!(port = %id, "drain for a port not live here"),
        }
    }

    fn peer_closed(&self, id: PortIdentifier) {
        match self.port(&id) {
            Some(port) => port.peer_closed(),
            None => tracing::trace!(port = %id, "close notice for a port not live here"),
        }
    }

    fn deliver_broadcast(&self, id: BroadcastChannelId, payload: Payload) {
        match self.broadcast(&id) {
            Some(channel) => channel.dispatch_message(payload),
            None => tracing::trace!(%id, "broadcast for a channel not open here"),
        }
    }

    /// Catch up after a resume: drain every started port, then raise any
    /// close event withheld while suspended, and flush deferred broadcasts.
    fn resume_delivery(&self) {
        for port in self.ports() {
            if port.is_started() {
                self.drain_port(port.id());
            }
            port.resume_peer_close();
        }
        for channel in self.broadcast_channels() {
            channel.flush_deferred();
        }
    }

    fn teardown(&self) {
        for port in self.ports() {
            if let Err(err) = port.close() {
                tracing::debug!(port = %port.id(), "close during teardown: {}", err);
            }
        }
        for channel in self.broadcast_channels() {
            if let Err(err) = channel.close() {
                tracing::debug!(id = %channel.id(), "close during teardown: {}", err);
            }
        }
        // Dropped outside their borrows: drops may reach back into the scope.
        let globals = mem::take(&mut *self.0.globals.borrow_mut());
        drop(globals);
        let local = mem::take(&mut *self.0.local.borrow_mut());
        drop(local);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Run one task, containing any panic to the task.
fn run_guarded(context: ContextId, task: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(%context, "task panicked: {}", panic_message(payload.as_ref()));
    }
}

fn run_event_loop(scope: &Scope, mut rx: mpsc::UnboundedReceiver<ContextTask>) {
    let context = scope.context_id();
    let mut stopping = false;
    loop {
        while let Some(task) = scope.next_local() {
            run_guarded(context, || task(scope));
        }

        let task = if stopping && scope.handle().ref_count() == 0 {
            match rx.try_recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        } else {
            match rx.blocking_recv() {
                Some(task) => task,
                None => break,
            }
        };

        match task {
            ContextTask::Run(task) => run_guarded(context, || task(scope)),
            ContextTask::DrainPort(port) => run_guarded(context, || scope.drain_port(port)),
            ContextTask::PeerClosed(port) => run_guarded(context, || scope.peer_closed(port)),
            ContextTask::DeliverBroadcast(id, payload) => {
                run_guarded(context, || scope.deliver_broadcast(id, payload))
            }
            ContextTask::Resume => run_guarded(context, || scope.resume_delivery()),
            ContextTask::Wake => (),
            ContextTask::Stop { force: true } => break,
            ContextTask::Stop { force: false } => stopping = true,
        }
    }
}

/// An execution context thread. Dropping it stops the context immediately
/// and waits for the thread to exit.
#[derive(Debug)]
pub struct ExecutionContext {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    pub(crate) fn spawn(
        name: &str,
        config: &Config,
        registry: RegistryHandle,
        codec: Arc<dyn Codec>,
        directory: ContextDirectory,
    ) -> Result<Self, ContextError> {
        let (handle, rx) = ContextHandle::detached();
        directory.insert(handle.clone());
        let thread_handle = handle.clone();
        let thread_directory = directory.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", config.context_thread_prefix, name))
            .stack_size(config.context_stack_size)
            .spawn(move || {
                let id = thread_handle.id();
                let _ = thread_handle.shared.thread.set(thread::current().id());
                tracing::debug!(context = %id, "context started");
                let scope = Scope::new(thread_handle, registry, codec);
                run_event_loop(&scope, rx);
                thread_directory.remove(id);
                scope.teardown();
                tracing::debug!(context = %id, "context exited");
            });
        match spawned {
            Ok(thread) => Ok(Self {
                handle,
                thread: Some(thread),
            }),
            Err(err) => {
                directory.remove(handle.id());
                Err(ContextError::Spawn(err))
            }
        }
    }

    /// The context's identifier.
    pub fn id(&self) -> ContextId {
        self.handle.id()
    }

    /// The context's handle.
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// See [`ContextHandle::post_task`].
    pub fn post_task(
        &self,
        task: impl FnOnce(&Scope) + Send + 'static,
    ) -> Result<(), ContextError> {
        self.handle.post_task(task)
    }

    /// See [`ContextHandle::post_task_and_wait`].
    pub fn post_task_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&Scope) -> R + Send + 'static,
    ) -> Result<R, ContextError> {
        self.handle.post_task_and_wait(task)
    }

    /// Ask the context to exit once it is idle and unreferenced.
    pub fn stop(&self) {
        self.handle.stop(false);
    }

    /// Whether the context thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the context thread to exit.
    pub fn join(mut self) -> Result<(), ContextError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ContextError::Aborted(self.handle.id())),
            None => Ok(()),
        }
    }

    /// Stop the context gracefully and wait for it to exit.
    pub fn shutdown(self) -> Result<(), ContextError> {
        self.stop();
        self.join()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.stop(true);
            if thread.join().is_err() {
                tracing::error!(context = %self.handle.id(), "context thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use timed_test::timed_test;

    use super::*;
    use crate::PortRuntime;

    #[timed_test(timeout_secs = 30)]
    fn test_post_task_and_wait() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("wait").unwrap();
        let id = context.id();
        let observed = context.post_task_and_wait(|scope| scope.context_id()).unwrap();
        assert_eq!(observed, id);
    }

    #[timed_test(timeout_secs = 30)]
    fn test_local_tasks_run_first_and_in_order() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("order").unwrap();
        let order = context
            .post_task_and_wait(|scope| {
                scope.set_global("order", Rc::new(RefCell::new(Vec::<u32>::new())));
                for i in 0..3 {
                    scope.post_local(move |scope| {
                        let order: Rc<RefCell<Vec<u32>>> = scope.global("order").unwrap();
                        order.borrow_mut().push(i);
                    });
                }
            })
            .and_then(|()| {
                context.post_task_and_wait(|scope| {
                    let order: Rc<RefCell<Vec<u32>>> = scope.global("order").unwrap();
                    let order = order.borrow().clone();
                    order
                })
            })
            .unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[timed_test(timeout_secs = 30)]
    fn test_reentrant_wait_is_rejected() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("reentrant").unwrap();
        let result = context
            .post_task_and_wait(|scope| {
                let handle = scope.handle().clone();
                matches!(
                    handle.post_task_and_wait(|_| ()),
                    Err(ContextError::Reentrant(_))
                )
            })
            .unwrap();
        assert!(result);
    }

    #[timed_test(timeout_secs = 30)]
    fn test_panicking_task_is_contained() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("panics").unwrap();
        let result = context.post_task_and_wait(|_| -> u32 { panic!("boom") });
        assert!(matches!(result, Err(ContextError::Aborted(_))));
        // The loop survives.
        assert_eq!(context.post_task_and_wait(|_| 7).unwrap(), 7);
    }

    #[timed_test(timeout_secs = 30)]
    fn test_stop_waits_for_keep_alive() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("keepalive").unwrap();
        let handle = context.handle().clone();
        handle.ref_event_loop();
        context.stop();

        // Still serving tasks while referenced.
        assert_eq!(context.post_task_and_wait(|_| 1).unwrap(), 1);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!context.is_finished());

        handle.unref_event_loop();
        context.join().unwrap();
        assert!(runtime.directory().get(handle.id()).is_none());
        assert!(matches!(
            handle.post_task(|_| ()),
            Err(ContextError::Stopped(_))
        ));
    }

    #[timed_test(timeout_secs = 30)]
    fn test_directory_post_task() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("directory").unwrap();
        let (tx, rx) = std_mpsc::channel();
        assert!(runtime.directory().post_task(context.id(), move |scope| {
            tx.send(scope.context_id()).unwrap();
        }));
        assert_eq!(rx.recv().unwrap(), context.id());

        let id = context.id();
        context.shutdown().unwrap();
        assert!(!runtime.directory().post_task(id, |_| ()));
    }

    #[timed_test(timeout_secs = 30)]
    fn test_globals() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("globals").unwrap();
        let (string, wrong_type, taken, after) = context
            .post_task_and_wait(|scope| {
                scope.set_global("name", "value".to_string());
                let string: Option<String> = scope.global("name");
                let wrong_type: Option<u32> = scope.global("name");
                let taken: Option<String> = scope.take_global("name");
                let after: Option<String> = scope.global("name");
                (string, wrong_type, taken, after)
            })
            .unwrap();
        assert_eq!(string.as_deref(), Some("value"));
        assert_eq!(wrong_type, None);
        assert_eq!(taken.as_deref(), Some("value"));
        assert_eq!(after, None);
    }
}
