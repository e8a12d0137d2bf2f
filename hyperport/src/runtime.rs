/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-wide runtime object: owns the registry thread and the
//! directory of execution contexts.

use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::codec::Codec;
use crate::codec::JsonCodec;
use crate::config;
use crate::config::Config;
use crate::context::ContextDirectory;
use crate::context::ContextError;
use crate::context::ExecutionContext;
use crate::context::Scope;
use crate::identifier::ContextId;
use crate::identifier::Locality;
use crate::registry;
use crate::registry::RegistryHandle;

/// Constructed once at startup and passed to whatever needs it. Teardown
/// is explicit through [`PortRuntime::shutdown`], and also happens on drop.
#[derive(Debug)]
pub struct PortRuntime {
    config: Config,
    codec: Arc<dyn Codec>,
    registry: RegistryHandle,
    directory: ContextDirectory,
    registry_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PortRuntime {
    /// Start a runtime that serializes values as JSON.
    pub fn new(config: Config) -> Result<Self, anyhow::Error> {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    /// Start a runtime from the global configuration.
    pub fn from_global_config() -> Result<Self, anyhow::Error> {
        Self::new(config::global::get())
    }

    /// Start a runtime with a custom codec.
    pub fn with_codec(config: Config, codec: Arc<dyn Codec>) -> Result<Self, anyhow::Error> {
        let directory = ContextDirectory::default();
        let (registry, registry_thread) = registry::spawn(
            &config.registry_thread_name,
            Locality::current(),
            directory.clone(),
            config.pending_queue_warn_threshold,
        )?;
        tracing::debug!(locality = %registry.locality(), "port runtime started");
        Ok(Self {
            config,
            codec,
            registry,
            directory,
            registry_thread: Mutex::new(Some(registry_thread)),
        })
    }

    /// Spawn a new execution context.
    pub fn spawn_context(&self, name: &str) -> Result<ExecutionContext, ContextError> {
        let context = ExecutionContext::spawn(
            name,
            &self.config,
            self.registry.clone(),
            Arc::clone(&self.codec),
            self.directory.clone(),
        )?;
        tracing::debug!(context = %context.id(), name, "spawned context");
        Ok(context)
    }

    /// Post `task` to context `id`; false if the context is gone.
    pub fn post_task(&self, id: ContextId, task: impl FnOnce(&Scope) + Send + 'static) -> bool {
        self.directory.post_task(id, task)
    }

    /// The registry handle.
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// The context directory.
    pub fn directory(&self) -> &ContextDirectory {
        &self.directory
    }

    /// This runtime's locality.
    pub fn locality(&self) -> Locality {
        self.registry.locality()
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop every context and then the registry, waiting for the registry
    /// thread. Contexts still tearing down afterwards see
    /// [`crate::RegistryError::Stopped`]. Idempotent.
    pub fn shutdown(&self) {
        let thread = match self.registry_thread.lock() {
            Ok(mut thread) => thread.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(thread) = thread else {
            return;
        };
        self.directory.stop_all();
        self.registry.stop();
        if thread.join().is_err() {
            tracing::error!("registry thread panicked");
        }
        tracing::debug!("port runtime shut down");
    }
}

impl Drop for PortRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use timed_test::timed_test;

    use super::*;
    use crate::RegistryError;

    #[timed_test(timeout_secs = 30)]
    fn test_shutdown_stops_registry() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let registry = runtime.registry().clone();
        assert_eq!(registry.channel_count().unwrap(), 0);
        runtime.shutdown();
        runtime.shutdown();
        assert_eq!(registry.channel_count(), Err(RegistryError::Stopped));
    }

    #[timed_test(timeout_secs = 30)]
    fn test_thread_names_follow_config() {
        let config = Config {
            context_thread_prefix: "unit".to_string(),
            ..Config::default()
        };
        let runtime = PortRuntime::new(config).unwrap();
        let context = runtime.spawn_context("named").unwrap();
        let name = context
            .post_task_and_wait(|_| std::thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("unit-named"));
    }

    #[timed_test(timeout_secs = 30)]
    fn test_runtime_post_task() {
        let runtime = PortRuntime::new(Config::default()).unwrap();
        let context = runtime.spawn_context("post").unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(runtime.post_task(context.id(), move |scope| {
            tx.send(scope.locality()).unwrap();
        }));
        assert_eq!(rx.recv().unwrap(), runtime.locality());
    }
}
