/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for hyperport.
//!
//! Settings may come from defaults, environment variables, or a YAML file.
//! A [`crate::PortRuntime`] takes its `Config` explicitly; [`global`] holds a
//! process-wide instance for callers that do not want to thread one through,
//! along with the lock tests use to override it.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

const DEFAULT_REGISTRY_THREAD_NAME: &str = "hyperport-registry";
const DEFAULT_CONTEXT_THREAD_PREFIX: &str = "hyperport-ctx";
const DEFAULT_CONTEXT_STACK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_PENDING_QUEUE_WARN_THRESHOLD: usize = 10_000;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the registry's home thread.
    pub registry_thread_name: String,
    /// Prefix for execution context thread names; the context's own name
    /// is appended.
    pub context_thread_prefix: String,
    /// Stack size, in bytes, of each execution context thread.
    pub context_stack_size: usize,
    /// Number of messages pending on one side of a channel at which the
    /// registry warns. Zero disables the warning.
    pub pending_queue_warn_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_thread_name: DEFAULT_REGISTRY_THREAD_NAME.to_string(),
            context_thread_prefix: DEFAULT_CONTEXT_THREAD_PREFIX.to_string(),
            context_stack_size: DEFAULT_CONTEXT_STACK_SIZE,
            pending_queue_warn_threshold: DEFAULT_PENDING_QUEUE_WARN_THRESHOLD,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables. Unset or unparseable
    /// variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("HYPERPORT_REGISTRY_THREAD_NAME") {
            config.registry_thread_name = val;
        }

        if let Ok(val) = env::var("HYPERPORT_CONTEXT_THREAD_PREFIX") {
            config.context_thread_prefix = val;
        }

        if let Ok(val) = env::var("HYPERPORT_CONTEXT_STACK_SIZE") {
            match val.parse::<usize>() {
                Ok(parsed) => config.context_stack_size = parsed,
                Err(err) => {
                    tracing::warn!("ignoring HYPERPORT_CONTEXT_STACK_SIZE={}: {}", val, err)
                }
            }
        }

        if let Ok(val) = env::var("HYPERPORT_PENDING_QUEUE_WARN_THRESHOLD") {
            match val.parse::<usize>() {
                Ok(parsed) => config.pending_queue_warn_threshold = parsed,
                Err(err) => tracing::warn!(
                    "ignoring HYPERPORT_PENDING_QUEUE_WARN_THRESHOLD={}: {}",
                    val,
                    err
                ),
            }
        }

        config
    }

    /// Load configuration from a YAML file. Missing fields take their
    /// defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration: every value `other` sets to
    /// something other than its default wins.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        if other.registry_thread_name != defaults.registry_thread_name {
            self.registry_thread_name = other.registry_thread_name.clone();
        }
        if other.context_thread_prefix != defaults.context_thread_prefix {
            self.context_thread_prefix = other.context_thread_prefix.clone();
        }
        if other.context_stack_size != defaults.context_stack_size {
            self.context_stack_size = other.context_stack_size;
        }
        if other.pending_queue_warn_threshold != defaults.pending_queue_warn_threshold {
            self.pending_queue_warn_threshold = other.pending_queue_warn_threshold;
        }
    }
}

/// Global configuration functions
///
/// Tests that depend on global configuration take [`global::lock`] first so
/// that they are serialized and cannot clobber each other's overrides.
///
/// ```ignore rust
/// let config = hyperport::config::global::lock();
/// let _guard = config.override_config(|c| c.pending_queue_warn_threshold = 1);
/// ```
pub mod global {
    use std::marker::PhantomData;

    use super::*;

    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(Config::from_env())));

    /// Acquire the global configuration lock. The returned [`ConfigLock`]
    /// is the only way to create overrides.
    pub fn lock() -> ConfigLock {
        static MUTEX: LazyLock<std::sync::Mutex<()>> =
            LazyLock::new(|| std::sync::Mutex::new(()));
        ConfigLock {
            // A test that panicked while holding the lock leaves nothing
            // inconsistent behind: overrides restore on unwind.
            _guard: MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }

    /// Initialize the global configuration from environment variables
    pub fn init_from_env() {
        set(Config::from_env());
    }

    /// Initialize the global configuration from a YAML file
    pub fn init_from_yaml<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
        set(Config::from_yaml(path)?);
        Ok(())
    }

    /// A snapshot of the global configuration.
    pub fn get() -> Config {
        CONFIG
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(config: Config) -> Config {
        let mut global = CONFIG
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *global, config)
    }

    /// Reset the global configuration to defaults. Call with the lock held.
    pub fn reset_to_defaults() {
        set(Config::default());
    }

    /// Holds the global configuration lock.
    pub struct ConfigLock {
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    impl ConfigLock {
        /// Apply `update` to the global configuration until the returned
        /// guard is dropped. The guard must not outlive this lock.
        pub fn override_config<'a>(&'a self, update: impl FnOnce(&mut Config)) -> ConfigGuard<'a> {
            let mut config = get();
            update(&mut config);
            let orig = set(config);
            ConfigGuard {
                orig: Some(orig),
                _phantom: PhantomData,
            }
        }
    }

    /// Restores the global configuration when dropped.
    pub struct ConfigGuard<'a> {
        orig: Option<Config>,
        // This is here so we can hold onto a 'a lifetime.
        _phantom: PhantomData<&'a ()>,
    }

    impl Drop for ConfigGuard<'_> {
        fn drop(&mut self) {
            if let Some(orig) = self.orig.take() {
                set(orig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.registry_thread_name, "hyperport-registry");
        assert_eq!(config.context_thread_prefix, "hyperport-ctx");
        assert_eq!(config.context_stack_size, 2 * 1024 * 1024);
        assert_eq!(config.pending_queue_warn_threshold, 10_000);
    }

    #[test]
    fn test_from_env() {
        let _lock = global::lock();
        std::env::set_var("HYPERPORT_PENDING_QUEUE_WARN_THRESHOLD", "17");
        std::env::set_var("HYPERPORT_CONTEXT_STACK_SIZE", "not a number");

        let config = Config::from_env();
        assert_eq!(config.pending_queue_warn_threshold, 17);
        assert_eq!(config.context_stack_size, 2 * 1024 * 1024); // Default value

        std::env::remove_var("HYPERPORT_PENDING_QUEUE_WARN_THRESHOLD");
        std::env::remove_var("HYPERPORT_CONTEXT_STACK_SIZE");
    }

    #[test]
    fn test_merge() {
        let mut config1 = Config {
            context_stack_size: 4096,
            ..Config::default()
        };
        let config2 = Config {
            registry_thread_name: "reg".to_string(),
            ..Config::default()
        };

        config1.merge(&config2);

        assert_eq!(config1.registry_thread_name, "reg");
        // Defaults in `other` do not clobber.
        assert_eq!(config1.context_stack_size, 4096);
    }

    #[test]
    fn test_yaml_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hyperport.yaml");
        let config = Config {
            context_thread_prefix: "worker".to_string(),
            pending_queue_warn_threshold: 5,
            ..Config::default()
        };
        config.to_yaml(&path)?;
        assert_eq!(Config::from_yaml(&path)?, config);

        // Partial files fill in defaults.
        std::fs::write(&path, "context_stack_size: 65536\n")?;
        let partial = Config::from_yaml(&path)?;
        assert_eq!(partial.context_stack_size, 65536);
        assert_eq!(partial.registry_thread_name, "hyperport-registry");
        Ok(())
    }

    #[test]
    fn test_overrides() {
        let config = global::lock();
        global::reset_to_defaults();
        assert_eq!(global::get().pending_queue_warn_threshold, 10_000);

        {
            let _guard = config.override_config(|c| c.pending_queue_warn_threshold = 2);
            assert_eq!(global::get().pending_queue_warn_threshold, 2);
            assert_eq!(global::get().context_stack_size, 2 * 1024 * 1024); // Unchanged
        }

        assert_eq!(global::get(), Config::default());
    }
}
