/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-level initialization: logging and panic reporting.

use std::backtrace::Backtrace;
use std::panic;
use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter directives.
pub const LOG_ENV_VAR: &str = "HYPERPORT_LOG";

const DEFAULT_LOG_FILTER: &str = "info";

/// Initialize hyperport for this process:
/// - Set up panic handling, so that panics on context threads are logged
///   with a backtrace.
/// - Initialize logging defaults.
pub fn initialize() {
    set_panic_hook();
    initialize_logging();
}

/// Install a stderr fmt subscriber filtered by [`LOG_ENV_VAR`] (default
/// `info`). Does nothing if a global subscriber is already installed.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

/// Chain a panic hook that logs the location and a backtrace through
/// `tracing` before running the previously installed hook. Installing it
/// more than once has no further effect.
pub fn set_panic_hook() {
    static INSTALLED: Once = Once::new();
    INSTALLED.call_once(|| {
        let prev = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture();
            let loc = info.location().map_or_else(
                || "unavailable".to_owned(),
                |loc: &panic::Location<'_>| {
                    format!("{}:{}:{}", loc.file(), loc.line(), loc.column())
                },
            );
            let thread = std::thread::current();
            tracing::error!(
                "stacktrace" = %backtrace,
                thread = thread.name().unwrap_or("<unnamed>"),
                "panic at {loc}"
            );

            // Execute the previous hook to preserve the default behavior.
            prev(info);
        }));
    });
}
