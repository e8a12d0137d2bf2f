/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `initialize` installs the process-wide subscriber, so it runs in its own
//! test binary, apart from tests that capture logs with `traced_test`.

use hyperport::init::initialize;
use hyperport::init::initialize_logging;
use hyperport::init::set_panic_hook;

#[test]
fn test_initialize_is_idempotent() {
    initialize();
    initialize();
    initialize_logging();
    tracing::info!("still logging");
}

#[test]
fn test_panic_hook_preserves_unwinding() {
    set_panic_hook();
    set_panic_hook();
    let result = std::panic::catch_unwind(|| panic!("expected"));
    assert!(result.is_err());
}
