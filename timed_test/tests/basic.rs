/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

// Module imports used only inside test bodies must count as used.
#![deny(unused_imports)]

use std::time::Duration;

use timed_test::async_timed_test;
use timed_test::timed_test;

#[async_timed_test(timeout_secs = 5)]
async fn async_good() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[async_timed_test(timeout_secs = 1, worker_threads = 1)]
#[should_panic]
async fn async_bad() {
    tokio::time::sleep(Duration::from_secs(3)).await;
}

#[timed_test(timeout_secs = 5)]
fn sync_good() {
    std::thread::sleep(Duration::from_millis(200));
}

#[timed_test(timeout_secs = 1)]
#[should_panic]
fn sync_bad() {
    std::thread::sleep(Duration::from_secs(3));
}

#[timed_test(timeout_secs = 5)]
#[should_panic(expected = "boom")]
fn sync_panic_propagates() {
    panic!("boom");
}

#[timed_test(timeout_secs = 5)]
fn sync_returns_result() -> Result<(), String> {
    let value: u32 = "42".parse().map_err(|e: std::num::ParseIntError| e.to_string())?;
    assert_eq!(value, 42);
    Ok(())
}
