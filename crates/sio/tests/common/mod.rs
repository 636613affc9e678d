// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(dead_code, reason = "each test binary uses a different subset of the helpers")]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::time::Duration;
use std::{env, process, thread};

use tracing::Level;
use tracing::subscriber::DefaultGuard;

/// If a test does not finish within this time, it is considered hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Patience for individual waits inside a test.
pub const WAIT: Option<Duration> = Some(Duration::from_secs(5));

#[must_use]
pub fn is_mutation_testing() -> bool {
    env::var("MUTATION_TESTING").as_deref() == Ok("1")
}

/// Runs `f` on the current thread and terminates the process if it does not finish within
/// [`TEST_TIMEOUT`].
///
/// # Panics
///
/// Re-raises any panic of `f`.
pub fn with_watchdog<R>(f: impl FnOnce() -> R) -> R {
    if is_mutation_testing() {
        return f();
    }

    let (sender, receiver) = mpsc::channel();
    let watchdog = thread::Builder::new()
        .name("test watchdog".to_owned())
        .spawn(move || {
            if receiver.recv_timeout(TEST_TIMEOUT) != Ok(()) {
                eprintln!("Test timed out, terminating process.");
                #[expect(clippy::exit, reason = "a hung test cannot be stopped any other way")]
                process::exit(112);
            }
        })
        .unwrap();

    let result = catch_unwind(AssertUnwindSafe(f));
    sender.send(()).unwrap();
    watchdog.join().unwrap();

    result.unwrap()
}

/// Sends the events of the calling thread to the test output until the guard is dropped.
#[must_use]
pub fn log_to_test_output() -> DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::TRACE)
        .finish();

    tracing::subscriber::set_default(subscriber)
}

/// Standard test data: a repeating sequence of bytes from 0 to 255.
pub fn repeating_bytes(len: usize) -> Vec<u8> {
    (0..=u8::MAX).cycle().take(len).collect()
}
