// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! Dropping the [`Sender`] requests shutdown; clones of the [`Receiver`] are
//! handed to worker threads, which either poll [`Receiver::check`] between
//! units of work or park in [`Receiver::wait_for`] for their tick interval.

use crate::Condvar;
use crate::Mutex;
use std::sync::Arc;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    requested: Mutex<bool>,
    condvar: Condvar,
}

pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        // Note sequencing: modify the lock state, then notify waiters.
        // The opposite order would create a race in which something might never wake.
        *self.0.requested.lock() = true;
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.requested.lock() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Sleeps for up to `timeout`, returning early with `Err(ShutdownError)`
    /// if shutdown is requested first.
    pub fn wait_for(&self, timeout: std::time::Duration) -> Result<(), ShutdownError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut requested = self.0.requested.lock();
        loop {
            if *requested {
                return Err(ShutdownError);
            }
            if self
                .0
                .condvar
                .wait_until(&mut requested, deadline)
                .timed_out()
            {
                return if *requested { Err(ShutdownError) } else { Ok(()) };
            }
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        requested: Mutex::new(false),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}
