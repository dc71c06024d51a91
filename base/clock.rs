// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Clock interface and implementations for testability.

use crate::time::{Duration, Time, MICROS_PER_SEC};
use crate::Mutex;
use std::fmt;
use std::mem;
use std::ops;
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// A monotonic instant in microseconds since an unspecified epoch.
///
/// Only differences between instants are meaningful. Unlike
/// `std::time::Instant`, this is a plain value so tests can fabricate it.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, serde::Serialize)]
pub struct Instant(pub i64);

impl Instant {
    pub fn as_micros(self) -> i64 {
        self.0
    }
}

impl ops::Sub for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.0)
    }
}

impl ops::Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0 - rhs.0)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Duration(self.0))
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time from `CLOCK_REALTIME`.
    fn realtime(&self) -> Time;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> i64 {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            let ts = ts.assume_init();
            // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
            // On other platforms, the `.into()` is a no-op.
            #[allow(clippy::useless_conversion)]
            let sec: i64 = ts.tv_sec.into();
            sec * MICROS_PER_SEC + (ts.tv_nsec as i64) / 1_000
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> Time {
        Time(self.get(libc::CLOCK_REALTIME))
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        Instant(self.get(libc::CLOCK_BOOTTIME))
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        Instant(self.get(libc::CLOCK_MONOTONIC))
    }

    fn sleep(&self, how_long: Duration) {
        if how_long < Duration::ZERO {
            warn!(%how_long, "invalid duration");
            return;
        }
        thread::sleep(how_long.to_std());
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed >= Duration::from_secs(1) {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Time,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: Time) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Time {
        self.0.boot + *self.0.uptime.lock()
    }

    fn monotonic(&self) -> Instant {
        Instant((*self.0.uptime.lock()).as_micros())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances() {
        let c = SimulatedClocks::new(Time(1_000_000));
        assert_eq!(c.realtime(), Time(1_000_000));
        assert_eq!(c.monotonic(), Instant(0));
        c.sleep(Duration::from_millis(1500));
        assert_eq!(c.realtime(), Time(2_500_000));
        assert_eq!(c.monotonic(), Instant(1_500_000));
    }

    #[test]
    fn real_monotonic_increases() {
        let c = RealClocks {};
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
