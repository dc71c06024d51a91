// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! A time-bounded queue with an optional background flusher.

use base::clock::Instant;
use base::time::Duration;
use base::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

/// How long the flusher parks when the queue is empty, bounding how stale the
/// stop flag can get.
const FLUSH_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

type FlushCallback<T> = Arc<dyn Fn(T) -> bool + Send + Sync>;

struct State<T> {
    entries: VecDeque<(Instant, T)>,
    length: Duration,
    flushing: bool,
    flush_cb: FlushCallback<T>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

/// An ordered sequence of `(monotonic timestamp, value)` pairs bounded by a
/// duration: on every [`push`](TimeBoundedQueue::push), entries older than
/// `now - length` are evicted from the head.
///
/// [`enable_flushing`](TimeBoundedQueue::enable_flushing) starts a worker
/// thread that drains head entries into the configured callback.
pub struct TimeBoundedQueue<T> {
    shared: Arc<Shared<T>>,
    flusher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<T: Send + 'static> TimeBoundedQueue<T> {
    pub fn new(length: Duration) -> Self {
        TimeBoundedQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: VecDeque::new(),
                    length,
                    flushing: false,
                    flush_cb: Arc::new(|_| false),
                }),
                cv: Condvar::new(),
            }),
            flusher: Mutex::new(None),
        }
    }

    /// Appends `value` with timestamp `now`, wakes one flusher waiter, and
    /// evicts head entries older than `now - length`.
    pub fn push(&self, now: Instant, value: T) {
        let mut state = self.shared.state.lock();
        state.entries.push_back((now, value));
        self.shared.cv.notify_one();
        let length = state.length;
        Self::evict(&mut state.entries, now, length);
    }

    /// Evicts head entries older than `now - length`. Called from the owner's
    /// GC tick; [`push`](Self::push) also evicts.
    pub fn trim(&self, now: Instant) {
        let mut state = self.shared.state.lock();
        let length = state.length;
        Self::evict(&mut state.entries, now, length);
    }

    fn evict(entries: &mut VecDeque<(Instant, T)>, now: Instant, length: Duration) {
        while let Some((t, _)) = entries.front() {
            if now - *t > length {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Updates the bound. Does not retroactively evict; eviction happens on
    /// the next push or trim.
    pub fn set_length(&self, length: Duration) {
        self.shared.state.lock().length = length;
    }

    pub fn get_length(&self) -> Duration {
        self.shared.state.lock().length
    }

    pub fn clear(&self) {
        self.shared.state.lock().entries.clear();
    }

    pub fn count(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().flushing
    }

    /// Sets the callback invoked by the flusher worker. Returning `false`
    /// from the callback terminates the worker.
    pub fn set_flushing_callback(&self, cb: impl Fn(T) -> bool + Send + Sync + 'static) {
        self.shared.state.lock().flush_cb = Arc::new(cb);
    }

    /// Starts the flusher worker. Returns `false` (and does nothing) if one
    /// is already running.
    pub fn enable_flushing(&self) -> bool {
        let mut flusher = self.flusher.lock();
        {
            let mut state = self.shared.state.lock();
            if state.flushing {
                return false;
            }
            state.flushing = true;
        }
        // A previous worker that terminated via its callback may still need
        // reaping.
        if let Some(h) = flusher.take() {
            h.join().unwrap();
        }
        let shared = self.shared.clone();
        *flusher = Some(
            thread::Builder::new()
                .name("queue-flush".to_owned())
                .spawn(move || flush_loop(&shared))
                .unwrap(),
        );
        true
    }

    /// Stops and joins the flusher worker. Returns `false` if none was
    /// running.
    pub fn disable_flushing(&self) -> bool {
        let mut flusher = self.flusher.lock();
        let was_flushing = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.flushing, false)
        };
        self.shared.cv.notify_all();
        if let Some(h) = flusher.take() {
            h.join().unwrap();
        }
        was_flushing
    }
}

impl<T: Clone + Send + 'static> TimeBoundedQueue<T> {
    /// Snapshot-copies all current entries (with their timestamps) into
    /// `other`, replacing `other`'s contents.
    pub fn copy_into(&self, other: &TimeBoundedQueue<T>) {
        let snapshot = self.shared.state.lock().entries.clone();
        other.shared.state.lock().entries = snapshot;
    }

    /// Snapshot of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<(Instant, T)> {
        self.shared.state.lock().entries.iter().cloned().collect()
    }
}

impl<T> Drop for TimeBoundedQueue<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.flushing = false;
        }
        self.shared.cv.notify_all();
        if let Some(h) = self.flusher.get_mut().take() {
            h.join().unwrap();
        }
    }
}

fn flush_loop<T>(shared: &Shared<T>) {
    loop {
        let (value, cb) = {
            let mut state = shared.state.lock();
            loop {
                if !state.flushing {
                    return;
                }
                if let Some((_, v)) = state.entries.pop_front() {
                    break (v, state.flush_cb.clone());
                }
                shared.cv.wait_for(&mut state, FLUSH_WAIT);
            }
        };
        if !cb(value) {
            shared.state.lock().flushing = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn at(millis: i64) -> Instant {
        Instant(millis * 1_000)
    }

    #[test]
    fn push_evicts_by_age() {
        let q = TimeBoundedQueue::new(Duration::from_millis(500));
        for i in 0..=10 {
            q.push(at(i * 100), i);
        }
        // Entries strictly older than 500 ms at the last push are gone:
        // the survivors are values 5..=10.
        assert_eq!(q.count(), 6);
        let retained: Vec<i64> = q.snapshot().into_iter().map(|(_, v)| v).collect();
        assert_eq!(retained, vec![5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn trim_evicts_without_push() {
        let q = TimeBoundedQueue::new(Duration::from_millis(500));
        for i in 0..=10 {
            q.push(at(i * 100), i);
        }
        q.trim(at(1400));
        let retained: Vec<i64> = q.snapshot().into_iter().map(|(_, v)| v).collect();
        assert_eq!(retained, vec![9, 10]);
    }

    #[test]
    fn set_length_is_not_retroactive() {
        let q = TimeBoundedQueue::new(Duration::from_secs(10));
        q.push(at(0), 0);
        q.push(at(100), 1);
        q.set_length(Duration::from_millis(50));
        assert_eq!(q.count(), 2);
        q.trim(at(200));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn copy_into_replaces_contents() {
        let q = TimeBoundedQueue::new(Duration::from_secs(10));
        q.push(at(1), 1);
        q.push(at(2), 2);
        let other = TimeBoundedQueue::new(Duration::from_secs(10));
        other.push(at(0), 99);
        q.copy_into(&other);
        let copied: Vec<i64> = other.snapshot().into_iter().map(|(_, v)| v).collect();
        assert_eq!(copied, vec![1, 2]);
        assert_eq!(q.count(), 2);
    }

    #[test]
    fn flusher_drains_in_order() {
        let q = TimeBoundedQueue::new(Duration::from_secs(10));
        let (tx, rx) = mpsc::channel();
        q.set_flushing_callback(move |v| tx.send(v).is_ok());
        assert!(q.enable_flushing());
        assert!(!q.enable_flushing());
        for i in 0..100 {
            q.push(at(i), i);
        }
        for i in 0..100 {
            assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), i);
        }
        assert!(q.disable_flushing());
        assert!(!q.disable_flushing());
    }

    #[test]
    fn flusher_stops_when_callback_returns_false() {
        let q = TimeBoundedQueue::new(Duration::from_secs(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        q.set_flushing_callback(move |_: i64| {
            calls2.fetch_add(1, Ordering::SeqCst);
            false
        });
        q.push(at(0), 7);
        q.push(at(1), 8);
        assert!(q.enable_flushing());
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while q.is_flushing() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!q.is_flushing());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.count(), 1);
    }
}
