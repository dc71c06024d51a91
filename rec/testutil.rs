// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Utilities for automated testing of the recording engine. Used by tests of
//! both the `nightjar-rec` crate itself and the `nightjar` crate.

use crate::frame::Frame;
use crate::meas::{ChannelMeta, EntryData, MeasurementOpener, MeasurementWriter};
use base::clock::Instant;
use base::time::Time;
use base::{err, Error, Mutex};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: sets up logging. (Note the
/// output can be confusing unless `RUST_TEST_THREADS=1` is set in the
/// program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// A frame whose wall and monotonic timestamps are both `t_millis`
/// milliseconds past their respective epochs.
pub fn frame(topic: &str, payload: Vec<u8>, t_millis: i64) -> Arc<Frame> {
    Arc::new(Frame::new(
        topic,
        payload,
        Time(t_millis * 1_000),
        Time(t_millis * 1_000),
        Instant(t_millis * 1_000),
        t_millis,
    ))
}

/// One entry captured by [`MockOpener`].
#[derive(Clone, Debug)]
pub struct CapturedEntry {
    pub topic_name: String,
    pub payload: Vec<u8>,
    pub publish_time: Time,
    pub receive_time: Time,
    pub id: i64,
    pub clock: i64,
}

#[derive(Default)]
struct MockState {
    entries: Mutex<Vec<CapturedEntry>>,
    channel_meta: Mutex<BTreeMap<String, ChannelMeta>>,
    closed: AtomicBool,
}

/// An in-memory measurement for writer tests: captures entries and channel
/// metadata, optionally failing on open or on every entry.
#[derive(Clone, Default)]
pub struct MockOpener {
    state: Arc<MockState>,
    fail_open: bool,
    fail_entries: bool,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn fail_entries(mut self) -> Self {
        self.fail_entries = true;
        self
    }

    pub fn entries(&self) -> Vec<CapturedEntry> {
        self.state.entries.lock().clone()
    }

    pub fn channel_meta(&self) -> BTreeMap<String, ChannelMeta> {
        self.state.channel_meta.lock().clone()
    }

    pub fn closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

pub struct MockMeasurement {
    state: Arc<MockState>,
    fail_entries: bool,
}

impl MeasurementOpener for MockOpener {
    type Writer = MockMeasurement;

    fn open(&self, _dir: &Path, _file_base_name: &str, _max_file_size: u64) -> Result<MockMeasurement, Error> {
        if self.fail_open {
            return Err(err!(ResourceUnavailable, msg("mock open failure")));
        }
        Ok(MockMeasurement {
            state: self.state.clone(),
            fail_entries: self.fail_entries,
        })
    }
}

impl MeasurementWriter for MockMeasurement {
    fn set_channel_meta(&mut self, topic_name: &str, meta: &ChannelMeta) -> Result<(), Error> {
        self.state
            .channel_meta
            .lock()
            .insert(topic_name.to_owned(), meta.clone());
        Ok(())
    }

    fn add_entry(&mut self, entry: &EntryData) -> Result<(), Error> {
        if self.fail_entries {
            return Err(err!(ResourceUnavailable, msg("mock entry failure")));
        }
        self.state.entries.lock().push(CapturedEntry {
            topic_name: entry.topic_name.to_owned(),
            payload: entry.payload.to_vec(),
            publish_time: entry.publish_time,
            receive_time: entry.receive_time,
            id: entry.id,
            clock: entry.clock,
        });
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `cond` until it holds or `timeout` elapses; returns its final value.
pub fn wait_until(timeout: std::time::Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    cond()
}
