// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The per-job writer worker: one thread owning the measurement handle,
//! draining a frame queue into it.

use crate::frame::Frame;
use crate::job_config::JobConfig;
use crate::meas::{ChannelMeta, EntryData, MeasurementOpener, MeasurementWriter};
use crate::pubsub::TopicInfoMap;
use base::clock::Instant;
use base::time::Duration;
use base::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Upper bound on one wait for new frames, so interrupt/flush are noticed
/// promptly even without a wakeup.
const INPUT_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Clone, Debug, Serialize)]
pub struct WriterStatus {
    /// Written plus still-queued frames.
    pub total_frame_count: i64,

    /// Frames accepted but not yet written.
    pub unflushed_frame_count: i64,

    /// Span between the first written frame and the newest known frame.
    pub total_length: Duration,

    pub healthy: bool,
    pub message: String,
}

impl Default for WriterStatus {
    fn default() -> Self {
        WriterStatus {
            total_frame_count: 0,
            unflushed_frame_count: 0,
            total_length: Duration::ZERO,
            healthy: true,
            message: String::new(),
        }
    }
}

struct Input {
    queue: VecDeque<Arc<Frame>>,
    flushing: bool,
    interrupted: bool,
}

#[derive(Default)]
struct Stats {
    written_frames: i64,
    first_written: Option<Instant>,
    last_written: Option<Instant>,
    unhealthy_message: Option<String>,
}

struct Shared {
    input: Mutex<Input>,
    cv: Condvar,
    stats: Mutex<Stats>,
    pending_meta: Mutex<Option<TopicInfoMap>>,
    running: AtomicBool,
}

/// Accepts frames while `Running`; after [`WriterWorker::flush`] it refuses
/// new frames, drains its queue, closes the measurement, and terminates.
pub struct WriterWorker {
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<()>>,
}

impl WriterWorker {
    /// Starts the worker. With `start_flushed` the worker only drains
    /// `seed_frames` and exits (the save-pre-buffer path).
    pub fn spawn<O: MeasurementOpener>(
        opener: O,
        job_config: JobConfig,
        host_name: String,
        initial_topic_info: TopicInfoMap,
        seed_frames: VecDeque<Arc<Frame>>,
        start_flushed: bool,
    ) -> WriterWorker {
        let shared = Arc::new(Shared {
            input: Mutex::new(Input {
                queue: seed_frames,
                flushing: start_flushed,
                interrupted: false,
            }),
            cv: Condvar::new(),
            stats: Mutex::new(Stats::default()),
            pending_meta: Mutex::new(None),
            running: AtomicBool::new(true),
        });
        let join = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("writer-{}", job_config.job_id))
                .spawn(move || {
                    run(&shared, opener, &job_config, &host_name, initial_topic_info);
                    shared.running.store(false, Ordering::SeqCst);
                })
                .unwrap()
        };
        WriterWorker {
            shared,
            join: Some(join),
        }
    }

    /// Appends a frame. Returns `false` (dropping the frame) once flushing.
    pub fn add_frame(&self, frame: Arc<Frame>) -> bool {
        let mut input = self.shared.input.lock();
        if input.flushing {
            return false;
        }
        input.queue.push_back(frame);
        self.shared.cv.notify_one();
        true
    }

    /// Stops accepting frames; the worker drains the queue and terminates.
    pub fn flush(&self) {
        let mut input = self.shared.input.lock();
        input.flushing = true;
        if self.is_running() && !input.queue.is_empty() {
            info!("flushing {} frames", input.queue.len());
        }
        self.shared.cv.notify_all();
    }

    /// Requests termination without draining the queue.
    pub fn interrupt(&self) {
        self.shared.input.lock().interrupted = true;
        self.shared.cv.notify_all();
    }

    pub fn join(&mut self) {
        if let Some(h) = self.join.take() {
            h.join().unwrap();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.input.lock().flushing
    }

    /// Schema update; applied to entries written from here on.
    pub fn set_topic_info(&self, topic_info: TopicInfoMap) {
        *self.shared.pending_meta.lock() = Some(topic_info);
    }

    pub fn get_status(&self) -> WriterStatus {
        let (queued, newest_queued) = {
            let input = self.shared.input.lock();
            (input.queue.len() as i64, input.queue.back().map(|f| f.monotonic_receive_time))
        };
        let stats = self.shared.stats.lock();
        let total_length = match (stats.first_written, newest_queued.or(stats.last_written)) {
            (Some(first), Some(newest)) => newest - first,
            _ => Duration::ZERO,
        };
        WriterStatus {
            total_frame_count: stats.written_frames + queued,
            unflushed_frame_count: queued,
            total_length,
            healthy: stats.unhealthy_message.is_none(),
            message: stats.unhealthy_message.clone().unwrap_or_default(),
        }
    }
}

impl Drop for WriterWorker {
    fn drop(&mut self) {
        self.interrupt();
        self.join();
    }
}

fn apply_topic_info(
    writer: &mut impl MeasurementWriter,
    topic_info: &TopicInfoMap,
) -> Result<(), base::Error> {
    for (topic_name, info) in topic_info {
        writer.set_channel_meta(
            topic_name,
            &ChannelMeta {
                type_name: info.legacy_type(),
                description: info.description.clone(),
            },
        )?;
    }
    Ok(())
}

fn run<O: MeasurementOpener>(
    shared: &Shared,
    opener: O,
    job_config: &JobConfig,
    host_name: &str,
    initial_topic_info: TopicInfoMap,
) {
    info!(
        "measurement directory: {:?}",
        job_config.complete_measurement_path()
    );
    let dir = job_config.complete_measurement_path().join(host_name);
    let mut writer = match opener.open(&dir, host_name, job_config.max_file_size) {
        Ok(writer) => writer,
        Err(e) => {
            error!(err = %e.chain(), "unable to create measurement");
            shared.stats.lock().unhealthy_message =
                Some(format!("Unable to create measurement {dir:?}"));
            return;
        }
    };
    if let Err(e) = apply_topic_info(&mut writer, &initial_topic_info) {
        warn!(err = %e.chain(), "cannot install initial channel metadata");
    }

    loop {
        let frame = {
            let mut input = shared.input.lock();
            loop {
                if input.interrupted {
                    debug!("writer interrupted");
                    drop(input);
                    close(writer);
                    return;
                }
                if let Some(frame) = input.queue.pop_front() {
                    break frame;
                }
                if input.flushing {
                    debug!("finished flushing frames");
                    drop(input);
                    close(writer);
                    info!("finished saving measurement");
                    return;
                }
                shared.cv.wait_for(&mut input, INPUT_WAIT);
            }
        };

        if let Some(topic_info) = shared.pending_meta.lock().take() {
            if let Err(e) = apply_topic_info(&mut writer, &topic_info) {
                warn!(err = %e.chain(), "cannot update channel metadata");
            }
        }

        {
            let mut stats = shared.stats.lock();
            if stats.written_frames == 0 {
                stats.first_written = Some(frame.monotonic_receive_time);
            }
            stats.last_written = Some(frame.monotonic_receive_time);
            stats.written_frames += 1;
        }

        let entry = EntryData {
            payload: &frame.payload,
            publish_time: frame.publish_time,
            receive_time: frame.receive_time,
            topic_name: &frame.topic_name,
            id: frame.id,
            clock: frame.clock,
        };
        if let Err(e) = writer.add_entry(&entry) {
            error!(err = %e.chain(), "unable to add frame to measurement");
            shared.stats.lock().unhealthy_message =
                Some("Error adding frame to measurement".to_owned());
        }
    }
}

fn close(mut writer: impl MeasurementWriter) {
    if let Err(e) = writer.close() {
        error!(err = %e.chain(), "unable to close measurement");
    }
}
