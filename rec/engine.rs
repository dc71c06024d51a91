// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The top-level recording engine.
//!
//! Owns the pre-buffer, the record-job history, the add-on manager, and the
//! monitoring/GC timer threads; routes incoming frames from the middleware's
//! receive threads into the pre-buffer and the active job's writer queue.
//!
//! Lock order, outermost first: `bus_state`, `rec`, `addons` (never the
//! reverse). `monitor` is a leaf. Job-internal locks nest under `rec`.

use crate::addon::{AddonJobStatus, AddonManager, AddonStatus, SetJobStatusFn};
use crate::frame::Frame;
use crate::job::{job_uses_path, JobState, JobStatus, RecordJob};
use crate::job_config::JobConfig;
use crate::meas::{FrameLogOpener, MeasurementOpener};
use crate::pubsub::{Bus, MessageData, ReceiveCallback, Subscription, TopicInfoMap};
use crate::upload::UploadConfig;
use base::clock::{Clocks, RealClocks, TimerGuard};
use base::time::{Duration, Time};
use base::{err, Error, FastHashMap, Mutex};
use base::shutdown;
use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RecordMode {
    All,
    Blacklist,
    Whitelist,
}

/// Initial engine configuration. The pre-buffer settings are inputs, not
/// built-in defaults.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_pre_buffer_length: Duration,
    pub pre_buffering_enabled: bool,
    pub monitor_period: std::time::Duration,
    pub gc_period: std::time::Duration,

    /// `None`: discover add-ons from the search paths. `Some`: use exactly
    /// these executables.
    pub addon_executables: Option<Vec<PathBuf>>,
}

impl EngineConfig {
    pub fn new(max_pre_buffer_length: Duration, pre_buffering_enabled: bool) -> Self {
        EngineConfig {
            max_pre_buffer_length,
            pre_buffering_enabled,
            monitor_period: std::time::Duration::from_secs(1),
            gc_period: std::time::Duration::from_secs(1),
            addon_executables: None,
        }
    }

    pub fn with_addon_executables(mut self, executables: Vec<PathBuf>) -> Self {
        self.addon_executables = Some(executables);
        self
    }

    pub fn without_addons(self) -> Self {
        self.with_addon_executables(Vec::new())
    }

    pub fn with_periods(
        mut self,
        monitor_period: std::time::Duration,
        gc_period: std::time::Duration,
    ) -> Self {
        self.monitor_period = monitor_period;
        self.gc_period = gc_period;
        self
    }
}

/// Aggregate status snapshot of the whole engine.
#[derive(Clone, Debug, Serialize)]
pub struct RecorderStatus {
    pub timestamp: Time,
    pub pid: u32,
    pub initialized: bool,
    pub subscribed_topics: BTreeSet<String>,
    pub pre_buffer_frame_count: usize,
    pub pre_buffer_length: Duration,
    pub addon_statuses: Vec<AddonStatus>,
    pub healthy: bool,
    pub message: String,
    pub jobs: Vec<JobStatus>,
}

struct RecState {
    jobs: Vec<Arc<RecordJob>>,
    recording_job: Option<Arc<RecordJob>>,
    pre_buffer: VecDeque<Arc<Frame>>,
    pre_buffering_enabled: bool,
    max_pre_buffer_length: Duration,
    healthy: bool,
    message: String,
}

struct BusState {
    subscriptions: FastHashMap<String, Box<dyn Subscription>>,
    hosts_filter: BTreeSet<String>,
    record_mode: RecordMode,
    listed_topics: BTreeSet<String>,
    connected: bool,
}

struct Inner<C: Clocks + Clone, O: MeasurementOpener + Clone> {
    weak_self: Weak<Inner<C, O>>,
    clocks: C,
    opener: O,
    bus: Arc<dyn Bus>,
    host_name: String,
    rec: Mutex<RecState>,
    bus_state: Mutex<BusState>,
    monitor: Mutex<TopicInfoMap>,
    addons: Mutex<AddonManager>,
}

/// The recording engine. Dropping it interrupts every timer and job, then
/// joins.
pub struct Recorder<C: Clocks + Clone = RealClocks, O: MeasurementOpener + Clone = FrameLogOpener>
{
    inner: Arc<Inner<C, O>>,
    shutdown_tx: Option<shutdown::Sender>,
    monitor_join: Option<thread::JoinHandle<()>>,
    gc_join: Option<thread::JoinHandle<()>>,
}

/// The name of the directory measurements on this machine are written under.
pub fn local_host_name() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned())
}

/// Decides which topics to subscribe to: a topic is accepted iff it has at
/// least one publisher, passes the record mode's topic list, and (with a
/// non-empty host filter) has at least one publisher on a listed host.
pub fn filter_topics(
    topic_info: &TopicInfoMap,
    record_mode: RecordMode,
    listed_topics: &BTreeSet<String>,
    hosts_filter: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut accepted = BTreeSet::new();
    for (topic_name, info) in topic_info {
        if info.publishers.is_empty() {
            continue;
        }
        match record_mode {
            RecordMode::All => {}
            RecordMode::Blacklist if listed_topics.contains(topic_name) => continue,
            RecordMode::Whitelist if !listed_topics.contains(topic_name) => continue,
            _ => {}
        }
        if !hosts_filter.is_empty()
            && !info.publishers.keys().any(|host| hosts_filter.contains(host))
        {
            continue;
        }
        accepted.insert(topic_name.clone());
    }
    accepted
}

impl<C: Clocks + Clone, O: MeasurementOpener + Clone> Recorder<C, O> {
    pub fn new(clocks: C, bus: Arc<dyn Bus>, opener: O, config: EngineConfig) -> Self {
        let host_name = local_host_name();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<C, O>>| {
            let set_job_status: SetJobStatusFn = {
                let weak = weak.clone();
                Arc::new(move |job_id, addon_id, status: AddonJobStatus| {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let rec = inner.rec.lock();
                    if let Some(job) = rec.jobs.iter().find(|j| j.job_config().job_id == job_id)
                    {
                        job.set_addon_status(addon_id, status);
                    }
                })
            };
            let addons = match &config.addon_executables {
                None => AddonManager::new(host_name.clone(), set_job_status),
                Some(paths) => AddonManager::from_executables(
                    paths.clone(),
                    host_name.clone(),
                    set_job_status,
                    100,
                    std::time::Duration::from_millis(50),
                ),
            };
            Inner {
                weak_self: weak.clone(),
                clocks,
                opener,
                bus,
                host_name,
                rec: Mutex::new(RecState {
                    jobs: Vec::new(),
                    recording_job: None,
                    pre_buffer: VecDeque::new(),
                    pre_buffering_enabled: config.pre_buffering_enabled,
                    max_pre_buffer_length: config.max_pre_buffer_length,
                    healthy: true,
                    message: String::new(),
                }),
                bus_state: Mutex::new(BusState {
                    subscriptions: FastHashMap::default(),
                    hosts_filter: BTreeSet::new(),
                    record_mode: RecordMode::All,
                    listed_topics: BTreeSet::new(),
                    connected: false,
                }),
                monitor: Mutex::new(TopicInfoMap::new()),
                addons: Mutex::new(addons),
            }
        });
        inner
            .addons
            .lock()
            .set_pre_buffer(config.pre_buffering_enabled, config.max_pre_buffer_length);

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let monitor_join = {
            let weak = Arc::downgrade(&inner);
            let rx = shutdown_rx.clone();
            let period = config.monitor_period;
            thread::Builder::new()
                .name("monitor".to_owned())
                .spawn(move || loop {
                    match weak.upgrade() {
                        Some(inner) => inner.monitor_tick(),
                        None => return,
                    }
                    if rx.wait_for(period).is_err() {
                        return;
                    }
                })
                .unwrap()
        };
        let gc_join = {
            let weak = Arc::downgrade(&inner);
            let rx = shutdown_rx;
            let period = config.gc_period;
            thread::Builder::new()
                .name("gc".to_owned())
                .spawn(move || loop {
                    if rx.wait_for(period).is_err() {
                        return;
                    }
                    match weak.upgrade() {
                        Some(inner) => inner.garbage_collect(),
                        None => return,
                    }
                })
                .unwrap()
        };

        Recorder {
            inner,
            shutdown_tx: Some(shutdown_tx),
            monitor_join: Some(monitor_join),
            gc_join: Some(gc_join),
        }
    }

    //// Connection

    /// Connects to the middleware: subscribes to the currently-accepted
    /// topics and initializes enabled add-ons. Idempotent.
    pub fn connect(&self) {
        {
            let mut bus_state = self.inner.bus_state.lock();
            if bus_state.connected {
                return;
            }
            info!("connecting to middleware");
            let topic_info = self.inner.monitor.lock().clone();
            let accepted = filter_topics(
                &topic_info,
                bus_state.record_mode,
                &bus_state.listed_topics,
                &bus_state.hosts_filter,
            );
            self.inner
                .create_new_subscribers_locked(&mut bus_state, &accepted);
            bus_state.connected = true;
        }
        self.inner.addons.lock().initialize();
    }

    /// Destroys all subscribers, deinitializes add-ons, stops any running
    /// recording, and clears the pre-buffer.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut bus_state = self.inner.bus_state.lock();
            let was = bus_state.connected;
            if was {
                info!("disconnecting from middleware");
                bus_state.subscriptions.clear();
                bus_state.connected = false;
            }
            was
        };
        if was_connected {
            self.inner.addons.lock().deinitialize();
        }
        let mut rec = self.inner.rec.lock();
        self.inner.stop_recording_locked(&mut rec);
        rec.pre_buffer.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.bus_state.lock().connected
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.inner
            .bus_state
            .lock()
            .subscriptions
            .keys()
            .cloned()
            .collect()
    }

    //// Pre-buffer

    pub fn set_pre_buffering_enabled(&self, enabled: bool) {
        let length = {
            let mut rec = self.inner.rec.lock();
            if !enabled {
                rec.pre_buffer.clear();
            }
            rec.pre_buffering_enabled = enabled;
            rec.max_pre_buffer_length
        };
        self.inner.addons.lock().set_pre_buffer(enabled, length);
        info!("pre-buffering enabled: {}", enabled);
    }

    pub fn set_max_pre_buffer_length(&self, length: Duration) {
        let enabled = {
            let mut rec = self.inner.rec.lock();
            rec.max_pre_buffer_length = length;
            rec.pre_buffering_enabled
        };
        self.inner.addons.lock().set_pre_buffer(enabled, length);
        info!("max pre-buffer length: {}", length);
    }

    pub fn is_pre_buffering_enabled(&self) -> bool {
        self.inner.rec.lock().pre_buffering_enabled
    }

    pub fn get_max_pre_buffer_length(&self) -> Duration {
        self.inner.rec.lock().max_pre_buffer_length
    }

    /// `(frame count, age of the oldest buffered frame)`.
    pub fn get_current_pre_buffer_length(&self) -> (usize, Duration) {
        let rec = self.inner.rec.lock();
        self.inner.current_pre_buffer_length_locked(&rec)
    }

    //// Recorder control

    /// Starts the one live recording. Fails if another job is already
    /// recording or the evaluated path is in use; failure reasons land in
    /// the engine's info.
    pub fn start_recording(&self, job_config: &JobConfig) -> bool {
        self.connect();
        let Some((evaluated, topic_info, system_information, middleware_config)) =
            self.prepare_job(job_config, "start recording")
        else {
            return false;
        };

        let _t = TimerGuard::new(&self.inner.clocks, || {
            format!("starting recording {}", evaluated.job_id)
        });
        let mut rec = self.inner.rec.lock();

        if let Some(job) = &rec.recording_job {
            if job.get_main_state() == JobState::Recording {
                let message = "Unable to start recording: a recording is already running";
                error!("{message}");
                Inner::<C, O>::set_info_locked(&mut rec, false, message);
                return false;
            }
        }
        let path = evaluated.complete_measurement_path().to_owned();
        for job in &rec.jobs {
            if let Err(e) = job_uses_path(job, &path) {
                let message = format!("Unable to start recording: {e}");
                error!("{message}");
                Inner::<C, O>::set_info_locked(&mut rec, false, message);
                return false;
            }
        }

        if rec.pre_buffering_enabled {
            let (frames, length) = self.inner.current_pre_buffer_length_locked(&rec);
            info!(
                "start recording (id: {}), initial buffer: {} frames / {}",
                evaluated.job_id, frames, length
            );
        } else {
            info!("start recording (id: {})", evaluated.job_id);
        }

        let job = Arc::new(RecordJob::new(evaluated.clone(), self.inner.host_name.clone()));
        rec.jobs.push(job.clone());
        if job
            .initialize_measurement_directory(&system_information, middleware_config.as_deref())
            .is_err()
        {
            let message = "Unable to start recording: failed to initialize measurement directory";
            Inner::<C, O>::set_info_locked(&mut rec, false, message);
            return false;
        }

        let addons = self.inner.addons.lock();
        for addon_id in addons.get_enabled_addons() {
            job.set_addon_status(&addon_id, AddonJobStatus::default());
        }
        if !job.start_recording(
            topic_info,
            rec.pre_buffer.clone(),
            self.inner.opener.clone(),
        ) {
            let message = "Unable to start recording: failed to start recorder thread";
            error!("{message}");
            Inner::<C, O>::set_info_locked(&mut rec, false, message);
            return false;
        }
        rec.recording_job = Some(job);
        addons.start_recording(&evaluated);
        Inner::<C, O>::set_info_locked(&mut rec, true, "");
        true
    }

    pub fn stop_recording(&self) -> bool {
        let mut rec = self.inner.rec.lock();
        let success = self.inner.stop_recording_locked(&mut rec);
        if success {
            info!("stop recording");
        } else {
            error!("unable to stop recording: no recording is running");
        }
        success
    }

    /// Flushes the current pre-buffer into a one-shot job. The live
    /// recording (if any) is unaffected.
    pub fn save_pre_buffered_data(&self, job_config: &JobConfig) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some((evaluated, topic_info, system_information, middleware_config)) =
            self.prepare_job(job_config, "save buffer")
        else {
            return false;
        };

        let mut rec = self.inner.rec.lock();
        if !rec.pre_buffering_enabled {
            let message = "Cannot save buffer. Buffering is disabled.";
            error!("{message}");
            Inner::<C, O>::set_info_locked(&mut rec, false, message);
            return false;
        }
        let path = evaluated.complete_measurement_path().to_owned();
        for job in &rec.jobs {
            if let Err(e) = job_uses_path(job, &path) {
                let message = format!("Unable to save buffer: {e}");
                error!("{message}");
                Inner::<C, O>::set_info_locked(&mut rec, false, message);
                return false;
            }
        }

        let (frames, length) = self.inner.current_pre_buffer_length_locked(&rec);
        info!(
            "saving buffer to disk (id: {}), content: {} frames / {}",
            evaluated.job_id, frames, length
        );

        let job = Arc::new(RecordJob::new(evaluated.clone(), self.inner.host_name.clone()));
        rec.jobs.push(job.clone());
        if job
            .initialize_measurement_directory(&system_information, middleware_config.as_deref())
            .is_err()
        {
            let message = "Unable to save buffer: failed to initialize measurement directory";
            Inner::<C, O>::set_info_locked(&mut rec, false, message);
            return false;
        }

        let addons = self.inner.addons.lock();
        for addon_id in addons.get_enabled_addons() {
            job.set_addon_status(&addon_id, AddonJobStatus::default());
        }
        if !job.save_buffer(
            topic_info,
            rec.pre_buffer.clone(),
            self.inner.opener.clone(),
        ) {
            let message = "Unable to save buffer: failed to start buffer writer thread";
            error!("{message}");
            Inner::<C, O>::set_info_locked(&mut rec, false, message);
            return false;
        }
        addons.save_buffer(&evaluated);
        Inner::<C, O>::set_info_locked(&mut rec, true, "");
        true
    }

    //// Measurement history

    pub fn upload_measurement(&self, upload_config: &UploadConfig) -> Result<(), Error> {
        let result = match self.find_job(upload_config.meas_id) {
            None => Err(err!(MeasIdNotFound, msg("{}", upload_config.meas_id))),
            Some(job) => job.upload(upload_config),
        };
        match &result {
            Err(e) => {
                let message = format!("Error uploading measurement: {e}");
                error!("{message}");
                self.inner.set_info(false, message);
            }
            Ok(()) => info!("uploading measurement {}", upload_config.meas_id),
        }
        result
    }

    pub fn add_comment(&self, job_id: i64, comment: &str) -> Result<(), Error> {
        let result = match self.find_job(job_id) {
            None => Err(err!(MeasIdNotFound, msg("{job_id}"))),
            Some(job) => job.add_comment(comment),
        };
        match &result {
            Err(e) => {
                let message = format!("Error adding comment: {e}");
                error!("{message}");
                self.inner.set_info(false, message);
            }
            Ok(()) => info!("added comment to measurement {job_id}"),
        }
        result
    }

    pub fn delete_measurement(&self, job_id: i64) -> Result<(), Error> {
        let result = match self.find_job(job_id) {
            None => Err(err!(MeasIdNotFound, msg("{job_id}"))),
            Some(job) => job.delete_measurement(),
        };
        match &result {
            Err(e) => {
                let message = format!("Error deleting measurement: {e}");
                error!("{message}");
                self.inner.set_info(false, message);
            }
            Ok(()) => info!("successfully deleted measurement {job_id}"),
        }
        result
    }

    //// Add-ons

    /// Changing the enabled add-on set would silently alter a running
    /// measurement, so it is refused while recording.
    pub fn set_enabled_addons(&self, addon_ids: &BTreeSet<String>) -> bool {
        {
            let mut rec = self.inner.rec.lock();
            if Inner::<C, O>::is_recording_locked(&rec) {
                let message =
                    "Failed to set enabled addons. Please stop the recording and try again.";
                error!("{message}");
                Inner::<C, O>::set_info_locked(&mut rec, false, message);
                return false;
            }
            Inner::<C, O>::set_info_locked(&mut rec, true, "");
        }
        self.inner.addons.lock().set_enabled_addons(addon_ids);
        true
    }

    pub fn get_enabled_addons(&self) -> BTreeSet<String> {
        self.inner.addons.lock().get_enabled_addons()
    }

    //// Topic filters

    /// Refused while recording. Clears the pre-buffer and recomputes the
    /// subscriber set.
    pub fn set_host_filter(&self, hosts: BTreeSet<String>) -> bool {
        let success = {
            let mut bus_state = self.inner.bus_state.lock();
            let mut rec = self.inner.rec.lock();
            if Inner::<C, O>::is_recording_locked(&rec) {
                false
            } else {
                bus_state.hosts_filter = hosts.clone();
                rec.pre_buffer.clear();
                true
            }
        };
        if success {
            self.inner.set_info(true, "");
            info!("host filter: {}", hosts.iter().join("; "));
            self.inner.update_and_clean_subscribers();
        } else {
            let message = "Unable to set host filter";
            error!("{message}");
            self.inner.set_info(false, message);
        }
        success
    }

    /// Refused while recording. Clears the pre-buffer and recomputes the
    /// subscriber set.
    pub fn set_record_mode(&self, mode: RecordMode, listed_topics: BTreeSet<String>) -> bool {
        let success = {
            let mut bus_state = self.inner.bus_state.lock();
            let mut rec = self.inner.rec.lock();
            if Inner::<C, O>::is_recording_locked(&rec) {
                false
            } else {
                bus_state.record_mode = mode;
                bus_state.listed_topics = listed_topics.clone();
                rec.pre_buffer.clear();
                true
            }
        };
        if success {
            info!("record mode: {:?}", mode);
            if mode != RecordMode::All {
                info!("listed topics: {}", listed_topics.iter().join("; "));
            }
            self.inner.set_info(true, "");
            self.inner.update_and_clean_subscribers();
        } else {
            let message = "Unable to set record mode and listed topics";
            error!("{message}");
            self.inner.set_info(false, message);
        }
        success
    }

    /// Replaces the topic list, keeping the current record mode.
    pub fn set_listed_topics(&self, listed_topics: BTreeSet<String>) -> bool {
        let mode = self.inner.bus_state.lock().record_mode;
        self.set_record_mode(mode, listed_topics)
    }

    pub fn get_record_mode(&self) -> RecordMode {
        self.inner.bus_state.lock().record_mode
    }

    pub fn get_hosts_filter(&self) -> BTreeSet<String> {
        self.inner.bus_state.lock().hosts_filter.clone()
    }

    pub fn get_listed_topics(&self) -> BTreeSet<String> {
        self.inner.bus_state.lock().listed_topics.clone()
    }

    //// Status and maintenance

    pub fn get_status(&self) -> RecorderStatus {
        let timestamp = self.inner.clocks.realtime();
        let (initialized, subscribed_topics) = {
            let bus_state = self.inner.bus_state.lock();
            (
                bus_state.connected,
                bus_state.subscriptions.keys().cloned().collect(),
            )
        };
        let addon_statuses = self.inner.addons.lock().get_addon_statuses();
        let (pre_buffer_frame_count, pre_buffer_length, healthy, message, jobs) = {
            let rec = self.inner.rec.lock();
            let (count, length) = self.inner.current_pre_buffer_length_locked(&rec);
            (
                count,
                length,
                rec.healthy,
                rec.message.clone(),
                rec.jobs.iter().map(|j| j.get_job_status()).collect(),
            )
        };
        RecorderStatus {
            timestamp,
            pid: std::process::id(),
            initialized,
            subscribed_topics,
            pre_buffer_frame_count,
            pre_buffer_length,
            addon_statuses,
            healthy,
            message,
            jobs,
        }
    }

    /// Trims the pre-buffer by age and reaps finished workers. Also called
    /// periodically by the GC timer.
    pub fn garbage_collect(&self) {
        self.inner.garbage_collect();
    }

    /// Takes one monitoring snapshot and reconciles subscribers. Also called
    /// periodically by the monitoring timer.
    pub fn update_monitoring(&self) {
        self.inner.monitor_tick();
    }

    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    fn find_job(&self, job_id: i64) -> Option<Arc<RecordJob>> {
        self.inner
            .rec
            .lock()
            .jobs
            .iter()
            .find(|j| j.job_config().job_id == job_id)
            .cloned()
    }

    /// Evaluation and snapshot gathering common to the two job-creating
    /// operations. `None` means the config was rejected (info updated).
    fn prepare_job(
        &self,
        job_config: &JobConfig,
        operation: &str,
    ) -> Option<(JobConfig, TopicInfoMap, String, Option<PathBuf>)> {
        let evaluated = job_config.evaluate(self.inner.clocks.realtime(), &self.inner.host_name);
        if evaluated.meas_name.is_empty() && evaluated.meas_root_dir.is_empty() {
            let message = format!("Unable to {operation}: target path not set");
            error!("{message}");
            self.inner.set_info(false, message);
            return None;
        }
        let topic_info = self.inner.monitor.lock().clone();
        let system_information = self.inner.system_information();
        let middleware_config = self.inner.bus.config_file_path();
        Some((evaluated, topic_info, system_information, middleware_config))
    }
}

impl<C: Clocks + Clone, O: MeasurementOpener + Clone> Drop for Recorder<C, O> {
    fn drop(&mut self) {
        self.disconnect();
        drop(self.shutdown_tx.take());
        if let Some(h) = self.monitor_join.take() {
            h.join().unwrap();
        }
        if let Some(h) = self.gc_join.take() {
            h.join().unwrap();
        }
        let jobs = {
            let mut rec = self.inner.rec.lock();
            rec.recording_job = None;
            std::mem::take(&mut rec.jobs)
        };
        for job in &jobs {
            job.interrupt();
        }
    }
}

impl<C: Clocks + Clone, O: MeasurementOpener + Clone> Inner<C, O> {
    fn monitor_tick(&self) {
        let topic_info = self.bus.poll_topics();
        *self.monitor.lock() = topic_info.clone();
        self.set_topic_info(topic_info);
    }

    /// New monitoring snapshot: create subscribers for newly-accepted topics
    /// and forward the schema to the active writer.
    fn set_topic_info(&self, topic_info: TopicInfoMap) {
        {
            let mut bus_state = self.bus_state.lock();
            if bus_state.connected {
                let accepted = filter_topics(
                    &topic_info,
                    bus_state.record_mode,
                    &bus_state.listed_topics,
                    &bus_state.hosts_filter,
                );
                self.create_new_subscribers_locked(&mut bus_state, &accepted);
            }
        }
        let rec = self.rec.lock();
        if let Some(job) = &rec.recording_job {
            job.set_topic_info(topic_info);
        }
    }

    fn update_and_clean_subscribers(&self) {
        let topic_info = self.monitor.lock().clone();
        let mut bus_state = self.bus_state.lock();
        if !bus_state.connected {
            return;
        }
        let accepted = filter_topics(
            &topic_info,
            bus_state.record_mode,
            &bus_state.listed_topics,
            &bus_state.hosts_filter,
        );
        self.create_new_subscribers_locked(&mut bus_state, &accepted);
        self.remove_old_subscribers_locked(&mut bus_state, &accepted);
    }

    fn create_new_subscribers_locked(&self, bus_state: &mut BusState, topics: &BTreeSet<String>) {
        for topic in topics {
            if bus_state.subscriptions.contains_key(topic) {
                continue;
            }
            info!("subscribing to {topic}");
            let weak = self.weak_self.clone();
            let callback: ReceiveCallback = Box::new(move |topic_name, data| {
                if let Some(inner) = weak.upgrade() {
                    inner.message_received(topic_name, data);
                }
            });
            match self.bus.subscribe(topic, callback) {
                Ok(subscription) => {
                    bus_state.subscriptions.insert(topic.clone(), subscription);
                }
                Err(e) => {
                    error!(err = %e.chain(), "error creating subscriber for topic {topic}");
                    let mut rec = self.rec.lock();
                    Self::set_info_locked(&mut rec, false, "Error creating subscribers");
                }
            }
        }
    }

    fn remove_old_subscribers_locked(&self, bus_state: &mut BusState, topics: &BTreeSet<String>) {
        bus_state.subscriptions.retain(|topic, _| {
            let keep = topics.contains(topic);
            if !keep {
                info!("unsubscribing from {topic}");
            }
            keep
        });
    }

    /// Runs on the middleware's receive threads.
    fn message_received(&self, topic_name: &str, data: &MessageData) {
        let receive_time = self.clocks.realtime();
        let monotonic_receive_time = self.clocks.monotonic();
        let frame = Arc::new(Frame::new(
            topic_name,
            data.payload.to_vec(),
            data.publish_time,
            receive_time,
            monotonic_receive_time,
            data.clock,
        ));
        let mut rec = self.rec.lock();
        if rec.pre_buffering_enabled {
            rec.pre_buffer.push_back(frame.clone());
        }
        if let Some(job) = &rec.recording_job {
            job.add_frame(frame);
        }
    }

    fn garbage_collect(&self) {
        let now = self.clocks.monotonic();
        let mut rec = self.rec.lock();
        let horizon = rec.max_pre_buffer_length;
        while let Some(front) = rec.pre_buffer.front() {
            if now - front.monotonic_receive_time > horizon {
                rec.pre_buffer.pop_front();
            } else {
                break;
            }
        }
        for job in &rec.jobs {
            job.refresh_state();
        }
    }

    fn stop_recording_locked(&self, rec: &mut RecState) -> bool {
        let job = match &rec.recording_job {
            Some(job) if job.get_main_state() == JobState::Recording => job.clone(),
            _ => return false,
        };
        let success = job.stop_recording();
        self.addons.lock().stop_recording();
        rec.recording_job = None;
        success
    }

    fn is_recording_locked(rec: &RecState) -> bool {
        matches!(&rec.recording_job, Some(job) if job.get_main_state() == JobState::Recording)
    }

    fn current_pre_buffer_length_locked(&self, rec: &RecState) -> (usize, Duration) {
        let length = match rec.pre_buffer.front() {
            Some(front) => self.clocks.monotonic() - front.monotonic_receive_time,
            None => Duration::ZERO,
        };
        (rec.pre_buffer.len(), length)
    }

    fn set_info(&self, healthy: bool, message: impl Into<String>) {
        let mut rec = self.rec.lock();
        Self::set_info_locked(&mut rec, healthy, message);
    }

    fn set_info_locked(rec: &mut RecState, healthy: bool, message: impl Into<String>) {
        rec.healthy = healthy;
        rec.message = message.into();
    }

    /// Text dump stored as `system_information.txt` in every measurement.
    fn system_information(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(out, "nightjar {}", env!("CARGO_PKG_VERSION"));
        let _ = writeln!(out, "host: {}", self.host_name);
        let _ = writeln!(out, "pid: {}", std::process::id());
        let timestamp = self.clocks.realtime();
        if let Ok(ts) = jiff::Timestamp::from_microsecond(timestamp.as_micros()) {
            let _ = writeln!(out, "time: {ts}");
        }
        let bus_state = self.bus_state.lock();
        let _ = writeln!(out, "connected: {}", bus_state.connected);
        let _ = writeln!(out, "record mode: {:?}", bus_state.record_mode);
        if !bus_state.listed_topics.is_empty() {
            let _ = writeln!(
                out,
                "listed topics: {}",
                bus_state.listed_topics.iter().join("; ")
            );
        }
        if !bus_state.hosts_filter.is_empty() {
            let _ = writeln!(
                out,
                "host filter: {}",
                bus_state.hosts_filter.iter().join("; ")
            );
        }
        let _ = writeln!(out, "subscribed topics: {}", bus_state.subscriptions.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{LoopbackBus, TopicInfo};
    use crate::testutil::{self, MockOpener};
    use base::clock::SimulatedClocks;
    use base::time::Time;

    /// Long timer periods: the tests drive monitoring and GC by hand.
    fn quiet_config(max_len: Duration, enabled: bool) -> EngineConfig {
        EngineConfig::new(max_len, enabled)
            .without_addons()
            .with_periods(
                std::time::Duration::from_secs(3600),
                std::time::Duration::from_secs(3600),
            )
    }

    fn bus_with_topic(topic: &str) -> Arc<LoopbackBus> {
        let bus = Arc::new(LoopbackBus::new());
        bus.add_publisher(topic, "host1", "p1", TopicInfo::default());
        bus
    }

    fn job_config(root: &std::path::Path, id: i64, name: &str) -> JobConfig {
        JobConfig::new(id)
            .with_root_dir(root.to_string_lossy().into_owned())
            .with_name(name)
    }

    #[test]
    fn pre_buffer_eviction_by_age() {
        testutil::init();
        let clocks = SimulatedClocks::new(Time(1_000_000_000));
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            clocks.clone(),
            bus.clone(),
            MockOpener::new(),
            quiet_config(Duration::from_millis(500), true),
        );
        recorder.update_monitoring();
        recorder.connect();

        // Frames at 0, 100, ..., 1000 ms.
        for i in 0..=10 {
            bus.publish("a", b"x", clocks.realtime(), i);
            if i < 10 {
                clocks.sleep(Duration::from_millis(100));
            }
        }
        assert_eq!(recorder.get_current_pre_buffer_length().0, 11);

        recorder.garbage_collect();
        let (count, length) = recorder.get_current_pre_buffer_length();
        assert_eq!(count, 6);
        assert_eq!(length, Duration::from_millis(500));
    }

    #[test]
    fn start_stop_records_pre_buffer_and_live_frames() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let opener = MockOpener::new();
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            opener.clone(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        recorder.connect();
        assert_eq!(recorder.subscribed_topics().len(), 1);

        for i in 0..20 {
            bus.publish("a", b"frame", Time(i * 1000), i);
        }
        assert!(recorder.start_recording(&job_config(root.path(), 42, "m1")));
        for i in 20..30 {
            bus.publish("a", b"frame", Time(i * 1000), i);
        }
        assert!(recorder.stop_recording());
        assert!(!recorder.stop_recording());

        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || {
                recorder
                    .get_status()
                    .jobs
                    .iter()
                    .any(|j| j.job_id == 42 && j.state == JobState::FinishedFlushing)
            }
        ));
        let status = recorder.get_status();
        let job = status.jobs.iter().find(|j| j.job_id == 42).unwrap();
        assert_eq!(job.writer.total_frame_count, 30);
        assert_eq!(job.writer.unflushed_frame_count, 0);
        let clocks: Vec<i64> = opener.entries().iter().map(|e| e.clock).collect();
        assert_eq!(clocks, (0..30).collect::<Vec<i64>>());
    }

    #[test]
    fn only_one_job_records_at_a_time() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus,
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        assert!(recorder.start_recording(&job_config(root.path(), 1, "m1")));
        assert!(!recorder.start_recording(&job_config(root.path(), 2, "m2")));
        assert!(!recorder.get_status().healthy);

        let status = recorder.get_status();
        assert_eq!(
            status
                .jobs
                .iter()
                .filter(|j| j.state == JobState::Recording)
                .count(),
            1
        );
        assert!(recorder.stop_recording());
    }

    #[test]
    fn path_collision_is_rejected() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus,
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        assert!(recorder.start_recording(&job_config(root.path(), 42, "m1")));
        assert!(recorder.stop_recording());
        // Even after the first job stops, its path stays taken.
        assert!(!recorder.start_recording(&job_config(root.path(), 44, "m1")));
        let status = recorder.get_status();
        assert!(!status.healthy);
        assert!(status.message.contains("is used by measurement 42"), "{}", status.message);
    }

    #[test]
    fn save_pre_buffer_while_recording() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let opener = MockOpener::new();
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            opener.clone(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        recorder.connect();

        for i in 0..10 {
            bus.publish("a", b"x", Time(i * 1000), i);
        }
        assert!(recorder.start_recording(&job_config(root.path(), 42, "m1")));
        assert!(recorder.save_pre_buffered_data(&job_config(root.path(), 43, "m2")));

        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || {
                recorder
                    .get_status()
                    .jobs
                    .iter()
                    .any(|j| j.job_id == 43 && j.state == JobState::FinishedFlushing)
            }
        ));
        let status = recorder.get_status();
        let snapshot = status.jobs.iter().find(|j| j.job_id == 43).unwrap();
        assert_eq!(snapshot.writer.total_frame_count, 10);
        let live = status.jobs.iter().find(|j| j.job_id == 42).unwrap();
        assert_eq!(live.state, JobState::Recording);
        assert!(recorder.stop_recording());
    }

    #[test]
    fn save_pre_buffer_requires_buffering() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus,
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), false),
        );
        recorder.update_monitoring();
        // Not connected yet.
        assert!(!recorder.save_pre_buffered_data(&job_config(root.path(), 1, "m")));
        recorder.connect();
        // Buffering disabled.
        assert!(!recorder.save_pre_buffered_data(&job_config(root.path(), 1, "m")));
        assert!(!recorder.get_status().healthy);
    }

    #[test]
    fn empty_target_path_is_rejected() {
        testutil::init();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus,
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        assert!(!recorder.start_recording(&JobConfig::new(1)));
        let status = recorder.get_status();
        assert!(status.message.contains("target path not set"));
    }

    #[test]
    fn filter_purity() {
        let mut topics = TopicInfoMap::new();
        let mut with_pub = TopicInfo::default();
        with_pub
            .publishers
            .entry("host1".to_owned())
            .or_default()
            .insert("p1".to_owned());
        topics.insert("a".to_owned(), with_pub.clone());
        topics.insert("b".to_owned(), with_pub.clone());
        topics.insert("orphan".to_owned(), TopicInfo::default());

        let none = BTreeSet::new();
        let listed: BTreeSet<String> = ["a".to_owned()].into_iter().collect();

        let all = filter_topics(&topics, RecordMode::All, &none, &none);
        assert_eq!(all.iter().collect::<Vec<_>>(), ["a", "b"]);

        let blacklisted = filter_topics(&topics, RecordMode::Blacklist, &listed, &none);
        assert_eq!(blacklisted.iter().collect::<Vec<_>>(), ["b"]);

        let whitelisted = filter_topics(&topics, RecordMode::Whitelist, &listed, &none);
        assert_eq!(whitelisted.iter().collect::<Vec<_>>(), ["a"]);

        let other_host: BTreeSet<String> = ["host2".to_owned()].into_iter().collect();
        assert!(filter_topics(&topics, RecordMode::All, &none, &other_host).is_empty());
        let matching_host: BTreeSet<String> = ["host1".to_owned()].into_iter().collect();
        assert_eq!(
            filter_topics(&topics, RecordMode::All, &none, &matching_host).len(),
            2
        );
    }

    #[test]
    fn filter_changes_reconcile_subscribers_and_clear_buffer() {
        testutil::init();
        let bus = Arc::new(LoopbackBus::new());
        bus.add_publisher("a", "host1", "p1", TopicInfo::default());
        bus.add_publisher("b", "host1", "p1", TopicInfo::default());
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        recorder.connect();
        assert_eq!(recorder.subscribed_topics().len(), 2);

        bus.publish("a", b"x", Time(0), 0);
        assert_eq!(recorder.get_current_pre_buffer_length().0, 1);

        let listed: BTreeSet<String> = ["a".to_owned()].into_iter().collect();
        assert!(recorder.set_record_mode(RecordMode::Whitelist, listed));
        assert_eq!(
            recorder.subscribed_topics().iter().collect::<Vec<_>>(),
            ["a"]
        );
        assert_eq!(bus.subscriber_count("b"), 0);
        // Changing the filter wipes the pre-buffer.
        assert_eq!(recorder.get_current_pre_buffer_length().0, 0);
    }

    #[test]
    fn filter_changes_refused_while_recording() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus,
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        assert!(recorder.start_recording(&job_config(root.path(), 1, "m1")));
        assert!(!recorder.set_host_filter(["host2".to_owned()].into_iter().collect()));
        assert!(!recorder.set_record_mode(RecordMode::Whitelist, BTreeSet::new()));
        assert!(recorder.stop_recording());
        assert!(recorder.set_host_filter(BTreeSet::new()));
    }

    #[test]
    fn disconnect_stops_recording_and_clears_buffer() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        recorder.connect();
        bus.publish("a", b"x", Time(0), 0);
        assert!(recorder.start_recording(&job_config(root.path(), 1, "m1")));

        recorder.disconnect();
        assert!(!recorder.is_connected());
        assert_eq!(recorder.get_current_pre_buffer_length().0, 0);
        assert!(recorder.subscribed_topics().is_empty());
        let status = recorder.get_status();
        let job = status.jobs.iter().find(|j| j.job_id == 1).unwrap();
        assert!(matches!(
            job.state,
            JobState::Flushing | JobState::FinishedFlushing
        ));
    }

    #[test]
    fn delete_measurement_by_id() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            MockOpener::new(),
            quiet_config(Duration::from_secs(10), true),
        );
        recorder.update_monitoring();
        recorder.connect();
        bus.publish("a", b"x", Time(0), 0);
        assert!(recorder.save_pre_buffered_data(&job_config(root.path(), 7, "m1")));
        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || {
                recorder
                    .get_status()
                    .jobs
                    .iter()
                    .any(|j| j.state == JobState::FinishedFlushing)
            }
        ));

        assert_eq!(
            recorder.delete_measurement(8).unwrap_err().kind(),
            base::ErrorKind::MeasIdNotFound
        );
        recorder.delete_measurement(7).unwrap();
        assert!(!root.path().join("m1").exists());
        assert!(recorder.get_status().jobs.iter().any(|j| j.is_deleted));
    }

    #[test]
    fn timers_run_and_shut_down() {
        testutil::init();
        let bus = bus_with_topic("a");
        let recorder = Recorder::new(
            base::clock::RealClocks {},
            bus.clone(),
            MockOpener::new(),
            EngineConfig::new(Duration::from_millis(50), true)
                .without_addons()
                .with_periods(
                    std::time::Duration::from_millis(20),
                    std::time::Duration::from_millis(20),
                ),
        );
        recorder.connect();
        // The monitoring timer discovers topic `a` on its own.
        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || recorder.subscribed_topics().len() == 1
        ));
        bus.publish("a", b"x", Time(0), 0);
        // The GC timer trims the 50 ms pre-buffer on its own.
        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || recorder.get_current_pre_buffer_length().0 == 0
        ));
        drop(recorder);
    }
}
