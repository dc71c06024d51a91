// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! One record job: the state machine around a writer worker and (optionally)
//! an upload worker, plus the measurement directory it owns.

use crate::addon::{AddonJobState, AddonJobStatus};
use crate::frame::Frame;
use crate::job_config::JobConfig;
use crate::meas::MeasurementOpener;
use crate::pubsub::TopicInfoMap;
use crate::upload::{self, UploadConfig, UploadStatus, UploadWorker};
use crate::writer::{WriterStatus, WriterWorker};
use base::{bail, err, Error, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Main recorder state of one job. States only ever advance in the declared
/// order (the upload states apply only to jobs that upload).
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub enum JobState {
    NotStarted,
    Recording,
    Flushing,
    FinishedFlushing,
    Uploading,
    FinishedUploading,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub job_id: i64,
    pub state: JobState,
    pub is_deleted: bool,
    pub writer: WriterStatus,
    pub addons: BTreeMap<String, AddonJobStatus>,
    pub upload: UploadStatus,
}

struct Inner {
    state: JobState,
    writer: Option<WriterWorker>,
    upload: Option<UploadWorker>,
    addon_statuses: BTreeMap<String, AddonJobStatus>,
    safe_to_delete_dir: bool,
    is_deleted: bool,
    healthy: bool,
    message: String,
    files_with_metadata: Vec<PathBuf>,
}

pub struct RecordJob {
    job_config: JobConfig,
    host_name: String,
    inner: RwLock<Inner>,
}

impl RecordJob {
    /// Takes an already-evaluated [`JobConfig`].
    pub fn new(evaluated_job_config: JobConfig, host_name: impl Into<String>) -> Self {
        RecordJob {
            job_config: evaluated_job_config,
            host_name: host_name.into(),
            inner: RwLock::new(Inner {
                state: JobState::NotStarted,
                writer: None,
                upload: None,
                addon_statuses: BTreeMap::new(),
                safe_to_delete_dir: false,
                is_deleted: false,
                healthy: true,
                message: String::new(),
                files_with_metadata: Vec::new(),
            }),
        }
    }

    pub fn job_config(&self) -> &JobConfig {
        &self.job_config
    }

    /// Creates the measurement directory skeleton: `doc/` with the
    /// description, the host directory with a runtime-information dump and a
    /// best-effort copy of the middleware config, and the measurement marker
    /// file. Records which of these are metadata files so uploads can skip
    /// them on demand. The directory may only be deleted later if it did not
    /// exist or was empty when entered.
    pub fn initialize_measurement_directory(
        &self,
        system_information: &str,
        middleware_config: Option<&Path>,
    ) -> Result<(), Error> {
        let measurement_path = self.job_config.complete_measurement_path().to_owned();
        let mut inner = self.inner.write();

        match std::fs::read_dir(&measurement_path) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    inner.safe_to_delete_dir = true;
                } else {
                    warn!("the measurement folder {:?} is not empty", measurement_path);
                }
            }
            Err(_) => inner.safe_to_delete_dir = true,
        }

        let doc_dir = measurement_path.join("doc");
        if let Err(e) = std::fs::create_dir_all(&doc_dir) {
            let message = format!("Error creating directory {doc_dir:?}");
            inner.healthy = false;
            inner.message = message.clone();
            error!("{message}");
            return Err(err!(ResourceUnavailable, source(e), msg("{message}")));
        }

        let host_dir = measurement_path.join(&self.host_name);
        if let Err(e) = std::fs::create_dir_all(&host_dir) {
            let message = format!("Error creating directory {host_dir:?}");
            inner.healthy = false;
            inner.message = message.clone();
            error!("{message}");
            return Err(err!(ResourceUnavailable, source(e), msg("{message}")));
        }

        let system_information_path = host_dir.join("system_information.txt");
        if let Err(e) = std::fs::write(&system_information_path, system_information) {
            let message = format!("Error creating file {system_information_path:?}");
            inner.healthy = false;
            inner.message = message.clone();
            error!(err = %e, "{message}");
        }

        if let Some(config_path) = middleware_config {
            let dest = host_dir.join("ecal.yaml");
            info!("copying middleware config from {:?} to {:?}", config_path, dest);
            if let Err(e) = std::fs::copy(config_path, &dest) {
                let message = format!("Error copying middleware config to {dest:?}");
                inner.healthy = false;
                inner.message = message.clone();
                error!(err = %e, "{message}");
            }
        }

        let mut marker_name = measurement_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if marker_name.is_empty() || marker_name == "." || marker_name == ".." {
            marker_name = "measurement".to_owned();
        }
        marker_name.push_str(".ecalmeas");
        let marker_path = measurement_path.join(&marker_name);
        info!("creating measurement marker {:?}", marker_path);
        // For mimetype detection the marker file must not be empty.
        if let Err(e) = std::fs::write(&marker_path, " ") {
            let message = format!("Error creating file {marker_path:?}");
            inner.healthy = false;
            inner.message = message.clone();
            error!("{message}");
            return Err(err!(ResourceUnavailable, source(e), msg("{message}")));
        }
        inner.files_with_metadata.push(PathBuf::from(&marker_name));

        let description_path = measurement_path.join("doc/description.txt");
        info!("saving description to {:?}", description_path);
        if let Err(e) = std::fs::write(&description_path, &self.job_config.description) {
            let message = "Error saving description: cannot open file".to_owned();
            inner.healthy = false;
            inner.message = message.clone();
            error!("{message}");
            return Err(err!(ResourceUnavailable, source(e), msg("{message}")));
        }
        inner
            .files_with_metadata
            .push(PathBuf::from("doc/description.txt"));

        Ok(())
    }

    /// Legal only in `NotStarted`: starts the writer worker and enters
    /// `Recording`.
    pub fn start_recording<O: MeasurementOpener>(
        &self,
        initial_topic_info: TopicInfoMap,
        seed_frames: VecDeque<Arc<Frame>>,
        opener: O,
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.state != JobState::NotStarted {
            return false;
        }
        inner.writer = Some(WriterWorker::spawn(
            opener,
            self.job_config.clone(),
            self.host_name.clone(),
            initial_topic_info,
            seed_frames,
            false,
        ));
        inner.state = JobState::Recording;
        true
    }

    /// Legal only in `Recording`: tells the writer to flush and enters
    /// `Flushing`.
    pub fn stop_recording(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.state != JobState::Recording {
            return false;
        }
        match inner.writer.as_ref() {
            Some(writer) => writer.flush(),
            None => return false,
        }
        inner.state = JobState::Flushing;
        true
    }

    /// Legal only in `NotStarted`: starts a writer that immediately drains
    /// `seed_frames` and enters `Flushing`.
    pub fn save_buffer<O: MeasurementOpener>(
        &self,
        initial_topic_info: TopicInfoMap,
        seed_frames: VecDeque<Arc<Frame>>,
        opener: O,
    ) -> bool {
        let mut inner = self.inner.write();
        if inner.state != JobState::NotStarted {
            return false;
        }
        inner.writer = Some(WriterWorker::spawn(
            opener,
            self.job_config.clone(),
            self.host_name.clone(),
            initial_topic_info,
            seed_frames,
            true,
        ));
        inner.state = JobState::Flushing;
        true
    }

    /// Hands a frame to the writer queue. Returns `false` unless the job is
    /// `Recording`.
    pub fn add_frame(&self, frame: Arc<Frame>) -> bool {
        let inner = self.inner.read();
        if inner.state != JobState::Recording {
            return false;
        }
        match inner.writer.as_ref() {
            Some(writer) => writer.add_frame(frame),
            None => false,
        }
    }

    pub fn set_topic_info(&self, topic_info: TopicInfoMap) {
        let inner = self.inner.read();
        if inner.state != JobState::Recording {
            return;
        }
        if let Some(writer) = inner.writer.as_ref() {
            writer.set_topic_info(topic_info);
        }
    }

    /// Starts uploading the finished measurement. Refused while the job (or
    /// any add-on part of it) is still recording or flushing, while another
    /// upload runs, or after deletion.
    pub fn upload(self: &Arc<Self>, upload_config: &UploadConfig) -> Result<(), Error> {
        let mut inner = self.inner.write();
        Self::update_state_locked(&mut inner);

        let result = if inner.is_deleted {
            Err(err!(MeasIsDeleted))
        } else if inner.state == JobState::Recording
            || Self::any_addon_state_is(&inner, AddonJobState::Recording)
        {
            Err(err!(CurrentlyRecording))
        } else if inner.state == JobState::Flushing
            || Self::any_addon_state_is(&inner, AddonJobState::Flushing)
        {
            Err(err!(CurrentlyFlushing))
        } else if inner.state == JobState::Uploading {
            Err(err!(CurrentlyUploading))
        } else {
            let post_upload: Option<upload::PostUploadFn> = if upload_config.delete_after_upload {
                let job = Arc::clone(self);
                Some(Box::new(move || {
                    if let Err(e) = job.delete_measurement_impl(true) {
                        warn!(err = %e.chain(), "delete after upload failed");
                    }
                }))
            } else {
                None
            };
            if let Some(mut old) = inner.upload.take() {
                old.interrupt();
                old.join();
            }
            upload::spawn_upload(
                self.job_config.complete_measurement_path().to_owned(),
                inner.files_with_metadata.clone(),
                upload_config,
                post_upload,
            )
            .map(|worker| {
                inner.upload = Some(worker);
                inner.state = JobState::Uploading;
            })
        };

        if let Err(e) = &result {
            inner.healthy = false;
            inner.message = format!("Error uploading measurement: {e}");
            error!("{}", inner.message);
        }
        result
    }

    /// Appends a blank line and `comment` to `doc/description.txt`. Refused
    /// while uploading or after deletion.
    pub fn add_comment(&self, comment: &str) -> Result<(), Error> {
        {
            let mut inner = self.inner.write();
            Self::update_state_locked(&mut inner);
            if inner.is_deleted {
                let e = err!(MeasIsDeleted);
                inner.healthy = false;
                inner.message = format!("Error adding comment: {e}");
                return Err(e);
            }
            if inner.state == JobState::Uploading {
                let e = err!(CurrentlyUploading);
                inner.healthy = false;
                inner.message = format!("Error adding comment: {e}");
                return Err(e);
            }
        }

        let description_path = self
            .job_config
            .complete_measurement_path()
            .join("doc/description.txt");
        let appended = std::fs::OpenOptions::new()
            .append(true)
            .open(&description_path)
            .and_then(|mut f| write!(f, "\n{comment}"));
        match appended {
            Ok(()) => {
                info!("added comment to {:?}", description_path);
                Ok(())
            }
            Err(e) => {
                let e = err!(
                    ResourceUnavailable,
                    source(e),
                    msg("{}", description_path.display())
                );
                let mut inner = self.inner.write();
                inner.healthy = false;
                inner.message = format!("Error adding comment: {e}");
                error!("{}", inner.message);
                Err(e)
            }
        }
    }

    pub fn delete_measurement(&self) -> Result<(), Error> {
        self.delete_measurement_impl(false)
    }

    fn delete_measurement_impl(&self, omit_uploading_check: bool) -> Result<(), Error> {
        let measurement_path = self.job_config.complete_measurement_path().to_owned();
        {
            let mut inner = self.inner.write();
            Self::update_state_locked(&mut inner);

            let check: Result<(), Error> = if inner.is_deleted {
                Err(err!(MeasIsDeleted))
            } else if inner.state == JobState::Recording
                || Self::any_addon_state_is(&inner, AddonJobState::Recording)
            {
                Err(err!(CurrentlyRecording))
            } else if inner.state == JobState::Flushing
                || Self::any_addon_state_is(&inner, AddonJobState::Flushing)
            {
                Err(err!(CurrentlyFlushing))
            } else if !omit_uploading_check && inner.state == JobState::Uploading {
                Err(err!(CurrentlyUploading))
            } else if !measurement_path.exists() {
                Err(err!(ResourceUnavailable, msg("{}", measurement_path.display())))
            } else if !inner.safe_to_delete_dir {
                Err(err!(
                    DirNotEmpty,
                    msg(
                        "{:?} already contained files when the measurement was started",
                        measurement_path
                    )
                ))
            } else {
                Ok(())
            };
            if let Err(e) = check {
                inner.healthy = false;
                inner.message = format!("Error deleting measurement: {e}");
                return Err(e);
            }
        }

        let removed = std::fs::remove_dir_all(&measurement_path);

        let mut inner = self.inner.write();
        match removed {
            Ok(()) => {
                inner.is_deleted = true;
                Ok(())
            }
            Err(e) => {
                let e = err!(Unknown, source(e), msg("failed deleting {:?}", measurement_path));
                inner.healthy = false;
                inner.message = format!("Error deleting measurement: {e}");
                Err(e)
            }
        }
    }

    /// Mirrors one add-on's view of this job, as reported by the add-on's
    /// status worker.
    pub fn set_addon_status(&self, addon_id: &str, status: AddonJobStatus) {
        self.inner
            .write()
            .addon_statuses
            .insert(addon_id.to_owned(), status);
    }

    /// Performs a state-update pass (reaping exited workers) and snapshots.
    pub fn get_job_status(&self) -> JobStatus {
        self.refresh_state();
        let inner = self.inner.read();
        let mut writer_status = inner
            .writer
            .as_ref()
            .map(|w| w.get_status())
            .unwrap_or_default();
        // Job-level problems surface through the writer slot when the writer
        // itself is fine.
        if writer_status.healthy {
            writer_status.healthy = inner.healthy;
            writer_status.message = inner.message.clone();
        }
        JobStatus {
            job_id: self.job_config.job_id,
            state: inner.state,
            is_deleted: inner.is_deleted,
            writer: writer_status,
            addons: inner.addon_statuses.clone(),
            upload: inner
                .upload
                .as_ref()
                .map(|u| u.get_status())
                .unwrap_or_default(),
        }
    }

    pub fn get_main_state(&self) -> JobState {
        self.refresh_state();
        self.inner.read().state
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.read().is_deleted
    }

    /// Advances `Flushing` to `FinishedFlushing` and `Uploading` to
    /// `FinishedUploading` once the respective worker has exited.
    pub fn refresh_state(&self) {
        let mut inner = self.inner.write();
        Self::update_state_locked(&mut inner);
    }

    pub fn interrupt(&self) {
        let inner = self.inner.read();
        if let Some(writer) = inner.writer.as_ref() {
            writer.interrupt();
        }
        if let Some(upload) = inner.upload.as_ref() {
            upload.interrupt();
        }
    }

    fn update_state_locked(inner: &mut Inner) {
        if inner.is_deleted {
            return;
        }
        match inner.state {
            JobState::Flushing => {
                if let Some(writer) = inner.writer.as_ref() {
                    if !writer.is_running() || !writer.is_flushing() {
                        inner.state = JobState::FinishedFlushing;
                    }
                }
            }
            JobState::Uploading => {
                if let Some(upload) = inner.upload.as_ref() {
                    if !upload.is_running() {
                        inner.state = JobState::FinishedUploading;
                    }
                }
            }
            _ => {}
        }
    }

    fn any_addon_state_is(inner: &Inner, state: AddonJobState) -> bool {
        inner.addon_statuses.values().any(|s| s.state == state)
    }
}

/// A path-collision probe used by the engine: an error if this job is
/// non-deleted, started, and writing to `path`.
pub fn job_uses_path(job: &RecordJob, path: &Path) -> Result<(), Error> {
    if !job.is_deleted()
        && job.get_main_state() != JobState::NotStarted
        && job.job_config().complete_measurement_path() == path
    {
        bail!(
            DirNotEmpty,
            msg(
                "{:?} is used by measurement {}",
                path,
                job.job_config().job_id
            )
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, MockOpener};
    use base::time::Time;
    use base::ErrorKind;
    use crate::upload::UploadTarget;

    fn evaluated_config(root: &Path, name: &str) -> JobConfig {
        JobConfig::new(42)
            .with_root_dir(root.to_string_lossy().into_owned())
            .with_name(name)
            .with_description("a test measurement")
            .evaluate(Time(0), "host1")
    }

    fn seed(n: i64) -> VecDeque<Arc<Frame>> {
        (0..n)
            .map(|i| testutil::frame("a", vec![0u8; 8], i * 10))
            .collect()
    }

    fn wait_for_state(job: &RecordJob, state: JobState) {
        assert!(
            testutil::wait_until(std::time::Duration::from_secs(10), || {
                job.get_main_state() == state
            }),
            "job stuck in {:?}",
            job.get_main_state()
        );
    }

    #[test]
    fn initialize_creates_layout() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let job = RecordJob::new(evaluated_config(root.path(), "m1"), "host1");
        job.initialize_measurement_directory("sysinfo dump", None)
            .unwrap();

        let meas = root.path().join("m1");
        assert_eq!(
            std::fs::read_to_string(meas.join("doc/description.txt")).unwrap(),
            "a test measurement"
        );
        assert_eq!(
            std::fs::read_to_string(meas.join("m1.ecalmeas")).unwrap(),
            " "
        );
        assert_eq!(
            std::fs::read_to_string(meas.join("host1/system_information.txt")).unwrap(),
            "sysinfo dump"
        );
    }

    #[test]
    fn initialize_copies_middleware_config() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let config_file = root.path().join("ecal.yaml");
        std::fs::write(&config_file, "layer: udp\n").unwrap();
        let job = RecordJob::new(evaluated_config(root.path(), "m1"), "host1");
        job.initialize_measurement_directory("", Some(&config_file))
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("m1/host1/ecal.yaml")).unwrap(),
            "layer: udp\n"
        );
    }

    #[test]
    fn record_stop_reaches_finished_flushing() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let opener = MockOpener::new();
        let job = RecordJob::new(evaluated_config(root.path(), "m1"), "host1");
        job.initialize_measurement_directory("", None).unwrap();

        assert_eq!(job.get_main_state(), JobState::NotStarted);
        assert!(!job.stop_recording());
        assert!(!job.add_frame(testutil::frame("a", vec![], 0)));

        assert!(job.start_recording(TopicInfoMap::new(), seed(2), opener.clone()));
        assert!(!job.start_recording(TopicInfoMap::new(), seed(0), opener.clone()));
        assert_eq!(job.get_main_state(), JobState::Recording);
        assert!(job.add_frame(testutil::frame("a", vec![], 100)));

        assert!(job.stop_recording());
        assert!(!job.add_frame(testutil::frame("a", vec![], 200)));
        wait_for_state(&job, JobState::FinishedFlushing);

        let status = job.get_job_status();
        assert_eq!(status.writer.total_frame_count, 3);
        assert_eq!(status.writer.unflushed_frame_count, 0);
        assert_eq!(opener.entries().len(), 3);
    }

    #[test]
    fn save_buffer_goes_straight_to_flushing() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let opener = MockOpener::new();
        let job = RecordJob::new(evaluated_config(root.path(), "m2"), "host1");
        job.initialize_measurement_directory("", None).unwrap();
        assert!(job.save_buffer(TopicInfoMap::new(), seed(5), opener.clone()));
        wait_for_state(&job, JobState::FinishedFlushing);
        assert_eq!(opener.entries().len(), 5);
    }

    #[test]
    fn state_observations_are_monotonic() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let job = RecordJob::new(evaluated_config(root.path(), "m3"), "host1");
        job.initialize_measurement_directory("", None).unwrap();
        let mut last = job.get_main_state();
        assert!(job.start_recording(TopicInfoMap::new(), seed(1), MockOpener::new()));
        assert!(job.stop_recording());
        for _ in 0..100 {
            let state = job.get_main_state();
            assert!(state >= last, "{state:?} after {last:?}");
            last = state;
            if state == JobState::FinishedFlushing {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn delete_rules() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let opener = MockOpener::new();
        let job = RecordJob::new(evaluated_config(root.path(), "m4"), "host1");
        job.initialize_measurement_directory("", None).unwrap();

        assert!(job.start_recording(TopicInfoMap::new(), seed(0), opener.clone()));
        assert_eq!(
            job.delete_measurement().unwrap_err().kind(),
            ErrorKind::CurrentlyRecording
        );
        assert!(job.stop_recording());
        wait_for_state(&job, JobState::FinishedFlushing);

        job.delete_measurement().unwrap();
        assert!(job.is_deleted());
        assert!(!root.path().join("m4").exists());
        assert_eq!(
            job.delete_measurement().unwrap_err().kind(),
            ErrorKind::MeasIsDeleted
        );
        assert_eq!(
            job.add_comment("too late").unwrap_err().kind(),
            ErrorKind::MeasIsDeleted
        );
    }

    #[test]
    fn delete_refused_for_preexisting_dir() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let meas = root.path().join("m5");
        std::fs::create_dir_all(&meas).unwrap();
        std::fs::write(meas.join("precious.txt"), b"keep me").unwrap();

        let job = RecordJob::new(evaluated_config(root.path(), "m5"), "host1");
        job.initialize_measurement_directory("", None).unwrap();
        assert_eq!(
            job.delete_measurement().unwrap_err().kind(),
            ErrorKind::DirNotEmpty
        );
        assert!(meas.join("precious.txt").exists());
    }

    #[test]
    fn add_comment_appends() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let job = RecordJob::new(evaluated_config(root.path(), "m6"), "host1");
        job.initialize_measurement_directory("", None).unwrap();
        job.add_comment("first comment").unwrap();
        job.add_comment("second comment").unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("m6/doc/description.txt")).unwrap(),
            "a test measurement\nfirst comment\nsecond comment"
        );
    }

    #[test]
    fn upload_and_delete_after_upload() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordJob::new(evaluated_config(root.path(), "m7"), "host1"));
        job.initialize_measurement_directory("", None).unwrap();
        assert!(job.save_buffer(TopicInfoMap::new(), seed(1), MockOpener::new()));
        wait_for_state(&job, JobState::FinishedFlushing);

        let config = UploadConfig {
            meas_id: 42,
            target: UploadTarget::Directory(target.path().to_owned()),
            upload_path: "up".to_owned(),
            upload_metadata_files: true,
            delete_after_upload: true,
        };
        job.upload(&config).unwrap();
        assert!(testutil::wait_until(
            std::time::Duration::from_secs(10),
            || job.is_deleted()
        ));
        // Deletion freezes the state machine.
        assert_eq!(job.get_main_state(), JobState::Uploading);
        assert!(target.path().join("up/m7.ecalmeas").exists());
        assert!(!root.path().join("m7").exists());
    }

    #[test]
    fn upload_reaches_finished_uploading() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordJob::new(evaluated_config(root.path(), "m7b"), "host1"));
        job.initialize_measurement_directory("", None).unwrap();
        assert!(job.save_buffer(TopicInfoMap::new(), seed(1), MockOpener::new()));
        wait_for_state(&job, JobState::FinishedFlushing);

        let config = UploadConfig {
            meas_id: 42,
            target: UploadTarget::Directory(target.path().to_owned()),
            upload_path: String::new(),
            upload_metadata_files: true,
            delete_after_upload: false,
        };
        job.upload(&config).unwrap();
        wait_for_state(&job, JobState::FinishedUploading);
        assert!(root.path().join("m7b").exists());
        let status = job.get_job_status();
        assert!(status.upload.healthy);
        assert_eq!(status.upload.files_uploaded, status.upload.files_total);
    }

    #[test]
    fn upload_refused_while_recording() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let job = Arc::new(RecordJob::new(evaluated_config(root.path(), "m8"), "host1"));
        job.initialize_measurement_directory("", None).unwrap();
        assert!(job.start_recording(TopicInfoMap::new(), seed(0), MockOpener::new()));
        let config = UploadConfig {
            meas_id: 42,
            target: UploadTarget::Directory(target.path().to_owned()),
            upload_path: String::new(),
            upload_metadata_files: true,
            delete_after_upload: false,
        };
        assert_eq!(
            job.upload(&config).unwrap_err().kind(),
            ErrorKind::CurrentlyRecording
        );
    }

    #[test]
    fn addon_state_blocks_deletion() {
        testutil::init();
        let root = tempfile::tempdir().unwrap();
        let job = RecordJob::new(evaluated_config(root.path(), "m9"), "host1");
        job.initialize_measurement_directory("", None).unwrap();
        job.set_addon_status(
            "cam",
            AddonJobStatus {
                state: AddonJobState::Flushing,
                ..Default::default()
            },
        );
        assert_eq!(
            job.delete_measurement().unwrap_err().kind(),
            ErrorKind::CurrentlyFlushing
        );
        job.set_addon_status(
            "cam",
            AddonJobStatus {
                state: AddonJobState::FinishedFlushing,
                ..Default::default()
            },
        );
        job.delete_measurement().unwrap();
    }
}
