// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Recorder add-on orchestration: subprocess pipe, per-addon session, and
//! the manager that discovers and fans control out to add-ons.

pub mod host;
pub mod manager;
pub mod pipe;
pub mod session;

pub use manager::AddonManager;
pub use session::AddonSession;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Graceful-close hint written to an add-on's stdin: a single FS byte.
pub const EOT: char = '\u{1c}';

/// Add-on-side record job state, as carried on the wire by `job_statuses`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum AddonJobState {
    #[default]
    NotStarted,
    Recording,
    Flushing,
    FinishedFlushing,
}

impl AddonJobState {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            AddonJobState::NotStarted => "not started",
            AddonJobState::Recording => "recording",
            AddonJobState::Flushing => "flushing",
            AddonJobState::FinishedFlushing => "finished",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "not started" => Some(AddonJobState::NotStarted),
            "recording" => Some(AddonJobState::Recording),
            "flushing" => Some(AddonJobState::Flushing),
            "finished" => Some(AddonJobState::FinishedFlushing),
            _ => None,
        }
    }
}

/// One add-on's view of one record job, mirrored into the owning
/// [`crate::job::RecordJob`] by the session's status worker.
#[derive(Clone, Debug, Serialize)]
pub struct AddonJobStatus {
    pub state: AddonJobState,
    pub total_frame_count: i64,
    pub unflushed_frame_count: i64,
    pub healthy: bool,
    pub message: String,
}

impl Default for AddonJobStatus {
    fn default() -> Self {
        AddonJobStatus {
            state: AddonJobState::NotStarted,
            total_frame_count: 0,
            unflushed_frame_count: 0,
            healthy: true,
            message: String::new(),
        }
    }
}

/// Mirrored status of one add-on session.
#[derive(Clone, Debug, Serialize)]
pub struct AddonStatus {
    pub executable_path: PathBuf,
    pub addon_id: String,
    pub name: String,
    pub description: String,
    pub initialized: bool,
    pub pre_buffer_frame_count: i64,
    pub healthy: bool,
    pub message: String,
}

impl AddonStatus {
    fn new(executable_path: PathBuf) -> Self {
        AddonStatus {
            executable_path,
            addon_id: String::new(),
            name: String::new(),
            description: String::new(),
            initialized: false,
            pre_buffer_frame_count: 0,
            healthy: true,
            message: String::new(),
        }
    }
}

/// Callback the engine supplies so sessions can mirror per-job add-on status
/// into the matching record job.
pub type SetJobStatusFn = Arc<dyn Fn(i64, &str, AddonJobStatus) + Send + Sync>;
