// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Per-job configuration and its one-shot placeholder evaluation.

use base::time::Time;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configuration of one record job.
///
/// Callers construct it with placeholder-bearing directory/name strings;
/// [`JobConfig::evaluate`] substitutes the placeholders exactly once, before
/// the job is created. The substitutions:
///
/// * `${TIME}`: evaluation wall time as `YYYY-MM-DD_HH-MM-SS`
/// * `${HOST}`: local host name
///
/// Unknown placeholders are left untouched.
#[derive(Clone, Debug, Serialize)]
pub struct JobConfig {
    pub job_id: i64,
    pub meas_root_dir: String,
    pub meas_name: String,
    pub description: String,

    /// Upper bound for one measurement frame file, in bytes.
    pub max_file_size: u64,

    complete_path: Option<PathBuf>,
}

impl JobConfig {
    pub fn new(job_id: i64) -> Self {
        JobConfig {
            job_id,
            meas_root_dir: String::new(),
            meas_name: String::new(),
            description: String::new(),
            max_file_size: 512 << 20,
            complete_path: None,
        }
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<String>) -> Self {
        self.meas_root_dir = root_dir.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.meas_name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    /// Returns a copy with placeholders substituted and the complete
    /// measurement path fixed. Idempotent on an already-evaluated config.
    pub fn evaluate(&self, now: Time, host_name: &str) -> JobConfig {
        if self.complete_path.is_some() {
            return self.clone();
        }
        let time_str = format_time(now);
        let root = expand(&self.meas_root_dir, &time_str, host_name);
        let name = expand(&self.meas_name, &time_str, host_name);
        let complete_path = Path::new(&root).join(&name);
        JobConfig {
            job_id: self.job_id,
            meas_root_dir: root,
            meas_name: name,
            description: self.description.clone(),
            max_file_size: self.max_file_size,
            complete_path: Some(complete_path),
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.complete_path.is_some()
    }

    /// The fully-evaluated measurement directory. Empty before
    /// [`JobConfig::evaluate`].
    pub fn complete_measurement_path(&self) -> &Path {
        self.complete_path.as_deref().unwrap_or(Path::new(""))
    }
}

fn expand(input: &str, time_str: &str, host_name: &str) -> String {
    input
        .replace("${TIME}", time_str)
        .replace("${HOST}", host_name)
}

fn format_time(now: Time) -> String {
    match jiff::Timestamp::from_microsecond(now.as_micros()) {
        Ok(ts) => ts
            .to_zoned(jiff::tz::TimeZone::UTC)
            .strftime("%Y-%m-%d_%H-%M-%S")
            .to_string(),
        Err(_) => "invalid-time".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_substitutes_placeholders() {
        let config = JobConfig::new(1)
            .with_root_dir("/meas/${HOST}")
            .with_name("run_${TIME}");
        assert!(!config.is_evaluated());
        // 2021-04-01 00:00:00 UTC.
        let evaluated = config.evaluate(Time(1617235200 * 1_000_000), "edge01");
        assert!(evaluated.is_evaluated());
        assert_eq!(evaluated.meas_root_dir, "/meas/edge01");
        assert_eq!(evaluated.meas_name, "run_2021-04-01_00-00-00");
        assert_eq!(
            evaluated.complete_measurement_path(),
            Path::new("/meas/edge01/run_2021-04-01_00-00-00")
        );
    }

    #[test]
    fn evaluation_is_one_shot() {
        let config = JobConfig::new(1).with_root_dir("/meas").with_name("${TIME}");
        let first = config.evaluate(Time(0), "h");
        let second = first.evaluate(Time(1_000_000_000_000), "other");
        assert_eq!(
            first.complete_measurement_path(),
            second.complete_measurement_path()
        );
    }

    #[test]
    fn unknown_placeholders_are_kept() {
        let config = JobConfig::new(1).with_root_dir("/meas").with_name("x${WHAT}y");
        let evaluated = config.evaluate(Time(0), "h");
        assert_eq!(evaluated.meas_name, "x${WHAT}y");
    }
}
