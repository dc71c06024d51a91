// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Discovers add-on executables, brings each to a known state, and fans
//! control operations out to the enabled ones.

use super::session::AddonSession;
use super::{AddonStatus, SetJobStatusFn};
use crate::job_config::JobConfig;
use base::time::Duration;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Environment variable listing additional add-on directories, separated by
/// the platform-native path separator.
pub const ADDON_PATH_ENV: &str = "ECAL_REC_ADDON_PATH";

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

const ID_POLL_ATTEMPTS: usize = 100;
const ID_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

pub struct AddonManager {
    enabled: Vec<AddonSession>,
    disabled: Vec<AddonSession>,
    unresponsive: Vec<AddonSession>,
    initialized: bool,
    pre_buffer_enabled: bool,
    max_pre_buffer_length: Duration,
}

/// The default add-on location plus anything in `ECAL_REC_ADDON_PATH`.
pub fn addon_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.join("addons"));
        }
    }
    if let Ok(extra) = std::env::var(ADDON_PATH_ENV) {
        dirs.extend(
            extra
                .split(PATH_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        );
    }
    dirs
}

/// Regular files with any execute permission bit set, in the given
/// directories.
pub fn addon_executable_paths(addon_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for dir in addon_dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if metadata.permissions().mode() & 0o111 == 0 {
                    continue;
                }
            }
            paths.push(entry.path());
        }
    }
    paths
}

impl AddonManager {
    /// Discovers add-ons from the search paths and waits for each to report
    /// an id.
    pub fn new(host_name: String, set_job_status: SetJobStatusFn) -> Self {
        Self::from_executables(
            addon_executable_paths(&addon_directories()),
            host_name,
            set_job_status,
            ID_POLL_ATTEMPTS,
            ID_POLL_INTERVAL,
        )
    }

    /// As [`AddonManager::new`], with the executable list and the id-polling
    /// knobs supplied by the caller.
    pub fn from_executables(
        executable_paths: Vec<PathBuf>,
        host_name: String,
        set_job_status: SetJobStatusFn,
        id_poll_attempts: usize,
        id_poll_interval: std::time::Duration,
    ) -> Self {
        let mut uninitialized: Vec<AddonSession> = Vec::new();
        for path in executable_paths {
            info!("found addon in path {:?}", path);
            uninitialized.push(AddonSession::launch(
                path,
                host_name.clone(),
                set_job_status.clone(),
            ));
        }

        let mut by_id: Vec<AddonSession> = Vec::new();
        for _ in 0..id_poll_attempts {
            let mut still_waiting = Vec::new();
            for session in uninitialized {
                let addon_id = session.addon_id();
                if addon_id.is_empty() {
                    still_waiting.push(session);
                } else if by_id.iter().any(|s| s.addon_id() == addon_id) {
                    warn!(addon_id = %addon_id, "addon already exists; ignoring duplicate");
                } else {
                    info!(addon_id = %addon_id, "addon successfully loaded");
                    by_id.push(session);
                }
            }
            uninitialized = still_waiting;
            if uninitialized.is_empty() {
                break;
            }
            std::thread::sleep(id_poll_interval);
        }

        for session in &uninitialized {
            warn!(
                "addon {:?} does not respond",
                session.executable_path()
            );
        }

        AddonManager {
            enabled: Vec::new(),
            disabled: by_id,
            unresponsive: uninitialized,
            initialized: false,
            pre_buffer_enabled: false,
            max_pre_buffer_length: Duration::ZERO,
        }
    }

    /// Diffs `addon_ids` against the current enabled set. Newly-enabled
    /// add-ons receive the current pre-buffer config and, if the manager is
    /// initialized, an `initialize`; newly-disabled ones a `deinitialize`.
    /// Unknown ids are logged and ignored.
    pub fn set_enabled_addons(&mut self, addon_ids: &BTreeSet<String>) {
        let mut to_enable = Vec::new();
        for addon_id in addon_ids {
            if let Some(i) = self.disabled.iter().position(|s| &s.addon_id() == addon_id) {
                to_enable.push(self.disabled.swap_remove(i));
            } else if !self.enabled.iter().any(|s| &s.addon_id() == addon_id) {
                warn!(addon_id = %addon_id, "failed enabling addon: the addon does not exist");
            }
        }

        let mut to_disable = Vec::new();
        let mut still_enabled = Vec::new();
        for session in self.enabled.drain(..) {
            if addon_ids.contains(&session.addon_id()) {
                still_enabled.push(session);
            } else {
                to_disable.push(session);
            }
        }
        self.enabled = still_enabled;

        for session in to_enable {
            info!(addon_id = %session.addon_id(), "enabling addon");
            session.set_pre_buffer(self.pre_buffer_enabled, self.max_pre_buffer_length);
            if self.initialized {
                session.initialize();
            }
            self.enabled.push(session);
        }

        for session in to_disable {
            info!(addon_id = %session.addon_id(), "disabling addon");
            session.set_pre_buffer(self.pre_buffer_enabled, self.max_pre_buffer_length);
            if self.initialized {
                session.deinitialize();
            }
            self.disabled.push(session);
        }
    }

    pub fn get_enabled_addons(&self) -> BTreeSet<String> {
        self.enabled.iter().map(|s| s.addon_id()).collect()
    }

    pub fn initialize(&mut self) {
        self.initialized = true;
        for session in &self.enabled {
            session.initialize();
        }
    }

    pub fn deinitialize(&mut self) {
        self.initialized = false;
        for session in &self.enabled {
            session.deinitialize();
        }
    }

    pub fn set_pre_buffer(&mut self, enabled: bool, length: Duration) {
        self.pre_buffer_enabled = enabled;
        self.max_pre_buffer_length = length;
        for session in &self.enabled {
            session.set_pre_buffer(enabled, length);
        }
    }

    pub fn start_recording(&self, job_config: &JobConfig) {
        for session in &self.enabled {
            session.start_recording(job_config);
        }
    }

    pub fn stop_recording(&self) {
        for session in &self.enabled {
            session.stop_recording();
        }
    }

    pub fn save_buffer(&self, job_config: &JobConfig) {
        for session in &self.enabled {
            session.save_buffer(job_config);
        }
    }

    /// Statuses of all enabled or disabled add-ons whose child process is
    /// still running.
    pub fn get_addon_statuses(&self) -> Vec<AddonStatus> {
        self.enabled
            .iter()
            .chain(self.disabled.iter())
            .filter(|s| s.is_running())
            .map(|s| s.status())
            .collect()
    }

    pub fn unresponsive_count(&self) -> usize {
        self.unresponsive.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn noop_status_fn() -> SetJobStatusFn {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn split_addon_path() {
        // addon_directories reads the process environment, so exercise the
        // split logic directly.
        let joined = format!("/a/b{PATH_SEPARATOR}{PATH_SEPARATOR}/c");
        let parts: Vec<&str> = joined
            .split(PATH_SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(parts, vec!["/a/b", "/c"]);
    }

    #[cfg(unix)]
    #[test]
    fn discovery_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;
        crate::testutil::init();
        let dir = tempfile::tempdir().unwrap();
        let exec = dir.path().join("addon-exec");
        let plain = dir.path().join("addon-plain");
        std::fs::write(&exec, "#!/bin/sh\n").unwrap();
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let found = addon_executable_paths(&[dir.path().to_owned()]);
        assert_eq!(found, vec![exec]);
    }

    #[test]
    fn unresponsive_addons_are_set_aside() {
        crate::testutil::init();
        let manager = AddonManager::from_executables(
            vec![PathBuf::from("/nonexistent/addon")],
            "host1".to_owned(),
            noop_status_fn(),
            2,
            std::time::Duration::from_millis(1),
        );
        assert_eq!(manager.unresponsive_count(), 1);
        assert!(manager.get_enabled_addons().is_empty());
        assert!(manager.get_addon_statuses().is_empty());
    }

    #[test]
    fn enable_unknown_addon_is_ignored() {
        crate::testutil::init();
        let mut manager = AddonManager::from_executables(
            Vec::new(),
            "host1".to_owned(),
            noop_status_fn(),
            1,
            std::time::Duration::from_millis(1),
        );
        let ids: BTreeSet<String> = ["nope".to_owned()].into_iter().collect();
        manager.set_enabled_addons(&ids);
        assert!(manager.get_enabled_addons().is_empty());
    }
}
