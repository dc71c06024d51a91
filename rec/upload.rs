// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Background upload of a finished measurement.
//!
//! A local-directory target is supported; FTP targets are declined the same
//! way the original recorder declines them when built without its transfer
//! library.

use base::{bail, err, Error, Mutex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub enum UploadTarget {
    /// Mirror the measurement into this directory.
    Directory(PathBuf),

    /// An FTP server. Not supported by this build.
    Ftp {
        host: String,
        port: u16,
        username: String,
        password: String,
    },
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    /// Job id of the measurement to upload.
    pub meas_id: i64,
    pub target: UploadTarget,

    /// Path below the target root to upload into.
    pub upload_path: String,

    /// Whether metadata files (measurement marker, description) are uploaded
    /// too.
    pub upload_metadata_files: bool,

    /// Delete the local measurement once the upload finished.
    pub delete_after_upload: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadStatus {
    pub bytes_total: u64,
    pub bytes_uploaded: u64,
    pub files_total: usize,
    pub files_uploaded: usize,
    pub healthy: bool,
    pub message: String,
}

impl Default for UploadStatus {
    fn default() -> Self {
        UploadStatus {
            bytes_total: 0,
            bytes_uploaded: 0,
            files_total: 0,
            files_uploaded: 0,
            healthy: true,
            message: String::new(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    status: Mutex<UploadStatus>,
    running: AtomicBool,
    interrupted: AtomicBool,
}

/// A background worker transferring one measurement tree.
#[derive(Debug)]
pub struct UploadWorker {
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<()>>,
}

/// Post-upload hook, e.g. delete-after-upload.
pub type PostUploadFn = Box<dyn FnOnce() + Send>;

/// Starts the upload described by `config` for the measurement at
/// `local_dir`. `skip_files` are measurement-relative paths excluded from the
/// transfer (the metadata files, when `upload_metadata_files` is off).
pub fn spawn_upload(
    local_dir: PathBuf,
    skip_files: Vec<PathBuf>,
    config: &UploadConfig,
    post_upload: Option<PostUploadFn>,
) -> Result<UploadWorker, Error> {
    let target_root = match &config.target {
        UploadTarget::Directory(dir) => dir.clone(),
        UploadTarget::Ftp { host, .. } => {
            bail!(
                UnsupportedAction,
                msg("cannot upload to ftp://{host}: built without FTP support")
            );
        }
    };
    let upload_path = config.upload_path.trim_matches('/').to_owned();
    let skip: BTreeSet<PathBuf> = if config.upload_metadata_files {
        BTreeSet::new()
    } else {
        skip_files.into_iter().collect()
    };

    let shared = Arc::new(Shared {
        status: Mutex::new(UploadStatus::default()),
        running: AtomicBool::new(true),
        interrupted: AtomicBool::new(false),
    });
    let join = {
        let shared = shared.clone();
        thread::Builder::new()
            .name("upload".to_owned())
            .spawn(move || {
                run(&shared, &local_dir, &target_root.join(upload_path), &skip);
                if !shared.interrupted.load(Ordering::SeqCst) {
                    if let Some(hook) = post_upload {
                        hook();
                    }
                }
                shared.running.store(false, Ordering::SeqCst);
            })
            .unwrap()
    };
    Ok(UploadWorker {
        shared,
        join: Some(join),
    })
}

impl UploadWorker {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn get_status(&self) -> UploadStatus {
        self.shared.status.lock().clone()
    }

    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(h) = self.join.take() {
            h.join().unwrap();
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        self.interrupt();
        self.join();
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            collect_files(root, &path, out)?;
        } else if metadata.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|e| err!(Internal, source(e)))?
                .to_owned();
            out.push((relative, metadata.len()));
        }
    }
    Ok(())
}

fn run(shared: &Shared, local_dir: &Path, target_dir: &Path, skip: &BTreeSet<PathBuf>) {
    info!("uploading {:?} to {:?}", local_dir, target_dir);

    let mut files = Vec::new();
    if let Err(e) = collect_files(local_dir, local_dir, &mut files) {
        error!(err = %e.chain(), "cannot enumerate measurement files");
        let mut status = shared.status.lock();
        status.healthy = false;
        status.message = format!("Cannot enumerate {local_dir:?}");
        return;
    }
    files.retain(|(relative, _)| !skip.contains(relative));

    {
        let mut status = shared.status.lock();
        status.files_total = files.len();
        status.bytes_total = files.iter().map(|(_, len)| len).sum();
    }

    for (relative, len) in files {
        if shared.interrupted.load(Ordering::SeqCst) {
            info!("upload interrupted");
            return;
        }
        let from = local_dir.join(&relative);
        let to = target_dir.join(&relative);
        let copied = to
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| std::fs::copy(&from, &to));
        match copied {
            Ok(_) => {
                let mut status = shared.status.lock();
                status.files_uploaded += 1;
                status.bytes_uploaded += len;
            }
            Err(e) => {
                warn!(err = %e, "cannot upload {:?}", relative);
                let mut status = shared.status.lock();
                status.healthy = false;
                status.message = format!("Cannot upload {relative:?}");
            }
        }
    }
    info!("finished uploading {:?}", local_dir);
}
