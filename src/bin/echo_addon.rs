// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! A self-contained recorder add-on for demos and end-to-end tests.
//!
//! It speaks the stdio protocol, keeps a time-bounded pre-buffer of
//! synthetic frames, and "records" by writing a small text file into the
//! measurement path it is given.

use base::clock::{Clocks as _, RealClocks};
use base::time::Duration;
use base::Mutex;
use rec::addon::{host, AddonJobState};
use rec::protocol::{functions, ArgumentMap, RequestHandler, Response, Variant};
use rec::queue::TimeBoundedQueue;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

const FRAME_PERIOD: std::time::Duration = std::time::Duration::from_millis(10);

struct EchoJob {
    state: AddonJobState,
    frame_count: i64,
    path: PathBuf,
}

struct EchoRecorder {
    clocks: RealClocks,
    initialized: AtomicBool,
    prebuffering: AtomicBool,
    prebuffer: TimeBoundedQueue<i64>,
    next_frame: AtomicI64,
    jobs: Mutex<BTreeMap<i64, EchoJob>>,
}

impl EchoRecorder {
    fn new() -> Arc<Self> {
        let recorder = Arc::new(EchoRecorder {
            clocks: RealClocks {},
            initialized: AtomicBool::new(false),
            prebuffering: AtomicBool::new(false),
            prebuffer: TimeBoundedQueue::new(Duration::from_secs(4)),
            next_frame: AtomicI64::new(0),
            jobs: Mutex::new(BTreeMap::new()),
        });
        // Synthetic frame source.
        {
            let recorder = recorder.clone();
            std::thread::Builder::new()
                .name("frames".to_owned())
                .spawn(move || loop {
                    std::thread::sleep(FRAME_PERIOD);
                    if recorder.prebuffering.load(Ordering::SeqCst) {
                        let frame = recorder.next_frame.fetch_add(1, Ordering::SeqCst);
                        recorder.prebuffer.push(recorder.clocks.monotonic(), frame);
                    }
                })
                .unwrap();
        }
        recorder
    }

    fn start_recording(&self, id: i64, path: &str) -> Result<(), String> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err("not initialized".to_owned());
        }
        let dir = PathBuf::from(path);
        std::fs::create_dir_all(&dir).map_err(|e| format!("cannot create {dir:?}: {e}"))?;
        let seeded = self.prebuffer.count() as i64;
        let mut jobs = self.jobs.lock();
        if jobs.values().any(|j| j.state == AddonJobState::Recording) {
            return Err("already recording".to_owned());
        }
        jobs.insert(
            id,
            EchoJob {
                state: AddonJobState::Recording,
                frame_count: seeded,
                path: dir,
            },
        );
        Ok(())
    }

    fn stop_recording(&self, id: i64) -> Result<(), String> {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Err(format!("unknown job {id}"));
        };
        if job.state != AddonJobState::Recording {
            return Err(format!("job {id} is not recording"));
        }
        let marker = job.path.join("echo_addon.txt");
        std::fs::write(&marker, format!("echo addon recorded {} frames\n", job.frame_count))
            .map_err(|e| format!("cannot write {marker:?}: {e}"))?;
        job.state = AddonJobState::FinishedFlushing;
        Ok(())
    }
}

fn status_response(result: Result<(), String>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(message) => Response::failed(message),
    }
}

fn build_handler(recorder: Arc<EchoRecorder>) -> RequestHandler {
    let mut handler = RequestHandler::new();

    handler.register(functions::info(), |_| {
        Response::ok().with_result(
            [
                ("id".to_owned(), Variant::from("echo")),
                ("name".to_owned(), Variant::from("Echo Addon")),
                (
                    "description".to_owned(),
                    Variant::from("synthetic frame source for demos and tests"),
                ),
            ]
            .into_iter()
            .collect(),
        )
    });

    handler.register(functions::api_version(), |_| {
        Response::ok().with_result(
            [("version".to_owned(), Variant::Integer(1))]
                .into_iter()
                .collect(),
        )
    });

    {
        let recorder = recorder.clone();
        handler.register(functions::initialize(), move |_| {
            recorder.initialized.store(true, Ordering::SeqCst);
            Response::ok()
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::deinitialize(), move |_| {
            recorder.initialized.store(false, Ordering::SeqCst);
            Response::ok()
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::set_prebuffer_length(), move |request| {
            let millis = match request.parameters["duration"].as_i64() {
                Ok(millis) => millis,
                Err(e) => return Response::failed(e.to_string()),
            };
            recorder.prebuffer.set_length(Duration::from_millis(millis));
            Response::ok()
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::enable_prebuffering(), move |_| {
            recorder.prebuffering.store(true, Ordering::SeqCst);
            Response::ok()
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::disable_prebuffering(), move |_| {
            recorder.prebuffering.store(false, Ordering::SeqCst);
            recorder.prebuffer.clear();
            Response::ok()
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::prebuffer_count(), move |_| {
            Response::ok().with_result(
                [(
                    "frame_count".to_owned(),
                    Variant::Integer(recorder.prebuffer.count() as i64),
                )]
                .into_iter()
                .collect(),
            )
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::start_recording(), move |request| {
            let id = request.parameters["id"].as_i64().unwrap_or(0);
            let path = request.parameters["path"].as_str().unwrap_or("");
            status_response(recorder.start_recording(id, path))
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::stop_recording(), move |request| {
            let id = request.parameters["id"].as_i64().unwrap_or(0);
            status_response(recorder.stop_recording(id))
        });
    }
    {
        // Saving the pre-buffer is a start immediately followed by a stop.
        let recorder = recorder.clone();
        handler.register(functions::save_prebuffer(), move |request| {
            let id = request.parameters["id"].as_i64().unwrap_or(0);
            let path = request.parameters["path"].as_str().unwrap_or("");
            status_response(
                recorder
                    .start_recording(id, path)
                    .and_then(|()| recorder.stop_recording(id)),
            )
        });
    }
    {
        let recorder = recorder.clone();
        handler.register(functions::job_statuses(), move |_| {
            let mut jobs = recorder.jobs.lock();
            let mut response = Response::ok();
            for (id, job) in jobs.iter_mut() {
                if job.state == AddonJobState::Recording {
                    job.frame_count += 1;
                }
                let row: ArgumentMap = [
                    ("id".to_owned(), Variant::Integer(*id)),
                    ("state".to_owned(), Variant::from(job.state.as_wire_str())),
                    ("healthy".to_owned(), Variant::Boolean(true)),
                    ("status_description".to_owned(), Variant::from("")),
                    ("frame_count".to_owned(), Variant::Integer(job.frame_count)),
                    ("queue_count".to_owned(), Variant::Integer(0)),
                ]
                .into_iter()
                .collect();
                response = response.with_result(row);
            }
            response
        });
    }

    handler
}

fn main() {
    base::tracing_setup::install();
    let recorder = EchoRecorder::new();
    let handler = build_handler(recorder);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    if let Err(e) = host::serve(&handler, stdin.lock(), stdout.lock()) {
        tracing::error!(err = %e.chain(), "addon terminating on i/o error");
        std::process::exit(1);
    }
}
