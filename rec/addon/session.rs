// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! One session per discovered add-on executable.
//!
//! The session owns the child's pipe through a single request worker: every
//! pipe operation happens on that worker, so requests and responses stay in
//! FIFO order. A second worker polls `prebuffer_count` and `job_statuses`
//! every 200 ms and mirrors the answers into [`AddonStatus`] and into the
//! engine via the injected `set_job_status` callback.

use super::pipe::{self, ProcessControl};
use super::{AddonJobState, AddonJobStatus, AddonStatus, SetJobStatusFn, EOT};
use crate::job_config::JobConfig;
use crate::protocol::{functions, LineTransport, Request, Response, ResponseHandler, Status};
use base::shutdown;
use base::time::Duration;
use base::{err, Error, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::warn;

const STATUS_POLL_PERIOD: std::time::Duration = std::time::Duration::from_millis(200);

/// Above this queue depth the status worker skips its tick rather than piling
/// more polls onto an add-on that isn't keeping up.
const MAX_PENDING_REQUESTS: usize = 100;

/// How long shutdown waits for an in-flight request before force-killing the
/// child to unblock the worker's stdout read.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

type ResponseCallback = Box<dyn FnOnce(&Response) + Send>;

enum Command {
    Request(Request, ResponseCallback),
    Shutdown,
}

struct Shared {
    status: Mutex<AddonStatus>,
    control: Mutex<Box<dyn ProcessControl>>,
    currently_recording_job_id: AtomicI64,
    pre_buffering_enabled: AtomicBool,
}

#[derive(Clone)]
struct Enqueuer {
    tx: mpsc::Sender<Command>,
    pending: Arc<AtomicUsize>,
}

impl Enqueuer {
    /// Sends silently into the void once the worker is gone (session loss).
    fn enqueue(&self, request: Request, callback: ResponseCallback) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Command::Request(request, callback)).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct AddonSession {
    shared: Arc<Shared>,
    pending: Arc<AtomicUsize>,
    enqueuer: Enqueuer,
    cmd_tx: mpsc::Sender<Command>,
    host_name: String,
    executable_path: PathBuf,
    request_worker: Option<thread::JoinHandle<()>>,
    status_worker: Option<thread::JoinHandle<()>>,
    status_shutdown: Option<shutdown::Sender>,
}

impl AddonSession {
    /// Launches the add-on executable and starts the session workers.
    ///
    /// A spawn failure still yields a session (reporting not-running and an
    /// unhealthy status), matching how an add-on that dies later behaves.
    pub fn launch(
        executable_path: PathBuf,
        host_name: String,
        set_job_status: SetJobStatusFn,
    ) -> Self {
        match pipe::start(&executable_path) {
            Ok((handle, child_pipe)) => Self::with_pipe(
                executable_path,
                host_name,
                Box::new(child_pipe),
                Box::new(handle),
                set_job_status,
            ),
            Err(e) => {
                warn!(err = %e.chain(), "unable to start recorder add-on");
                let mut status = AddonStatus::new(executable_path.clone());
                status.healthy = false;
                status.message = format!(
                    "Unable to start recorder add-on {}",
                    executable_path.display()
                );
                struct Dead;
                impl ProcessControl for Dead {
                    fn is_alive(&mut self) -> bool {
                        false
                    }
                    fn stop(&mut self) -> bool {
                        false
                    }
                }
                let (cmd_tx, _) = mpsc::channel();
                let pending = Arc::new(AtomicUsize::new(0));
                AddonSession {
                    shared: Arc::new(Shared {
                        status: Mutex::new(status),
                        control: Mutex::new(Box::new(Dead)),
                        currently_recording_job_id: AtomicI64::new(0),
                        pre_buffering_enabled: AtomicBool::new(false),
                    }),
                    pending: pending.clone(),
                    enqueuer: Enqueuer {
                        tx: cmd_tx.clone(),
                        pending,
                    },
                    cmd_tx,
                    host_name,
                    executable_path,
                    request_worker: None,
                    status_worker: None,
                    status_shutdown: None,
                }
            }
        }
    }

    /// Builds a session over an already-connected pipe. This is the seam used
    /// by in-process tests; [`AddonSession::launch`] is the production path.
    pub fn with_pipe(
        executable_path: PathBuf,
        host_name: String,
        pipe: Box<dyn LineTransport + Send>,
        control: Box<dyn ProcessControl>,
        set_job_status: SetJobStatusFn,
    ) -> Self {
        let shared = Arc::new(Shared {
            status: Mutex::new(AddonStatus::new(executable_path.clone())),
            control: Mutex::new(control),
            currently_recording_job_id: AtomicI64::new(0),
            pre_buffering_enabled: AtomicBool::new(false),
        });
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let enqueuer = Enqueuer {
            tx: cmd_tx.clone(),
            pending: pending.clone(),
        };

        let request_worker = {
            let shared = shared.clone();
            let pending = pending.clone();
            thread::Builder::new()
                .name("addon-req".to_owned())
                .spawn(move || request_loop(&shared, &pending, cmd_rx, pipe))
                .unwrap()
        };

        // The first request adopts the add-on's identity; the status worker
        // stays quiet until that has happened.
        {
            let shared = shared.clone();
            enqueuer.enqueue(
                Request::new("info"),
                Box::new(move |response| {
                    let Some(result) = response.results.first() else {
                        return;
                    };
                    let mut status = shared.status.lock();
                    if let Ok(id) = result["id"].as_str() {
                        status.addon_id = id.to_owned();
                    }
                    if let Ok(name) = result["name"].as_str() {
                        status.name = name.to_owned();
                    }
                    if let Ok(description) = result["description"].as_str() {
                        status.description = description.to_owned();
                    }
                }),
            );
        }

        let (status_shutdown, status_rx) = shutdown::channel();
        let status_worker = {
            let shared = shared.clone();
            let enqueuer = enqueuer.clone();
            let pending = pending.clone();
            thread::Builder::new()
                .name("addon-status".to_owned())
                .spawn(move || status_loop(&shared, &enqueuer, &pending, &status_rx, set_job_status))
                .unwrap()
        };

        AddonSession {
            shared,
            pending,
            enqueuer,
            cmd_tx,
            host_name,
            executable_path,
            request_worker: Some(request_worker),
            status_worker: Some(status_worker),
            status_shutdown: Some(status_shutdown),
        }
    }

    pub fn initialize(&self) {
        let shared = self.shared.clone();
        self.enqueuer.enqueue(
            Request::new("initialize"),
            Box::new(move |_| {
                shared.status.lock().initialized = true;
            }),
        );
    }

    pub fn deinitialize(&self) {
        let shared = self.shared.clone();
        self.enqueuer.enqueue(
            Request::new("deinitialize"),
            Box::new(move |_| {
                shared.status.lock().initialized = false;
            }),
        );
    }

    pub fn set_pre_buffer(&self, enabled: bool, length: Duration) {
        self.enqueuer.enqueue(
            Request::new("set_prebuffer_length").with_parameter("duration", length.as_millis()),
            Box::new(|_| {}),
        );
        if enabled {
            if !self.shared.pre_buffering_enabled.load(Ordering::SeqCst) {
                let shared = self.shared.clone();
                self.enqueuer.enqueue(
                    Request::new("enable_prebuffering"),
                    Box::new(move |_| {
                        shared.pre_buffering_enabled.store(true, Ordering::SeqCst);
                    }),
                );
            }
        } else {
            let shared = self.shared.clone();
            self.enqueuer.enqueue(
                Request::new("disable_prebuffering"),
                Box::new(move |_| {
                    shared.pre_buffering_enabled.store(false, Ordering::SeqCst);
                }),
            );
        }
    }

    pub fn start_recording(&self, job_config: &JobConfig) {
        if self.shared.currently_recording_job_id.load(Ordering::SeqCst) != 0 {
            return;
        }
        let path = job_config
            .complete_measurement_path()
            .join(&self.host_name);
        let job_id = job_config.job_id;
        let shared = self.shared.clone();
        self.enqueuer.enqueue(
            Request::new("start_recording")
                .with_parameter("id", job_id)
                .with_parameter("path", path.to_string_lossy().into_owned()),
            Box::new(move |_| {
                let _ = shared.currently_recording_job_id.compare_exchange(
                    0,
                    job_id,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }),
        );
    }

    pub fn stop_recording(&self) {
        let job_id = self.shared.currently_recording_job_id.load(Ordering::SeqCst);
        if job_id == 0 {
            return;
        }
        let shared = self.shared.clone();
        self.enqueuer.enqueue(
            Request::new("stop_recording").with_parameter("id", job_id),
            Box::new(move |_| {
                shared.currently_recording_job_id.store(0, Ordering::SeqCst);
            }),
        );
    }

    pub fn save_buffer(&self, job_config: &JobConfig) {
        let path = job_config
            .complete_measurement_path()
            .join(&self.host_name);
        self.enqueuer.enqueue(
            Request::new("save_prebuffer")
                .with_parameter("id", job_config.job_id)
                .with_parameter("path", path.to_string_lossy().into_owned()),
            Box::new(|_| {}),
        );
    }

    pub fn addon_id(&self) -> String {
        self.shared.status.lock().addon_id.clone()
    }

    pub fn status(&self) -> AddonStatus {
        self.shared.status.lock().clone()
    }

    pub fn executable_path(&self) -> &Path {
        &self.executable_path
    }

    pub fn is_running(&self) -> bool {
        self.shared.control.lock().is_alive()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn shutdown_workers(&mut self) {
        drop(self.status_shutdown.take());
        if let Some(h) = self.status_worker.take() {
            h.join().unwrap();
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(h) = self.request_worker.take() {
            // A wedged add-on would otherwise block the join on its stdout
            // read; killing the child turns that read into an error.
            let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
            while !h.is_finished() && std::time::Instant::now() < deadline {
                thread::sleep(std::time::Duration::from_millis(10));
            }
            if !h.is_finished() {
                self.shared.control.lock().stop();
            }
            h.join().unwrap();
        }
        self.shared.control.lock().stop();
    }
}

impl Drop for AddonSession {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}

fn request_loop(
    shared: &Shared,
    pending: &AtomicUsize,
    cmd_rx: mpsc::Receiver<Command>,
    mut pipe: Box<dyn LineTransport + Send>,
) {
    let handler = ResponseHandler::new(functions::all());
    while let Ok(command) = cmd_rx.recv() {
        let (request, callback) = match command {
            Command::Shutdown => {
                let _ = pipe.write_line(&EOT.to_string());
                return;
            }
            Command::Request(request, callback) => (request, callback),
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        if !shared.control.lock().is_alive() {
            continue;
        }
        match handler.query(pipe.as_mut(), &request) {
            Err(e) => {
                warn!(
                    function = %request.function_name,
                    err = %e.chain(),
                    "response handler error"
                );
            }
            Ok(response) => {
                {
                    let mut status = shared.status.lock();
                    if !response.message.is_empty() {
                        status.message = response.message.clone();
                        status.healthy = response.status == Status::Ok;
                    }
                }
                if response.status == Status::Ok {
                    callback(&response);
                } else {
                    warn!(
                        function = %request.function_name,
                        "response error: {}",
                        response.message
                    );
                }
            }
        }
    }
}

fn status_loop(
    shared: &Arc<Shared>,
    enqueuer: &Enqueuer,
    pending: &Arc<AtomicUsize>,
    shutdown_rx: &shutdown::Receiver,
    set_job_status: SetJobStatusFn,
) {
    loop {
        if shutdown_rx.wait_for(STATUS_POLL_PERIOD).is_err() {
            return;
        }
        if pending.load(Ordering::SeqCst) > MAX_PENDING_REQUESTS {
            continue;
        }
        let addon_id = shared.status.lock().addon_id.clone();
        if addon_id.is_empty() {
            continue;
        }

        {
            let shared = shared.clone();
            enqueuer.enqueue(
                Request::new("prebuffer_count"),
                Box::new(move |response| {
                    let Some(result) = response.results.first() else {
                        return;
                    };
                    if let Ok(count) = result["frame_count"].as_i64() {
                        shared.status.lock().pre_buffer_frame_count = count;
                    }
                }),
            );
        }

        {
            let set_job_status = set_job_status.clone();
            enqueuer.enqueue(
                Request::new("job_statuses"),
                Box::new(move |response| {
                    for result in &response.results {
                        match parse_job_status_row(result) {
                            Ok((job_id, status)) => set_job_status(job_id, &addon_id, status),
                            Err(e) => {
                                warn!(err = %e.chain(), "discarding malformed job_statuses row")
                            }
                        }
                    }
                }),
            );
        }
    }
}

fn parse_job_status_row(
    result: &crate::protocol::ArgumentMap,
) -> Result<(i64, AddonJobStatus), Error> {
    let state_str = result["state"].as_str()?;
    let state = AddonJobState::from_wire_str(state_str)
        .ok_or_else(|| err!(ProtocolError, msg("unknown job state \"{state_str}\"")))?;
    Ok((
        result["id"].as_i64()?,
        AddonJobStatus {
            state,
            total_frame_count: result["frame_count"].as_i64()?,
            unflushed_frame_count: result["queue_count"].as_i64()?,
            healthy: result["healthy"].as_bool()?,
            message: result["status_description"].as_str()?.to_owned(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ArgumentMap, RequestHandler, Variant};
    use crate::testutil;
    use std::collections::VecDeque;

    /// A pipe wired straight into an in-process [`RequestHandler`], plus a
    /// log of the function names it saw, in arrival order.
    struct InProcessAddon {
        handler: RequestHandler,
        seen: Arc<Mutex<Vec<String>>>,
        pending: VecDeque<String>,
    }

    impl LineTransport for InProcessAddon {
        fn write_line(&mut self, line: &str) -> Result<(), Error> {
            if line.starts_with(EOT) {
                return Ok(());
            }
            if let Some(name) = line.split_whitespace().next() {
                self.seen.lock().push(name.to_owned());
            }
            self.pending.extend(self.handler.query(line));
            Ok(())
        }

        fn read_line(&mut self) -> Result<String, Error> {
            self.pending
                .pop_front()
                .ok_or_else(|| err!(ResourceUnavailable, msg("pipe closed")))
        }
    }

    struct FakeControl {
        alive: Arc<AtomicBool>,
    }

    impl ProcessControl for FakeControl {
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn stop(&mut self) -> bool {
            self.alive.swap(false, Ordering::SeqCst)
        }
    }

    fn echo_handler(seen: &Arc<Mutex<Vec<String>>>) -> InProcessAddon {
        let mut handler = RequestHandler::new();
        handler.register(functions::info(), |_| {
            Response::ok().with_result(
                [
                    ("id".to_owned(), Variant::from("test")),
                    ("name".to_owned(), Variant::from("Test Addon")),
                    ("description".to_owned(), Variant::from("records nothing")),
                ]
                .into_iter()
                .collect(),
            )
        });
        handler.register(functions::initialize(), |_| Response::ok());
        handler.register(functions::deinitialize(), |_| Response::ok());
        handler.register(functions::set_prebuffer_length(), |_| Response::ok());
        handler.register(functions::enable_prebuffering(), |_| Response::ok());
        handler.register(functions::save_prebuffer(), |_| Response::ok());
        handler.register(functions::prebuffer_count(), |_| {
            Response::ok().with_result(
                [("frame_count".to_owned(), Variant::Integer(17))]
                    .into_iter()
                    .collect(),
            )
        });
        handler.register(functions::job_statuses(), |_| {
            let row: ArgumentMap = [
                ("id".to_owned(), Variant::Integer(42)),
                ("state".to_owned(), Variant::from("recording")),
                ("healthy".to_owned(), Variant::Boolean(true)),
                ("status_description".to_owned(), Variant::from("")),
                ("frame_count".to_owned(), Variant::Integer(150)),
                ("queue_count".to_owned(), Variant::Integer(2)),
            ]
            .into_iter()
            .collect();
            Response::ok().with_result(row)
        });
        InProcessAddon {
            handler,
            seen: seen.clone(),
            pending: VecDeque::new(),
        }
    }

    fn wait_until(timeout: std::time::Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn adopts_info_and_mirrors_job_status() {
        testutil::init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addon = echo_handler(&seen);
        let mirrored: Arc<Mutex<Vec<(i64, String, AddonJobStatus)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let mirrored2 = mirrored.clone();
        let session = AddonSession::with_pipe(
            PathBuf::from("/fake/test-addon"),
            "host1".to_owned(),
            Box::new(addon),
            Box::new(FakeControl {
                alive: Arc::new(AtomicBool::new(true)),
            }),
            Arc::new(move |job_id, addon_id, status| {
                mirrored2.lock().push((job_id, addon_id.to_owned(), status));
            }),
        );

        assert!(wait_until(std::time::Duration::from_secs(5), || {
            session.addon_id() == "test"
        }));
        let status = session.status();
        assert_eq!(status.name, "Test Addon");
        assert_eq!(status.description, "records nothing");

        // Within one status-poll period the job status arrives.
        assert!(wait_until(std::time::Duration::from_secs(5), || {
            !mirrored.lock().is_empty()
        }));
        let (job_id, addon_id, job_status) = mirrored.lock().first().unwrap().clone();
        assert_eq!(job_id, 42);
        assert_eq!(addon_id, "test");
        assert_eq!(job_status.state, AddonJobState::Recording);
        assert_eq!(job_status.total_frame_count, 150);
        assert_eq!(job_status.unflushed_frame_count, 2);

        assert!(wait_until(std::time::Duration::from_secs(5), || {
            session.status().pre_buffer_frame_count == 17
        }));
    }

    #[test]
    fn requests_are_serialized_in_fifo_order() {
        testutil::init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut addon = echo_handler(&seen);
        // No identity: keep the status worker quiet so the order is exactly
        // what the test enqueues.
        addon.handler.register(functions::info(), |_| {
            Response::failed("not ready")
        });
        let session = AddonSession::with_pipe(
            PathBuf::from("/fake/test-addon"),
            "host1".to_owned(),
            Box::new(addon),
            Box::new(FakeControl {
                alive: Arc::new(AtomicBool::new(true)),
            }),
            Arc::new(|_, _, _| {}),
        );

        session.initialize();
        session.save_buffer(
            &JobConfig::new(7)
                .with_root_dir("/tmp")
                .with_name("m")
                .evaluate(base::time::Time(0), "host1"),
        );
        session.deinitialize();

        assert!(wait_until(std::time::Duration::from_secs(5), || {
            seen.lock().len() == 4
        }));
        assert_eq!(
            *seen.lock(),
            vec!["info", "initialize", "save_prebuffer", "deinitialize"]
        );
    }

    #[test]
    fn dead_child_silently_noops() {
        testutil::init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addon = echo_handler(&seen);
        let session = AddonSession::with_pipe(
            PathBuf::from("/fake/test-addon"),
            "host1".to_owned(),
            Box::new(addon),
            Box::new(FakeControl {
                alive: Arc::new(AtomicBool::new(false)),
            }),
            Arc::new(|_, _, _| {}),
        );
        assert!(!session.is_running());
        session.initialize();
        session.stop_recording();
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(seen.lock().is_empty());
        assert_eq!(session.addon_id(), "");
    }

    #[test]
    fn launch_failure_reports_unhealthy() {
        testutil::init();
        let session = AddonSession::launch(
            PathBuf::from("/nonexistent/addon"),
            "host1".to_owned(),
            Arc::new(|_, _, _| {}),
        );
        assert!(!session.is_running());
        let status = session.status();
        assert!(!status.healthy);
        assert!(status.message.contains("Unable to start"));
    }
}
