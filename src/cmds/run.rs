// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Subcommand to run a scripted demo recording: synthetic publishers on an
//! in-process bus, a pre-buffered recording of configurable length, and a
//! final status dump.

use base::clock::{Clocks as _, RealClocks};
use base::time::Duration;
use base::{err, shutdown, Error, ResultExt as _};
use bpaf::Bpaf;
use rec::engine::{EngineConfig, Recorder};
use rec::job::JobState;
use rec::job_config::JobConfig;
use rec::meas::FrameLogOpener;
use rec::pubsub::{Bus, LoopbackBus, TopicInfo};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Runs a demo recording according to the given configuration file.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the TOML configuration file.
    #[bpaf(argument("PATH"), fallback("nightjar.toml".into()))]
    config: PathBuf,
}

fn default_max_file_size_mib() -> u64 {
    512
}

fn default_pre_buffer_length_ms() -> i64 {
    4000
}

fn default_record_ms() -> u64 {
    3000
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigFile {
    /// Measurement root directory; `${TIME}` and `${HOST}` placeholders are
    /// substituted when the recording starts.
    pub meas_root_dir: String,

    pub meas_name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_max_file_size_mib")]
    pub max_file_size_mib: u64,

    #[serde(default = "default_pre_buffer_length_ms")]
    pub pre_buffer_length_ms: i64,

    #[serde(default)]
    pub pre_buffering_disabled: bool,

    /// How long to keep the live recording running.
    #[serde(default = "default_record_ms")]
    pub record_ms: u64,

    /// Synthetic publishers to run on the in-process bus.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,

    /// Add-on executables to load; when omitted, the usual search paths are
    /// scanned.
    #[serde(default)]
    pub addon_executables: Option<Vec<PathBuf>>,

    /// Add-on ids to enable before recording.
    #[serde(default)]
    pub enabled_addons: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TopicConfig {
    pub name: String,
    pub rate_hz: u32,
    #[serde(default)]
    pub payload_bytes: usize,
}

fn spawn_publisher(
    bus: Arc<LoopbackBus>,
    topic: TopicConfig,
    shutdown_rx: shutdown::Receiver,
) -> std::thread::JoinHandle<()> {
    let period = std::time::Duration::from_nanos(1_000_000_000 / u64::from(topic.rate_hz.max(1)));
    std::thread::Builder::new()
        .name(format!("pub-{}", topic.name))
        .spawn(move || {
            let clocks = RealClocks {};
            let payload = vec![0x6e; topic.payload_bytes];
            let mut clock = 0i64;
            loop {
                if shutdown_rx.wait_for(period).is_err() {
                    return;
                }
                bus.publish(&topic.name, &payload, clocks.realtime(), clock);
                clock += 1;
            }
        })
        .unwrap()
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config_text = std::fs::read_to_string(&args.config).map_err(|e| {
        err!(NotFound, source(e), msg("cannot read config file {:?}", args.config))
    })?;
    let config: ConfigFile = toml::from_str(&config_text)
        .err_kind(base::ErrorKind::InvalidArgument)?;

    let bus = Arc::new(LoopbackBus::new());
    let host = "demo";
    for topic in &config.topics {
        bus.add_publisher(
            &topic.name,
            host,
            "nightjar-demo",
            TopicInfo {
                type_name: "raw".to_owned(),
                ..Default::default()
            },
        );
    }

    let mut engine_config = EngineConfig::new(
        Duration::from_millis(config.pre_buffer_length_ms),
        !config.pre_buffering_disabled,
    );
    if let Some(addon_executables) = &config.addon_executables {
        engine_config = engine_config.with_addon_executables(addon_executables.clone());
    }
    let recorder = Recorder::new(
        RealClocks {},
        bus.clone() as Arc<dyn Bus>,
        FrameLogOpener,
        engine_config,
    );

    if !config.enabled_addons.is_empty() {
        let ids = config.enabled_addons.iter().cloned().collect();
        recorder.set_enabled_addons(&ids);
    }

    let (publisher_shutdown, publisher_rx) = shutdown::channel();
    let mut publishers = Vec::new();
    for topic in config.topics {
        publishers.push(spawn_publisher(bus.clone(), topic, publisher_rx.clone()));
    }

    recorder.update_monitoring();
    recorder.connect();

    // Let the pre-buffer fill before the recording starts, so the measurement
    // begins with history.
    if !config.pre_buffering_disabled {
        std::thread::sleep(std::time::Duration::from_millis(
            (config.pre_buffer_length_ms / 2).max(0) as u64,
        ));
        let (frames, length) = recorder.get_current_pre_buffer_length();
        info!("pre-buffer filled: {frames} frames / {length}");
    }

    let job_config = JobConfig::new(1)
        .with_root_dir(config.meas_root_dir)
        .with_name(config.meas_name)
        .with_description(config.description)
        .with_max_file_size(config.max_file_size_mib << 20);
    if !recorder.start_recording(&job_config) {
        let status = recorder.get_status();
        return Err(err!(Unknown, msg("cannot start recording: {}", status.message)));
    }

    std::thread::sleep(std::time::Duration::from_millis(config.record_ms));
    recorder.stop_recording();

    // Wait for the flush to finish before reporting.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        let status = recorder.get_status();
        let done = status
            .jobs
            .iter()
            .all(|j| matches!(j.state, JobState::FinishedFlushing | JobState::NotStarted));
        if done || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(publisher_shutdown);
    for publisher in publishers {
        publisher.join().unwrap();
    }

    let status = recorder.get_status();
    println!(
        "{}",
        serde_json::to_string_pretty(&status).err_kind(base::ErrorKind::Internal)?
    );
    Ok(if status.healthy { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_with_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
                meas_root_dir = "/tmp/meas/${TIME}"
                meas_name = "demo"

                [[topics]]
                name = "telemetry"
                rate_hz = 100
                payload_bytes = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.max_file_size_mib, 512);
        assert_eq!(config.pre_buffer_length_ms, 4000);
        assert!(!config.pre_buffering_disabled);
        assert_eq!(config.topics.len(), 1);
        assert_eq!(config.topics[0].rate_hz, 100);
        assert!(config.addon_executables.is_none());
    }
}
