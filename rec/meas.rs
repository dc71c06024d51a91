// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The on-disk measurement boundary.
//!
//! The writer worker only sees the [`MeasurementWriter`] trait; the container
//! format behind it is replaceable. [`FrameLogOpener`] is the shipped
//! implementation: length-delimited frame records in size-rotated part
//! files, with channel metadata in a JSON sidecar.

use base::time::Time;
use base::{err, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One frame entry as handed to the measurement container.
pub struct EntryData<'a> {
    pub payload: &'a [u8],
    pub publish_time: Time,
    pub receive_time: Time,
    pub topic_name: &'a str,
    pub id: i64,
    pub clock: i64,
}

/// Per-channel metadata installed before (or while) entries are written.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ChannelMeta {
    pub type_name: String,
    pub description: String,
}

/// An open measurement accepting entries. Implementations are used from a
/// single writer thread.
pub trait MeasurementWriter: Send {
    fn set_channel_meta(&mut self, topic_name: &str, meta: &ChannelMeta) -> Result<(), Error>;
    fn add_entry(&mut self, entry: &EntryData) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
}

/// Opens measurements; one writer worker calls this exactly once.
pub trait MeasurementOpener: Send + Sync + 'static {
    type Writer: MeasurementWriter;

    fn open(
        &self,
        dir: &Path,
        file_base_name: &str,
        max_file_size: u64,
    ) -> Result<Self::Writer, Error>;
}

/// Magic line starting every frame-log part file.
const FRAME_LOG_MAGIC: &[u8] = b"NJFRAMES1\n";

#[derive(Clone, Copy, Default)]
pub struct FrameLogOpener;

impl MeasurementOpener for FrameLogOpener {
    type Writer = FrameLogWriter;

    fn open(
        &self,
        dir: &Path,
        file_base_name: &str,
        max_file_size: u64,
    ) -> Result<Self::Writer, Error> {
        std::fs::create_dir_all(dir).map_err(|e| {
            err!(ResourceUnavailable, source(e), msg("cannot create measurement dir {:?}", dir))
        })?;
        let mut writer = FrameLogWriter {
            dir: dir.to_owned(),
            file_base_name: file_base_name.to_owned(),
            max_file_size: max_file_size.max(FRAME_LOG_MAGIC.len() as u64),
            file: None,
            file_index: 0,
            bytes_written: 0,
            channel_meta: BTreeMap::new(),
        };
        writer.roll_file()?;
        Ok(writer)
    }
}

/// Writes `<base>_NNNN.frames` part files plus a `<base>.channels.json`
/// sidecar describing the channels.
#[derive(Debug)]
pub struct FrameLogWriter {
    dir: PathBuf,
    file_base_name: String,
    max_file_size: u64,
    file: Option<BufWriter<File>>,
    file_index: u32,
    bytes_written: u64,
    channel_meta: BTreeMap<String, ChannelMeta>,
}

impl FrameLogWriter {
    fn part_path(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{:04}.frames", self.file_base_name, index))
    }

    fn roll_file(&mut self) -> Result<(), Error> {
        self.flush_current()?;
        let path = self.part_path(self.file_index);
        debug!("opening frame log part {:?}", path);
        let file = File::create(&path).map_err(|e| {
            err!(ResourceUnavailable, source(e), msg("cannot create frame file {:?}", path))
        })?;
        let mut file = BufWriter::new(file);
        file.write_all(FRAME_LOG_MAGIC)?;
        self.file = Some(file);
        self.file_index += 1;
        self.bytes_written = FRAME_LOG_MAGIC.len() as u64;
        Ok(())
    }

    fn flush_current(&mut self) -> Result<(), Error> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn write_sidecar(&self) -> Result<(), Error> {
        let path = self
            .dir
            .join(format!("{}.channels.json", self.file_base_name));
        let json = serde_json::to_vec_pretty(&self.channel_meta)
            .map_err(|e| err!(Internal, source(e), msg("cannot serialize channel metadata")))?;
        std::fs::write(&path, json)?;
        Ok(())
    }
}

impl MeasurementWriter for FrameLogWriter {
    fn set_channel_meta(&mut self, topic_name: &str, meta: &ChannelMeta) -> Result<(), Error> {
        self.channel_meta.insert(topic_name.to_owned(), meta.clone());
        Ok(())
    }

    fn add_entry(&mut self, entry: &EntryData) -> Result<(), Error> {
        if self.bytes_written >= self.max_file_size {
            self.roll_file()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(err!(Internal, msg("measurement already closed")));
        };
        let topic = entry.topic_name.as_bytes();
        let mut record = Vec::with_capacity(4 + topic.len() + 8 * 4 + 4 + entry.payload.len());
        record.extend_from_slice(&(topic.len() as u32).to_le_bytes());
        record.extend_from_slice(topic);
        record.extend_from_slice(&entry.publish_time.as_micros().to_le_bytes());
        record.extend_from_slice(&entry.receive_time.as_micros().to_le_bytes());
        record.extend_from_slice(&entry.id.to_le_bytes());
        record.extend_from_slice(&entry.clock.to_le_bytes());
        record.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
        record.extend_from_slice(entry.payload);
        file.write_all(&record)?;
        self.bytes_written += record.len() as u64;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.flush_current()?;
        self.write_sidecar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(topic: &'a str, payload: &'a [u8], t: i64) -> EntryData<'a> {
        EntryData {
            payload,
            publish_time: Time(t),
            receive_time: Time(t + 1),
            topic_name: topic,
            id: 0,
            clock: t,
        }
    }

    #[test]
    fn writes_parts_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FrameLogOpener;
        let mut writer = opener.open(dir.path(), "host1", 1 << 20).unwrap();
        writer
            .set_channel_meta(
                "a",
                &ChannelMeta {
                    type_name: "proto:Pose".to_owned(),
                    description: "d".to_owned(),
                },
            )
            .unwrap();
        writer.add_entry(&entry("a", b"hello", 1)).unwrap();
        writer.add_entry(&entry("a", b"world", 2)).unwrap();
        writer.close().unwrap();

        let part = dir.path().join("host1_0000.frames");
        let data = std::fs::read(part).unwrap();
        assert!(data.starts_with(FRAME_LOG_MAGIC));
        assert!(data.len() > FRAME_LOG_MAGIC.len());

        let sidecar = dir.path().join("host1.channels.json");
        let meta: BTreeMap<String, ChannelMeta> =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(meta["a"].type_name, "proto:Pose");
    }

    #[test]
    fn rotates_at_max_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let opener = FrameLogOpener;
        let mut writer = opener.open(dir.path(), "host1", 64).unwrap();
        for i in 0..4 {
            writer.add_entry(&entry("t", &[0u8; 64], i)).unwrap();
        }
        writer.close().unwrap();
        assert!(dir.path().join("host1_0000.frames").exists());
        assert!(dir.path().join("host1_0001.frames").exists());
    }

    #[test]
    fn open_fails_on_unwritable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file_in_the_way = dir.path().join("f");
        std::fs::write(&file_in_the_way, b"").unwrap();
        FrameLogOpener
            .open(&file_in_the_way, "host1", 1024)
            .unwrap_err();
    }
}
