// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! The middleware boundary: what the engine consumes from the pub/sub layer.
//!
//! The real transport is out of scope; the engine only needs a way to
//! snapshot the publisher topology and to create/destroy subscribers. An
//! in-process [`LoopbackBus`] is provided for the demo binary and for tests.

use base::time::Time;
use base::{err, Error, FastHashMap, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// What is known about one topic from the monitoring snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TopicInfo {
    pub type_name: String,
    pub encoding: String,
    pub description: String,

    /// Publishers by host name; the values are publisher process identifiers.
    pub publishers: BTreeMap<String, BTreeSet<String>>,
}

impl TopicInfo {
    /// The combined "encoding:type" form stored in measurement channel
    /// metadata.
    pub fn legacy_type(&self) -> String {
        if self.encoding.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}:{}", self.encoding, self.type_name)
        }
    }
}

/// Monitoring snapshot: topic name to info, ordered for stable iteration.
pub type TopicInfoMap = BTreeMap<String, TopicInfo>;

/// Borrowed view of one received message, valid only for the duration of the
/// receive callback.
pub struct MessageData<'a> {
    pub payload: &'a [u8],
    pub publish_time: Time,
    pub clock: i64,
}

/// Callback invoked on the middleware's receive thread for each message.
pub type ReceiveCallback = Box<dyn Fn(&str, &MessageData) + Send + Sync>;

/// A subscription to one topic. Dropping it destroys the subscriber.
pub trait Subscription: Send {
    fn topic_name(&self) -> &str;
}

/// The middleware interface the engine consumes.
pub trait Bus: Send + Sync + 'static {
    /// Snapshot of the current publisher topology.
    fn poll_topics(&self) -> TopicInfoMap;

    /// Creates a subscriber for `topic`; `cb` runs on the middleware's
    /// receive thread.
    fn subscribe(&self, topic: &str, cb: ReceiveCallback) -> Result<Box<dyn Subscription>, Error>;

    /// Path of the middleware's loaded configuration file, if any; copied
    /// into measurements on a best-effort basis.
    fn config_file_path(&self) -> Option<PathBuf> {
        None
    }
}

/// An in-process bus: publishers are registered up front, messages fan out
/// synchronously to subscribers on the publishing thread.
pub struct LoopbackBus {
    inner: Arc<LoopbackInner>,
    config_file_path: Option<PathBuf>,
}

struct LoopbackInner {
    topics: Mutex<TopicInfoMap>,
    subscribers: Mutex<FastHashMap<String, Vec<(u64, Arc<ReceiveCallback>)>>>,
    next_sub_id: Mutex<u64>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        LoopbackBus {
            inner: Arc::new(LoopbackInner {
                topics: Mutex::new(TopicInfoMap::new()),
                subscribers: Mutex::new(FastHashMap::default()),
                next_sub_id: Mutex::new(0),
            }),
            config_file_path: None,
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file_path = Some(path);
        self
    }

    /// Declares a publisher so it shows up in the monitoring snapshot.
    pub fn add_publisher(&self, topic: &str, host: &str, process: &str, info: TopicInfo) {
        let mut topics = self.inner.topics.lock();
        let entry = topics.entry(topic.to_owned()).or_insert_with(|| TopicInfo {
            type_name: info.type_name,
            encoding: info.encoding,
            description: info.description,
            publishers: BTreeMap::new(),
        });
        entry
            .publishers
            .entry(host.to_owned())
            .or_default()
            .insert(process.to_owned());
    }

    pub fn remove_topic(&self, topic: &str) {
        self.inner.topics.lock().remove(topic);
    }

    /// Delivers one message to all subscribers of `topic`, on the calling
    /// thread.
    pub fn publish(&self, topic: &str, payload: &[u8], publish_time: Time, clock: i64) {
        let callbacks: Vec<Arc<ReceiveCallback>> = {
            let subs = self.inner.subscribers.lock();
            match subs.get(topic) {
                Some(v) => v.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            }
        };
        let data = MessageData {
            payload,
            publish_time,
            clock,
        };
        for cb in callbacks {
            cb(topic, &data);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

struct LoopbackSubscription {
    inner: Arc<LoopbackInner>,
    topic: String,
    id: u64,
}

impl Subscription for LoopbackSubscription {
    fn topic_name(&self) -> &str {
        &self.topic
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        let mut subs = self.inner.subscribers.lock();
        if let Some(v) = subs.get_mut(&self.topic) {
            v.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Bus for LoopbackBus {
    fn poll_topics(&self) -> TopicInfoMap {
        self.inner.topics.lock().clone()
    }

    fn subscribe(&self, topic: &str, cb: ReceiveCallback) -> Result<Box<dyn Subscription>, Error> {
        if topic.is_empty() {
            return Err(err!(InvalidArgument, msg("empty topic name")));
        }
        let id = {
            let mut next = self.inner.next_sub_id.lock();
            *next += 1;
            *next
        };
        self.inner
            .subscribers
            .lock()
            .entry(topic.to_owned())
            .or_default()
            .push((id, Arc::new(cb)));
        Ok(Box::new(LoopbackSubscription {
            inner: self.inner.clone(),
            topic: topic.to_owned(),
            id,
        }))
    }

    fn config_file_path(&self) -> Option<PathBuf> {
        self.config_file_path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_subscriber_until_dropped() {
        let bus = LoopbackBus::new();
        bus.add_publisher("a", "host1", "p1", TopicInfo::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let sub = bus
            .subscribe(
                "a",
                Box::new(move |topic, data| {
                    assert_eq!(topic, "a");
                    assert_eq!(data.payload, b"x");
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        bus.publish("a", b"x", Time(1), 1);
        bus.publish("b", b"x", Time(2), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(sub);
        bus.publish("a", b"x", Time(3), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[test]
    fn snapshot_lists_publishers() {
        let bus = LoopbackBus::new();
        bus.add_publisher(
            "a",
            "host1",
            "p1",
            TopicInfo {
                type_name: "proto:Pose".to_owned(),
                ..Default::default()
            },
        );
        bus.add_publisher("a", "host2", "p2", TopicInfo::default());
        let topics = bus.poll_topics();
        let a = topics.get("a").unwrap();
        assert_eq!(a.type_name, "proto:Pose");
        assert_eq!(a.publishers.len(), 2);
    }
}
