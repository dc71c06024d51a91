// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

use base::clock::Instant;
use base::time::Time;

/// One captured message from the middleware.
///
/// Immutable once constructed; shared (`Arc<Frame>`) between the engine's
/// pre-buffer and any writer queues, so there is no frame-level lock.
pub struct Frame {
    pub payload: Vec<u8>,

    /// When the publisher stamped the message (middleware clock).
    pub publish_time: Time,

    /// When this process received the message (middleware clock).
    pub receive_time: Time,

    /// Receive time on the local monotonic clock; used for age comparisons
    /// only, never persisted.
    pub monotonic_receive_time: Instant,

    pub topic_name: String,

    /// The publisher's send counter.
    pub clock: i64,

    /// Message id; `0` when the middleware doesn't provide one.
    pub id: i64,
}

impl Frame {
    pub fn new(
        topic_name: impl Into<String>,
        payload: Vec<u8>,
        publish_time: Time,
        receive_time: Time,
        monotonic_receive_time: Instant,
        clock: i64,
    ) -> Self {
        Frame {
            payload,
            publish_time,
            receive_time,
            monotonic_receive_time,
            topic_name: topic_name.into(),
            clock,
            id: 0,
        }
    }
}

/// Custom `Debug` impl that skips the verbose `payload` field.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("topic_name", &self.topic_name)
            .field("payload_len", &self.payload.len())
            .field("publish_time", &self.publish_time)
            .field("receive_time", &self.receive_time)
            .field("monotonic_receive_time", &self.monotonic_receive_time)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
