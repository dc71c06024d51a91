// This file is part of Nightjar, a distributed pub/sub measurement recorder.
// Copyright (C) 2025 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

pub mod clock;
mod error;
pub mod shutdown;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

/// Hash map with a fast, non-DoS-resistant hasher, for internal maps keyed by
/// trusted data (topic names, addon ids).
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Hash set variant of [`FastHashMap`].
pub type FastHashSet<K> = std::collections::HashSet<K, ahash::RandomState>;
