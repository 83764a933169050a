// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-windowed suppression of repeated identical readings.

use crate::reading::{Address, Value};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and replay.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Key identifying one channel of one node.
pub type DedupKey = (Address, String);

#[derive(Debug, Clone)]
struct LastSeen {
    value: Value,
    at: Instant,
}

/// Last published value per (address, port).
///
/// Each call locks only the map shard that holds its key, so readings from
/// the radio and from discovery rounds never serialize on unrelated keys.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    last: DashMap<DedupKey, LastSeen>,
}

impl Deduplicator {
    /// A zero window disables suppression.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: DashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether a reading should be published, recording it if so.
    ///
    /// Suppressed readings leave the stored instant untouched, so a value
    /// repeated continuously is republished once per window.
    pub fn should_publish(&self, key: DedupKey, value: &Value, now: Instant) -> bool {
        if self.window.is_zero() {
            return true;
        }

        match self.last.entry(key) {
            Entry::Occupied(mut occupied) => {
                let seen = occupied.get_mut();
                let within = now.saturating_duration_since(seen.at) < self.window;
                if seen.value == *value && within {
                    return false;
                }
                seen.value = value.clone();
                seen.at = now;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LastSeen {
                    value: value.clone(),
                    at: now,
                });
            }
        }
        true
    }

    /// Drop keys whose window has elapsed; returns how many were removed.
    ///
    /// An expired entry no longer suppresses anything, so forgetting it does
    /// not change which readings are published.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.last.len();
        self.last
            .retain(|_, seen| now.saturating_duration_since(seen.at) < self.window);
        before.saturating_sub(self.last.len())
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.last.clear();
    }

    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
