// Counter state store: last reading per CounterKey, sharded per device.
// A shard is behind an async mutex; whoever reconciles a device holds its shard
// exclusively for the duration, so each key has exactly one writer at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::CounterKey;
use crate::vendor::CounterWidth;

/// Last accepted reading of one counter.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterState {
    pub last_value: u64,
    pub last_seen: Instant,
    pub last_timestamp: DateTime<Utc>,
    pub width: CounterWidth,
    /// The counter's other column, when it was read at the same instant.
    pub alternate: Option<(CounterWidth, u64)>,
    /// Octets per second over the previous interval; used to estimate multi-wrap counts.
    pub rate_hint: Option<f64>,
    /// Consecutive intervals whose rates agreed within a factor of two.
    pub hint_intervals: u32,
}

impl CounterState {
    /// Value of the column of `width` as of `last_seen`.
    pub fn value(&self, width: CounterWidth) -> Option<u64> {
        if width == self.width {
            return Some(self.last_value);
        }
        self.alternate
            .filter(|(w, _)| *w == width)
            .map(|(_, value)| value)
    }
}

/// States of one device.
#[derive(Debug, Default)]
pub struct CounterShard {
    states: HashMap<CounterKey, CounterState>,
}

impl CounterShard {
    pub fn get(&self, key: &CounterKey) -> Option<&CounterState> {
        self.states.get(key)
    }

    pub fn insert(&mut self, key: CounterKey, state: CounterState) {
        self.states.insert(key, state);
    }

    pub fn remove(&mut self, key: &CounterKey) -> Option<CounterState> {
        self.states.remove(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&CounterKey) -> bool) {
        self.states.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

pub type SharedShard = Arc<tokio::sync::Mutex<CounterShard>>;

#[derive(Debug, Default)]
pub struct CounterStore {
    shards: Mutex<HashMap<String, SharedShard>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shard of a device if it has one.
    pub fn existing(&self, device_id: &str) -> Option<SharedShard> {
        self.shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .cloned()
    }

    /// Shard of a device, created empty on first use.
    pub fn shard(&self, device_id: &str) -> SharedShard {
        let mut shards = self
            .shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shards
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    pub fn remove_device(&self, device_id: &str) {
        let mut shards = self
            .shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shards.remove(device_id);
    }

    /// Drops shards of devices not accepted by `keep`.
    pub fn retain_devices(&self, mut keep: impl FnMut(&str) -> bool) {
        let mut shards = self
            .shards
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        shards.retain(|id, _| keep(id));
    }

    pub fn device_count(&self) -> usize {
        self.shards
            .lock()
            .map(|s| s.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Copy of the state of one key (waits for the shard's current writer).
    pub async fn state(&self, key: &CounterKey) -> Option<CounterState> {
        let shard = self.existing(&key.device_id)?;
        let guard = shard.lock().await;
        guard.get(key).cloned()
    }
}
