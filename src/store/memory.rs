//! In-process implementation of the counter and sink contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{daily_logs_key, CounterStore, LogSink};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::telemetry::LogRecord;

struct Counter {
    value: i64,
    expires_at: Option<DateTime<Utc>>,
}

struct DailyList {
    entries: VecDeque<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    counters: HashMap<String, Counter>,
    recent: VecDeque<String>,
    daily: HashMap<String, DailyList>,
    /// Earliest time the next full counter sweep may run
    next_counter_sweep: Option<DateTime<Utc>>,
}

impl State {
    /// Drop every expired counter, at most once per sweep interval.
    fn sweep_counters(&mut self, now: DateTime<Utc>) {
        if self.next_counter_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.counters
            .retain(|_, c| c.expires_at.map_or(true, |at| at > now));
        self.next_counter_sweep = Some(now + to_chrono(COUNTER_SWEEP_INTERVAL));
    }

    fn sweep_daily(&mut self, now: DateTime<Utc>) {
        self.daily.retain(|_, d| d.expires_at > now);
    }
}

/// Minimum clock time between two full counter sweeps.
const COUNTER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Store kept entirely in process memory.
///
/// Expiry is evaluated lazily against the injected clock. Records are kept
/// serialized, the same as in Redis, so reads exercise the decoding path.
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    recent_capacity: usize,
    daily_retention: Duration,
}

impl MemoryStore {
    pub fn new(recent_capacity: usize) -> Self {
        Self::with_clock(recent_capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(recent_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            recent_capacity: recent_capacity.max(1),
            daily_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }

    pub fn with_daily_retention(mut self, retention: Duration) -> Self {
        self.daily_retention = retention;
        self
    }

    /// Current value of a live counter.
    pub fn counter_value(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        purge_counter(&mut state, key, now);
        state.counters.get(key).map(|c| c.value)
    }

    /// Number of entries on a live per-day list.
    pub fn daily_len(&self, key: &str) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.daily.get(key).is_some_and(|d| d.expires_at <= now) {
            state.daily.remove(key);
        }
        state.daily.get(key).map_or(0, |d| d.entries.len())
    }

    /// Number of entries on the recent list.
    pub fn recent_len(&self) -> usize {
        self.state.lock().recent.len()
    }

    /// Number of counters held, live or not yet swept.
    pub fn counter_count(&self) -> usize {
        self.state.lock().counters.len()
    }

    /// Number of per-day lists held, live or not yet swept.
    pub fn daily_count(&self) -> usize {
        self.state.lock().daily.len()
    }
}

fn purge_counter(state: &mut State, key: &str, now: DateTime<Utc>) {
    let expired = state
        .counters
        .get(key)
        .and_then(|c| c.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        state.counters.remove(key);
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        purge_counter(&mut state, key, now);
        state.sweep_counters(now);

        let counter = state.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        purge_counter(&mut state, key, now);

        if let Some(counter) = state.counters.get_mut(key) {
            counter.expires_at = Some(now + to_chrono(ttl));
        }
        Ok(())
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        purge_counter(&mut state, key, now);

        Ok(state
            .counters
            .get(key)
            .and_then(|c| c.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn append(&self, record: &LogRecord) -> Result<()> {
        let raw = record.to_json()?;
        let now = self.clock.now();
        let day_key = daily_logs_key(now);
        let expires_at = now + to_chrono(self.daily_retention);

        let mut state = self.state.lock();
        state.recent.push_front(raw.clone());
        state.recent.truncate(self.recent_capacity);

        state.sweep_daily(now);
        let daily = state.daily.entry(day_key).or_insert_with(|| DailyList {
            entries: VecDeque::new(),
            expires_at,
        });
        daily.entries.push_front(raw);
        daily.expires_at = expires_at;
        Ok(())
    }

    async fn load_recent(&self, limit: usize) -> Result<Vec<LogRecord>> {
        let limit = limit.min(self.recent_capacity);
        let state = self.state.lock();
        Ok(state
            .recent
            .iter()
            .take(limit)
            .filter_map(|raw| LogRecord::from_json(raw).ok())
            .collect())
    }

    fn recent_capacity(&self) -> usize {
        self.recent_capacity
    }
}
