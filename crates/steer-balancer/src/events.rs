//! Event log: buffers delay, down, and perf records until the next flush.
//!
//! Records are held in memory and written to the store as one batch per
//! tick. Subscribers get each record as it is recorded.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use steer_state::{DelayEvent, DownEvent, EventRecord, PerfSnapshot, StateResult, StateStore};

/// Capacity of the subscriber channel. Slow subscribers skip ahead.
const FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Pending {
    buffer: Vec<EventRecord>,
    /// Backend name → delay events blaming it since the last perf snapshot.
    delay_counts: HashMap<String, u64>,
}

pub struct EventLog {
    store: StateStore,
    pending: Mutex<Pending>,
    feed: broadcast::Sender<EventRecord>,
}

impl EventLog {
    pub fn new(store: StateStore) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            store,
            pending: Mutex::new(Pending::default()),
            feed,
        }
    }

    /// Receive every event recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.feed.subscribe()
    }

    pub fn record_delay(&self, event: DelayEvent) {
        info!(
            session = %event.session_id,
            prev = %event.prev_backend,
            new = %event.new_backend,
            "delay detected, backend blacklisted"
        );
        let mut pending = self.lock();
        *pending.delay_counts.entry(event.prev_backend.clone()).or_insert(0) += 1;
        self.push(&mut pending, EventRecord::Delay(event));
    }

    pub fn record_down(&self, event: DownEvent) {
        info!(
            down = ?event.down_backend_names,
            sessions = event.prev_session_count,
            distribution = ?event.distribution_counts,
            "backends down"
        );
        let mut pending = self.lock();
        self.push(&mut pending, EventRecord::Down(event));
    }

    pub fn record_perf(&self, snapshot: PerfSnapshot) {
        debug!(
            current_cost = snapshot.current_cost,
            ceiling = ?snapshot.cost_ceiling,
            backends = snapshot.backends.len(),
            "perf snapshot"
        );
        let mut pending = self.lock();
        self.push(&mut pending, EventRecord::Perf(snapshot));
    }

    /// Delay counts per backend name since the previous call, resetting them.
    pub fn take_delay_counts(&self) -> HashMap<String, u64> {
        std::mem::take(&mut self.lock().delay_counts)
    }

    /// Number of records waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Write buffered records in one batch.
    ///
    /// On failure the records stay buffered for the next attempt.
    pub fn flush(&self) -> StateResult<usize> {
        let batch = std::mem::take(&mut self.lock().buffer);
        if batch.is_empty() {
            return Ok(0);
        }
        match self.store.append_events(&batch) {
            Ok(written) => Ok(written),
            Err(e) => {
                error!(error = %e, count = batch.len(), "event flush failed");
                let mut pending = self.lock();
                let newer = std::mem::replace(&mut pending.buffer, batch);
                pending.buffer.extend(newer);
                Err(e)
            }
        }
    }

    fn push(&self, pending: &mut Pending, record: EventRecord) {
        // No subscribers is fine.
        let _ = self.feed.send(record.clone());
        pending.buffer.push(record);
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
