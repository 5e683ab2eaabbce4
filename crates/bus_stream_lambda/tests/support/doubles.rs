#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use bus_sim_core::context::{SharedContext, SimulationContext};
use bus_sim_core::test_helpers::{sample_catalog, TEST_SEED};
use bus_stream_core::contract::{select_latest, DimensionFilter, StreamEvent, TimeSeriesRecord};
use bus_stream_core::naming::{TableKind, TopicKind};
use bus_stream_lambda::adapters::event_bus::{EventPublisher, PublishError};
use bus_stream_lambda::adapters::time_series::{StoreError, TimeSeriesStore};
use bus_stream_lambda::adapters::transport::{DeliveryError, Transport};

pub fn shared_sample_context() -> SharedContext {
    SimulationContext::with_seed(Arc::new(sample_catalog()), TEST_SEED).into_shared()
}

/// Store that remembers every batch and can be told to fail.
#[derive(Default)]
pub struct RecordingStore {
    batches: Mutex<Vec<(TableKind, Vec<TimeSeriesRecord>)>>,
    calls: Mutex<usize>,
    fail: AtomicBool,
    write_delay: Option<Duration>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let store = Self::default();
        store.fail.store(true, Ordering::SeqCst);
        store
    }

    /// Every write takes `delay` before it lands.
    pub fn slow(delay: Duration) -> Self {
        Self {
            write_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn batches(&self) -> Vec<(TableKind, Vec<TimeSeriesRecord>)> {
        self.batches.lock().expect("poisoned mutex").clone()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("poisoned mutex")
    }

    pub fn seed(&self, table: TableKind, records: Vec<TimeSeriesRecord>) {
        self.batches
            .lock()
            .expect("poisoned mutex")
            .push((table, records));
    }

    fn latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at_or_before_ms: Option<i64>,
    ) -> Option<TimeSeriesRecord> {
        let batches = self.batches.lock().expect("poisoned mutex");
        let rows = batches
            .iter()
            .filter(|(written_to, _)| *written_to == table)
            .flat_map(|(_, records)| records.iter());
        select_latest(rows, filter, at_or_before_ms).cloned()
    }
}

#[async_trait]
impl TimeSeriesStore for RecordingStore {
    async fn write_batch(
        &self,
        table: TableKind,
        records: &[TimeSeriesRecord],
    ) -> Result<usize, StoreError> {
        *self.calls.lock().expect("poisoned mutex") += 1;
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Write {
                table,
                reason: "throttled".to_string(),
            });
        }
        self.batches
            .lock()
            .expect("poisoned mutex")
            .push((table, records.to_vec()));
        Ok(records.len())
    }

    async fn query_latest(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        Ok(self.latest(table, filter, None))
    }

    async fn query_at_or_before(
        &self,
        table: TableKind,
        filter: &DimensionFilter,
        at: DateTime<Utc>,
    ) -> Result<Option<TimeSeriesRecord>, StoreError> {
        Ok(self.latest(table, filter, Some(at.timestamp_millis())))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(TopicKind, StreamEvent)>>,
    fail: AtomicBool,
    stall: Option<Duration>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.fail.store(true, Ordering::SeqCst);
        publisher
    }

    /// Every publish hangs for `stall` before it is accepted.
    pub fn stalling(stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<(TopicKind, StreamEvent)> {
        self.published.lock().expect("poisoned mutex").clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: TopicKind, event: &StreamEvent) -> Result<(), PublishError> {
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Transport {
                topic,
                reason: "queue unavailable".to_string(),
            });
        }
        self.published
            .lock()
            .expect("poisoned mutex")
            .push((topic, event.clone()));
        Ok(())
    }
}

/// Transport with a scripted outcome per connection; unscripted ids succeed.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<HashMap<String, DeliveryError>>,
    delays: Mutex<HashMap<String, Duration>>,
    delivered: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, connection_id: &str, error: DeliveryError) {
        self.outcomes
            .lock()
            .expect("poisoned mutex")
            .insert(connection_id.to_string(), error);
    }

    pub fn delay(&self, connection_id: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("poisoned mutex")
            .insert(connection_id.to_string(), delay);
    }

    pub fn delivered_to(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .delivered
            .lock()
            .expect("poisoned mutex")
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.delivered
            .lock()
            .expect("poisoned mutex")
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, connection_id: &str, payload: &[u8]) -> Result<(), DeliveryError> {
        let delay = self
            .delays
            .lock()
            .expect("poisoned mutex")
            .get(connection_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self
            .outcomes
            .lock()
            .expect("poisoned mutex")
            .get(connection_id)
            .cloned()
        {
            return Err(error);
        }
        self.delivered
            .lock()
            .expect("poisoned mutex")
            .push((connection_id.to_string(), payload.to_vec()));
        Ok(())
    }
}
