//! Fixed-interval feeder orchestrator.
//!
//! A feeder walks `Uninitialized -> ConfigLoaded -> ClientsReady -> Running -> Stopped`.
//! Each tick simulates under the shared context lock, persists one batch and
//! then publishes events best-effort, concurrently and within whatever is left
//! of the interval. Nothing inside a tick ends the loop; only the shutdown
//! signal does, and it is observed between ticks.

pub mod config;
pub mod records;
pub mod restore;
pub mod tick;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bus_sim_core::context::SharedContext;
use bus_stream_core::contract::StreamEvent;
use bus_stream_core::naming::{TableKind, TopicKind};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::adapters::event_bus::EventPublisher;
use crate::adapters::time_series::TimeSeriesStore;
use crate::logging::{log_error, log_info, log_warn};

use self::tick::{simulator_for, TickSimulator};

const COMPONENT: &str = "feeder";

/// Ticks may cover at most this many intervals of simulated time.
pub const MAX_CATCH_UP_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeederKind {
    Position,
    PeopleCount,
    Sensor,
}

impl FeederKind {
    pub const ALL: [FeederKind; 3] = [Self::Position, Self::PeopleCount, Self::Sensor];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::PeopleCount => "people_count",
            Self::Sensor => "sensor",
        }
    }

    pub fn table(self) -> TableKind {
        match self {
            Self::Position => TableKind::BusPositions,
            Self::PeopleCount => TableKind::StopPeopleCount,
            Self::Sensor => TableKind::SensorReadings,
        }
    }

    pub fn topic(self) -> TopicKind {
        match self {
            Self::Position => TopicKind::BusPosition,
            Self::PeopleCount => TopicKind::StopPeopleCount,
            Self::Sensor => TopicKind::Sensor,
        }
    }

    pub fn default_interval(self) -> Duration {
        match self {
            Self::Position => Duration::from_secs(15),
            Self::PeopleCount => Duration::from_secs(60),
            Self::Sensor => Duration::from_secs(30),
        }
    }
}

impl FromStr for FeederKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "position" => Ok(Self::Position),
            "people_count" | "people-count" => Ok(Self::PeopleCount),
            "sensor" => Ok(Self::Sensor),
            other => Err(format!(
                "unknown feeder '{other}' (expected position, people_count or sensor)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeederPhase {
    Uninitialized,
    ConfigLoaded,
    ClientsReady,
    Running,
    Stopped,
}

impl FeederPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ConfigLoaded => "config_loaded",
            Self::ClientsReady => "clients_ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }

    fn can_become(self, next: FeederPhase) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::ConfigLoaded)
                | (Self::ConfigLoaded, Self::ClientsReady)
                | (Self::ClientsReady, Self::Running)
                | (Self::Running, Self::Stopped)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeederError {
    #[error("feeder cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: FeederPhase, to: FeederPhase },
    #[error("feeder is not ready to tick (phase {0:?})")]
    NotReady(FeederPhase),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeederConfig {
    pub kind: FeederKind,
    pub interval: Duration,
    pub max_catch_up: Duration,
}

impl FeederConfig {
    pub fn new(kind: FeederKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            max_catch_up: interval * MAX_CATCH_UP_INTERVALS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub kind: FeederKind,
    pub tick_at: DateTime<Utc>,
    pub records_written: usize,
    pub entities_ok: usize,
    pub entities_failed: usize,
    pub events_published: usize,
    pub events_failed: usize,
    pub persisted: bool,
    pub elapsed: Duration,
}

/// Simulated time covered by a tick: wall time since the previous tick, the
/// interval for the first tick, never more than `max_catch_up`.
pub fn simulated_elapsed(
    previous: Option<Instant>,
    now: Instant,
    interval: Duration,
    max_catch_up: Duration,
) -> Duration {
    match previous {
        None => interval,
        Some(previous) => now.saturating_duration_since(previous).min(max_catch_up),
    }
}

pub struct Feeder {
    config: FeederConfig,
    phase: FeederPhase,
    simulator: Box<dyn TickSimulator>,
    context: Option<SharedContext>,
    store: Option<Arc<dyn TimeSeriesStore>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Feeder {
    pub fn new(config: FeederConfig) -> Self {
        Self {
            simulator: simulator_for(config.kind),
            config,
            phase: FeederPhase::Uninitialized,
            context: None,
            store: None,
            publisher: None,
        }
    }

    pub fn kind(&self) -> FeederKind {
        self.config.kind
    }

    pub fn config(&self) -> &FeederConfig {
        &self.config
    }

    pub fn phase(&self) -> FeederPhase {
        self.phase
    }

    fn transition(&mut self, next: FeederPhase) -> Result<(), FeederError> {
        if !self.phase.can_become(next) {
            return Err(FeederError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        log_info(
            COMPONENT,
            "phase_changed",
            json!({
                "feeder": self.config.kind.as_str(),
                "from": self.phase.as_str(),
                "to": next.as_str(),
            }),
        );
        self.phase = next;
        Ok(())
    }

    pub fn load_config(&mut self, context: SharedContext) -> Result<(), FeederError> {
        self.transition(FeederPhase::ConfigLoaded)?;
        self.context = Some(context);
        Ok(())
    }

    pub fn attach_clients(
        &mut self,
        store: Arc<dyn TimeSeriesStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<(), FeederError> {
        self.transition(FeederPhase::ClientsReady)?;
        self.store = Some(store);
        self.publisher = Some(publisher);
        Ok(())
    }

    fn ready(
        &self,
    ) -> Result<(SharedContext, Arc<dyn TimeSeriesStore>, Arc<dyn EventPublisher>), FeederError>
    {
        if !matches!(self.phase, FeederPhase::ClientsReady | FeederPhase::Running) {
            return Err(FeederError::NotReady(self.phase));
        }
        match (&self.context, &self.store, &self.publisher) {
            (Some(context), Some(store), Some(publisher)) => Ok((
                Arc::clone(context),
                Arc::clone(store),
                Arc::clone(publisher),
            )),
            _ => Err(FeederError::NotReady(self.phase)),
        }
    }

    /// One simulate, persist, publish cycle. Entity, store and publish
    /// failures are reported in the summary, never returned as errors.
    pub async fn run_tick(
        &mut self,
        at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<TickSummary, FeederError> {
        let (context, store, publisher) = self.ready()?;
        let started = Instant::now();
        let kind = self.config.kind;

        let output = {
            let mut guard = match context.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    log_warn(
                        COMPONENT,
                        "context_lock_poisoned",
                        json!({ "feeder": kind.as_str() }),
                    );
                    poisoned.into_inner()
                }
            };
            self.simulator.simulate(&mut guard, at, elapsed)
        };

        for failure in &output.failures {
            log_warn(
                COMPONENT,
                "entity_skipped",
                json!({
                    "feeder": kind.as_str(),
                    "entity_id": failure.entity_id,
                    "error": failure.error.to_string(),
                }),
            );
        }

        let (persisted, records_written) = if output.records.is_empty() {
            (true, 0)
        } else {
            match store.write_batch(kind.table(), &output.records).await {
                Ok(written) => (true, written),
                Err(error) => {
                    log_error(
                        COMPONENT,
                        "batch_write_failed",
                        json!({
                            "feeder": kind.as_str(),
                            "table": kind.table().as_str(),
                            "records": output.records.len(),
                            "error": error.to_string(),
                        }),
                    );
                    (false, 0)
                }
            }
        };

        let budget = self.config.interval.saturating_sub(started.elapsed());
        let (events_published, events_failed) =
            publish_events(kind, publisher, output.events, budget).await;

        Ok(TickSummary {
            kind,
            tick_at: at,
            records_written,
            entities_ok: output.entities_ok,
            entities_failed: output.failures.len(),
            events_published,
            events_failed,
            persisted,
            elapsed: started.elapsed(),
        })
    }

    /// Runs ticks until `shutdown` carries `true` or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeederError> {
        self.transition(FeederPhase::Running)?;
        let interval = self.config.interval;
        let mut previous: Option<Instant> = None;

        while !*shutdown.borrow() {
            let started = Instant::now();
            let elapsed = simulated_elapsed(previous, started, interval, self.config.max_catch_up);
            previous = Some(started);

            match self.run_tick(Utc::now(), elapsed).await {
                Ok(summary) => log_tick(&summary),
                Err(error) => log_error(
                    COMPONENT,
                    "tick_failed",
                    json!({ "feeder": self.config.kind.as_str(), "error": error.to_string() }),
                ),
            }

            let took = started.elapsed();
            let pause = match interval.checked_sub(took) {
                Some(pause) => pause,
                None => {
                    log_warn(
                        COMPONENT,
                        "tick_overran_interval",
                        json!({
                            "feeder": self.config.kind.as_str(),
                            "tick_ms": took.as_millis(),
                            "interval_ms": interval.as_millis(),
                        }),
                    );
                    Duration::ZERO
                }
            };
            if wait_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }

        self.transition(FeederPhase::Stopped)
    }
}

/// Publishes every event concurrently and gives up on whatever has not
/// finished within `budget`. Returns `(published, failed)`; abandoned
/// events count as failed.
async fn publish_events(
    kind: FeederKind,
    publisher: Arc<dyn EventPublisher>,
    events: Vec<StreamEvent>,
    budget: Duration,
) -> (usize, usize) {
    let total = events.len();
    if total == 0 {
        return (0, 0);
    }

    let topic = kind.topic();
    let mut pending = JoinSet::new();
    for event in events {
        let publisher = Arc::clone(&publisher);
        pending.spawn(async move { publisher.publish(topic, &event).await });
    }

    let mut published = 0usize;
    let mut first_error: Option<String> = None;
    let drained = tokio::time::timeout(budget, async {
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Ok(())) => published += 1,
                Ok(Err(error)) => {
                    first_error.get_or_insert_with(|| error.to_string());
                }
                Err(error) => {
                    first_error.get_or_insert_with(|| format!("publish task failed: {error}"));
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        log_warn(
            COMPONENT,
            "publish_timed_out",
            json!({
                "feeder": kind.as_str(),
                "topic": topic.as_str(),
                "abandoned": pending.len(),
                "budget_ms": budget.as_millis(),
            }),
        );
        pending.abort_all();
    }
    let failed = total - published;
    if let Some(error) = first_error {
        log_warn(
            COMPONENT,
            "publish_failed",
            json!({
                "feeder": kind.as_str(),
                "topic": topic.as_str(),
                "failed": failed,
                "first_error": error,
            }),
        );
    }
    (published, failed)
}

/// Sleeps for `pause`; returns true as soon as shutdown is requested.
async fn wait_or_shutdown(pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(pause);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

fn log_tick(summary: &TickSummary) {
    log_info(
        COMPONENT,
        "tick_completed",
        json!({
            "feeder": summary.kind.as_str(),
            "tick_at": summary.tick_at.to_rfc3339(),
            "records_written": summary.records_written,
            "entities_ok": summary.entities_ok,
            "entities_failed": summary.entities_failed,
            "events_published": summary.events_published,
            "events_failed": summary.events_failed,
            "persisted": summary.persisted,
            "duration_ms": summary.elapsed.as_millis(),
        }),
    );
}
