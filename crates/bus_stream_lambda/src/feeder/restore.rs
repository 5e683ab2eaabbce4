//! Warm start: seed stop waiting counts from persisted people-count rows so a
//! restarted process continues where the previous one stopped.

use std::str::FromStr;
use std::sync::{MutexGuard, PoisonError};

use bus_sim_core::context::{SharedContext, SimulationContext};
use bus_stream_core::contract::DimensionFilter;
use bus_stream_core::naming::{measures, TableKind};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::adapters::time_series::TimeSeriesStore;
use crate::logging::{log_info, log_warn};

const COMPONENT: &str = "restore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePoint {
    Latest,
    AtOrBefore(DateTime<Utc>),
}

impl FromStr for RestorePoint {
    type Err = String;

    /// `latest` or an RFC 3339 timestamp.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        DateTime::parse_from_rfc3339(value)
            .map(|at| Self::AtOrBefore(at.with_timezone(&Utc)))
            .map_err(|error| {
                format!("invalid restore point '{value}' (expected latest or RFC 3339): {error}")
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub missing: usize,
    pub failed: usize,
}

fn lock(context: &SharedContext) -> MutexGuard<'_, SimulationContext> {
    context.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Restores every stop that has a persisted row. Stops without one keep
/// their seeded count; lookup failures are logged and skipped.
pub async fn restore_waiting_counts(
    context: &SharedContext,
    store: &dyn TimeSeriesStore,
    point: RestorePoint,
) -> RestoreSummary {
    let stop_ids: Vec<String> = lock(context)
        .ledger()
        .stop_ids()
        .map(str::to_string)
        .collect();
    let mut summary = RestoreSummary::default();

    for stop_id in stop_ids {
        let filter = DimensionFilter::new()
            .measure_name(measures::STOP_STATE)
            .dimension("stop_id", stop_id.as_str());
        let found = match point {
            RestorePoint::Latest => store.query_latest(TableKind::StopPeopleCount, &filter).await,
            RestorePoint::AtOrBefore(at) => {
                store
                    .query_at_or_before(TableKind::StopPeopleCount, &filter, at)
                    .await
            }
        };
        let record = match found {
            Ok(Some(record)) => record,
            Ok(None) => {
                summary.missing += 1;
                continue;
            }
            Err(error) => {
                summary.failed += 1;
                log_warn(
                    COMPONENT,
                    "restore_lookup_failed",
                    json!({ "stop_id": stop_id, "error": error.to_string() }),
                );
                continue;
            }
        };

        let waiting = record
            .measures
            .get("waiting_count")
            .and_then(|value| value.as_f64())
            .filter(|count| count.is_finite() && *count >= 0.0);
        let Some(waiting) = waiting else {
            summary.failed += 1;
            log_warn(
                COMPONENT,
                "restore_row_invalid",
                json!({ "stop_id": stop_id, "time_ms": record.time_ms }),
            );
            continue;
        };
        let restored = lock(context).restore_waiting(&stop_id, waiting.round() as u32);
        match restored {
            Ok(()) => summary.restored += 1,
            Err(error) => {
                summary.failed += 1;
                log_warn(
                    COMPONENT,
                    "restore_rejected",
                    json!({ "stop_id": stop_id, "error": error.to_string() }),
                );
            }
        }
    }

    log_info(
        COMPONENT,
        "waiting_counts_restored",
        json!({
            "restored": summary.restored,
            "missing": summary.missing,
            "failed": summary.failed,
        }),
    );
    summary
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_restore_points() {
        assert_eq!("latest".parse::<RestorePoint>(), Ok(RestorePoint::Latest));
        assert_eq!(
            "2026-03-02T09:30:00+01:00".parse::<RestorePoint>(),
            Ok(RestorePoint::AtOrBefore(
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap()
            ))
        );
        assert!("yesterday".parse::<RestorePoint>().is_err());
    }
}
