//! Runtime flags for the feeder process.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use super::restore::RestorePoint;
use super::{FeederConfig, FeederKind};

#[derive(Debug, Clone, Parser)]
#[command(name = "feeder", about = "Stream simulated bus telemetry on a fixed interval")]
pub struct FeederArgs {
    /// Comma-separated feeders to run, or `all`.
    #[arg(long, env = "BUS_FEEDERS", default_value = "all")]
    pub feeders: String,

    /// Catalog JSON as a local path or `s3://bucket/key`.
    #[arg(long, env = "BUS_CATALOG")]
    pub catalog: String,

    #[arg(long, env = "BUS_POSITION_INTERVAL_SECS", default_value_t = 15)]
    pub position_interval_secs: u64,

    #[arg(long, env = "BUS_PEOPLE_COUNT_INTERVAL_SECS", default_value_t = 60)]
    pub people_count_interval_secs: u64,

    #[arg(long, env = "BUS_SENSOR_INTERVAL_SECS", default_value_t = 30)]
    pub sensor_interval_secs: u64,

    /// `parquet:<dir>` or `timestream:<database>`.
    #[arg(long, env = "BUS_SINK", default_value = "parquet:data")]
    pub sink: SinkTarget,

    /// `sqs:<queue_url>`, `log`, or `none`.
    #[arg(long, env = "BUS_EVENTS", default_value = "log")]
    pub events: EventsTarget,

    /// Overrides the catalog seed.
    #[arg(long, env = "BUS_SEED")]
    pub seed: Option<u64>,

    /// Restore stop waiting counts from the sink before starting: `latest` or an RFC 3339 time.
    #[arg(long, env = "BUS_RESTORE")]
    pub restore: Option<RestorePoint>,
}

impl FeederArgs {
    pub fn interval_for(&self, kind: FeederKind) -> Duration {
        let secs = match kind {
            FeederKind::Position => self.position_interval_secs,
            FeederKind::PeopleCount => self.people_count_interval_secs,
            FeederKind::Sensor => self.sensor_interval_secs,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn feeder_configs(&self) -> Result<Vec<FeederConfig>, String> {
        Ok(parse_feeder_list(&self.feeders)?
            .into_iter()
            .map(|kind| FeederConfig::new(kind, self.interval_for(kind)))
            .collect())
    }
}

/// Parses `all` or a comma list, dropping duplicates while keeping order.
pub fn parse_feeder_list(value: &str) -> Result<Vec<FeederKind>, String> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(FeederKind::ALL.to_vec());
    }
    let mut kinds = Vec::new();
    for part in value.split(',').filter(|part| !part.trim().is_empty()) {
        let kind = part.parse::<FeederKind>()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err("at least one feeder must be selected".to_string());
    }
    Ok(kinds)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Parquet(PathBuf),
    Timestream { database: String },
}

impl FromStr for SinkTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some(("parquet", dir)) if !dir.is_empty() => Ok(Self::Parquet(PathBuf::from(dir))),
            Some(("timestream", database)) if !database.is_empty() => Ok(Self::Timestream {
                database: database.to_string(),
            }),
            _ => Err(format!(
                "invalid sink '{value}' (expected parquet:<dir> or timestream:<database>)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventsTarget {
    Sqs { queue_url: String },
    Log,
    None,
}

impl FromStr for EventsTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "log" => Ok(Self::Log),
            "none" => Ok(Self::None),
            _ => match value.split_once(':') {
                Some(("sqs", queue_url)) if !queue_url.is_empty() => Ok(Self::Sqs {
                    queue_url: queue_url.to_string(),
                }),
                _ => Err(format!(
                    "invalid events target '{value}' (expected sqs:<queue_url>, log or none)"
                )),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    Path(PathBuf),
    S3 { bucket: String, key: String },
}

impl CatalogSource {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.strip_prefix("s3://") {
            None => Ok(Self::Path(PathBuf::from(value))),
            Some(rest) => match rest.split_once('/') {
                Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }),
                _ => Err(format!("invalid S3 catalog URI '{value}'")),
            },
        }
    }
}
