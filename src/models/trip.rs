//! Canonical trip records and the quarantine side channel.

use std::fmt;

use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Timestamp layout used for hashing and display.
const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A normalized trip, independent of the export vintage it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TripRecord {
    /// Stable hash of stations and timestamps
    pub trip_id: String,

    pub start_station_id: String,
    pub end_station_id: String,

    /// Local wall-clock time as published
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,

    /// Seconds, validated against the timestamps
    pub duration_secs: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rider_category: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bike_category: Option<String>,

    /// Batch (vintage) the record was read from
    pub source_batch: String,
}

impl TripRecord {
    /// Derive the deduplication key for a trip.
    ///
    /// Exports carry no natural key that survives across vintages, so the id
    /// is a SHA-256 over start station, end station, start and end time. Two
    /// distinct trips with identical values collide by construction.
    pub fn derive_id(
        start_station_id: &str,
        end_station_id: &str,
        started_at: &NaiveDateTime,
        ended_at: &NaiveDateTime,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(start_station_id.as_bytes());
        hasher.update(b"|");
        hasher.update(end_station_id.as_bytes());
        hasher.update(b"|");
        hasher.update(started_at.format(KEY_TIMESTAMP_FORMAT).to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(ended_at.format(KEY_TIMESTAMP_FORMAT).to_string().as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Month partition of the start time, used to scope the key index.
    pub fn partition(&self) -> (i32, u32) {
        (self.started_at.year(), self.started_at.month())
    }
}

/// Why a row was routed to quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    MalformedRow,
    MissingStationId,
    UnparseableTimestamp,
    NonMonotonicTrip,
    DurationOutOfBounds,
    DurationMismatch,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::MalformedRow => "malformed-row",
            RejectReason::MissingStationId => "missing-station-id",
            RejectReason::UnparseableTimestamp => "unparseable-timestamp",
            RejectReason::NonMonotonicTrip => "non-monotonic-trip",
            RejectReason::DurationOutOfBounds => "duration-out-of-bounds",
            RejectReason::DurationMismatch => "duration-mismatch",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A row that failed validation, preserved with its reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuarantinedRow {
    pub batch_id: String,

    /// 1-based data row number (header excluded)
    pub row: usize,

    pub reason: RejectReason,

    /// Human-readable detail, never empty
    pub detail: String,

    /// Raw cells as read
    pub raw: Vec<String>,
}

impl QuarantinedRow {
    /// Identity of a quarantined row across re-runs.
    pub fn key(&self) -> (String, usize) {
        (self.batch_id.clone(), self.row)
    }
}
