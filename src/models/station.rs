//! Station status feed (GBFS-style) and normalized snapshots.
//!
//! Feeds in the wild disagree on small things: ids come as strings or
//! numbers, flags as booleans or `0`/`1`, and older versions use
//! `bikes_available` instead of `num_bikes_available`. The wire types
//! below accept all of these; [`StationEntry::normalize`] turns one entry
//! into a [`StationSnapshot`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

/// Top-level `station_status.json` document.
#[derive(Debug, Clone, Deserialize)]
pub struct StationFeed {
    /// Feed-reported publish time, POSIX seconds
    #[serde(default, deserialize_with = "flex_i64")]
    pub last_updated: Option<i64>,

    #[serde(default)]
    pub data: StationFeedData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StationFeedData {
    #[serde(default)]
    pub stations: Vec<StationEntry>,
}

/// One station as published.
#[derive(Debug, Clone, Deserialize)]
pub struct StationEntry {
    #[serde(default, alias = "id", deserialize_with = "flex_id")]
    pub station_id: Option<String>,

    #[serde(default, deserialize_with = "flex_u32")]
    pub capacity: Option<u32>,

    #[serde(default, alias = "bikes_available", deserialize_with = "flex_u32")]
    pub num_bikes_available: Option<u32>,

    #[serde(default, alias = "docks_available", deserialize_with = "flex_u32")]
    pub num_docks_available: Option<u32>,

    #[serde(default, deserialize_with = "flex_u32")]
    pub num_bikes_disabled: Option<u32>,

    #[serde(default, deserialize_with = "flex_u32")]
    pub num_docks_disabled: Option<u32>,

    #[serde(default, alias = "renting", deserialize_with = "flex_bool")]
    pub is_renting: Option<bool>,

    #[serde(default, alias = "returning", deserialize_with = "flex_bool")]
    pub is_returning: Option<bool>,

    #[serde(default, deserialize_with = "flex_i64")]
    pub last_reported: Option<i64>,
}

impl StationFeed {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated.and_then(epoch)
    }
}

impl StationEntry {
    /// Map a feed entry onto the snapshot schema.
    ///
    /// Returns `None` for entries without a usable station id.
    pub fn normalize(
        &self,
        polled_at: DateTime<Utc>,
        feed_last_updated: Option<DateTime<Utc>>,
    ) -> Option<StationSnapshot> {
        let station_id = self
            .station_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())?
            .to_string();

        let bikes = self.num_bikes_available.unwrap_or(0);
        let docks = self.num_docks_available.unwrap_or(0);
        let capacity = self.capacity.unwrap_or_else(|| {
            bikes
                .saturating_add(docks)
                .saturating_add(self.num_bikes_disabled.unwrap_or(0))
                .saturating_add(self.num_docks_disabled.unwrap_or(0))
        });

        Some(StationSnapshot {
            station_id,
            polled_at,
            capacity,
            bikes_available: bikes,
            docks_available: docks,
            is_renting: self.is_renting.unwrap_or(true),
            is_returning: self.is_returning.unwrap_or(true),
            feed_last_updated: feed_last_updated.or_else(|| self.last_reported.and_then(epoch)),
        })
    }
}

/// One point-in-time reading of a station.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StationSnapshot {
    pub station_id: String,
    pub polled_at: DateTime<Utc>,
    pub capacity: u32,
    pub bikes_available: u32,
    pub docks_available: u32,
    pub is_renting: bool,
    pub is_returning: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_last_updated: Option<DateTime<Utc>>,
}

fn epoch(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn flex_id<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Scalar>::deserialize(de)? {
        Some(Scalar::Text(s)) => Some(s),
        Some(Scalar::Int(n)) => Some(n.to_string()),
        Some(Scalar::Float(f)) if f.fract() == 0.0 => Some((f as i64).to_string()),
        _ => None,
    })
}

fn flex_i64<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<i64>, D::Error> {
    Ok(match Option::<Scalar>::deserialize(de)? {
        Some(Scalar::Int(n)) => Some(n),
        Some(Scalar::Float(f)) => Some(f as i64),
        Some(Scalar::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn flex_u32<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<u32>, D::Error> {
    Ok(flex_i64(de)?.and_then(|n| u32::try_from(n.max(0)).ok()))
}

fn flex_bool<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<bool>, D::Error> {
    Ok(match Option::<Scalar>::deserialize(de)? {
        Some(Scalar::Bool(b)) => Some(b),
        Some(Scalar::Int(n)) => Some(n != 0),
        Some(Scalar::Float(f)) => Some(f != 0.0),
        Some(Scalar::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"{
        "last_updated": 1700000000,
        "ttl": 0,
        "data": {"stations": [
            {"station_id": "0152", "num_bikes_available": 3, "num_docks_available": 9,
             "capacity": 12, "is_renting": 1, "is_returning": true},
            {"station_id": 20, "bikes_available": "4", "docks_available": 2,
             "num_bikes_disabled": 1, "is_renting": false, "is_returning": 0},
            {"num_bikes_available": 1, "num_docks_available": 1}
        ]}
    }"#;

    #[test]
    fn parses_field_variants() {
        let feed = StationFeed::parse(FEED.as_bytes()).unwrap();
        assert_eq!(feed.data.stations.len(), 3);
        assert_eq!(feed.data.stations[1].station_id.as_deref(), Some("20"));
        assert_eq!(feed.data.stations[1].num_bikes_available, Some(4));
        assert_eq!(feed.data.stations[0].is_renting, Some(true));
        assert_eq!(feed.data.stations[1].is_returning, Some(false));
    }

    #[test]
    fn normalize_derives_capacity_and_drops_missing_ids() {
        let feed = StationFeed::parse(FEED.as_bytes()).unwrap();
        let now = Utc::now();
        let updated = feed.last_updated_at();
        let snaps: Vec<_> = feed
            .data
            .stations
            .iter()
            .filter_map(|s| s.normalize(now, updated))
            .collect();

        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].capacity, 12);
        assert_eq!(snaps[1].capacity, 7);
        assert!(!snaps[1].is_renting);
        assert_eq!(snaps[0].feed_last_updated, epoch(1_700_000_000));
    }

    #[test]
    fn derived_capacity_saturates_on_absurd_counts() {
        let feed = r#"{"data": {"stations": [
            {"station_id": "0152", "num_bikes_available": 4294967295, "num_docks_available": 1}
        ]}}"#;
        let feed = StationFeed::parse(feed.as_bytes()).unwrap();
        let snap = feed.data.stations[0].normalize(Utc::now(), None).unwrap();
        assert_eq!(snap.capacity, u32::MAX);
        assert_eq!(snap.docks_available, 1);
    }
}
