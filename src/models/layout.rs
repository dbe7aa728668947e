//! Per-vintage CSV layouts for historical trip exports.
//!
//! Each layout is a named entry in an explicit mapping table: canonical
//! fields, the header aliases they appear under, accepted date formats,
//! the duration unit and how station ids are written. Matching a batch
//! against the table is purely structural (header comparison).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Canonical trip fields a layout can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripField {
    StartTime,
    EndTime,
    StartStation,
    EndStation,
    Duration,
    RiderCategory,
    BikeCategory,
}

impl TripField {
    /// Fields every layout must map.
    pub const REQUIRED: [TripField; 4] = [
        TripField::StartTime,
        TripField::EndTime,
        TripField::StartStation,
        TripField::EndStation,
    ];

    pub fn is_required(self) -> bool {
        Self::REQUIRED.contains(&self)
    }
}

impl fmt::Display for TripField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TripField::StartTime => "start_time",
            TripField::EndTime => "end_time",
            TripField::StartStation => "start_station",
            TripField::EndStation => "end_station",
            TripField::Duration => "duration",
            TripField::RiderCategory => "rider_category",
            TripField::BikeCategory => "bike_category",
        };
        f.write_str(name)
    }
}

/// Readings beyond this are corrupt cells, not trips.
const MAX_READING_SECS: f64 = 1e12;

/// Unit of the duration column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    #[default]
    Seconds,
    Minutes,
    Milliseconds,
}

impl DurationUnit {
    /// Convert a raw reading to whole seconds.
    ///
    /// `None` for NaN, infinities and readings too large to be a trip.
    pub fn to_seconds(self, value: f64) -> Option<i64> {
        let secs = match self {
            DurationUnit::Seconds => value,
            DurationUnit::Minutes => value * 60.0,
            DurationUnit::Milliseconds => value / 1000.0,
        };
        (secs.is_finite() && secs.abs() <= MAX_READING_SECS).then(|| secs.round() as i64)
    }
}

/// How a station column encodes the station id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StationFormat {
    /// The cell is the id
    #[default]
    Plain,
    /// The id is the leading token, e.g. `0152 Main & Union`
    LeadingCode,
}

impl StationFormat {
    pub fn station_id(self, cell: &str) -> Option<String> {
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        match self {
            StationFormat::Plain => Some(cell.to_string()),
            StationFormat::LeadingCode => {
                let code = cell.split_whitespace().next()?;
                code.chars()
                    .all(|c| c.is_ascii_alphanumeric())
                    .then(|| code.to_string())
                    .filter(|code| code.chars().any(|c| c.is_ascii_digit()))
            }
        }
    }
}

/// Header aliases for one canonical field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub field: TripField,
    pub aliases: Vec<String>,
}

/// One named vintage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaLayout {
    pub name: String,
    pub columns: Vec<ColumnMapping>,
    pub date_formats: Vec<String>,
    #[serde(default)]
    pub duration_unit: DurationUnit,
    #[serde(default)]
    pub station_format: StationFormat,
}

/// A layout resolved against a concrete header row.
#[derive(Debug, Clone)]
pub struct ResolvedLayout<'a> {
    pub layout: &'a SchemaLayout,
    positions: HashMap<TripField, usize>,
}

impl ResolvedLayout<'_> {
    /// Column index for a field, if the header carries it.
    pub fn position(&self, field: TripField) -> Option<usize> {
        self.positions.get(&field).copied()
    }

    pub fn matched_columns(&self) -> usize {
        self.positions.len()
    }
}

impl SchemaLayout {
    /// Resolve this layout against a header row.
    ///
    /// Returns `None` when any required field has no matching column.
    pub fn resolve<'a>(&'a self, header: &[String]) -> Option<ResolvedLayout<'a>> {
        let mut positions = HashMap::new();
        for mapping in &self.columns {
            let found = header.iter().position(|h| {
                mapping
                    .aliases
                    .iter()
                    .any(|alias| normalize_header(alias) == *h)
            });
            match found {
                Some(idx) => {
                    positions.insert(mapping.field, idx);
                }
                None if mapping.field.is_required() => return None,
                None => {}
            }
        }
        Some(ResolvedLayout {
            layout: self,
            positions,
        })
    }

    /// Pick the most specific layout for a header row.
    ///
    /// The layout matching the most columns wins; ties go to table order.
    pub fn select<'a>(layouts: &'a [SchemaLayout], header: &[String]) -> Option<ResolvedLayout<'a>> {
        let mut best: Option<ResolvedLayout<'a>> = None;
        for layout in layouts {
            if let Some(resolved) = layout.resolve(header) {
                let better = best
                    .as_ref()
                    .is_none_or(|b| resolved.matched_columns() > b.matched_columns());
                if better {
                    best = Some(resolved);
                }
            }
        }
        best
    }

    pub fn validate(&self) -> Result<()> {
        for field in TripField::REQUIRED {
            if !self.columns.iter().any(|c| c.field == field) {
                return Err(AppError::validation(format!(
                    "Layout '{}' does not map required field {}",
                    self.name, field
                )));
            }
        }
        if self.date_formats.is_empty() {
            return Err(AppError::validation(format!(
                "Layout '{}' has no date formats",
                self.name
            )));
        }
        Ok(())
    }

    /// Layouts of the exports published so far.
    pub fn builtin() -> Vec<SchemaLayout> {
        vec![
            SchemaLayout {
                name: "mobi-classic".into(),
                columns: vec![
                    column(TripField::StartTime, &["Departure"]),
                    column(TripField::EndTime, &["Return"]),
                    column(TripField::StartStation, &["Departure station"]),
                    column(TripField::EndStation, &["Return station"]),
                    column(TripField::Duration, &["Duration (sec.)", "Duration (sec)"]),
                    column(TripField::RiderCategory, &["Membership Type", "Membership type"]),
                ],
                date_formats: vec![
                    "%Y-%m-%d %H:%M".into(),
                    "%Y-%m-%d %H:%M:%S".into(),
                    "%m/%d/%Y %H:%M".into(),
                ],
                duration_unit: DurationUnit::Seconds,
                station_format: StationFormat::LeadingCode,
            },
            SchemaLayout {
                name: "mobi-electric".into(),
                columns: vec![
                    column(TripField::StartTime, &["Departure"]),
                    column(TripField::EndTime, &["Return"]),
                    column(TripField::StartStation, &["Departure station"]),
                    column(TripField::EndStation, &["Return station"]),
                    column(TripField::Duration, &["Duration (sec.)", "Duration (sec)"]),
                    column(TripField::RiderCategory, &["Membership type", "Membership Type"]),
                    column(TripField::BikeCategory, &["Electric bike"]),
                ],
                date_formats: vec!["%Y-%m-%d %H:%M:%S".into(), "%Y-%m-%d %H:%M".into()],
                duration_unit: DurationUnit::Seconds,
                station_format: StationFormat::LeadingCode,
            },
            SchemaLayout {
                name: "open-data-minutes".into(),
                columns: vec![
                    column(TripField::StartTime, &["start_time", "Start Time", "starttime"]),
                    column(TripField::EndTime, &["end_time", "End Time", "stoptime"]),
                    column(
                        TripField::StartStation,
                        &["start_station_id", "Start Station Id", "from_station_id"],
                    ),
                    column(
                        TripField::EndStation,
                        &["end_station_id", "End Station Id", "to_station_id"],
                    ),
                    column(TripField::Duration, &["duration_min", "Duration (min)"]),
                    column(TripField::RiderCategory, &["user_type", "User Type", "usertype"]),
                    column(TripField::BikeCategory, &["bike_type", "Bike Type"]),
                ],
                date_formats: vec![
                    "%m/%d/%Y %H:%M".into(),
                    "%m/%d/%Y %H:%M:%S".into(),
                    "%Y-%m-%d %H:%M:%S".into(),
                ],
                duration_unit: DurationUnit::Minutes,
                station_format: StationFormat::Plain,
            },
        ]
    }
}

fn column(field: TripField, aliases: &[&str]) -> ColumnMapping {
    ColumnMapping {
        field,
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
    }
}

/// Canonical header form used for matching: BOM-stripped, trimmed, lower-case.
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}').trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| normalize_header(c)).collect()
    }

    #[test]
    fn electric_header_prefers_electric_layout() {
        let layouts = SchemaLayout::builtin();
        let h = header(&[
            "\u{feff}Departure",
            "Return",
            "Bike",
            "Electric bike",
            "Departure station",
            "Return station",
            "Membership type",
            "Covered distance (m)",
            "Duration (sec.)",
        ]);
        let resolved = SchemaLayout::select(&layouts, &h).unwrap();
        assert_eq!(resolved.layout.name, "mobi-electric");
        assert_eq!(resolved.position(TripField::BikeCategory), Some(3));
    }

    #[test]
    fn classic_header_matches_classic_layout() {
        let layouts = SchemaLayout::builtin();
        let h = header(&[
            "Departure",
            "Return",
            "Bike",
            "Departure station",
            "Return station",
            "Membership Type",
            "Duration (sec.)",
        ]);
        let resolved = SchemaLayout::select(&layouts, &h).unwrap();
        // Both Mobi layouts match six columns; table order decides.
        assert_eq!(resolved.layout.name, "mobi-classic");
        assert_eq!(resolved.position(TripField::Duration), Some(6));
    }

    #[test]
    fn unknown_header_matches_nothing() {
        let layouts = SchemaLayout::builtin();
        let h = header(&["when", "where", "who"]);
        assert!(SchemaLayout::select(&layouts, &h).is_none());
    }

    #[test]
    fn leading_code_station_ids() {
        let fmt = StationFormat::LeadingCode;
        assert_eq!(fmt.station_id("0152 Main & Union"), Some("0152".into()));
        assert_eq!(fmt.station_id("  "), None);
        assert_eq!(fmt.station_id("Main & Union"), None);
        assert_eq!(StationFormat::Plain.station_id(" 7001 "), Some("7001".into()));
    }

    #[test]
    fn duration_units_convert_to_seconds() {
        assert_eq!(DurationUnit::Minutes.to_seconds(2.5), Some(150));
        assert_eq!(DurationUnit::Milliseconds.to_seconds(90_000.0), Some(90));
        assert_eq!(DurationUnit::Seconds.to_seconds(42.0), Some(42));
    }

    #[test]
    fn non_finite_and_huge_readings_have_no_duration() {
        assert_eq!(DurationUnit::Seconds.to_seconds(f64::NAN), None);
        assert_eq!(DurationUnit::Seconds.to_seconds(f64::NEG_INFINITY), None);
        assert_eq!(DurationUnit::Minutes.to_seconds(1e30), None);
    }

    #[test]
    fn builtin_layouts_are_valid() {
        for layout in SchemaLayout::builtin() {
            assert!(layout.validate().is_ok(), "{}", layout.name);
        }
    }
}
