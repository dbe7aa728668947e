// src/services/normalizer.rs

//! Schema normalizer service.
//!
//! Resolves a batch's header row against the layout table and yields one
//! [`RowOutcome`] per data row, lazily. Rows failing validation become
//! [`QuarantinedRow`]s with a reason code; nothing is dropped.

use chrono::NaiveDateTime;
use csv::{ByteRecord, ReaderBuilder, Trim};

use crate::error::{AppError, Result};
use crate::models::{
    NormalizerConfig, QuarantinedRow, RawBatch, RejectReason, ResolvedLayout, SchemaLayout,
    TripField, TripRecord, normalize_header,
};

/// Result of normalizing one data row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Valid(TripRecord),
    Quarantined(QuarantinedRow),
}

/// Maps raw exports onto the canonical trip schema.
pub struct SchemaNormalizer {
    layouts: Vec<SchemaLayout>,
    max_duration_secs: i64,
    tolerance_secs: i64,
}

impl SchemaNormalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            layouts: config.layouts.clone(),
            max_duration_secs: config.max_trip_duration_secs,
            tolerance_secs: config.duration_tolerance_secs,
        }
    }

    pub fn layouts(&self) -> &[SchemaLayout] {
        &self.layouts
    }

    /// Resolve the batch layout and return a lazy row iterator.
    ///
    /// Fails with `SchemaUnrecognized` when no layout's required columns are
    /// all present in the header.
    pub fn normalize<'a>(&'a self, batch: &'a RawBatch) -> Result<NormalizedRows<'a>> {
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(batch.content.as_slice());

        let raw_header = reader.byte_headers()?.clone();
        let header: Vec<String> = raw_header
            .iter()
            .map(|h| normalize_header(&String::from_utf8_lossy(h)))
            .collect();

        let layout = SchemaLayout::select(&self.layouts, &header).ok_or_else(|| {
            AppError::SchemaUnrecognized {
                batch_id: batch.batch_id.clone(),
                header: header.join(","),
            }
        })?;

        log::debug!(
            "Batch {} matched layout '{}' ({} columns)",
            batch.batch_id,
            layout.layout.name,
            layout.matched_columns()
        );

        Ok(NormalizedRows {
            normalizer: self,
            batch_id: &batch.batch_id,
            layout,
            reader,
            record: ByteRecord::new(),
            row: 0,
        })
    }

    fn validate_row(
        &self,
        layout: &ResolvedLayout<'_>,
        batch_id: &str,
        cells: &[String],
    ) -> std::result::Result<TripRecord, (RejectReason, String)> {
        let cell = |field: TripField| layout.position(field).and_then(|i| cells.get(i));

        let required_width = TripField::REQUIRED
            .iter()
            .filter_map(|f| layout.position(*f))
            .max()
            .map_or(0, |i| i + 1);
        if cells.len() < required_width {
            return Err((
                RejectReason::MalformedRow,
                format!("{} cells, expected at least {}", cells.len(), required_width),
            ));
        }

        let format = layout.layout.station_format;
        let start_station = cell(TripField::StartStation)
            .and_then(|c| format.station_id(c))
            .ok_or((RejectReason::MissingStationId, "no start station id".to_string()))?;
        let end_station = cell(TripField::EndStation)
            .and_then(|c| format.station_id(c))
            .ok_or((RejectReason::MissingStationId, "no end station id".to_string()))?;

        let started_at = self.parse_timestamp(layout, cell(TripField::StartTime))?;
        let ended_at = self.parse_timestamp(layout, cell(TripField::EndTime))?;
        if ended_at < started_at {
            return Err((
                RejectReason::NonMonotonicTrip,
                format!("ends {ended_at} before it starts {started_at}"),
            ));
        }

        let span = (ended_at - started_at).num_seconds();
        let duration_secs = match cell(TripField::Duration).filter(|c| !c.is_empty()) {
            None => span,
            Some(raw) => {
                let value: f64 = raw.replace(',', "").parse().map_err(|_| {
                    (RejectReason::MalformedRow, format!("unparseable duration '{raw}'"))
                })?;
                let (reported, excess) = layout
                    .layout
                    .duration_unit
                    .to_seconds(value)
                    .and_then(|r| Some((r, r.checked_sub(span)?)))
                    .ok_or_else(|| {
                        (RejectReason::MalformedRow, format!("unusable duration '{raw}'"))
                    })?;
                if excess > self.tolerance_secs {
                    return Err((
                        RejectReason::DurationMismatch,
                        format!("reported {reported}s exceeds the {span}s between timestamps"),
                    ));
                }
                // Shorter reports exclude stopovers; keep the wall-clock span then.
                if excess.abs() <= self.tolerance_secs {
                    reported
                } else {
                    span
                }
            }
        };

        if duration_secs <= 0 || duration_secs > self.max_duration_secs {
            return Err((
                RejectReason::DurationOutOfBounds,
                format!(
                    "{duration_secs}s outside (0, {}]",
                    self.max_duration_secs
                ),
            ));
        }

        let optional = |field: TripField| {
            cell(field)
                .filter(|c| !c.is_empty())
                .map(|c| c.to_string())
        };

        Ok(TripRecord {
            trip_id: TripRecord::derive_id(&start_station, &end_station, &started_at, &ended_at),
            start_station_id: start_station,
            end_station_id: end_station,
            started_at,
            ended_at,
            duration_secs,
            rider_category: optional(TripField::RiderCategory),
            bike_category: optional(TripField::BikeCategory),
            source_batch: batch_id.to_string(),
        })
    }

    fn parse_timestamp(
        &self,
        layout: &ResolvedLayout<'_>,
        cell: Option<&String>,
    ) -> std::result::Result<NaiveDateTime, (RejectReason, String)> {
        let raw = cell.map(|c| c.trim()).unwrap_or_default();
        layout
            .layout
            .date_formats
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .ok_or_else(|| {
                (
                    RejectReason::UnparseableTimestamp,
                    format!("'{raw}' matches none of {:?}", layout.layout.date_formats),
                )
            })
    }
}

/// Lazy row sequence for one batch.
pub struct NormalizedRows<'a> {
    normalizer: &'a SchemaNormalizer,
    batch_id: &'a str,
    layout: ResolvedLayout<'a>,
    reader: csv::Reader<&'a [u8]>,
    record: ByteRecord,
    row: usize,
}

impl NormalizedRows<'_> {
    pub fn layout_name(&self) -> &str {
        &self.layout.layout.name
    }

    /// Data rows read so far.
    pub fn rows_read(&self) -> usize {
        self.row
    }

    /// Drain the sequence into valid candidates and quarantined rows.
    pub fn partition(self) -> (Vec<TripRecord>, Vec<QuarantinedRow>) {
        let mut valid = Vec::new();
        let mut quarantined = Vec::new();
        for outcome in self {
            match outcome {
                RowOutcome::Valid(record) => valid.push(record),
                RowOutcome::Quarantined(row) => quarantined.push(row),
            }
        }
        (valid, quarantined)
    }

    fn quarantine(&self, reason: RejectReason, detail: String, raw: Vec<String>) -> RowOutcome {
        RowOutcome::Quarantined(QuarantinedRow {
            batch_id: self.batch_id.to_string(),
            row: self.row,
            reason,
            detail,
            raw,
        })
    }
}

impl Iterator for NormalizedRows<'_> {
    type Item = RowOutcome;

    fn next(&mut self) -> Option<Self::Item> {
        let read = self.reader.read_byte_record(&mut self.record);
        self.row += 1;
        match read {
            Ok(false) => {
                self.row -= 1;
                None
            }
            Err(error) => Some(self.quarantine(
                RejectReason::MalformedRow,
                error.to_string(),
                Vec::new(),
            )),
            Ok(true) => {
                let cells: Vec<String> = self
                    .record
                    .iter()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                Some(
                    match self
                        .normalizer
                        .validate_row(&self.layout, self.batch_id, &cells)
                    {
                        Ok(record) => RowOutcome::Valid(record),
                        Err((reason, detail)) => self.quarantine(reason, detail, cells),
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC: &str = "\
Departure,Return,Bike,Departure station,Return station,Membership Type,Covered distance (m),Duration (sec.)
2018-06-01 08:00,2018-06-01 08:15,1234,0152 Main & Union,0020 Pender & Burrard,Monthly,2100,900
2018-06-01 09:00,2018-06-01 09:10,1235,,0020 Pender & Burrard,Monthly,900,600
2018-06-01 10:00,2018-06-01 09:50,1236,0152 Main & Union,0020 Pender & Burrard,Monthly,900,600
2018-06-01 11:00,yesterday,1237,0152 Main & Union,0020 Pender & Burrard,Monthly,900,600
2018-06-01 12:00,2018-06-01 12:05,1238,0152 Main & Union,0020 Pender & Burrard,Monthly,800,7200
2018-06-01 13:00,2018-06-20 13:00,1239,0152 Main & Union,0020 Pender & Burrard,Monthly,800,
2018-06-01 14:00,2018-06-01 14:30,1240,0152 Main & Union
";

    fn normalizer() -> SchemaNormalizer {
        SchemaNormalizer::new(&NormalizerConfig::default())
    }

    #[test]
    fn every_row_is_either_valid_or_quarantined() {
        let batch = RawBatch::from_bytes("2018-06", CLASSIC);
        let n = normalizer();
        let rows = n.normalize(&batch).unwrap();
        assert_eq!(rows.layout_name(), "mobi-classic");

        let (valid, quarantined) = rows.partition();
        assert_eq!(valid.len() + quarantined.len(), 7);
        assert_eq!(valid.len(), 1);
        assert!(quarantined.iter().all(|q| !q.detail.is_empty()));

        let reasons: Vec<_> = quarantined.iter().map(|q| (q.row, q.reason)).collect();
        assert_eq!(
            reasons,
            vec![
                (2, RejectReason::MissingStationId),
                (3, RejectReason::NonMonotonicTrip),
                (4, RejectReason::UnparseableTimestamp),
                (5, RejectReason::DurationMismatch),
                (6, RejectReason::DurationOutOfBounds),
                (7, RejectReason::MalformedRow),
            ]
        );
    }

    #[test]
    fn valid_row_is_mapped_to_canonical_fields() {
        let batch = RawBatch::from_bytes("2018-06", CLASSIC);
        let n = normalizer();
        let first = n.normalize(&batch).unwrap().next().unwrap();
        let RowOutcome::Valid(trip) = first else {
            panic!("expected a valid row, got {first:?}");
        };
        assert_eq!(trip.start_station_id, "0152");
        assert_eq!(trip.end_station_id, "0020");
        assert_eq!(trip.duration_secs, 900);
        assert_eq!(trip.rider_category.as_deref(), Some("Monthly"));
        assert_eq!(trip.source_batch, "2018-06");
    }

    #[test]
    fn short_reported_duration_falls_back_to_span() {
        let csv = "\
Departure,Return,Departure station,Return station,Duration (sec.)
2018-06-01 08:00,2018-06-01 09:00,0152 A,0020 B,1200
";
        let batch = RawBatch::from_bytes("2018-06", csv);
        let n = normalizer();
        let (valid, quarantined) = n.normalize(&batch).unwrap().partition();
        assert!(quarantined.is_empty());
        assert_eq!(valid[0].duration_secs, 3600);
    }

    #[test]
    fn non_numeric_duration_readings_are_quarantined() {
        let csv = "\
Departure,Return,Departure station,Return station,Duration (sec.)
2018-06-01 08:00,2018-06-01 08:15,0152 A,0020 B,-inf
2018-06-01 08:00,2018-06-01 08:15,0152 A,0020 B,NaN
2018-06-01 08:00,2018-06-01 08:15,0152 A,0020 B,1e30
2018-06-01 08:00,2018-06-01 08:15,0152 A,0020 B,inf
2018-06-01 08:00,2018-06-01 08:15,0152 A,0020 B,900
";
        let batch = RawBatch::from_bytes("2018-06", csv);
        let n = normalizer();
        let (valid, quarantined) = n.normalize(&batch).unwrap().partition();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].duration_secs, 900);
        assert_eq!(quarantined.len(), 4);
        assert!(
            quarantined
                .iter()
                .all(|q| q.reason == RejectReason::MalformedRow)
        );
    }

    #[test]
    fn minutes_layout_with_us_dates() {
        let csv = "\
start_time,end_time,start_station_id,end_station_id,duration_min,user_type,bike_type
06/01/2021 08:00,06/01/2021 08:20,7001,7002,20,Casual,electric
";
        let batch = RawBatch::from_bytes("2021-06", csv);
        let n = normalizer();
        let rows = n.normalize(&batch).unwrap();
        assert_eq!(rows.layout_name(), "open-data-minutes");
        let (valid, _) = rows.partition();
        assert_eq!(valid[0].duration_secs, 1200);
        assert_eq!(valid[0].bike_category.as_deref(), Some("electric"));
    }

    #[test]
    fn unknown_header_fails_the_whole_batch() {
        let batch = RawBatch::from_bytes("2030-01", "when,where\n1,2\n");
        let n = normalizer();
        let err = n.normalize(&batch).err().unwrap();
        assert!(matches!(err, AppError::SchemaUnrecognized { .. }));
    }

    #[test]
    fn identical_trips_from_different_vintages_share_a_key() {
        let classic = "\
Departure,Return,Departure station,Return station,Duration (sec.)
2021-06-01 08:00,2021-06-01 08:20,7001 Somewhere,7002 Elsewhere,1200
";
        let open = "\
start_time,end_time,start_station_id,end_station_id,duration_min
06/01/2021 08:00,06/01/2021 08:20,7001,7002,20
";
        let n = normalizer();
        let a = RawBatch::from_bytes("a", classic);
        let b = RawBatch::from_bytes("b", open);
        let (va, _) = n.normalize(&a).unwrap().partition();
        let (vb, _) = n.normalize(&b).unwrap().partition();
        assert_eq!(va[0].trip_id, vb[0].trip_id);
    }
}
