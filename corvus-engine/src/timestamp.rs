//! Timestamp detection and parsing for heterogeneous forensic artifacts.
//!
//! Sources store instants as Windows FILETIME ticks, Unix epochs in seconds or
//! milliseconds, ISO-8601 text with or without a zone, a handful of locale
//! strings, or JSON arrays of any of those (Prefetch run times). Everything is
//! normalized to `DateTime<Utc>`; naive values are treated as UTC.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;
/// Numeric values above this are FILETIME ticks (100 ns since 1601).
const FILETIME_THRESHOLD: f64 = 1e13;
/// Numeric values above this (but below the FILETIME threshold) are Unix ms.
const UNIX_MILLIS_THRESHOLD: f64 = 1e10;

const MIN_VALID_YEAR: i32 = 1970;
const MAX_VALID_YEAR: i32 = 2100;

/// Column names probed during detection, most specific artifacts first.
/// Generic names come last so `last_run_time` beats a bare `time` column.
static COLUMN_NAME_PATTERNS: &[&str] = &[
    // Prefetch
    "last_run_time",
    "last_run",
    "run_time",
    "run_times",
    "execution_time",
    // ShimCache
    "last_modified",
    "last_modified_readable",
    "modified_time",
    // AmCache
    "install_date",
    "link_date",
    "file_time",
    // LNK & JumpList
    "time_creation",
    "time_access",
    "time_modification",
    "creation_time",
    "access_time",
    "modification_time",
    // SRUM
    "timestamp_utc",
    "time_stamp",
    // MFT
    "created",
    "modified",
    "accessed",
    "mft_modified",
    // Event logs
    "eventtimestamputc",
    "event_time",
    "generated_time",
    // Generic
    "timestamp",
    "datetime",
    "date_time",
    "time",
    "date",
    "ts",
];

/// Datetime layouts tried, in order, for string values.
static DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%Y%m%d%H%M%S",
    "%d-%b-%Y %H:%M:%S",
    "%a %b %d %H:%M:%S %Y",
];

/// Date-only layouts, parsed as midnight UTC.
static DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

static DIGITS_ONLY: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^\d+(\.\d+)?$").expect("digits pattern"));

/// The on-disk encoding a source's timestamp column uses, inferred by
/// majority vote over a sample. Drives how query bounds are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampFormat {
    UnixSeconds,
    UnixMillis,
    Filetime,
    Iso8601,
    DateTimeString,
    DateSlash,
    Unknown,
}

impl TimestampFormat {
    /// Render a UTC instant in this column encoding for use as an indexed
    /// range bound. Text encodings compare lexicographically in time order.
    pub fn encode_bound(&self, instant: DateTime<Utc>) -> Value {
        match self {
            TimestampFormat::UnixSeconds => Value::from(instant.timestamp()),
            TimestampFormat::UnixMillis => Value::from(instant.timestamp_millis()),
            TimestampFormat::Filetime => Value::from(
                (instant.timestamp() + FILETIME_EPOCH_OFFSET_SECS) * 10_000_000
                    + i64::from(instant.timestamp_subsec_micros()) * 10,
            ),
            TimestampFormat::Iso8601 => {
                Value::from(instant.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            }
            TimestampFormat::DateTimeString => {
                Value::from(instant.format("%Y-%m-%d %H:%M:%S").to_string())
            }
            TimestampFormat::DateSlash => {
                Value::from(instant.format("%m/%d/%Y %H:%M:%S").to_string())
            }
            TimestampFormat::Unknown => Value::from(instant.to_rfc3339()),
        }
    }
}

/// A timestamp column surfaced by detection.
#[derive(Debug, Clone)]
pub struct TimestampCandidate {
    pub column: String,
    pub format: TimestampFormat,
    /// Fraction of sampled non-null values that parsed, in `(0, 1]`.
    pub success_rate: f64,
    /// Rank of the column name in the pattern table; lower is more specific.
    pub name_rank: usize,
}

/// Parser for single values plus column detection over sampled records.
#[derive(Debug, Default, Clone)]
pub struct TimestampParser;

impl TimestampParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse one value to a UTC instant. Fails only when every strategy
    /// rejects the value or the year falls outside [1970, 2100].
    pub fn parse_value(&self, value: &Value) -> Result<DateTime<Utc>> {
        let parsed = match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => parse_numeric_int(i),
                None => n.as_f64().and_then(parse_numeric),
            },
            Value::String(s) => parse_string(s),
            _ => None,
        };
        parsed.ok_or_else(|| EngineError::TimestampParse(value.to_string()))
    }

    /// Parse a value that may be a JSON array of timestamps, yielding one
    /// instant per element. Unparseable elements are skipped; a scalar value
    /// yields at most one instant.
    pub fn parse_all(&self, value: &Value) -> Vec<DateTime<Utc>> {
        match value {
            Value::Array(elements) => elements
                .iter()
                .filter_map(|element| self.parse_value(element).ok())
                .collect(),
            Value::String(s) if looks_like_json_array(s) => {
                match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(elements)) => elements
                        .iter()
                        .filter_map(|element| self.parse_value(element).ok())
                        .collect(),
                    _ => self.parse_value(value).into_iter().collect(),
                }
            }
            other => self.parse_value(other).into_iter().collect(),
        }
    }

    /// Identify the column encoding of a single raw value.
    pub fn identify_format(&self, value: &Value) -> TimestampFormat {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(v) if v > FILETIME_THRESHOLD => TimestampFormat::Filetime,
                Some(v) if v > UNIX_MILLIS_THRESHOLD => TimestampFormat::UnixMillis,
                Some(_) => TimestampFormat::UnixSeconds,
                None => TimestampFormat::Unknown,
            },
            Value::String(s) => {
                let s = s.trim();
                // Fourteen digits is the compact `%Y%m%d%H%M%S` layout, not an epoch.
                if DIGITS_ONLY.is_match(s) && s.len() != 14 {
                    return match s.parse::<f64>() {
                        Ok(v) if v > FILETIME_THRESHOLD => TimestampFormat::Filetime,
                        Ok(v) if v > UNIX_MILLIS_THRESHOLD => TimestampFormat::UnixMillis,
                        Ok(_) => TimestampFormat::UnixSeconds,
                        Err(_) => TimestampFormat::Unknown,
                    };
                }
                if s.contains('T') {
                    TimestampFormat::Iso8601
                } else if s.contains('-') && s.contains(':') {
                    TimestampFormat::DateTimeString
                } else if s.contains('/') {
                    TimestampFormat::DateSlash
                } else {
                    TimestampFormat::Unknown
                }
            }
            _ => TimestampFormat::Unknown,
        }
    }

    /// Detect candidate timestamp columns from sampled rows (up to 100 used).
    ///
    /// Name-matched columns are tried first; if none of them parses, every
    /// remaining column is probed so detection only comes back empty when no
    /// column holds a single parseable value.
    pub fn find_timestamp_columns(
        &self,
        sample: &[serde_json::Map<String, Value>],
    ) -> Vec<TimestampCandidate> {
        let sample = &sample[..sample.len().min(100)];
        let Some(first) = sample.first() else {
            return Vec::new();
        };

        let columns: Vec<&String> = first.keys().collect();
        let mut named: Vec<(usize, &String)> = Vec::new();
        let mut unnamed: Vec<&String> = Vec::new();
        for &column in &columns {
            match column_name_rank(column) {
                Some(rank) => named.push((rank, column)),
                None => unnamed.push(column),
            }
        }
        named.sort_by_key(|(rank, _)| *rank);

        let mut candidates = self.score_columns(sample, named);
        if candidates.is_empty() {
            let fallback: Vec<(usize, &String)> = unnamed
                .into_iter()
                .map(|c| (COLUMN_NAME_PATTERNS.len(), c))
                .collect();
            candidates = self.score_columns(sample, fallback);
        }

        candidates.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.name_rank.cmp(&b.name_rank))
        });
        candidates
    }

    fn score_columns(
        &self,
        sample: &[serde_json::Map<String, Value>],
        columns: Vec<(usize, &String)>,
    ) -> Vec<TimestampCandidate> {
        let mut candidates = Vec::new();
        for (name_rank, column) in columns {
            let mut attempts = 0usize;
            let mut successes = 0usize;
            let mut formats: Vec<TimestampFormat> = Vec::new();
            for row in sample {
                let Some(value) = row.get(column.as_str()) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                attempts += 1;
                if !self.parse_all(value).is_empty() {
                    successes += 1;
                    formats.push(self.identify_format(value));
                }
            }
            if successes == 0 {
                continue;
            }
            candidates.push(TimestampCandidate {
                column: column.clone(),
                format: majority_format(&formats),
                success_rate: successes as f64 / attempts as f64,
                name_rank,
            });
        }
        candidates
    }
}

fn column_name_rank(column: &str) -> Option<usize> {
    let lowered = column.to_ascii_lowercase();
    if let Some(rank) = COLUMN_NAME_PATTERNS.iter().position(|p| *p == lowered) {
        return Some(rank);
    }
    // Substring fallback ranks below every exact pattern.
    if ["time", "date", "stamp"].iter().any(|p| lowered.contains(p)) {
        return Some(COLUMN_NAME_PATTERNS.len());
    }
    None
}

fn majority_format(formats: &[TimestampFormat]) -> TimestampFormat {
    let mut counts: std::collections::HashMap<TimestampFormat, usize> =
        std::collections::HashMap::new();
    for format in formats {
        *counts.entry(*format).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(format, _)| format)
        .unwrap_or(TimestampFormat::Unknown)
}

fn looks_like_json_array(s: &str) -> bool {
    let trimmed = s.trim_start();
    trimmed.starts_with('[')
}

fn parse_numeric_int(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    let instant = if value as f64 > FILETIME_THRESHOLD {
        let micros = value / 10;
        let secs = micros.div_euclid(1_000_000) - FILETIME_EPOCH_OFFSET_SECS;
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        Utc.timestamp_opt(secs, nanos).single()?
    } else if value as f64 > UNIX_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()?
    } else {
        Utc.timestamp_opt(value, 0).single()?
    };
    validate_year(instant)
}

fn parse_numeric(value: f64) -> Option<DateTime<Utc>> {
    if value <= 0.0 || !value.is_finite() {
        return None;
    }
    let instant = if value > FILETIME_THRESHOLD {
        let micros = (value / 10.0) as i64;
        let secs = micros.div_euclid(1_000_000) - FILETIME_EPOCH_OFFSET_SECS;
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        Utc.timestamp_opt(secs, nanos).single()?
    } else if value > UNIX_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value as i64).single()?
    } else {
        let secs = value.trunc() as i64;
        let nanos = ((value - value.trunc()) * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()?
    };
    validate_year(instant)
}

fn parse_string(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    // ISO-8601 with zone first, then the naive variants.
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return validate_year(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return validate_year(Utc.from_utc_datetime(&naive));
    }

    for layout in DATETIME_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return validate_year(Utc.from_utc_datetime(&naive));
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(value, layout) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return validate_year(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return validate_year(dt.with_timezone(&Utc));
    }

    // Epochs stored in TEXT columns. Tried last so the compact
    // `%Y%m%d%H%M%S` layout wins for fourteen-digit strings.
    if DIGITS_ONLY.is_match(value) {
        if let Ok(i) = value.parse::<i64>() {
            return parse_numeric_int(i);
        }
        return value.parse::<f64>().ok().and_then(parse_numeric);
    }

    None
}

fn validate_year(instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let year = instant.year();
    if (MIN_VALID_YEAR..=MAX_VALID_YEAR).contains(&year) {
        Some(instant)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> TimestampParser {
        TimestampParser::new()
    }

    #[test]
    fn filetime_epoch_boundary() {
        // 116444736000000000 ticks is exactly 1970-01-01T00:00:00Z.
        let parsed = parser()
            .parse_value(&json!(116_444_736_000_000_000u64))
            .unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn unix_seconds_and_millis() {
        let p = parser();
        let secs = p.parse_value(&json!(1_727_778_600)).unwrap();
        assert_eq!(secs, Utc.with_ymd_and_hms(2024, 10, 1, 10, 30, 0).unwrap());

        let millis = p.parse_value(&json!(1_727_778_600_000i64)).unwrap();
        assert_eq!(millis, secs);
    }

    #[test]
    fn iso8601_with_and_without_zone() {
        let p = parser();
        let zoned = p
            .parse_value(&json!("2024-10-01T10:30:00+02:00"))
            .unwrap();
        assert_eq!(zoned, Utc.with_ymd_and_hms(2024, 10, 1, 8, 30, 0).unwrap());

        let naive = p.parse_value(&json!("2024-10-01T10:30:00")).unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2024, 10, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn strptime_catalogue_layouts() {
        let p = parser();
        for (raw, expected) in [
            ("2024-10-01 10:30:00", (2024, 10, 1, 10, 30, 0)),
            ("10/01/2024 10:30:00 AM", (2024, 10, 1, 10, 30, 0)),
            ("10/01/2024 22:30:00", (2024, 10, 1, 22, 30, 0)),
            ("20241001103000", (2024, 10, 1, 10, 30, 0)),
            ("01-Oct-2024 10:30:00", (2024, 10, 1, 10, 30, 0)),
        ] {
            let (y, mo, d, h, mi, s) = expected;
            assert_eq!(
                p.parse_value(&json!(raw)).unwrap(),
                Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap(),
                "layout for {raw:?}"
            );
        }
    }

    #[test]
    fn compact_layout_beats_numeric_reading() {
        // Fourteen digits could also read as FILETIME-magnitude numbers.
        let parsed = parser().parse_value(&json!("20241001103000")).unwrap();
        assert_eq!(parsed.year(), 2024);
    }

    #[test]
    fn out_of_range_years_fail() {
        let p = parser();
        assert!(p.parse_value(&json!("1960-01-01 00:00:00")).is_err());
        assert!(p.parse_value(&json!("2101-01-01 00:00:00")).is_err());
        // A FILETIME pointing before 1970 is rejected too.
        assert!(p.parse_value(&json!(100_000_000_000_000u64)).is_err());
    }

    #[test]
    fn garbage_fails_with_parse_error() {
        assert!(parser().parse_value(&json!("not a timestamp")).is_err());
        assert!(parser().parse_value(&json!(null)).is_err());
    }

    #[test]
    fn array_expansion_yields_one_instant_per_element() {
        let p = parser();
        let instants = p.parse_all(&json!([
            "2024-10-01 10:00:00",
            "2024-10-01 11:00:00",
            "2024-10-01 12:00:00"
        ]));
        assert_eq!(instants.len(), 3);
        assert_eq!(
            instants[2],
            Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn stringified_arrays_expand_too() {
        let instants = parser().parse_all(&json!(
            "[\"2024-10-01 10:00:00\", \"2024-10-01 11:00:00\"]"
        ));
        assert_eq!(instants.len(), 2);
    }

    #[test]
    fn detection_prefers_artifact_specific_names() {
        let sample: Vec<serde_json::Map<String, Value>> = (0..10)
            .map(|i| {
                let row = json!({
                    "last_run_time": format!("2024-10-01 10:{i:02}:00"),
                    "time": format!("2024-10-01 10:{i:02}:00"),
                    "application": "calc.exe",
                });
                row.as_object().unwrap().clone()
            })
            .collect();

        let candidates = parser().find_timestamp_columns(&sample);
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].column, "last_run_time");
    }

    #[test]
    fn detection_ranks_by_parse_success() {
        let sample: Vec<serde_json::Map<String, Value>> = (0..10)
            .map(|i| {
                let row = json!({
                    // Name-matched but mostly junk values.
                    "install_date": if i < 2 { json!("2024-10-01 10:00:00") } else { json!("n/a") },
                    "last_modified": format!("2024-10-01 10:{i:02}:00"),
                });
                row.as_object().unwrap().clone()
            })
            .collect();

        let candidates = parser().find_timestamp_columns(&sample);
        assert_eq!(candidates[0].column, "last_modified");
        assert!(candidates[0].success_rate > candidates[1].success_rate);
    }

    #[test]
    fn detection_falls_back_to_unnamed_columns() {
        let sample: Vec<serde_json::Map<String, Value>> = (0..5)
            .map(|_| {
                let row = json!({
                    "payload": "2024-10-01 10:00:00",
                    "flags": 3,
                });
                row.as_object().unwrap().clone()
            })
            .collect();

        let candidates = parser().find_timestamp_columns(&sample);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].column, "payload");
    }

    #[test]
    fn detection_empty_when_nothing_parses() {
        let sample: Vec<serde_json::Map<String, Value>> = (0..5)
            .map(|_| {
                let row = json!({ "name": "calc.exe", "flags": "on" });
                row.as_object().unwrap().clone()
            })
            .collect();
        assert!(parser().find_timestamp_columns(&sample).is_empty());
    }

    #[test]
    fn bound_encoding_round_trips_per_format() {
        let p = parser();
        let instant = Utc.with_ymd_and_hms(2024, 10, 1, 10, 30, 0).unwrap();
        for format in [
            TimestampFormat::UnixSeconds,
            TimestampFormat::UnixMillis,
            TimestampFormat::Filetime,
            TimestampFormat::Iso8601,
            TimestampFormat::DateTimeString,
            TimestampFormat::DateSlash,
        ] {
            let bound = format.encode_bound(instant);
            assert_eq!(p.parse_value(&bound).unwrap(), instant, "{format:?}");
        }
    }
}
