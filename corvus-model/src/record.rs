use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::ids::SourceId;

/// Reserved field name under which the original multi-timestamp array is kept
/// when a record is expanded into one logical record per array element.
pub const EXPANDED_ARRAY_FIELD: &str = "__corvus_timestamp_array";

/// Field names probed, in order, when looking up a record's application name.
pub const APPLICATION_FIELDS: &[&str] = &[
    "application",
    "app_name",
    "application_name",
    "executable",
    "executable_name",
    "process_name",
    "name",
];

/// Field names probed, in order, when looking up a record's file path.
pub const FILE_PATH_FIELDS: &[&str] = &[
    "file_path",
    "full_path",
    "path",
    "target_path",
    "filename",
    "file_name",
];

/// One logical record drawn from a source database, carrying its parsed
/// instant alongside the raw row fields.
///
/// A physical row with a timestamp array (Prefetch run times) becomes several
/// `SourceRecord`s sharing the same `rowid` but differing in `instant`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceRecord {
    pub source_id: SourceId,
    /// SQLite rowid where the table has one; composite-keyed tables do not.
    pub rowid: Option<i64>,
    /// All row fields as read from the database.
    pub fields: Map<String, Value>,
    /// Parsed, UTC-normalized timestamp of this logical record.
    pub instant: DateTime<Utc>,
    /// The raw timestamp cell value this instant was parsed from.
    pub raw_timestamp: Value,
}

impl SourceRecord {
    /// Stable identity of this logical record for match deduplication.
    ///
    /// Preferred form is `rowid_timestamp`; the timestamp component keeps the
    /// expanded elements of a multi-timestamp row distinct. Without a rowid
    /// the key falls back to the timestamp joined with application and file
    /// path, and past that to the first three fields in stable field order.
    pub fn record_key(&self) -> String {
        let ts = self.instant.to_rfc3339();
        if let Some(rowid) = self.rowid {
            return format!("{rowid}_{ts}");
        }

        let application = self.application();
        let file_path = self.file_path();
        if application.is_some() || file_path.is_some() {
            return format!(
                "{ts}_{}_{}",
                application.unwrap_or_default(),
                file_path.unwrap_or_default()
            );
        }

        let mut key = ts;
        for (name, value) in self.fields.iter().take(3) {
            if name == EXPANDED_ARRAY_FIELD {
                continue;
            }
            key.push('_');
            key.push_str(&value_as_text(value));
        }
        key
    }

    /// Lowercased application name, when any known application field is set.
    pub fn application(&self) -> Option<String> {
        self.text_field(APPLICATION_FIELDS)
    }

    /// Lowercased file path, when any known path field is set.
    pub fn file_path(&self) -> Option<String> {
        self.text_field(FILE_PATH_FIELDS)
    }

    /// Case-insensitive lookup of an arbitrary field as text.
    pub fn field_text(&self, field: &str) -> Option<String> {
        let wanted = field.to_ascii_lowercase();
        self.fields
            .iter()
            .find(|(name, _)| name.to_ascii_lowercase() == wanted)
            .map(|(_, value)| value_as_text(value))
    }

    /// True when this record was expanded from a timestamp array.
    pub fn is_array_expanded(&self) -> bool {
        self.fields.contains_key(EXPANDED_ARRAY_FIELD)
    }

    fn text_field(&self, candidates: &[&str]) -> Option<String> {
        for candidate in candidates {
            for (name, value) in &self.fields {
                if name.eq_ignore_ascii_case(candidate) && !value.is_null() {
                    let text = value_as_text(value);
                    if !text.is_empty() {
                        return Some(text.to_lowercase());
                    }
                }
            }
        }
        None
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
