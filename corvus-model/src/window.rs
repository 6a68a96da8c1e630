use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::ids::{SourceId, WindowId};
use crate::record::SourceRecord;

/// A fixed-width scan window, closed on both ends, plus the records each
/// source contributed to it.
///
/// A window is created empty by the generator, populated by exactly one
/// worker, then frozen once persisted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TimeWindow {
    pub window_id: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub records_by_source: BTreeMap<SourceId, Vec<SourceRecord>>,
}

impl TimeWindow {
    pub fn new(window_id: WindowId, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            window_id,
            start,
            end,
            records_by_source: BTreeMap::new(),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }

    pub fn total_records(&self) -> usize {
        self.records_by_source.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records_by_source.values().all(Vec::is_empty)
    }

    /// Source ids that contributed at least one record.
    pub fn contributing_sources(&self) -> Vec<&SourceId> {
        self.records_by_source
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    /// Phase-1 sufficiency: at least `minimum_matches` non-anchor sources must
    /// have contributed, and the anchor is always one of the contributors, so
    /// `minimum_matches + 1` distinct sources are required in total.
    pub fn meets_threshold(&self, minimum_matches: usize) -> bool {
        self.contributing_sources().len() >= minimum_matches + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WindowId;
    use chrono::TimeZone;

    fn window() -> TimeWindow {
        TimeWindow::new(
            WindowId(0),
            Utc.with_ymd_and_hms(2024, 10, 1, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 10, 1, 10, 5, 0).unwrap(),
        )
    }

    #[test]
    fn boundaries_are_inclusive() {
        let w = window();
        assert!(w.contains(w.start));
        assert!(w.contains(w.end));
        assert!(!w.contains(w.end + chrono::Duration::seconds(1)));
    }

    #[test]
    fn threshold_counts_non_anchor_contributors() {
        let mut w = window();
        assert!(!w.meets_threshold(1));

        // An empty record list is not a contribution.
        w.records_by_source.insert(SourceId::from("a"), Vec::new());
        assert!(!w.meets_threshold(1));

        let record = SourceRecord {
            source_id: SourceId::from("a"),
            rowid: Some(1),
            fields: serde_json::Map::new(),
            instant: w.start,
            raw_timestamp: serde_json::Value::Null,
        };
        w.records_by_source.insert(SourceId::from("a"), vec![record.clone()]);
        assert!(!w.meets_threshold(1), "one source is only ever the anchor");

        let mut other = record;
        other.source_id = SourceId::from("b");
        w.records_by_source.insert(SourceId::from("b"), vec![other]);
        assert!(w.meets_threshold(1));
    }
}
