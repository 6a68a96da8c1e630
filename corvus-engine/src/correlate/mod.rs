//! Phase 2: replay persisted windows and build scored, deduplicated matches.
//!
//! Every record of every source is a candidate anchor. Per anchor, each other
//! source contributes its closest record (by absolute time distance) to the
//! best combination; alternates substitute one further-away candidate at a
//! time up to the per-anchor cap. Combinations are validated bidirectionally
//! against the window width, deduplicated process-wide, scored, and only then
//! emitted.

pub mod dedup;

use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, warn};

use corvus_model::{
    ApplyTo, CorrelationMatch, CorrelationRules, FilterStatistics, MatchId, Phase2Statistics,
    ScanConfig, SourceId, SourceRecord, TimeWindow, Wing,
};

use crate::cancel::CancellationManager;
use crate::error::Result;
use crate::persist::WindowStore;
use crate::persist::streaming::StreamingMatchStore;
use crate::progress::{ProgressEventKind, ProgressTracker};
use crate::scoring::{self, validate_match};
use crate::semantic;
use dedup::{DedupOutcome, DedupRegistry};

/// Everything Phase 2 produces besides the matches themselves.
#[derive(Debug, Default)]
pub struct Phase2Output {
    pub matches: Vec<CorrelationMatch>,
    pub statistics: Phase2Statistics,
    pub duplicates_prevented: u64,
    pub duplicates_by_source: BTreeMap<SourceId, u64>,
    pub matches_failed_validation: u64,
    pub filter_statistics: FilterStatistics,
    pub cancelled: bool,
}

/// Replays Phase-1 windows into correlation matches.
pub struct Phase2Correlator<'a> {
    wing: &'a Wing,
    tracker: &'a ProgressTracker,
    dedup: DedupRegistry,
    window_seconds: i64,
    minimum_matches: usize,
    max_matches_per_anchor: usize,
}

impl std::fmt::Debug for Phase2Correlator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase2Correlator")
            .field("window_seconds", &self.window_seconds)
            .field("minimum_matches", &self.minimum_matches)
            .field("max_matches_per_anchor", &self.max_matches_per_anchor)
            .finish()
    }
}

impl<'a> Phase2Correlator<'a> {
    pub fn new(wing: &'a Wing, config: &ScanConfig, tracker: &'a ProgressTracker) -> Self {
        Self {
            wing,
            tracker,
            dedup: DedupRegistry::new(),
            window_seconds: wing.rules.window_seconds(),
            minimum_matches: wing.rules.minimum_matches,
            max_matches_per_anchor: config.max_matches_per_anchor,
        }
    }

    /// Replay every persisted window in id order.
    pub async fn correlate(
        &self,
        store: &WindowStore,
        streaming: Option<&StreamingMatchStore>,
        cancellation: &CancellationManager,
    ) -> Result<Phase2Output> {
        let mut output = Phase2Output::default();
        self.tracker
            .emit(ProgressEventKind::CorrelationStart, json!({}));

        let window_ids = store.window_ids().await?;
        for window_id in window_ids {
            if cancellation.is_cancelled() {
                output.cancelled = true;
                break;
            }
            let Some(window) = store.load_window(window_id).await? else {
                continue;
            };
            self.correlate_window(&window, streaming, &mut output)
                .await?;
            output.statistics.windows_replayed += 1;
            self.tracker.emit(
                ProgressEventKind::AnchorProgress,
                json!({
                    "window_id": window_id.as_u64(),
                    "matches_so_far": output.matches.len(),
                }),
            );
        }
        Ok(output)
    }

    async fn correlate_window(
        &self,
        window: &TimeWindow,
        streaming: Option<&StreamingMatchStore>,
        output: &mut Phase2Output,
    ) -> Result<()> {
        self.tracker.emit(
            ProgressEventKind::AnchorCollection,
            json!({
                "window_id": window.window_id.as_u64(),
                "records": window.total_records(),
            }),
        );

        // Every record of every source anchors, in timestamp order for
        // determinism (ties broken by source id, then record key).
        let mut anchors: Vec<&SourceRecord> =
            window.records_by_source.values().flatten().collect();
        anchors.sort_by(|a, b| {
            a.instant
                .cmp(&b.instant)
                .then_with(|| a.source_id.cmp(&b.source_id))
                .then_with(|| a.record_key().cmp(&b.record_key()))
        });
        output.statistics.anchors_enumerated += anchors.len() as u64;

        for anchor in anchors {
            if self.wing.rules.apply_to == ApplyTo::Specific {
                output.filter_statistics.records_considered += 1;
                if !record_matches_targets(anchor, &self.wing.rules) {
                    output.filter_statistics.records_filtered_out += 1;
                    continue;
                }
            }
            self.correlate_anchor(anchor, window, streaming, output)
                .await?;
        }
        Ok(())
    }

    async fn correlate_anchor(
        &self,
        anchor: &SourceRecord,
        window: &TimeWindow,
        streaming: Option<&StreamingMatchStore>,
        output: &mut Phase2Output,
    ) -> Result<()> {
        // Candidate list per non-anchor source, closest first; distance ties
        // break toward the earlier record, then the smaller key.
        let candidates: Vec<(&SourceId, Vec<&SourceRecord>)> = window
            .records_by_source
            .iter()
            .filter(|(source_id, records)| {
                **source_id != anchor.source_id && !records.is_empty()
            })
            .map(|(source_id, records)| {
                let mut list: Vec<&SourceRecord> = records.iter().collect();
                list.sort_by(|a, b| {
                    let da = (a.instant - anchor.instant).abs();
                    let db = (b.instant - anchor.instant).abs();
                    da.cmp(&db)
                        .then_with(|| a.instant.cmp(&b.instant))
                        .then_with(|| a.record_key().cmp(&b.record_key()))
                });
                (source_id, list)
            })
            .collect();

        if candidates.len() < self.minimum_matches {
            return Ok(());
        }

        let mut emitted_for_anchor = 0usize;

        // The best combination takes index 0 everywhere; each alternate
        // substitutes one source's index-i candidate while the rest stay at
        // their closest.
        let mut selections: Vec<(usize, usize)> = vec![(usize::MAX, 0)];
        for (position, (_, list)) in candidates.iter().enumerate() {
            for alternate in 1..list.len() {
                selections.push((position, alternate));
            }
        }

        for (position, alternate) in selections {
            if emitted_for_anchor >= self.max_matches_per_anchor {
                output.statistics.alternate_limit_hits += 1;
                debug!(
                    anchor = %anchor.record_key(),
                    cap = self.max_matches_per_anchor,
                    "per-anchor match cap hit, alternates truncated"
                );
                break;
            }
            emitted_for_anchor += 1;

            let mut records: BTreeMap<SourceId, SourceRecord> = BTreeMap::new();
            records.insert(anchor.source_id.clone(), anchor.clone());
            for (index, (source_id, list)) in candidates.iter().enumerate() {
                let pick = if index == position { alternate } else { 0 };
                records.insert((*source_id).clone(), list[pick].clone());
            }

            // Bidirectional window validation runs against the anchor the
            // match will report, which priority selection may move off the
            // enumeration anchor.
            let (reported_anchor, reported_instant) = self.reported_anchor(&records);
            records.retain(|source_id, record| {
                *source_id == reported_anchor
                    || (record.instant - reported_instant).abs().num_seconds()
                        <= self.window_seconds
            });
            if records.len() < self.minimum_matches + 1 {
                output.matches_failed_validation += 1;
                continue;
            }
            output.statistics.combinations_generated += 1;

            let m = self.build_match(records);
            if let Err(reason) = validate_match(&m, m.records.len()) {
                warn!(reason, "match failed integrity validation");
                output.matches_failed_validation += 1;
                continue;
            }

            let mut m = m;
            match self.dedup.register(m.match_set(), m.match_id) {
                DedupOutcome::Original => {
                    self.tracker.record_matches(1);
                }
                DedupOutcome::DuplicateOf(original) => {
                    m.is_duplicate = true;
                    m.duplicate_of = Some(original);
                    output.duplicates_prevented += 1;
                    output.statistics.duplicates_flagged += 1;
                    *output
                        .duplicates_by_source
                        .entry(m.anchor_source_id.clone())
                        .or_insert(0) += 1;
                }
            }

            semantic::apply_semantics(&mut m, self.wing);
            if let Some(store) = streaming {
                store.write_match(&m).await?;
            }
            output.matches.push(m);
        }
        Ok(())
    }

    /// The anchor this combination will report: the contributing source whose
    /// artifact type ranks highest in the wing's priority list, ties broken
    /// by source order.
    fn reported_anchor(
        &self,
        records: &BTreeMap<SourceId, SourceRecord>,
    ) -> (SourceId, chrono::DateTime<chrono::Utc>) {
        records
            .iter()
            .min_by_key(|(source_id, _)| {
                let artifact = self
                    .wing
                    .source(source_id)
                    .map(|spec| spec.artifact_type.clone())
                    .unwrap_or(corvus_model::ArtifactType::Other(String::new()));
                (self.wing.anchor_rank(&artifact), (*source_id).clone())
            })
            .map(|(source_id, record)| (source_id.clone(), record.instant))
            .expect("combinations are non-empty")
    }

    /// Assemble a match from a validated combination.
    fn build_match(&self, records: BTreeMap<SourceId, SourceRecord>) -> CorrelationMatch {
        let (anchor_source_id, anchor_instant) = self.reported_anchor(&records);

        let anchor_artifact_type = self
            .wing
            .source(&anchor_source_id)
            .map(|spec| spec.artifact_type.clone())
            .unwrap_or(corvus_model::ArtifactType::Other(String::new()));

        let score = scoring::score_match(&records, self.wing);
        CorrelationMatch {
            match_id: MatchId::new(),
            anchor_source_id,
            anchor_artifact_type,
            anchor_instant,
            records,
            match_score: score.match_score,
            score_breakdown: score.breakdown,
            confidence_score: score.confidence_score,
            confidence_band: score.confidence_band,
            weighted_score: score.weighted_score,
            time_spread_seconds: score.time_spread_seconds,
            field_similarity_scores: score.field_similarity_scores,
            is_duplicate: false,
            duplicate_of: None,
            semantic_data: Default::default(),
        }
    }
}

/// Wildcard target filter for `apply_to: specific` wings.
fn record_matches_targets(record: &SourceRecord, rules: &CorrelationRules) -> bool {
    if let Some(target) = &rules.target_application {
        let hit = record
            .application()
            .is_some_and(|app| semantic::wildcard_matches(target, &app));
        if !hit {
            return false;
        }
    }
    if let Some(target) = &rules.target_file_path {
        let hit = record
            .file_path()
            .is_some_and(|path| semantic::wildcard_matches(target, &path));
        if !hit {
            return false;
        }
    }
    if let Some(target) = &rules.target_event_id {
        let hit = record
            .field_text("event_id")
            .is_some_and(|id| semantic::wildcard_matches(target, &id));
        if !hit {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use corvus_model::{TimeWindow, WindowId};
    use serde_json::Value;

    fn record(source: &str, rowid: i64, instant: DateTime<Utc>) -> SourceRecord {
        let mut fields = serde_json::Map::new();
        fields.insert(
            "application".to_string(),
            Value::String("calc.exe".to_string()),
        );
        SourceRecord {
            source_id: SourceId::from(source),
            rowid: Some(rowid),
            fields,
            instant,
            raw_timestamp: Value::Null,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, h, m, s).unwrap()
    }

    async fn run_phase2(
        window: TimeWindow,
        wing: &Wing,
        config: &ScanConfig,
    ) -> Phase2Output {
        let dir = tempfile::tempdir().unwrap();
        let store = WindowStore::open(&dir.path().join("corr.db")).await.unwrap();
        store.save_window(&window).await.unwrap();

        let tracker = ProgressTracker::new();
        let correlator = Phase2Correlator::new(wing, config, &tracker);
        let cancellation = CancellationManager::new();
        correlator
            .correlate(&store, None, &cancellation)
            .await
            .unwrap()
    }

    fn window_with(
        records: &[(&str, i64, DateTime<Utc>)],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> TimeWindow {
        let mut window = TimeWindow::new(WindowId(0), start, end);
        for (source, rowid, instant) in records {
            window
                .records_by_source
                .entry(SourceId::from(*source))
                .or_default()
                .push(record(source, *rowid, *instant));
        }
        window
    }

    #[tokio::test]
    async fn closest_records_form_the_best_match() {
        let wing = crate::testutil::minimal_wing();
        let config = ScanConfig::default();
        // B has a close and a far record; only the close one joins the best
        // combination for anchor A.
        let window = window_with(
            &[
                ("a", 1, at(10, 0, 0)),
                ("b", 1, at(10, 2, 0)),
                ("b", 2, at(10, 4, 30)),
            ],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        let output = run_phase2(window, &wing, &config).await;
        let canonical: Vec<&CorrelationMatch> =
            output.matches.iter().filter(|m| !m.is_duplicate).collect();
        assert!(!canonical.is_empty());

        let best = canonical
            .iter()
            .find(|m| {
                m.records[&SourceId::from("a")].rowid == Some(1)
                    && m.records[&SourceId::from("b")].rowid == Some(1)
            })
            .expect("closest pairing present");
        assert!((best.time_spread_seconds - 120.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn out_of_window_records_fail_validation() {
        let mut wing = crate::testutil::minimal_wing();
        wing.rules.window_minutes = 1;
        let config = ScanConfig::default();
        // The b record is 4 minutes from the anchor but both sit in the same
        // persisted window; bidirectional validation must reject the pair.
        let window = window_with(
            &[("a", 1, at(10, 0, 0)), ("b", 1, at(10, 4, 0))],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        let output = run_phase2(window, &wing, &config).await;
        assert!(output.matches.is_empty());
        assert!(output.matches_failed_validation > 0);
    }

    #[tokio::test]
    async fn repeated_combinations_are_flagged_not_dropped() {
        let wing = crate::testutil::minimal_wing();
        let config = ScanConfig::default();
        let window = window_with(
            &[("a", 1, at(10, 0, 0)), ("b", 1, at(10, 1, 0))],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        // Anchoring from a and from b generates the same participant set; the
        // second occurrence must come back flagged and linked.
        let output = run_phase2(window, &wing, &config).await;
        let canonical: Vec<_> = output.matches.iter().filter(|m| !m.is_duplicate).collect();
        let duplicates: Vec<_> = output.matches.iter().filter(|m| m.is_duplicate).collect();
        assert_eq!(canonical.len(), 1);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].duplicate_of, Some(canonical[0].match_id));
        assert_eq!(output.duplicates_prevented, 1);

        // Accounting identity: canonical + duplicates = combinations that met
        // the threshold.
        assert_eq!(
            canonical.len() as u64 + output.duplicates_prevented,
            output.statistics.combinations_generated
        );
    }

    #[tokio::test]
    async fn anchor_priority_selects_the_reported_anchor() {
        let mut wing = crate::testutil::minimal_wing();
        // Source b's artifact type outranks a's.
        wing.sources[0].artifact_type = corvus_model::ArtifactType::EventLogs;
        wing.sources[1].artifact_type = corvus_model::ArtifactType::Prefetch;
        wing.anchor_priority = vec![
            corvus_model::ArtifactType::Prefetch,
            corvus_model::ArtifactType::EventLogs,
        ];
        let config = ScanConfig::default();
        let window = window_with(
            &[("a", 1, at(10, 0, 0)), ("b", 1, at(10, 1, 0))],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        let output = run_phase2(window, &wing, &config).await;
        for m in &output.matches {
            assert_eq!(m.anchor_source_id, SourceId::from("b"));
            assert_eq!(
                m.anchor_artifact_type,
                corvus_model::ArtifactType::Prefetch
            );
        }
    }

    #[tokio::test]
    async fn per_anchor_cap_truncates_alternates() {
        let wing = crate::testutil::minimal_wing();
        let config = ScanConfig {
            max_matches_per_anchor: 3,
            ..ScanConfig::default()
        };
        // Ten b candidates: anchor a alone would generate 1 best + 9
        // alternates without the cap.
        let mut entries: Vec<(&str, i64, DateTime<Utc>)> = vec![("a", 1, at(10, 0, 0))];
        for i in 0..10 {
            entries.push(("b", i + 1, at(10, 0, (i as u32 + 1) * 10)));
        }
        let window = window_with(&entries, at(10, 0, 0), at(10, 5, 0));

        let output = run_phase2(window, &wing, &config).await;
        assert!(output.statistics.alternate_limit_hits > 0);
    }

    #[tokio::test]
    async fn specific_targets_filter_anchors() {
        let mut wing = crate::testutil::minimal_wing();
        wing.rules.apply_to = ApplyTo::Specific;
        wing.rules.target_application = Some("word.exe".to_string());
        let config = ScanConfig::default();
        let window = window_with(
            &[("a", 1, at(10, 0, 0)), ("b", 1, at(10, 1, 0))],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        // Fixture records are all calc.exe; nothing may anchor.
        let output = run_phase2(window, &wing, &config).await;
        assert!(output.matches.is_empty());
        assert_eq!(output.filter_statistics.records_filtered_out, 2);
    }

    #[tokio::test]
    async fn matches_respect_window_distance_invariant() {
        let wing = crate::testutil::minimal_wing();
        let config = ScanConfig::default();
        let window = window_with(
            &[
                ("a", 1, at(10, 0, 0)),
                ("a", 2, at(10, 3, 0)),
                ("b", 1, at(10, 2, 0)),
                ("b", 2, at(10, 4, 0)),
            ],
            at(10, 0, 0),
            at(10, 5, 0),
        );

        let output = run_phase2(window, &wing, &config).await;
        let window_seconds = wing.rules.window_seconds();
        for m in &output.matches {
            let anchor_instant = m.records[&m.anchor_source_id].instant;
            for record in m.records.values() {
                assert!(
                    (record.instant - anchor_instant).abs().num_seconds() <= window_seconds
                );
            }
            assert!((0.0..=1.0).contains(&m.match_score));
            assert!((0.0..=1.0).contains(&m.confidence_score));
            assert!(
                (m.computed_time_spread_seconds() - m.time_spread_seconds).abs() <= 0.01
            );
        }
    }
}
