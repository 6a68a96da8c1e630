//! Semantic rule and mapping application.
//!
//! Wings can carry AND/OR trees of wildcard conditions that tag matches with
//! normalized meanings ("program execution", "usb insertion"), plus direct
//! (source, field, value) substitutions that translate technical values into
//! analyst-facing ones. Both are applied in Phase 2, after a match survives
//! validation.

use regex::RegexBuilder;
use tracing::warn;

use corvus_model::{
    CorrelationMatch, SemanticCondition, SemanticNode, SourceRecord, Wing,
};

/// Case-insensitive wildcard match: `*` spans any run, `?` one character.
pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    let mut escaped = String::with_capacity(pattern.len() * 2 + 2);
    escaped.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => escaped.push_str(".*"),
            '?' => escaped.push('.'),
            other => escaped.push_str(&regex::escape(&other.to_string())),
        }
    }
    escaped.push('$');

    match RegexBuilder::new(&escaped).case_insensitive(true).build() {
        Ok(re) => re.is_match(value),
        Err(err) => {
            warn!(pattern, error = %err, "unusable wildcard pattern");
            false
        }
    }
}

fn condition_matches(record: &SourceRecord, condition: &SemanticCondition) -> bool {
    record
        .field_text(&condition.field)
        .is_some_and(|value| wildcard_matches(&condition.pattern, &value))
}

fn node_matches(record: &SourceRecord, node: &SemanticNode) -> bool {
    match node {
        SemanticNode::All(children) => {
            !children.is_empty() && children.iter().all(|child| node_matches(record, child))
        }
        SemanticNode::Any(children) => children.iter().any(|child| node_matches(record, child)),
        SemanticNode::Condition(condition) => condition_matches(record, condition),
    }
}

/// Attach rule tags and mapping substitutions to a match.
pub fn apply_semantics(m: &mut CorrelationMatch, wing: &Wing) {
    for rule in &wing.semantic_rules {
        let hit = m
            .records
            .values()
            .any(|record| node_matches(record, &rule.root));
        if hit && !m.semantic_data.tags.contains(&rule.tag) {
            m.semantic_data.tags.push(rule.tag.clone());
        }
    }

    for mapping in &wing.semantic_mappings {
        let Some(record) = m.records.get(&mapping.source_id) else {
            continue;
        };
        let Some(value) = record.field_text(&mapping.field) else {
            continue;
        };
        if value.eq_ignore_ascii_case(&mapping.technical_value) {
            m.semantic_data.substitutions.insert(
                format!("{}.{}", mapping.source_id, mapping.field),
                mapping.semantic_value.clone(),
            );
        }
    }
}
