//! Process-wide match deduplication.
//!
//! Every validated combination registers its [`MatchSet`] here. The first
//! registration wins canonical status; later ones (including repeats produced
//! by overlapping windows) come back as duplicates pointing at the canonical
//! match id. The map is hash-sharded internally, so parallel workers contend
//! only on their shard.

use dashmap::DashMap;

use corvus_model::{MatchId, MatchSet};

/// Result of registering a match identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First occurrence; the registered id is now canonical.
    Original,
    /// Seen before; carries the canonical match id.
    DuplicateOf(MatchId),
}

/// Sharded first-writer-wins registry of match identities.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    seen: DashMap<MatchSet, MatchId>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate match. Exactly one caller per distinct set ever
    /// observes [`DedupOutcome::Original`].
    pub fn register(&self, set: MatchSet, candidate: MatchId) -> DedupOutcome {
        match self.seen.entry(set) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                DedupOutcome::DuplicateOf(*existing.get())
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(candidate);
                DedupOutcome::Original
            }
        }
    }

    pub fn distinct_matches(&self) -> usize {
        self.seen.len()
    }
}
