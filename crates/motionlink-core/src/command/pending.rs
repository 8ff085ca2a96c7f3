// ── Per-device pending set ──
//
// Outstanding command ids for one device, kept in issue order. Used only
// to compute sync status and to find commands a broadcast covers; it
// never mutates device state.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::CommandId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEntry {
    id: CommandId,
    /// Wall-clock issue time, compared against server timestamps.
    issued_at: DateTime<Utc>,
    /// Monotonic issue time, used for timeout and staleness windows.
    issued_instant: Instant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet {
    entries: Vec<PendingEntry>,
}

impl PendingSet {
    pub fn insert(&mut self, id: CommandId, issued_at: DateTime<Utc>, issued_instant: Instant) {
        self.entries.push(PendingEntry {
            id,
            issued_at,
            issued_instant,
        });
    }

    /// Remove one id. Returns whether it was present.
    pub fn remove(&mut self, id: &CommandId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.id != id);
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CommandId> {
        self.entries.iter().map(|e| &e.id)
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Monotonic issue time of the oldest outstanding command.
    pub fn oldest_instant(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.issued_instant).min()
    }

    /// Ids a broadcast stamped `at` supersedes: those issued strictly
    /// before it. A broadcast without a timestamp covers everything.
    pub fn covered_by(&self, at: Option<DateTime<Utc>>) -> Vec<CommandId> {
        self.entries
            .iter()
            .filter(|e| at.is_none_or(|ts| e.issued_at < ts))
            .map(|e| e.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    #[test]
    fn covered_by_respects_issue_order() {
        let t0 = Utc::now();
        let now = Instant::now();
        let mut set = PendingSet::default();
        set.insert("a".into(), t0, now);
        set.insert("b".into(), t0 + ChronoDuration::seconds(2), now);

        let covered = set.covered_by(Some(t0 + ChronoDuration::seconds(1)));
        assert_eq!(covered, vec![CommandId::from("a")]);

        let all = set.covered_by(None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn equal_timestamp_does_not_cover() {
        let t0 = Utc::now();
        let mut set = PendingSet::default();
        set.insert("a".into(), t0, Instant::now());
        assert!(set.covered_by(Some(t0)).is_empty());
    }

    #[test]
    fn remove_by_id_not_position() {
        let t0 = Utc::now();
        let now = Instant::now();
        let mut set = PendingSet::default();
        set.insert("a".into(), t0, now);
        set.insert("b".into(), t0, now);
        set.insert("c".into(), t0, now);

        assert!(set.remove(&"b".into()));
        assert!(!set.remove(&"b".into()));
        assert_eq!(set.ids().cloned().collect::<Vec<_>>(), vec![
            CommandId::from("a"),
            CommandId::from("c")
        ]);
    }

    #[test]
    fn oldest_instant_is_the_earliest_issue() {
        let t0 = Utc::now();
        let i0 = Instant::now();
        let mut set = PendingSet::default();
        assert_eq!(set.oldest_instant(), None);
        set.insert(
            "b".into(),
            t0 + ChronoDuration::seconds(5),
            i0 + std::time::Duration::from_secs(5),
        );
        set.insert("a".into(), t0, i0);
        assert_eq!(set.oldest_instant(), Some(i0));
    }
}
