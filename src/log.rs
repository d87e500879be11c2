//! The in-memory replicated log.

use crate::raft::Entry;

/// The replicated log, held fully in memory over a compactable base.
///
/// The log stores entries with indices `base_index+1 ..= base_index+count`.
/// The pair `(base_index, base_term)` is a virtual prefix: the point up to
/// which entries have been folded into a snapshot and discarded. A fresh log
/// has `base_index == 0`, and index 0 never holds an entry.
///
/// Invariants:
///
/// * Entry indices are contiguous starting at `base_index + 1`.
/// * Entry terms never decrease from the previous entry.
/// * An appended entry's index is exactly `last_index() + 1`.
///
/// References returned by [`get`](RaftLog::get) are invalidated by any
/// mutating call; the borrow checker enforces this.
#[derive(Debug, Default)]
pub(crate) struct RaftLog {
    base_index: u64,
    base_term: u64,
    entries: Vec<Entry>,
}

impl RaftLog {
    /// Create an empty log with a zero base.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create an empty log starting just after `(base_index, base_term)`.
    pub(crate) fn with_base(base_index: u64, base_term: u64) -> Self {
        RaftLog {
            base_index,
            base_term,
            entries: Vec::new(),
        }
    }

    /// The index of the compacted prefix; entries at or below it are gone.
    pub(crate) fn base_index(&self) -> u64 {
        self.base_index
    }

    /// The term of the entry at `base_index`.
    pub(crate) fn base_term(&self) -> u64 {
        self.base_term
    }

    /// The number of entries currently held in memory.
    pub(crate) fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// The index of the newest entry, or `base_index` when empty.
    pub(crate) fn last_index(&self) -> u64 {
        self.base_index + self.entries.len() as u64
    }

    /// The term of the newest entry, or `base_term` when empty.
    pub(crate) fn last_term(&self) -> u64 {
        match self.entries.last() {
            Some(entry) => entry.term,
            None => self.base_term,
        }
    }

    /// Append an entry whose index must be exactly `last_index() + 1`.
    pub(crate) fn append(&mut self, entry: Entry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log append must be contiguous");
        debug_assert!(entry.term >= self.last_term(), "entry terms must be monotonic");
        self.entries.push(entry);
    }

    /// Look up the entry at `index`.
    ///
    /// Returns `None` when `index <= base_index` (compacted away) or
    /// `index > last_index()`.
    pub(crate) fn get(&self, index: u64) -> Option<&Entry> {
        if index <= self.base_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.base_index - 1) as usize)
    }

    /// The term of the entry at `index`.
    ///
    /// Returns `base_term` at `base_index` itself, the entry's term when the
    /// entry is present, and the sentinel `0` ("unknown") otherwise.
    pub(crate) fn term_at(&self, index: u64) -> u64 {
        if index == self.base_index {
            return self.base_term;
        }
        match self.get(index) {
            Some(entry) => entry.term,
            None => 0,
        }
    }

    /// A slice of up to `max` entries starting at `from`, for replication.
    ///
    /// `from` must be within `(base_index, last_index()+1]`.
    pub(crate) fn entries_from(&self, from: u64, max: u64) -> &[Entry] {
        debug_assert!(from > self.base_index);
        let start = (from.saturating_sub(self.base_index + 1)) as usize;
        let start = start.min(self.entries.len());
        let end = start.saturating_add(max.min(usize::MAX as u64) as usize).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Remove all entries with `index > after`; their payloads are freed.
    pub(crate) fn truncate_after(&mut self, after: u64) {
        if after >= self.last_index() {
            return;
        }
        let keep = after.saturating_sub(self.base_index) as usize;
        self.entries.truncate(keep);
    }

    /// Remove all entries with `index < from`, advancing the base to
    /// `(from - 1, term_at(from - 1))`.
    ///
    /// Used for in-memory compaction once a snapshot covering `from - 1` is
    /// durable. A `from` at or below the current base is a no-op.
    pub(crate) fn truncate_before(&mut self, from: u64) {
        if from <= self.base_index + 1 {
            return;
        }
        let new_base = from - 1;
        let new_base_term = self.term_at(new_base);
        if new_base >= self.last_index() {
            self.entries.clear();
        } else {
            self.entries.drain(..(new_base - self.base_index) as usize);
        }
        self.base_index = new_base;
        self.base_term = new_base_term;
    }

    /// Discard everything and restart the log just after the given base.
    ///
    /// Used when a snapshot from the leader supersedes the whole log.
    pub(crate) fn reset(&mut self, base_index: u64, base_term: u64) {
        self.entries.clear();
        self.base_index = base_index;
        self.base_term = base_term;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::raft::EntryKind;

    fn entry(term: u64, index: u64) -> Entry {
        Entry {
            term,
            index,
            kind: EntryKind::Command,
            payload: format!("cmd-{}", index).into_bytes(),
        }
    }

    #[test]
    fn empty_log_boundaries() {
        let log = RaftLog::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), 0);
        assert!(log.get(0).is_none());
        assert!(log.get(1).is_none());
    }

    #[test]
    fn append_assigns_contiguous_indices() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2).unwrap().term, 1);
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.term_at(4), 0);
    }

    #[test]
    fn truncate_after_removes_suffix() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }
        log.truncate_after(3);

        assert_eq!(log.last_index(), 3);
        assert!(log.get(4).is_none());
        assert!(log.get(5).is_none());
        assert_eq!(log.get(3).unwrap().index, 3);

        // Truncating at or past the end is a no-op.
        log.truncate_after(10);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn truncate_before_advances_base() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(if i <= 2 { 1 } else { 2 }, i));
        }
        log.truncate_before(4);

        assert_eq!(log.base_index(), 3);
        assert_eq!(log.base_term(), 2);
        assert_eq!(log.count(), 2);
        assert!(log.get(3).is_none());
        assert_eq!(log.term_at(3), 2);
        assert_eq!(log.get(4).unwrap().index, 4);
        assert_eq!(log.last_index(), 5);
    }

    #[test]
    fn truncate_before_everything_leaves_empty_log() {
        let mut log = RaftLog::new();
        for i in 1..=3 {
            log.append(entry(1, i));
        }
        log.truncate_before(4);

        assert_eq!(log.base_index(), 3);
        assert_eq!(log.base_term(), 1);
        assert_eq!(log.count(), 0);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn entries_from_respects_max() {
        let mut log = RaftLog::new();
        for i in 1..=10 {
            log.append(entry(1, i));
        }

        let slice = log.entries_from(4, 3);
        assert_eq!(slice.len(), 3);
        assert_eq!(slice[0].index, 4);
        assert_eq!(slice[2].index, 6);

        let tail = log.entries_from(9, 64);
        assert_eq!(tail.len(), 2);
        assert!(log.entries_from(11, 64).is_empty());
    }

    #[test]
    fn reset_discards_everything() {
        let mut log = RaftLog::new();
        for i in 1..=3 {
            log.append(entry(1, i));
        }
        log.reset(10, 3);

        assert_eq!(log.count(), 0);
        assert_eq!(log.base_index(), 10);
        assert_eq!(log.base_term(), 3);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 3);
        assert!(log.get(2).is_none());
    }
}
