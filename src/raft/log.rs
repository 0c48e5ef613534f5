use super::{NodeID, Term};

use serde_derive::{Deserialize, Serialize};
use std::collections::HashSet;

/// A log index. Entries start at 1, and 0 indicates no entry.
pub type Index = u64;

/// A log entry: a single client write, replicated under the term in which a
/// leader accepted it. The originating client and the accepting leader
/// travel with the entry (as src/dst on the wire) so that any future leader
/// can detect duplicate requests and route the commit reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term in which the entry was accepted.
    pub term: Term,
    pub key: String,
    pub value: String,
    /// The client that submitted the write.
    #[serde(rename = "src")]
    pub client: NodeID,
    /// The leader that accepted the write.
    #[serde(rename = "dst")]
    pub origin: NodeID,
    /// The client-assigned message ID, unique per request.
    pub mid: String,
}

/// The replicated log of client writes. Committed entries are applied to
/// the key/value state machine in log order.
///
/// The log also owns the current term and the vote cast in it, since vote
/// durability and term monotonicity are log-level invariants.
///
/// Invariants:
///
/// * Entry indexes are contiguous starting at 1 (no gaps).
/// * Entry terms never decrease, and never exceed the current term.
/// * Committed entries are never changed or removed.
/// * The commit index never decreases.
///
/// All state is volatile: a crashed replica rejoins empty and is caught up
/// by the leader.
pub struct Log {
    /// Stored entries. The entry at index i lives at offset i - 1.
    entries: Vec<Entry>,
    /// The current term.
    term: Term,
    /// Who we voted for in the current term, if anyone.
    vote: Option<NodeID>,
    /// The index of the last committed entry, or 0 if none.
    commit_index: Index,
    /// The MIDs of all stored entries, for duplicate request suppression.
    mids: HashSet<String>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

impl Log {
    /// Creates a new, empty log at term 0.
    pub fn new() -> Self {
        Self { entries: Vec::new(), term: 0, vote: None, commit_index: 0, mids: HashSet::new() }
    }

    /// Returns the current term, 0 if none.
    pub fn get_term(&self) -> Term {
        self.term
    }

    /// Returns the vote cast in the current term, if any.
    pub fn get_vote(&self) -> Option<&NodeID> {
        self.vote.as_ref()
    }

    /// Sets the current term and cast vote (if any). Enforces that the term
    /// does not regress, and that we only vote for one node in a term.
    pub fn set_term(&mut self, term: Term, vote: Option<NodeID>) {
        assert!(term > 0, "can't set term 0");
        assert!(term >= self.term, "term regression {} → {}", self.term, term);
        assert!(term > self.term || self.vote.is_none() || vote == self.vote, "can't change vote");
        self.term = term;
        self.vote = vote;
    }

    /// Returns the index of the last entry, or 0 if the log is empty.
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns the term of the last entry, or 0 if the log is empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Returns the commit index, or 0 if no entries are committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    /// Returns the term of the last committed entry, or 0 if none.
    pub fn commit_term(&self) -> Term {
        self.get(self.commit_index).map(|e| e.term).unwrap_or(0)
    }

    /// Appends an entry at the current term, returning its index.
    pub fn append(&mut self, entry: Entry) -> Index {
        assert!(self.term > 0, "can't append entry in term 0");
        assert_eq!(entry.term, self.term, "entry term must be the current term");
        self.mids.insert(entry.mid.clone());
        self.entries.push(entry);
        self.last_index()
    }

    /// Commits entries up to and including the given index, which must
    /// exist. The commit index never regresses; commits at or below it are
    /// no-ops.
    pub fn commit(&mut self, index: Index) -> Index {
        assert!(index <= self.last_index(), "commit index {index} does not exist");
        if index > self.commit_index {
            self.commit_index = index;
        }
        self.commit_index
    }

    /// Fetches the entry at an index, or None if it does not exist.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        index.checked_sub(1).and_then(|offset| self.entries.get(offset as usize))
    }

    /// Checks if the log contains an entry with the given index and term.
    pub fn has(&self, index: Index, term: Term) -> bool {
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Returns true if the log contains an entry with the given MID. Used
    /// to suppress duplicate client writes, which are acked as if the
    /// original succeeded.
    pub fn contains_mid(&self, mid: &str) -> bool {
        self.mids.contains(mid)
    }

    /// Returns the entries in the given index range, clamped to the log.
    pub fn scan(&self, range: impl std::ops::RangeBounds<Index>) -> &[Entry] {
        use std::ops::Bound;
        let start = match range.start_bound() {
            Bound::Included(&index) => index.saturating_sub(1) as usize,
            Bound::Excluded(&index) => index as usize,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&index) => index as usize,
            Bound::Excluded(&index) => index.saturating_sub(1) as usize,
            Bound::Unbounded => self.entries.len(),
        };
        &self.entries[start.min(self.entries.len())..end.min(self.entries.len())]
    }

    /// Splices entries into the log following the given base index, which
    /// must be in the log (or 0). Entries already present with the same
    /// term are left alone, since logs matching on index and term are
    /// identical up to that point; the first conflicting entry truncates
    /// the rest of the log before the remainder is appended. Committed
    /// entries are never truncated, so a stale re-delivered append cannot
    /// unwind them. Returns the last index covered by the splice.
    pub fn splice(&mut self, base: Index, entries: Vec<Entry>) -> Index {
        assert!(base <= self.last_index(), "splice base {base} beyond log");
        let last = base + entries.len() as Index;
        for (i, entry) in entries.into_iter().enumerate() {
            let index = base + i as Index + 1;
            if let Some(existing) = self.get(index) {
                if existing.term == entry.term {
                    continue;
                }
                assert!(index > self.commit_index, "splice would overwrite committed entry");
                self.truncate(index - 1);
            }
            self.mids.insert(entry.mid.clone());
            self.entries.push(entry);
        }
        last
    }

    /// Removes all entries after the given index.
    fn truncate(&mut self, index: Index) {
        for entry in self.entries.drain(index as usize..) {
            self.mids.remove(&entry.mid);
        }
    }
}
