use super::Entry;

use std::collections::HashMap;

/// A Raft-managed state machine. Committed log entries are applied exactly
/// once, in log order; reads only ever see the applied prefix. The state
/// machine is owned by the node and touched from the event loop thread only.
pub trait State: Send {
    /// Applies a committed entry to the state machine.
    fn apply(&mut self, entry: &Entry);

    /// Reads the value of a key. Absent keys read as the empty string.
    fn read(&self, key: &str) -> String;
}

/// The key/value store state machine: a mapping from each key to the most
/// recently committed value.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State for KvStore {
    fn apply(&mut self, entry: &Entry) {
        self.data.insert(entry.key.clone(), entry.value.clone());
    }

    fn read(&self, key: &str) -> String {
        self.data.get(key).cloned().unwrap_or_default()
    }
}
