//! Bounded set of upstream event keys the controller already acted on.

use std::collections::{HashSet, VecDeque};

/// Insertion-ordered, capped key set. Evicts the oldest key when full.
#[derive(Debug, Clone)]
pub struct SeenEventSet {
    cap: usize,
    keys: VecDeque<String>,
    index: HashSet<String>,
}

impl SeenEventSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            keys: VecDeque::new(),
            index: HashSet::new(),
        }
    }

    pub fn from_keys(keys: Vec<String>, cap: usize) -> Self {
        let mut set = Self::new(cap);
        for key in keys {
            set.mark(&key);
        }
        set
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    /// Returns `false` when the key was already present.
    pub fn mark(&mut self, key: &str) -> bool {
        if self.index.contains(key) {
            return false;
        }
        self.keys.push_back(key.to_string());
        self.index.insert(key.to_string());
        while self.keys.len() > self.cap {
            if let Some(removed) = self.keys.pop_front() {
                self.index.remove(&removed);
            }
        }
        true
    }

    /// Returns `false` when the key was not present.
    pub fn unmark(&mut self, key: &str) -> bool {
        if !self.index.remove(key) {
            return false;
        }
        self.keys.retain(|existing| existing != key);
        true
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }
}
