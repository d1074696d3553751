use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{evaluate, FactStore, SuccessorIndex};
use crate::query::Query;
use crate::{Fact, FactHash, FactwatchError, Result};

/// Volatile [`FactStore`] for tests, caches and short-lived engines.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Facts bucketed by hash; a bucket holds more than one fact only on a
    /// hash collision.
    facts: HashMap<FactHash, Vec<Fact>>,
    /// `(predecessor hash, role)` to the facts referencing it through `role`.
    successors: HashMap<(FactHash, String), Vec<Fact>>,
    len: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct facts stored.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, fact: &Fact) -> Result<bool> {
        Ok(self.lock()?.contains(fact))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| FactwatchError::Internal("memory store lock poisoned".into()))
    }
}

impl Inner {
    fn contains(&self, fact: &Fact) -> bool {
        self.facts
            .get(&fact.hash())
            .is_some_and(|bucket| bucket.contains(fact))
    }

    fn insert(&mut self, fact: &Fact) -> bool {
        if self.contains(fact) {
            return false;
        }
        for (role, predecessor) in fact.predecessor_edges() {
            let successors = self
                .successors
                .entry((predecessor.hash(), role.to_string()))
                .or_default();
            if !successors.contains(fact) {
                successors.push(fact.clone());
            }
        }
        self.facts.entry(fact.hash()).or_default().push(fact.clone());
        self.len += 1;
        true
    }
}

impl FactStore for MemoryStore {
    fn save(&self, fact: &Fact) -> Result<Vec<Fact>> {
        let mut inner = self.lock()?;
        let saved: Vec<Fact> = fact
            .ancestry()
            .into_iter()
            .filter(|f| inner.insert(f))
            .collect();
        tracing::trace!(hash = %fact.hash(), saved = saved.len(), "memory store save");
        Ok(saved)
    }

    fn execute_query(&self, start: &Fact, query: &Query) -> Result<Vec<Fact>> {
        evaluate(self, start, query)
    }
}

impl SuccessorIndex for MemoryStore {
    fn successors(&self, fact: &Fact, role: &str) -> Result<Vec<Fact>> {
        let inner = self.lock()?;
        Ok(inner
            .successors
            .get(&(fact.hash(), role.to_string()))
            .map(|list| {
                list.iter()
                    .filter(|s| s.references(role, fact))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
