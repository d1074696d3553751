use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde_json::{json, Map, Value as JsonValue};

use super::{evaluate, FactStore, SuccessorIndex};
use crate::query::Query;
use crate::{Fact, FactHash, FactwatchError, Result, Value};

/// Hex fact hash to a JSON array of mementos, one per distinct fact with
/// that hash.
///
/// A memento keeps scalar fields as they are and replaces every predecessor
/// with `{"hash": "<hex>", "slot": n}`: the bucket it lives in and its
/// position there. Buckets only grow, so a slot never moves. Buckets hold a
/// single memento unless two distinct facts collide.
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");

/// Successor index: `"{predecessor hash}:{role}:{successor hash}"` keys with
/// empty values. Hashes are fixed-width hex, so a prefix scan over
/// `"{predecessor hash}:{role}:"` finds every successor through that role.
const SUCCESSORS: TableDefinition<&str, &str> = TableDefinition::new("successors");

/// Persistent [`FactStore`] backed by `redb`.
///
/// Every [`save`](FactStore::save) runs in one write transaction, so a fact
/// and its predecessors become visible together. Each fact is written once,
/// however many successors share it.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create a store with no file I/O. Data is lost when it is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(FACTS)?;
        write_txn.open_table(SUCCESSORS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Whether `fact` and all of its predecessors are stored.
    pub fn contains(&self, fact: &Fact) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let mut slots = HashMap::new();
        for candidate in fact.ancestry() {
            let Some(memento) = memento(&candidate, &slots) else {
                return Ok(false);
            };
            let bucket = read_bucket(&table, candidate.hash())?;
            let Some(index) = bucket.iter().position(|m| *m == memento) else {
                return Ok(false);
            };
            slots.insert(candidate, index);
        }
        Ok(true)
    }

    /// Every fact stored under `hash`.
    pub fn facts_with_hash(&self, hash: FactHash) -> Result<Vec<Fact>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let facts = Loader::new(&table).facts_at(hash)?;
        Ok(facts.iter().map(|f| f.as_ref().clone()).collect())
    }
}

/// Position of a stored fact: its hash bucket and index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Slot {
    hash: FactHash,
    index: usize,
}

impl Slot {
    fn to_json(self) -> JsonValue {
        json!({ "hash": self.hash.to_hex(), "slot": self.index })
    }

    fn from_json(json: &JsonValue) -> Result<Self> {
        let hash = json
            .get("hash")
            .and_then(JsonValue::as_str)
            .and_then(FactHash::from_hex);
        let index = json
            .get("slot")
            .and_then(JsonValue::as_u64)
            .and_then(|i| usize::try_from(i).ok());
        match (hash, index) {
            (Some(hash), Some(index)) => Ok(Slot { hash, index }),
            _ => Err(corrupt(format!("bad predecessor reference {json}"))),
        }
    }
}

fn corrupt(detail: impl std::fmt::Display) -> FactwatchError {
    FactwatchError::Storage(format!("corrupt fact table: {detail}"))
}

fn read_bucket(
    table: &impl ReadableTable<&'static str, &'static str>,
    hash: FactHash,
) -> Result<Vec<JsonValue>> {
    let raw: Option<String> = table
        .get(hash.to_hex().as_str())?
        .map(|guard| guard.value().to_string());
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

/// Stored form of `fact`, or `None` if a predecessor has no known slot.
fn memento(fact: &Fact, slots: &HashMap<Fact, usize>) -> Option<JsonValue> {
    let reference = |p: &Arc<Fact>| {
        slots.get(p.as_ref()).map(|&index| {
            Slot {
                hash: p.hash(),
                index,
            }
            .to_json()
        })
    };
    let mut map = Map::new();
    for (name, value) in fact.fields() {
        let json = match value {
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Number(n) => JsonValue::Number(n.clone()),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Null => JsonValue::Null,
            Value::Predecessor(p) => reference(p)?,
            Value::Predecessors(list) => {
                JsonValue::Array(list.iter().map(reference).collect::<Option<Vec<_>>>()?)
            }
        };
        map.insert(name.clone(), json);
    }
    Some(JsonValue::Object(map))
}

/// Rebuilds facts from mementos within one transaction.
///
/// Predecessors are rebuilt before the facts that reference them, from an
/// explicit work list, so chain depth never turns into stack depth. Every
/// slot is rebuilt at most once and shared after that.
struct Loader<'t, T> {
    table: &'t T,
    buckets: HashMap<FactHash, Vec<JsonValue>>,
    built: HashMap<Slot, Arc<Fact>>,
}

impl<'t, T: ReadableTable<&'static str, &'static str>> Loader<'t, T> {
    fn new(table: &'t T) -> Self {
        Self {
            table,
            buckets: HashMap::new(),
            built: HashMap::new(),
        }
    }

    fn facts_at(&mut self, hash: FactHash) -> Result<Vec<Arc<Fact>>> {
        let len = self.mementos(hash)?.len();
        (0..len).map(|index| self.load(Slot { hash, index })).collect()
    }

    fn mementos(&mut self, hash: FactHash) -> Result<&[JsonValue]> {
        let bucket = match self.buckets.entry(hash) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(read_bucket(self.table, hash)?),
        };
        Ok(bucket.as_slice())
    }

    fn load(&mut self, slot: Slot) -> Result<Arc<Fact>> {
        let mut pending = vec![slot];
        let mut expanded = HashSet::new();
        while let Some(&top) = pending.last() {
            if self.built.contains_key(&top) {
                pending.pop();
                continue;
            }
            let memento = self
                .mementos(top.hash)?
                .get(top.index)
                .cloned()
                .ok_or_else(|| corrupt(format!("no fact at {}/{}", top.hash, top.index)))?;
            let JsonValue::Object(fields) = memento else {
                return Err(corrupt(format!("{} is not an object", top.hash)));
            };

            let mut missing = Vec::new();
            for value in fields.values() {
                let references = match value {
                    JsonValue::Object(_) => std::slice::from_ref(value),
                    JsonValue::Array(items) => items.as_slice(),
                    _ => &[],
                };
                for reference in references {
                    let slot = Slot::from_json(reference)?;
                    if !self.built.contains_key(&slot) {
                        missing.push(slot);
                    }
                }
            }

            if missing.is_empty() {
                let fact = self.rebuild(&fields)?;
                if fact.hash() != top.hash {
                    return Err(corrupt(format!("{} rebuilt as {}", top.hash, fact.hash())));
                }
                self.built.insert(top, Arc::new(fact));
                pending.pop();
            } else if expanded.insert(top) {
                pending.extend(missing);
            } else {
                // Its predecessors were all loaded above it, unless one
                // leads back to it.
                return Err(corrupt(format!("cycle through {}", top.hash)));
            }
        }
        self.built
            .get(&slot)
            .cloned()
            .ok_or_else(|| corrupt(format!("no fact at {}/{}", slot.hash, slot.index)))
    }

    fn rebuild(&self, memento: &Map<String, JsonValue>) -> Result<Fact> {
        let mut fields = BTreeMap::new();
        for (name, value) in memento {
            let value = match value {
                JsonValue::String(s) => Value::Text(s.clone()),
                JsonValue::Number(n) => Value::Number(n.clone()),
                JsonValue::Bool(b) => Value::Boolean(*b),
                JsonValue::Null => Value::Null,
                JsonValue::Object(_) => Value::Predecessor(self.built_at(value)?),
                JsonValue::Array(items) => Value::Predecessors(
                    items
                        .iter()
                        .map(|item| self.built_at(item))
                        .collect::<Result<_>>()?,
                ),
            };
            fields.insert(name.clone(), value);
        }
        Ok(Fact::from_fields(fields))
    }

    fn built_at(&self, reference: &JsonValue) -> Result<Arc<Fact>> {
        let slot = Slot::from_json(reference)?;
        self.built
            .get(&slot)
            .cloned()
            .ok_or_else(|| corrupt(format!("{} referenced before it was loaded", slot.hash)))
    }
}

fn successor_key(predecessor: FactHash, role: &str, successor: FactHash) -> String {
    format!("{}:{}:{}", predecessor.to_hex(), role, successor.to_hex())
}

impl FactStore for RedbStore {
    fn save(&self, fact: &Fact) -> Result<Vec<Fact>> {
        let mut saved = Vec::new();
        let write_txn = self.db.begin_write()?;
        {
            let mut facts = write_txn.open_table(FACTS)?;
            let mut successors = write_txn.open_table(SUCCESSORS)?;
            // Ancestry lists predecessors first, so every predecessor has a
            // slot by the time a fact referencing it is written.
            let mut slots = HashMap::new();
            for candidate in fact.ancestry() {
                let memento = memento(&candidate, &slots).ok_or_else(|| {
                    let hash = candidate.hash();
                    FactwatchError::Internal(format!("{hash} saved before a predecessor"))
                })?;
                let mut bucket = read_bucket(&facts, candidate.hash())?;
                let index = match bucket.iter().position(|m| *m == memento) {
                    Some(index) => index,
                    None => {
                        bucket.push(memento);
                        let value = serde_json::to_string(&bucket)?;
                        facts.insert(candidate.hash().to_hex().as_str(), value.as_str())?;

                        for (role, predecessor) in candidate.predecessor_edges() {
                            let key = successor_key(predecessor.hash(), role, candidate.hash());
                            successors.insert(key.as_str(), "")?;
                        }
                        saved.push(candidate.clone());
                        bucket.len() - 1
                    }
                };
                slots.insert(candidate, index);
            }
        }
        write_txn.commit()?;
        tracing::debug!(hash = %fact.hash(), saved = saved.len(), "redb store save");
        Ok(saved)
    }

    fn execute_query(&self, start: &Fact, query: &Query) -> Result<Vec<Fact>> {
        evaluate(self, start, query)
    }
}

impl SuccessorIndex for RedbStore {
    fn successors(&self, fact: &Fact, role: &str) -> Result<Vec<Fact>> {
        let prefix = format!("{}:{}:", fact.hash().to_hex(), role);
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(SUCCESSORS)?;
        let facts = read_txn.open_table(FACTS)?;

        let mut hashes = Vec::new();
        for entry in index.range(prefix.as_str()..)? {
            let (key, _) = entry?;
            let key = key.value();
            let Some(suffix) = key.strip_prefix(prefix.as_str()) else {
                break;
            };
            // Longer roles sharing this prefix leave a longer suffix.
            if let Some(hash) = FactHash::from_hex(suffix) {
                hashes.push(hash);
            }
        }

        let mut loader = Loader::new(&facts);
        let mut results: Vec<Fact> = Vec::new();
        for hash in hashes {
            for successor in loader.facts_at(hash)? {
                if successor.references(role, fact) && !results.contains(successor.as_ref()) {
                    results.push(successor.as_ref().clone());
                }
            }
        }
        Ok(results)
    }
}

impl From<redb::DatabaseError> for FactwatchError {
    fn from(e: redb::DatabaseError) -> Self {
        FactwatchError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for FactwatchError {
    fn from(e: redb::TransactionError) -> Self {
        FactwatchError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for FactwatchError {
    fn from(e: redb::TableError) -> Self {
        FactwatchError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for FactwatchError {
    fn from(e: redb::StorageError) -> Self {
        FactwatchError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for FactwatchError {
    fn from(e: redb::CommitError) -> Self {
        FactwatchError::Storage(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
