//! Immutable, content-addressed facts.
//!
//! A [`Fact`] is a mapping from field names to [`Value`]s. Fields either hold
//! scalars or point at *predecessor* facts, which makes the set of known facts
//! a directed acyclic graph: a fact can only reference facts that already
//! exist.
//!
//! Facts have no identity besides their content. Two facts with equal fields
//! are the same fact, and they share the same [`FactHash`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::{FactwatchError, Result};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001b3;

/// Content digest of a [`Fact`].
///
/// FNV-1a 64-bit over the fields in sorted name order, with predecessor
/// fields folded in through their own hashes. Not a security primitive:
/// distinct facts may collide, so every lookup keyed by hash still compares
/// facts structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactHash(pub u64);

impl FactHash {
    /// Fixed-width lowercase hex, used as a storage key.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(FactHash)
    }
}

impl std::fmt::Display for FactHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The value held by one field of a fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A text string.
    Text(String),
    /// A JSON number.
    Number(Number),
    /// A boolean.
    Boolean(bool),
    /// An explicit null.
    Null,
    /// A single predecessor.
    Predecessor(Arc<Fact>),
    /// An ordered list of predecessors.
    Predecessors(Vec<Arc<Fact>>),
}

impl Value {
    /// Textual form of a scalar, as compared against query field literals.
    ///
    /// Returns `None` for predecessor fields.
    pub fn scalar_text(&self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Null => Some("null".to_string()),
            Value::Predecessor(_) | Value::Predecessors(_) => None,
        }
    }

    pub fn is_predecessor(&self) -> bool {
        matches!(self, Value::Predecessor(_) | Value::Predecessors(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}
impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}
impl From<f64> for Value {
    /// Non-finite floats have no JSON form and become [`Value::Null`].
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}
impl From<Fact> for Value {
    fn from(fact: Fact) -> Self {
        Value::Predecessor(Arc::new(fact))
    }
}
impl From<Arc<Fact>> for Value {
    fn from(fact: Arc<Fact>) -> Self {
        Value::Predecessor(fact)
    }
}
impl From<Vec<Fact>> for Value {
    fn from(facts: Vec<Fact>) -> Self {
        Value::Predecessors(facts.into_iter().map(Arc::new).collect())
    }
}

/// An immutable, content-addressed record.
///
/// The hash is computed once at construction; all constructors go through
/// [`Fact::from_fields`].
///
/// ```rust
/// use factwatch::Fact;
///
/// let user = Fact::new().with("type", "User").with("publicKey", "X");
/// let list = Fact::new()
///     .with("type", "List")
///     .with("name", "Chores")
///     .with("from", user.clone());
///
/// assert_eq!(list.predecessors("from")[0].as_ref(), &user);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct Fact {
    fields: BTreeMap<String, Value>,
    hash: FactHash,
}

impl Fact {
    /// An empty fact. Add fields with [`Fact::with`].
    pub fn new() -> Self {
        Self::from_fields(BTreeMap::new())
    }

    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        let hash = compute_hash(&fields);
        Self { fields, hash }
    }

    /// Return a copy of this fact with `name` set to `value`.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = self.fields;
        fields.insert(name.into(), value.into());
        Self::from_fields(fields)
    }

    pub fn hash(&self) -> FactHash {
        self.hash
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Predecessors reachable through `role`. Empty when the field is absent
    /// or holds a scalar.
    pub fn predecessors(&self, role: &str) -> &[Arc<Fact>] {
        match self.fields.get(role) {
            Some(Value::Predecessor(fact)) => std::slice::from_ref(fact),
            Some(Value::Predecessors(list)) => list,
            _ => &[],
        }
    }

    /// Does `role` on this fact point at `predecessor`?
    pub fn references(&self, role: &str, predecessor: &Fact) -> bool {
        self.predecessors(role)
            .iter()
            .any(|p| p.as_ref() == predecessor)
    }

    /// Every predecessor edge of this fact as `(role, predecessor)`, in field
    /// order.
    pub fn predecessor_edges(&self) -> impl Iterator<Item = (&str, &Arc<Fact>)> {
        self.fields.iter().flat_map(|(role, value)| {
            let list: &[Arc<Fact>] = match value {
                Value::Predecessor(fact) => std::slice::from_ref(fact),
                Value::Predecessors(list) => list,
                _ => &[],
            };
            list.iter().map(move |p| (role.as_str(), p))
        })
    }

    /// Does the scalar field `name` render to `literal`?
    pub fn matches_field(&self, name: &str, literal: &str) -> bool {
        self.fields
            .get(name)
            .and_then(Value::scalar_text)
            .is_some_and(|text| text == literal)
    }

    /// This fact and all of its transitive predecessors, predecessors first,
    /// each fact exactly once.
    pub fn ancestry(&self) -> Vec<Fact> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        collect_ancestry(self, &mut seen, &mut out);
        out
    }

    /// JSON object form with predecessors inlined.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (name, value) in &self.fields {
            let json = match value {
                Value::Text(s) => JsonValue::String(s.clone()),
                Value::Number(n) => JsonValue::Number(n.clone()),
                Value::Boolean(b) => JsonValue::Bool(*b),
                Value::Null => JsonValue::Null,
                Value::Predecessor(fact) => fact.to_json(),
                Value::Predecessors(list) => {
                    JsonValue::Array(list.iter().map(|f| f.to_json()).collect())
                }
            };
            map.insert(name.clone(), json);
        }
        JsonValue::Object(map)
    }

    /// Build a fact from its JSON object form.
    ///
    /// Nested objects become predecessors and arrays of objects become
    /// predecessor lists. Arrays holding scalars have no fact meaning and are
    /// rejected.
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let JsonValue::Object(map) = json else {
            return Err(FactwatchError::InvalidFact(format!(
                "expected a JSON object, got {json}"
            )));
        };
        let mut fields = BTreeMap::new();
        for (name, value) in map {
            let value = match value {
                JsonValue::String(s) => Value::Text(s.clone()),
                JsonValue::Number(n) => Value::Number(n.clone()),
                JsonValue::Bool(b) => Value::Boolean(*b),
                JsonValue::Null => Value::Null,
                JsonValue::Object(_) => Value::Predecessor(Arc::new(Fact::from_json(value)?)),
                JsonValue::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        if !item.is_object() {
                            return Err(FactwatchError::InvalidFact(format!(
                                "field `{name}` mixes scalars into a predecessor list"
                            )));
                        }
                        list.push(Arc::new(Fact::from_json(item)?));
                    }
                    Value::Predecessors(list)
                }
            };
            fields.insert(name.clone(), value);
        }
        Ok(Self::from_fields(fields))
    }
}

impl Default for Fact {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Fact {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.fields == other.fields
    }
}

impl Eq for Fact {}

impl std::hash::Hash for Fact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl From<Fact> for JsonValue {
    fn from(fact: Fact) -> Self {
        fact.to_json()
    }
}

impl TryFrom<JsonValue> for Fact {
    type Error = FactwatchError;

    fn try_from(json: JsonValue) -> Result<Self> {
        Fact::from_json(&json)
    }
}

fn collect_ancestry(fact: &Fact, seen: &mut HashSet<Fact>, out: &mut Vec<Fact>) {
    if seen.contains(fact) {
        return;
    }
    for (_, predecessor) in fact.predecessor_edges() {
        collect_ancestry(predecessor, seen, out);
    }
    seen.insert(fact.clone());
    out.push(fact.clone());
}

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(FNV_OFFSET_BASIS)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    // Length-prefixed so that adjacent strings cannot run together.
    fn write_str(&mut self, s: &str) {
        self.write(&(s.len() as u64).to_le_bytes());
        self.write(s.as_bytes());
    }
}

fn compute_hash(fields: &BTreeMap<String, Value>) -> FactHash {
    let mut h = Fnv1a::new();
    for (name, value) in fields {
        h.write_str(name);
        match value {
            Value::Text(s) => {
                h.write(b"s");
                h.write_str(s);
            }
            Value::Number(n) => {
                h.write(b"n");
                h.write_str(&n.to_string());
            }
            Value::Boolean(b) => h.write(&[b'b', *b as u8]),
            Value::Null => h.write(b"z"),
            Value::Predecessor(fact) => {
                h.write(b"p");
                h.write(&fact.hash.0.to_le_bytes());
            }
            Value::Predecessors(list) => {
                h.write(b"l");
                h.write(&(list.len() as u64).to_le_bytes());
                for fact in list {
                    h.write(&fact.hash.0.to_le_bytes());
                }
            }
        }
    }
    FactHash(h.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
