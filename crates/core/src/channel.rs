//! Peer-to-peer fact exchange with per-channel deduplication.
//!
//! Each endpoint numbers the facts it sends with local ids. A fact goes over
//! the wire once per channel; afterwards, and inside every fact that names it
//! as a predecessor, it travels as a `{"id": n}` reference. Both endpoints
//! cache every fact they have sent or received, keyed by content hash, so the
//! two sides resolve references against the same table.
//!
//! Messages must be delivered in the order they were produced: predecessors
//! always precede the facts that reference them.
//!
//! ```rust
//! use factwatch::{ChannelConfig, Fact, FactChannel, Message};
//! use std::sync::{Arc, Mutex};
//!
//! let outbox = Arc::new(Mutex::new(Vec::new()));
//! let sink = outbox.clone();
//! let mut channel = FactChannel::new(ChannelConfig::odd(), move |m: Message| {
//!     sink.lock().unwrap().push(m)
//! })
//! .unwrap();
//!
//! let user = Fact::new().with("type", "User").with("publicKey", "X");
//! let list = Fact::new().with("type", "List").with("name", "Chores").with("from", user);
//! let reference = channel.send_fact(&list).unwrap();
//!
//! assert_eq!(reference.id, 3);
//! assert_eq!(outbox.lock().unwrap().len(), 2);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::{Fact, FactHash, FactwatchError, Result, Value};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A message exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// One fact, with predecessors replaced by references.
    Fact {
        id: u64,
        fact: JsonValue,
        token: FactHash,
    },
    /// Subscribe to a query from a start fact.
    Watch {
        start: JsonValue,
        query: String,
        token: JsonValue,
    },
    /// Run a query once from a start fact.
    Query {
        start: JsonValue,
        query: String,
        token: JsonValue,
    },
    #[serde(rename_all = "camelCase")]
    LoggedIn {
        user_fact: JsonValue,
        profile: JsonValue,
    },
    /// The results for `token` have all been sent.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<JsonValue>,
    },
}

/// Channel-local alias of a fact already sent or received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactReference {
    pub id: u64,
    pub hash: FactHash,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Id numbering for one endpoint.
///
/// The two endpoints of a conversation must never hand out the same id, so
/// one uses odd ids and the other even ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub first_id: u64,
    pub id_step: u64,
}

impl ChannelConfig {
    pub fn odd() -> Self {
        Self {
            first_id: 1,
            id_step: 2,
        }
    }

    pub fn even() -> Self {
        Self {
            first_id: 2,
            id_step: 2,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::odd()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

type Sink = Box<dyn FnMut(Message) + Send>;
type ReceivedHandler = Box<dyn FnMut(&Fact) + Send>;

/// One endpoint of a peer connection.
///
/// A channel that hits a protocol violation fails permanently: every later
/// call returns [`FactwatchError::ChannelFailed`].
pub struct FactChannel {
    config: ChannelConfig,
    next_id: u64,
    by_hash: HashMap<FactHash, Vec<(u64, Fact)>>,
    by_id: HashMap<u64, Fact>,
    sink: Sink,
    on_received: Option<ReceivedHandler>,
    failure: Option<String>,
}

impl FactChannel {
    pub fn new(config: ChannelConfig, sink: impl FnMut(Message) + Send + 'static) -> Result<Self> {
        if config.id_step == 0 {
            return Err(FactwatchError::Protocol(
                "channel id step must be non-zero".into(),
            ));
        }
        Ok(Self {
            config,
            next_id: config.first_id,
            by_hash: HashMap::new(),
            by_id: HashMap::new(),
            sink: Box::new(sink),
            on_received: None,
            failure: None,
        })
    }

    /// Invoke `handler` with every fact received on this channel.
    pub fn on_received(mut self, handler: impl FnMut(&Fact) + Send + 'static) -> Self {
        self.on_received = Some(Box::new(handler));
        self
    }

    pub fn config(&self) -> ChannelConfig {
        self.config
    }

    /// The id the next sent fact will carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Reference to `fact` if it has crossed this channel in either
    /// direction.
    pub fn reference(&self, fact: &Fact) -> Option<FactReference> {
        self.by_hash.get(&fact.hash()).and_then(|bucket| {
            bucket
                .iter()
                .find(|(_, cached)| cached == fact)
                .map(|(id, _)| FactReference {
                    id: *id,
                    hash: fact.hash(),
                })
        })
    }

    /// Send `fact` and any predecessors the peer has not seen yet.
    ///
    /// A fact already on this channel sends nothing and returns its existing
    /// reference.
    pub fn send_fact(&mut self, fact: &Fact) -> Result<FactReference> {
        self.check_open()?;
        if let Some(reference) = self.reference(fact) {
            return Ok(reference);
        }
        let mut last = None;
        for pending in fact.ancestry() {
            if self.reference(&pending).is_some() {
                continue;
            }
            last = Some(self.emit(pending)?);
        }
        last.ok_or_else(|| FactwatchError::Internal("fact missing from its own ancestry".into()))
    }

    fn emit(&mut self, fact: Fact) -> Result<FactReference> {
        let id = self.next_id;
        let memento = self.memento(&fact)?;
        self.next_id = id.checked_add(self.config.id_step).ok_or_else(|| {
            FactwatchError::Protocol("channel ran out of local ids".into())
        })?;

        let reference = FactReference {
            id,
            hash: fact.hash(),
        };
        tracing::trace!(id, hash = %reference.hash, "channel send");
        (self.sink)(Message::Fact {
            id,
            fact: memento,
            token: reference.hash,
        });
        self.register(id, fact);
        Ok(reference)
    }

    /// Wire form of `fact`, with predecessors as references.
    fn memento(&self, fact: &Fact) -> Result<JsonValue> {
        let mut map = Map::new();
        for (name, value) in fact.fields() {
            let json = match value {
                Value::Text(s) => JsonValue::String(s.clone()),
                Value::Number(n) => JsonValue::Number(n.clone()),
                Value::Boolean(b) => JsonValue::Bool(*b),
                Value::Null => JsonValue::Null,
                Value::Predecessor(p) => self.reference_json(p)?,
                Value::Predecessors(list) => JsonValue::Array(
                    list.iter()
                        .map(|p| self.reference_json(p))
                        .collect::<Result<_>>()?,
                ),
            };
            map.insert(name.clone(), json);
        }
        Ok(JsonValue::Object(map))
    }

    fn reference_json(&self, predecessor: &Fact) -> Result<JsonValue> {
        let reference = self.reference(predecessor).ok_or_else(|| {
            FactwatchError::Internal(format!(
                "predecessor {} sent out of order",
                predecessor.hash()
            ))
        })?;
        Ok(json!({ "id": reference.id }))
    }

    /// Handle one inbound message.
    ///
    /// Returns the reconstructed fact for `fact` messages and `None` for
    /// every other kind, which the channel does not interpret.
    pub fn receive(&mut self, message: &Message) -> Result<Option<Fact>> {
        self.check_open()?;
        let Message::Fact { id, fact, token } = message else {
            return Ok(None);
        };
        match self.rebuild(*id, fact, *token) {
            Ok(fact) => {
                tracing::trace!(id, hash = %fact.hash(), "channel receive");
                self.register(*id, fact.clone());
                if let Some(handler) = self.on_received.as_mut() {
                    handler(&fact);
                }
                Ok(Some(fact))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn rebuild(&self, id: u64, memento: &JsonValue, token: FactHash) -> Result<Fact> {
        let JsonValue::Object(map) = memento else {
            return Err(FactwatchError::Protocol(format!(
                "fact {id} payload is not an object"
            )));
        };
        let mut fields = std::collections::BTreeMap::new();
        for (name, value) in map {
            let value = match value {
                JsonValue::String(s) => Value::Text(s.clone()),
                JsonValue::Number(n) => Value::Number(n.clone()),
                JsonValue::Bool(b) => Value::Boolean(*b),
                JsonValue::Null => Value::Null,
                JsonValue::Object(reference) => {
                    Value::Predecessor(Arc::new(self.resolve(reference)?))
                }
                JsonValue::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        let JsonValue::Object(reference) = item else {
                            return Err(FactwatchError::Protocol(format!(
                                "field `{name}` of fact {id} holds a non-reference list item"
                            )));
                        };
                        list.push(Arc::new(self.resolve(reference)?));
                    }
                    Value::Predecessors(list)
                }
            };
            fields.insert(name.clone(), value);
        }
        let fact = Fact::from_fields(fields);

        if fact.hash() != token {
            return Err(FactwatchError::Protocol(format!(
                "fact {id} hashes to {} but was sent as {token}",
                fact.hash()
            )));
        }
        if let Some(existing) = self.by_id.get(&id) {
            if existing != &fact {
                return Err(FactwatchError::Protocol(format!(
                    "id {id} already names a different fact"
                )));
            }
        }
        Ok(fact)
    }

    fn resolve(&self, reference: &Map<String, JsonValue>) -> Result<Fact> {
        let id = reference
            .get("id")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| FactwatchError::Protocol("reference without an id".into()))?;
        let fact = self
            .by_id
            .get(&id)
            .ok_or(FactwatchError::UnknownReference(id))?;
        if let Some(hash) = reference.get("hash") {
            if hash.as_u64() != Some(fact.hash().0) {
                return Err(FactwatchError::Protocol(format!(
                    "reference {id} carries hash {hash}, expected {}",
                    fact.hash().0
                )));
            }
        }
        Ok(fact.clone())
    }

    fn register(&mut self, id: u64, fact: Fact) {
        if self.by_id.contains_key(&id) {
            return;
        }
        self.by_hash
            .entry(fact.hash())
            .or_default()
            .push((id, fact.clone()));
        self.by_id.insert(id, fact);
    }

    fn check_open(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(FactwatchError::ChannelFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: FactwatchError) -> FactwatchError {
        tracing::warn!(error = %error, "fact channel failed");
        self.failure = Some(error.to_string());
        error
    }
}

impl std::fmt::Debug for FactChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactChannel")
            .field("config", &self.config)
            .field("next_id", &self.next_id)
            .field("cached", &self.by_id.len())
            .field("failure", &self.failure)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn channel(config: ChannelConfig) -> (FactChannel, Arc<Mutex<Vec<Message>>>) {
        let outbox = Arc::new(Mutex::new(Vec::new()));
        let sink = outbox.clone();
        let channel = FactChannel::new(config, move |m| sink.lock().unwrap().push(m)).unwrap();
        (channel, outbox)
    }

    fn user() -> Fact {
        Fact::new().with("type", "User").with("publicKey", "X")
    }

    fn chores() -> Fact {
        Fact::new()
            .with("type", "List")
            .with("name", "Chores")
            .with("from", user())
    }

    #[test]
    fn predecessor_goes_first_with_odd_ids() {
        let (mut channel, outbox) = channel(ChannelConfig::odd());
        channel.send_fact(&chores()).unwrap();

        let sent = outbox.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            Message::Fact {
                id: 1,
                fact: json!({ "type": "User", "publicKey": "X" }),
                token: user().hash(),
            }
        );
        assert_eq!(
            sent[1],
            Message::Fact {
                id: 3,
                fact: json!({ "type": "List", "name": "Chores", "from": { "id": 1 } }),
                token: chores().hash(),
            }
        );
    }

    #[test]
    fn sending_twice_sends_once() {
        let (mut channel, outbox) = channel(ChannelConfig::odd());
        let first = channel.send_fact(&chores()).unwrap();
        let second = channel.send_fact(&chores()).unwrap();
        assert_eq!(first, second);
        assert_eq!(outbox.lock().unwrap().len(), 2);
        assert_eq!(channel.next_id(), 5);
    }

    #[test]
    fn shared_predecessors_are_sent_once() {
        let (mut channel, outbox) = channel(ChannelConfig::even());
        channel.send_fact(&chores()).unwrap();
        let errands = Fact::new()
            .with("type", "List")
            .with("name", "Errands")
            .with("from", user());
        let reference = channel.send_fact(&errands).unwrap();

        assert_eq!(reference.id, 6);
        let sent = outbox.lock().unwrap();
        assert_eq!(sent.len(), 3);
        let Message::Fact { fact, .. } = &sent[2] else {
            panic!("expected a fact message");
        };
        assert_eq!(fact["from"], json!({ "id": 2 }));
    }

    #[test]
    fn predecessor_lists_become_reference_arrays() {
        let (mut channel, outbox) = channel(ChannelConfig::odd());
        let a = Fact::new().with("name", "a");
        let b = Fact::new().with("name", "b");
        let merge = Fact::new().with("prior", vec![a, b]);
        channel.send_fact(&merge).unwrap();

        let sent = outbox.lock().unwrap();
        let Message::Fact { fact, .. } = &sent[2] else {
            panic!("expected a fact message");
        };
        assert_eq!(fact["prior"], json!([{ "id": 1 }, { "id": 3 }]));
    }

    #[test]
    fn receive_rebuilds_the_fact() {
        let (mut sender, outbox) = channel(ChannelConfig::odd());
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = received.clone();
        let (receiver, _) = channel(ChannelConfig::even());
        let mut receiver =
            receiver.on_received(move |fact| seen.lock().unwrap().push(fact.clone()));

        sender.send_fact(&chores()).unwrap();
        for message in outbox.lock().unwrap().iter() {
            receiver.receive(message).unwrap();
        }
        assert_eq!(*received.lock().unwrap(), vec![user(), chores()]);
        assert_eq!(receiver.reference(&chores()).unwrap().id, 3);
    }

    #[test]
    fn received_facts_are_not_echoed_back() {
        let (mut receiver, outbox) = channel(ChannelConfig::even());
        receiver
            .receive(&Message::Fact {
                id: 1,
                fact: json!({ "type": "User", "publicKey": "X" }),
                token: user().hash(),
            })
            .unwrap();
        let reference = receiver.send_fact(&user()).unwrap();
        assert_eq!(reference.id, 1);
        assert!(outbox.lock().unwrap().is_empty());
    }

    #[test]
    fn references_may_carry_a_hash() {
        let (mut receiver, _) = channel(ChannelConfig::even());
        receiver
            .receive(&Message::Fact {
                id: 1,
                fact: user().to_json(),
                token: user().hash(),
            })
            .unwrap();
        let fact = receiver
            .receive(&Message::Fact {
                id: 3,
                fact: json!({
                    "type": "List",
                    "name": "Chores",
                    "from": { "id": 1, "hash": user().hash().0 },
                }),
                token: chores().hash(),
            })
            .unwrap();
        assert_eq!(fact, Some(chores()));
    }

    #[test]
    fn unknown_reference_fails_the_channel() {
        let (mut receiver, _) = channel(ChannelConfig::even());
        let err = receiver
            .receive(&Message::Fact {
                id: 3,
                fact: json!({ "from": { "id": 1 } }),
                token: FactHash(0),
            })
            .unwrap_err();
        assert!(matches!(err, FactwatchError::UnknownReference(1)));
        assert!(receiver.is_failed());

        let err = receiver.send_fact(&user()).unwrap_err();
        assert!(matches!(err, FactwatchError::ChannelFailed(_)));
    }

    #[test]
    fn token_mismatch_is_a_protocol_error() {
        let (mut receiver, _) = channel(ChannelConfig::even());
        let err = receiver
            .receive(&Message::Fact {
                id: 1,
                fact: user().to_json(),
                token: FactHash(42),
            })
            .unwrap_err();
        assert!(matches!(err, FactwatchError::Protocol(_)));
        assert!(receiver.is_failed());
    }

    #[test]
    fn other_messages_pass_through() {
        let (mut receiver, _) = channel(ChannelConfig::even());
        let done = Message::Done { token: None };
        assert_eq!(receiver.receive(&done).unwrap(), None);
    }

    #[test]
    fn zero_step_is_rejected() {
        let config = ChannelConfig {
            first_id: 1,
            id_step: 0,
        };
        assert!(FactChannel::new(config, |_| {}).is_err());
    }

    #[test]
    fn messages_use_camel_case_tags() {
        let logged_in = Message::LoggedIn {
            user_fact: user().to_json(),
            profile: json!({ "displayName": "Ada" }),
        };
        let json = serde_json::to_value(&logged_in).unwrap();
        assert_eq!(json["type"], "loggedIn");
        assert_eq!(json["userFact"]["publicKey"], "X");

        let watch: Message = serde_json::from_value(json!({
            "type": "watch",
            "start": { "name": "Chores" },
            "query": "S.list",
            "token": 7,
        }))
        .unwrap();
        assert!(matches!(watch, Message::Watch { ref query, .. } if query == "S.list"));

        let done = serde_json::to_value(Message::Done { token: None }).unwrap();
        assert_eq!(done, json!({ "type": "done" }));
    }
}
