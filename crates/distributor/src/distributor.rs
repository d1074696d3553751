//! Fact distribution to connected peers, built on Factwatch.
//!
//! A [`Distributor`] owns one [`WatchEngine`] and one [`FactChannel`] per
//! connected peer. Peers push facts and open `watch` or `query` requests;
//! matching facts flow back through the peer's own channel, so each peer
//! receives any given fact at most once. Every fact is checked against the
//! [`Authorization`] policy before it is delivered.
//!
//! There is no transport here. Callers decode inbound messages, pass them
//! to [`Distributor::handle`], and give each session a sender for outbound
//! messages.
//!
//! # Usage
//!
//! ```rust
//! use factwatch::{Fact, MemoryStore, Message};
//! use factwatch_distributor::{Distributor, SessionConfig};
//! use serde_json::json;
//!
//! let mut distributor = Distributor::new(MemoryStore::new());
//! let session = distributor
//!     .connect(SessionConfig::default(), |message| println!("{message:?}"))
//!     .unwrap();
//!
//! let chores = Fact::new().with("type", "List").with("name", "Chores");
//! distributor
//!     .handle(
//!         session,
//!         &Message::Watch {
//!             start: chores.to_json(),
//!             query: "S.list".into(),
//!             token: json!(1),
//!         },
//!     )
//!     .unwrap();
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use factwatch::{
    ChannelConfig, Fact, FactChannel, FactStore, Message, Query, Subscription, WatchEngine,
    WatchId,
};
use serde_json::Value as JsonValue;

pub use factwatch::FactwatchError as Error;
pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

/// Decides whether a peer may see a fact.
pub trait Authorization: Send + Sync {
    /// `user` is the fact the peer logged in as, if it has.
    fn is_authorized(&self, fact: &Fact, user: Option<&Fact>) -> bool;
}

/// Lets every peer see every fact.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn is_authorized(&self, _fact: &Fact, _user: Option<&Fact>) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
}

impl Default for SessionConfig {
    /// The serving side of a connection numbers its facts with even ids.
    fn default() -> Self {
        Self {
            channel: ChannelConfig::even(),
        }
    }
}

type Sender = Arc<Mutex<dyn FnMut(Message) + Send>>;
type Outbox = Arc<Mutex<VecDeque<Fact>>>;

struct Session {
    channel: FactChannel,
    sender: Sender,
    user: Option<Fact>,
    watches: Vec<WatchId>,
    /// Facts matched by this session's watches, not yet delivered.
    outbox: Outbox,
}

fn send(sender: &Sender, message: Message) -> Result<()> {
    let mut sender = sender
        .lock()
        .map_err(|_| Error::Internal("session sender lock poisoned".into()))?;
    (*sender)(message);
    Ok(())
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

pub struct Distributor<S: FactStore> {
    engine: WatchEngine<S>,
    authorization: Box<dyn Authorization>,
    sessions: BTreeMap<SessionId, Session>,
    next_session: u64,
}

impl<S: FactStore> Distributor<S> {
    /// A distributor that shows every fact to every peer.
    pub fn new(store: S) -> Self {
        Self::with_authorization(store, AllowAll)
    }

    pub fn with_authorization(store: S, authorization: impl Authorization + 'static) -> Self {
        Self {
            engine: WatchEngine::new(store),
            authorization: Box::new(authorization),
            sessions: BTreeMap::new(),
            next_session: 1,
        }
    }

    pub fn engine(&self) -> &WatchEngine<S> {
        &self.engine
    }

    /// Direct access to the engine, e.g. to publish server-side facts.
    /// Call [`flush`](Self::flush) afterwards to deliver the results.
    pub fn engine_mut(&mut self) -> &mut WatchEngine<S> {
        &mut self.engine
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Watches opened by a session, in the order they were opened.
    pub fn watches(&self, session: SessionId) -> Option<&[WatchId]> {
        self.sessions.get(&session).map(|s| s.watches.as_slice())
    }

    /// Open a session. `sender` receives every outbound message, in order.
    pub fn connect(
        &mut self,
        config: SessionConfig,
        sender: impl FnMut(Message) + Send + 'static,
    ) -> Result<SessionId> {
        let sender: Sender = Arc::new(Mutex::new(sender));
        let sink = sender.clone();
        let channel = FactChannel::new(config.channel, move |message| match sink.lock() {
            Ok(mut send) => (*send)(message),
            Err(_) => tracing::warn!("session sender lock poisoned; message dropped"),
        })?;

        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            id,
            Session {
                channel,
                sender,
                user: None,
                watches: Vec::new(),
                outbox: Arc::new(Mutex::new(VecDeque::new())),
            },
        );
        tracing::debug!(session = id.0, "session connected");
        Ok(id)
    }

    /// Record the user behind a session and acknowledge with `loggedIn`.
    pub fn login(&mut self, session: SessionId, user_fact: Fact, profile: JsonValue) -> Result<()> {
        let entry = self.session_mut(session)?;
        let message = Message::LoggedIn {
            user_fact: user_fact.to_json(),
            profile,
        };
        entry.user = Some(user_fact);
        send(&entry.sender, message)
    }

    /// Process one message from a peer.
    ///
    /// An error from the session's channel leaves the channel failed; the
    /// caller should [`disconnect`](Self::disconnect) the session.
    pub fn handle(&mut self, session: SessionId, message: &Message) -> Result<()> {
        match message {
            Message::Fact { .. } => {
                let received = self.session_mut(session)?.channel.receive(message)?;
                if let Some(fact) = received {
                    self.engine.fact(fact)?;
                    self.flush()?;
                }
                Ok(())
            }
            Message::Watch { start, query, token } => {
                let start = Fact::from_json(start)?;
                let query: Query = query.parse()?;
                let outbox = self.session_mut(session)?.outbox.clone();
                let subscription = Subscription::new(query, move |fact| match outbox.lock() {
                    Ok(mut pending) => pending.push_back(fact.clone()),
                    Err(_) => tracing::warn!("session outbox lock poisoned; fact dropped"),
                });
                let watch = self.engine.watch(start, subscription)?;
                self.session_mut(session)?.watches.push(watch);
                tracing::debug!(session = session.0, "watch opened");

                self.flush()?;
                let entry = self.session_mut(session)?;
                send(
                    &entry.sender,
                    Message::Done {
                        token: Some(token.clone()),
                    },
                )
            }
            Message::Query { start, query, token } => {
                let start = Fact::from_json(start)?;
                let query: Query = query.parse()?;
                let results = self.engine.store().execute_query(&start, &query)?;
                let entry = self
                    .sessions
                    .get_mut(&session)
                    .ok_or_else(|| Error::NotFound(format!("session {}", session.0)))?;
                for fact in &results {
                    if self.authorization.is_authorized(fact, entry.user.as_ref()) {
                        entry.channel.send_fact(fact)?;
                    }
                }
                send(
                    &entry.sender,
                    Message::Done {
                        token: Some(token.clone()),
                    },
                )
            }
            Message::LoggedIn { .. } | Message::Done { .. } => {
                tracing::trace!(session = session.0, "ignoring peer acknowledgement");
                Ok(())
            }
        }
    }

    /// Deliver every fact matched since the last flush to its session.
    ///
    /// A session whose channel has failed receives nothing more; its pending
    /// facts are dropped and the other sessions are still served.
    pub fn flush(&mut self) -> Result<()> {
        for (id, session) in self.sessions.iter_mut() {
            let pending: Vec<Fact> = session
                .outbox
                .lock()
                .map_err(|_| Error::Internal("session outbox lock poisoned".into()))?
                .drain(..)
                .collect();
            if session.channel.is_failed() {
                if !pending.is_empty() {
                    tracing::debug!(
                        session = id.0,
                        dropped = pending.len(),
                        "channel failed; deliveries dropped"
                    );
                }
                continue;
            }
            for fact in pending {
                if !self.authorization.is_authorized(&fact, session.user.as_ref()) {
                    tracing::trace!(session = id.0, hash = %fact.hash(), "fact withheld");
                    continue;
                }
                if let Err(e) = session.channel.send_fact(&fact) {
                    tracing::warn!(session = id.0, error = %e, "delivery failed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Close a session and stop all of its watches.
    pub fn disconnect(&mut self, session: SessionId) {
        let Some(entry) = self.sessions.remove(&session) else {
            return;
        };
        for watch in entry.watches {
            self.engine.stop(watch);
        }
        tracing::debug!(session = session.0, "session disconnected");
    }

    fn session_mut(&mut self, session: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&session)
            .ok_or_else(|| Error::NotFound(format!("session {}", session.0)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
