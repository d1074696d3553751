//! Factwatch: a content-addressed fact graph with live query subscriptions.
//!
//! The core primitive is a [`Fact`]: an immutable record of named fields,
//! some of which point at other facts (its *predecessors*). A fact is
//! identified by the hash of its content, so the same fact created on two
//! machines is the same fact.
//!
//! A [`Query`] walks the graph from a start fact through predecessor and
//! successor joins, field conditions and existential sub-queries. A
//! [`WatchEngine`] keeps query results current as facts arrive, using the
//! query's [`Inverse`]s instead of re-running it. A [`FactChannel`] ships
//! facts between peers so that each one crosses the wire once per connection.
//!
//! # Quick start
//!
//! ```rust
//! use factwatch::{Fact, MemoryStore, Query, Subscription, WatchEngine};
//!
//! let mut engine = WatchEngine::new(MemoryStore::new());
//! let chores = Fact::new().with("type", "List").with("name", "Chores");
//!
//! // Open tasks: successors through `list` with no completion.
//! let open: Query = r#"S.list N(S.task F.type="Completed")"#.parse().unwrap();
//! let watch = engine
//!     .watch(chores.clone(), Subscription::new(open, |task| println!("open: {task:?}")))
//!     .unwrap();
//!
//! let trash = Fact::new().with("list", chores).with("description", "Take out the trash");
//! engine.fact(trash.clone()).unwrap();
//! assert_eq!(engine.results(watch).unwrap(), &[trash.clone()]);
//!
//! engine.fact(Fact::new().with("type", "Completed").with("task", trash)).unwrap();
//! assert!(engine.results(watch).unwrap().is_empty());
//! ```

pub mod channel;
pub mod fact;
pub mod query;
pub mod store;
pub mod watch;

pub use channel::{ChannelConfig, FactChannel, FactReference, Message};
pub use fact::{Fact, FactHash, Value};
pub use query::{invert, segment, Direction, Inverse, ParseError, Quantifier, Query, Step};
pub use store::{FactStore, MemoryStore, RedbStore};
pub use watch::{Publisher, Subscription, WatchEngine, WatchId};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FactwatchError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid fact: {0}")]
    InvalidFact(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("unknown fact reference: {0}")]
    UnknownReference(u64),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel failed: {0}")]
    ChannelFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FactwatchError>;
