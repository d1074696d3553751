//! Storage collaborators.
//!
//! The engine never decides how facts are laid out or fetched; it only needs
//! to save facts and run queries from a start fact. [`FactStore`] is that
//! seam. Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: hash-bucketed maps behind a mutex;
//! - [`RedbStore`]: ACID tables in a `redb` database, on disk or in memory.
//!
//! Both answer queries through [`evaluate`], which only asks the store for
//! successor lookups; predecessor joins read the fact's own fields.

mod durable;
mod memory;

pub use durable::RedbStore;
pub use memory::MemoryStore;

use std::collections::HashSet;

use crate::query::{Direction, Quantifier, Query, Step};
use crate::{Fact, Result};

pub trait FactStore {
    /// Persist `fact` and any of its predecessors not yet stored.
    ///
    /// Returns the facts that were newly saved, predecessors first. Saving a
    /// fact that is already present succeeds and returns an empty list.
    fn save(&self, fact: &Fact) -> Result<Vec<Fact>>;

    /// Run `query` from `start`, returning matches in first-seen order.
    fn execute_query(&self, start: &Fact, query: &Query) -> Result<Vec<Fact>>;
}

/// Successor lookup, the one index a store must provide.
pub trait SuccessorIndex {
    /// Stored facts whose `role` field references `fact`.
    fn successors(&self, fact: &Fact, role: &str) -> Result<Vec<Fact>>;
}

/// Evaluate `query` from `start` against `index`.
///
/// A join through a role that a fact does not carry yields nothing for that
/// fact; missing data is not an error.
pub fn evaluate<I: SuccessorIndex + ?Sized>(
    index: &I,
    start: &Fact,
    query: &Query,
) -> Result<Vec<Fact>> {
    evaluate_steps(index, vec![start.clone()], query.steps())
}

fn evaluate_steps<I: SuccessorIndex + ?Sized>(
    index: &I,
    mut current: Vec<Fact>,
    steps: &[Step],
) -> Result<Vec<Fact>> {
    for step in steps {
        if current.is_empty() {
            break;
        }
        current = match step {
            Step::Field { name, value } => current
                .into_iter()
                .filter(|fact| fact.matches_field(name, value))
                .collect(),
            Step::Join {
                direction: Direction::Predecessor,
                role,
            } => distinct(current.iter().flat_map(|fact| {
                fact.predecessors(role)
                    .iter()
                    .map(|p| p.as_ref().clone())
            })),
            Step::Join {
                direction: Direction::Successor,
                role,
            } => {
                let mut next = Vec::new();
                for fact in &current {
                    next.extend(index.successors(fact, role)?);
                }
                distinct(next)
            }
            Step::Existential { quantifier, query } => {
                let mut kept = Vec::with_capacity(current.len());
                for fact in current {
                    let found = !evaluate_steps(index, vec![fact.clone()], query.steps())?
                        .is_empty();
                    let keep = match quantifier {
                        Quantifier::Exists => found,
                        Quantifier::NotExists => !found,
                    };
                    if keep {
                        kept.push(fact);
                    }
                }
                kept
            }
        };
    }
    Ok(current)
}

fn distinct(facts: impl IntoIterator<Item = Fact>) -> Vec<Fact> {
    let mut seen = HashSet::new();
    facts
        .into_iter()
        .filter(|fact| seen.insert(fact.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chores() -> Fact {
        Fact::new().with("type", "List").with("name", "Chores")
    }

    fn task(description: &str) -> Fact {
        Fact::new()
            .with("type", "Task")
            .with("list", chores())
            .with("description", description)
    }

    fn completed(task: Fact) -> Fact {
        Fact::new().with("type", "Completed").with("task", task)
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.save(&task("Take out the trash")).unwrap();
        store.save(&task("Wash the dishes")).unwrap();
        store
            .save(&completed(task("Wash the dishes")))
            .unwrap();
        store
    }

    fn run(store: &MemoryStore, start: &Fact, query: &str) -> Vec<Fact> {
        store.execute_query(start, &query.parse().unwrap()).unwrap()
    }

    #[test]
    fn empty_query_yields_start() {
        let store = seeded();
        assert_eq!(run(&store, &chores(), ""), vec![chores()]);
    }

    #[test]
    fn successor_join_finds_referencing_facts() {
        let store = seeded();
        let tasks = run(&store, &chores(), "S.list");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0], task("Take out the trash"));
    }

    #[test]
    fn predecessor_join_reads_fields() {
        let store = seeded();
        let lists = run(&store, &task("Wash the dishes"), "P.list");
        assert_eq!(lists, vec![chores()]);
    }

    #[test]
    fn joins_deduplicate_results() {
        let store = seeded();
        let lists = run(&store, &chores(), "S.list P.list");
        assert_eq!(lists, vec![chores()]);
    }

    #[test]
    fn field_conditions_filter() {
        let store = seeded();
        assert_eq!(run(&store, &chores(), r#"S.list F.type="Task""#).len(), 2);
        assert!(run(&store, &chores(), r#"S.list F.type="List""#).is_empty());
    }

    #[test]
    fn existentials_filter_by_sub_query() {
        let store = seeded();
        let open = run(&store, &chores(), r#"S.list N(S.task F.type="Completed")"#);
        assert_eq!(open, vec![task("Take out the trash")]);
        let done = run(&store, &chores(), r#"S.list E(S.task F.type="Completed")"#);
        assert_eq!(done, vec![task("Wash the dishes")]);
    }

    #[test]
    fn absent_role_yields_nothing() {
        let store = seeded();
        assert!(run(&store, &chores(), "P.owner").is_empty());
        assert!(run(&store, &chores(), "S.owner").is_empty());
    }
}
