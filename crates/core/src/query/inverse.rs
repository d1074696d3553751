//! Query inversion: which subscriptions a new fact can affect.
//!
//! A new fact can only enter a query's results where the query walks a
//! successor join, because facts only ever gain successors. For every such
//! join, [`invert`] produces an [`Inverse`] that starts *at the new fact*:
//!
//! - `affected` walks backwards from the new fact to the start fact of the
//!   subscription whose results may change;
//! - `added` walks forwards from the new fact to the results that appear;
//! - `removed` walks forwards from the new fact to the results that vanish.
//!
//! ```rust
//! use factwatch::query::invert;
//!
//! let inverses = invert(&"S.user P.project".parse().unwrap());
//! assert_eq!(inverses.len(), 1);
//! assert_eq!(inverses[0].affected.to_string(), "P.user");
//! assert_eq!(inverses[0].added.as_ref().unwrap().to_string(), "P.project");
//! assert!(inverses[0].removed.is_none());
//! ```

use super::{Direction, Quantifier, Query, Step};

/// One way a freshly added fact changes the results of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inverse {
    /// From the new fact back to the subscription's start fact.
    pub affected: Query,
    /// From the new fact to results that are now present.
    pub added: Option<Query>,
    /// From the new fact to results that are no longer present.
    pub removed: Option<Query>,
}

impl Inverse {
    /// The role a new fact must carry to trigger this inverse.
    pub fn trigger_role(&self) -> Option<&str> {
        self.affected.steps().iter().find_map(|step| match step {
            Step::Join { role, .. } => Some(role.as_str()),
            _ => None,
        })
    }
}

/// Inverses of `query`, in the order their triggering joins appear.
///
/// Existential sub-queries are inverted recursively. A sub-query inverse that
/// adds under `E(...)` adds to the outer query and one under `N(...)`
/// removes from it; a sub-query inverse that removes does the opposite.
pub fn invert(query: &Query) -> Vec<Inverse> {
    invert_steps(query.steps())
}

fn invert_steps(steps: &[Step]) -> Vec<Inverse> {
    let mut inverses = Vec::new();
    let mut i = 0;
    while i < steps.len() {
        match &steps[i] {
            Step::Join {
                direction: Direction::Successor,
                ..
            } => {
                // Conditions right after the join describe the new fact.
                let mut end = i + 1;
                while matches!(steps.get(end), Some(Step::Field { .. })) {
                    end += 1;
                }
                let prefix = Query::from_steps(steps[..end].to_vec());
                inverses.push(Inverse {
                    affected: prefix.reversed(),
                    added: Some(Query::from_steps(steps[end..].to_vec())),
                    removed: None,
                });
                i = end;
            }
            Step::Existential { quantifier, query } => {
                let back_to_start = Query::from_steps(steps[..i].to_vec()).reversed();
                let continuation = Query::from_steps(steps[i + 1..].to_vec());
                for inner in invert_steps(query.steps()) {
                    // The path to the outer results passes through the fact
                    // the existential was evaluated on.
                    let outer_results = inner.affected.clone().concat(continuation.clone());
                    let becomes_true = match (inner.added.is_some(), quantifier) {
                        (true, Quantifier::Exists) | (false, Quantifier::NotExists) => true,
                        (true, Quantifier::NotExists) | (false, Quantifier::Exists) => false,
                    };
                    let (added, removed) = if becomes_true {
                        (Some(outer_results), None)
                    } else {
                        (None, Some(outer_results))
                    };
                    inverses.push(Inverse {
                        affected: inner.affected.concat(back_to_start.clone()),
                        added,
                        removed,
                    });
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    inverses
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
