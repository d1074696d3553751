//! Join-chain queries over the fact graph.
//!
//! A [`Query`] is an ordered list of [`Step`]s evaluated relative to an
//! externally supplied start fact:
//!
//! - `F.name="literal"`: the current fact must carry that scalar value;
//! - `S.role`: move to the facts that reference the current fact via `role`;
//! - `P.role`: move to the fact(s) the current fact references via `role`;
//! - `N(...)` / `E(...)`: keep the current fact only if the sub-query yields
//!   nothing / something. Existential steps do not move the current fact.
//!
//! Queries print and parse through the canonical descriptive string (see
//! [`codec`]), and are built in code with the combinators on [`Query`]:
//!
//! ```rust
//! use factwatch::Query;
//!
//! let open_tasks = Query::new()
//!     .successor("list")
//!     .where_not(Query::new().successor("task").field("type", "Completed"));
//!
//! assert_eq!(
//!     open_tasks.to_string(),
//!     r#"S.list N(S.task F.type="Completed")"#
//! );
//! ```

pub mod codec;
pub mod inverse;
pub mod segment;

pub use codec::ParseError;
pub use inverse::{invert, Inverse};
pub use segment::segment;

/// Which way a [`Step::Join`] walks a predecessor edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From a fact to the facts that reference it.
    Successor,
    /// From a fact to the facts it references.
    Predecessor,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Successor => Direction::Predecessor,
            Direction::Predecessor => Direction::Successor,
        }
    }
}

/// Polarity of a [`Step::Existential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantifier {
    /// `E(...)`: at least one result.
    Exists,
    /// `N(...)`: no results.
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Step {
    Field { name: String, value: String },
    Join { direction: Direction, role: String },
    Existential { quantifier: Quantifier, query: Query },
}

impl Step {
    pub fn is_successor(&self) -> bool {
        matches!(
            self,
            Step::Join {
                direction: Direction::Successor,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    steps: Vec<Step>,
}

impl Query {
    /// The empty query: yields its start fact.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn push(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Move to the facts that reference the current fact via `role`.
    ///
    /// Roles and field names are non-empty and made of alphanumerics, `_`,
    /// `-` and `$` (see [`codec::is_valid_name`]); anything else has no
    /// descriptive-string form. Debug builds panic on an invalid name.
    pub fn successor(self, role: impl Into<String>) -> Self {
        let role = role.into();
        debug_assert!(codec::is_valid_name(&role), "invalid role {role:?}");
        self.push(Step::Join {
            direction: Direction::Successor,
            role,
        })
    }

    /// Move to the fact(s) the current fact references via `role`. Same
    /// naming rules as [`successor`](Self::successor).
    pub fn predecessor(self, role: impl Into<String>) -> Self {
        let role = role.into();
        debug_assert!(codec::is_valid_name(&role), "invalid role {role:?}");
        self.push(Step::Join {
            direction: Direction::Predecessor,
            role,
        })
    }

    /// Require the current fact's `name` field to equal `value`. The value
    /// may hold any text; the name follows the rules on
    /// [`successor`](Self::successor).
    pub fn field(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        debug_assert!(codec::is_valid_name(&name), "invalid field name {name:?}");
        self.push(Step::Field {
            name,
            value: value.into(),
        })
    }

    pub fn where_not(self, query: Query) -> Self {
        self.push(Step::Existential {
            quantifier: Quantifier::NotExists,
            query,
        })
    }

    pub fn where_exists(self, query: Query) -> Self {
        self.push(Step::Existential {
            quantifier: Quantifier::Exists,
            query,
        })
    }

    /// `self` followed by `other`.
    pub fn concat(mut self, other: Query) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Walk the chain backwards: reverse the joins, flip their directions,
    /// and keep every condition attached to the fact it constrained.
    ///
    /// `F.type="Project" S.project F.type="Task"` reverses to
    /// `F.type="Task" P.project F.type="Project"`.
    pub fn reversed(&self) -> Query {
        // conditions[i] constrains the fact reached after i joins.
        let mut conditions: Vec<Vec<Step>> = vec![Vec::new()];
        let mut joins: Vec<(Direction, String)> = Vec::new();
        for step in &self.steps {
            match step {
                Step::Join { direction, role } => {
                    joins.push((*direction, role.clone()));
                    conditions.push(Vec::new());
                }
                other => {
                    if let Some(last) = conditions.last_mut() {
                        last.push(other.clone());
                    }
                }
            }
        }

        let mut steps = conditions.pop().unwrap_or_default();
        while let Some((direction, role)) = joins.pop() {
            steps.push(Step::Join {
                direction: direction.flip(),
                role,
            });
            steps.extend(conditions.pop().unwrap_or_default());
        }
        Query { steps }
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&codec::render(self))
    }
}

impl std::str::FromStr for Query {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        codec::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
