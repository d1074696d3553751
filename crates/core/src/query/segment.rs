//! Splitting a query into incrementally executable segments.
//!
//! Each segment runs from the functional start of the query through one
//! successor join and the field conditions directly after it. Successor
//! joins are the only steps that need an index lookup in a store, so a
//! segment is the smallest unit of (re-)execution.

use super::{Direction, Query, Step};

/// Segments of `query`, in traversal order.
///
/// Field conditions at the very front of the query only constrain the start
/// fact, which the caller already has, so they are left out. Predecessor
/// joins are carried forward into the next segment that ends in a successor
/// join; a chain without successor joins has no segments. Existential
/// sub-queries continue the outer path regardless of polarity, and the steps
/// after an existential fork from the same prefix.
pub fn segment(query: &Query) -> Vec<Query> {
    let steps = query.steps();
    let start = steps
        .iter()
        .position(|step| !matches!(step, Step::Field { .. }))
        .unwrap_or(steps.len());
    let mut segments = Vec::new();
    walk(&steps[start..], Vec::new(), &mut segments);
    segments
}

/// Role of the successor join that closes `segment`, if any.
pub fn terminal_successor(segment: &Query) -> Option<&str> {
    segment.steps().iter().rev().find_map(|step| match step {
        Step::Join {
            direction: Direction::Successor,
            role,
        } => Some(role.as_str()),
        _ => None,
    })
}

fn walk(steps: &[Step], mut path: Vec<Step>, segments: &mut Vec<Query>) {
    let mut i = 0;
    while i < steps.len() {
        let step = &steps[i];
        i += 1;
        match step {
            Step::Existential { query, .. } => {
                walk(query.steps(), path.clone(), segments);
            }
            Step::Join {
                direction: Direction::Successor,
                ..
            } => {
                path.push(step.clone());
                while let Some(field @ Step::Field { .. }) = steps.get(i) {
                    path.push(field.clone());
                    i += 1;
                }
                segments.push(Query::from_steps(path.clone()));
            }
            _ => path.push(step.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
