//! Edge selection: which outgoing edge to follow after a node completes.
//!
//! Cascade over the node's outgoing edges (authored order throughout):
//! 1. Conditional edges whose expression evaluates true; among the
//!    matches, one whose label equals the outcome's preferred label takes
//!    absolute precedence, otherwise the first match wins.
//! 2. The first unconditional edge whose label equals the preferred label.
//! 3. The first unconditional edge whose target appears in the outcome's
//!    suggested next ids.
//! 4. The first unconditional edge.
//!
//! `None` from a failed node is a fatal routing error for the caller.

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{PipelineEdge, PipelineGraph};

/// Select the next edge out of `node_id`, or `None` when no edge applies.
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &waypoint_types::Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    let preferred = outcome.preferred_label.as_deref().map(normalize_label);

    // Conditional pass: evaluate in authored order. An unparseable
    // condition never matches (validation flags it at load time).
    let matching: Vec<&PipelineEdge> = edges
        .iter()
        .filter(|e| {
            e.condition.as_deref().is_some_and(|cond| {
                parse_condition(cond)
                    .map(|expr| evaluate_condition(&expr, resolve))
                    .unwrap_or(false)
            })
        })
        .collect();

    if let Some(ref want) = preferred {
        if let Some(edge) = matching
            .iter()
            .find(|e| e.label.as_deref().map(normalize_label).as_ref() == Some(want))
        {
            return Some(edge);
        }
    }
    if let Some(edge) = matching.first() {
        return Some(edge);
    }

    // Unconditional pass.
    let unconditional: Vec<&PipelineEdge> =
        edges.iter().filter(|e| e.condition.is_none()).collect();

    if let Some(ref want) = preferred {
        if let Some(edge) = unconditional
            .iter()
            .find(|e| e.label.as_deref().map(normalize_label).as_ref() == Some(want))
        {
            return Some(edge);
        }
    }
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = unconditional.iter().find(|e| e.to == *suggested) {
            return Some(edge);
        }
    }
    unconditional.first().copied()
}

/// Normalize a label for comparison: trim, lowercase, strip accelerator
/// prefixes like `[Y] `, `Y) `, `Y - `.
pub fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w\s*-\s+)")
        .expect("static accelerator regex")
        .replace(&s, "")
        .trim()
        .to_string()
}
