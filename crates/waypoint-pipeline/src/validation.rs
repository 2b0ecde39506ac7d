//! Graph validation: composable lint rules producing diagnostics.
//!
//! [`validate`] runs every built-in rule and returns the collected
//! diagnostics; [`validate_or_error`] additionally fails when at least one
//! `Error`-severity diagnostic is present.

use std::collections::{HashSet, VecDeque};

use crate::condition::parse_condition;
use crate::graph::PipelineGraph;
use crate::handler::KNOWN_HANDLER_TYPES;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

fn error(rule: &dyn LintRule, message: String, node_id: Option<String>) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity: Severity::Error,
        message,
        node_id,
        edge: None,
        fix: None,
    }
}

fn warning(rule: &dyn LintRule, message: String, node_id: Option<String>) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity: Severity::Warning,
        message,
        node_id,
        edge: None,
        fix: None,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct SingleStartRule;
impl LintRule for SingleStartRule {
    fn name(&self) -> &str {
        "single_start"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph.all_nodes().filter(|n| PipelineGraph::is_start(n)).collect();
        match starts.len() {
            1 => vec![],
            0 => vec![Diagnostic {
                fix: Some("add a node with shape=\"Mdiamond\" or type=\"start\"".into()),
                ..error(
                    self,
                    "pipeline has no start node (shape=Mdiamond or type=start)".into(),
                    None,
                )
            }],
            n => vec![error(
                self,
                format!(
                    "pipeline has {n} start nodes ({}); expected exactly one",
                    starts.iter().map(|s| s.id.as_str()).collect::<Vec<_>>().join(", ")
                ),
                None,
            )],
        }
    }
}

struct TerminalNodeRule;
impl LintRule for TerminalNodeRule {
    fn name(&self) -> &str {
        "terminal_node"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.terminal_nodes().is_empty() {
            vec![Diagnostic {
                fix: Some("add a node with shape=\"Msquare\" or type=\"exit\"".into()),
                ..error(
                    self,
                    "pipeline has no terminal node (shape=Msquare or type=exit)".into(),
                    None,
                )
            }]
        } else {
            vec![]
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![]; // SingleStartRule reports this.
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.id.clone());
        queue.push_back(start.id.clone());
        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if visited.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }

        graph
            .all_nodes()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| {
                error(
                    self,
                    format!("node '{}' is not reachable from the start node", n.id),
                    Some(n.id.clone()),
                )
            })
            .collect()
    }
}

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str {
        "edge_endpoints"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in graph.all_edges() {
            for (endpoint, id) in [("source", &edge.from), ("target", &edge.to)] {
                if graph.node(id).is_none() {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "edge {} -> {} references non-existent {endpoint} '{id}'",
                            edge.from, edge.to
                        ),
                        node_id: None,
                        edge: Some((edge.from.clone(), edge.to.clone())),
                        fix: None,
                    });
                }
            }
        }
        diags
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![];
        };
        if graph.incoming_edges(&start.id).is_empty() {
            vec![]
        } else {
            vec![error(
                self,
                format!("start node '{}' has incoming edges", start.id),
                Some(start.id.clone()),
            )]
        }
    }
}

struct TerminalNoOutgoingRule;
impl LintRule for TerminalNoOutgoingRule {
    fn name(&self) -> &str {
        "terminal_no_outgoing"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .terminal_nodes()
            .into_iter()
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| {
                error(
                    self,
                    format!("terminal node '{}' has outgoing edges", n.id),
                    Some(n.id.clone()),
                )
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter_map(|e| {
                let cond = e.condition.as_deref()?;
                parse_condition(cond).err().map(|err| Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "edge {} -> {} has invalid condition '{}': {}",
                        e.from, e.to, cond, err
                    ),
                    node_id: None,
                    edge: Some((e.from.clone(), e.to.clone())),
                    fix: None,
                })
            })
            .collect()
    }
}

struct KnownTypeRule;
impl LintRule for KnownTypeRule {
    fn name(&self) -> &str {
        "known_type"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| {
                let t = n.node_type.as_deref()?;
                if KNOWN_HANDLER_TYPES.contains(&t) {
                    return None;
                }
                Some(warning(
                    self,
                    format!("node '{}' has unknown type '{}'", n.id, t),
                    Some(n.id.clone()),
                ))
            })
            .collect()
    }
}

struct FidelityValidRule;
impl LintRule for FidelityValidRule {
    fn name(&self) -> &str {
        "fidelity_valid"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            if let Some(ref f) = node.fidelity {
                if waypoint_types::FidelityMode::parse(f).is_none() {
                    diags.push(Diagnostic {
                        fix: Some(
                            "use one of: full, truncate, compact, summary:low, summary:medium, summary:high".into(),
                        ),
                        ..warning(
                            self,
                            format!("node '{}' has unrecognized fidelity '{f}'", node.id),
                            Some(node.id.clone()),
                        )
                    });
                }
            }
        }
        for edge in graph.all_edges() {
            if let Some(ref f) = edge.fidelity {
                if waypoint_types::FidelityMode::parse(f).is_none() {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "edge {} -> {} has unrecognized fidelity '{f}'",
                            edge.from, edge.to
                        ),
                        node_id: None,
                        edge: Some((edge.from.clone(), edge.to.clone())),
                        fix: None,
                    });
                }
            }
        }
        diags
    }
}

struct RetryTargetExistsRule;
impl LintRule for RetryTargetExistsRule {
    fn name(&self) -> &str {
        "retry_target_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter_map(|n| {
                let target = n.retry_target.as_deref()?;
                if graph.node(target).is_some() {
                    return None;
                }
                Some(warning(
                    self,
                    format!(
                        "node '{}' has retry_target '{target}' which does not exist",
                        n.id
                    ),
                    Some(n.id.clone()),
                ))
            })
            .collect()
    }
}

struct GoalGateHasRetryRule;
impl LintRule for GoalGateHasRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.goal_gate && n.retry_target.is_none())
            .map(|n| {
                warning(
                    self,
                    format!("node '{}' has goal_gate=true but no retry_target", n.id),
                    Some(n.id.clone()),
                )
            })
            .collect()
    }
}

struct CodergenPromptRule;
impl LintRule for CodergenPromptRule {
    fn name(&self) -> &str {
        "codergen_prompt"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.node_type.as_deref() == Some("codergen"))
            .filter(|n| n.prompt.is_none() && n.label == n.id)
            .map(|n| {
                warning(
                    self,
                    format!("codergen node '{}' has neither a prompt nor a label", n.id),
                    Some(n.id.clone()),
                )
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn built_in_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(SingleStartRule),
        Box::new(TerminalNodeRule),
        Box::new(ReachabilityRule),
        Box::new(EdgeEndpointsRule),
        Box::new(StartNoIncomingRule),
        Box::new(TerminalNoOutgoingRule),
        Box::new(ConditionSyntaxRule),
        Box::new(KnownTypeRule),
        Box::new(FidelityValidRule),
        Box::new(RetryTargetExistsRule),
        Box::new(GoalGateHasRetryRule),
        Box::new(CodergenPromptRule),
    ]
}

/// Run all built-in lint rules and return the collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for rule in built_in_rules() {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all rules; `Err` when at least one `Error`-severity diagnostic is
/// present (the message joins the fatal messages).
pub fn validate_or_error(graph: &PipelineGraph) -> waypoint_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let fatal: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if fatal.is_empty() {
        Ok(diagnostics)
    } else {
        Err(waypoint_types::WaypointError::ValidationError(
            fatal.join("; "),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
