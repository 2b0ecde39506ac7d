//! Pipeline graph model: the validated, engine-facing view of a parsed graph.

use std::collections::HashMap;
use std::time::Duration;

use waypoint_dot::{AttrValue, EdgeDecl, NodeDecl, ParsedGraph};

/// A directed, possibly cyclic pipeline graph.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub attrs: HashMap<String, AttrValue>,
    nodes: HashMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
    /// Maps node id to a `(start, count)` range into `edges`. Edges are
    /// stably sorted by `from`, so each node's outgoing edges form a
    /// contiguous slice that preserves authored order.
    adjacency: HashMap<String, (usize, usize)>,
}

/// A pipeline stage.
#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: usize,
    pub allow_partial: bool,
    pub goal_gate: bool,
    pub retry_target: Option<String>,
    pub max_iterations: usize,
    pub fidelity: Option<String>,
    pub timeout: Option<Duration>,
    pub llm_model: Option<String>,
    pub llm_provider: Option<String>,
    pub workdir: Option<String>,
    pub base_url: Option<String>,
    pub max_turns: Option<usize>,
    pub classes: Vec<String>,
    pub raw_attrs: HashMap<String, AttrValue>,
}

impl PipelineNode {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.raw_attrs.get(key).and_then(AttrValue::as_str)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.raw_attrs.get(key).and_then(AttrValue::as_bool)
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        self.raw_attrs.get(key).and_then(AttrValue::as_int)
    }

    pub fn attr_duration(&self, key: &str) -> Option<Duration> {
        self.raw_attrs.get(key).and_then(AttrValue::as_duration)
    }
}

/// A directed transition between two stages.
#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub fidelity: Option<String>,
    pub loop_restart: bool,
}

// --- Attribute extraction helpers ---

fn get_string(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<String> {
    attrs.get(key).and_then(|v| v.as_str().map(String::from))
}

fn get_bool(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(AttrValue::as_bool)
}

fn get_int(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(AttrValue::as_int)
}

fn get_duration(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(AttrValue::as_duration)
}

// --- Conversions ---

fn node_from_decl(
    id: &str,
    decl: &NodeDecl,
    graph_defaults: &HashMap<String, AttrValue>,
    subgraph_defaults: Option<&HashMap<String, AttrValue>>,
) -> PipelineNode {
    // Layering: graph defaults, then subgraph defaults, then explicit attrs.
    let mut attrs = graph_defaults.clone();
    if let Some(sg) = subgraph_defaults {
        attrs.extend(sg.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    attrs.extend(decl.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineNode {
        id: id.to_string(),
        label: get_string(&attrs, "label").unwrap_or_else(|| id.to_string()),
        shape: get_string(&attrs, "shape").unwrap_or_else(|| "box".to_string()),
        node_type: get_string(&attrs, "type"),
        prompt: get_string(&attrs, "prompt"),
        max_retries: get_int(&attrs, "max_retries").map(|v| v.max(0) as usize).unwrap_or(0),
        allow_partial: get_bool(&attrs, "allow_partial").unwrap_or(false),
        goal_gate: get_bool(&attrs, "goal_gate").unwrap_or(false),
        retry_target: get_string(&attrs, "retry_target"),
        max_iterations: get_int(&attrs, "max_iterations")
            .filter(|v| *v > 0)
            .map(|v| v as usize)
            .unwrap_or(10),
        fidelity: get_string(&attrs, "fidelity"),
        timeout: get_duration(&attrs, "timeout"),
        llm_model: get_string(&attrs, "llm_model"),
        llm_provider: get_string(&attrs, "llm_provider"),
        workdir: get_string(&attrs, "workdir"),
        base_url: get_string(&attrs, "base_url"),
        max_turns: get_int(&attrs, "max_turns").filter(|v| *v > 0).map(|v| v as usize),
        classes: get_string(&attrs, "class")
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
        raw_attrs: attrs,
    }
}

fn edge_from_decl(decl: &EdgeDecl, edge_defaults: &HashMap<String, AttrValue>) -> PipelineEdge {
    let mut attrs = edge_defaults.clone();
    attrs.extend(decl.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineEdge {
        from: decl.from.clone(),
        to: decl.to.clone(),
        label: get_string(&attrs, "label"),
        condition: get_string(&attrs, "condition").filter(|c| !c.trim().is_empty()),
        fidelity: get_string(&attrs, "fidelity"),
        loop_restart: get_bool(&attrs, "loop_restart").unwrap_or(false),
    }
}

impl PipelineGraph {
    /// Build the engine-facing model from a parsed graph.
    pub fn from_parsed(graph: ParsedGraph) -> waypoint_types::Result<Self> {
        let mut nodes = HashMap::new();
        let mut all_edges = Vec::new();

        for (id, decl) in &graph.nodes {
            nodes.insert(id.clone(), node_from_decl(id, decl, &graph.node_defaults, None));
        }
        for sg in &graph.subgraphs {
            for (id, decl) in &sg.nodes {
                nodes.insert(
                    id.clone(),
                    node_from_decl(id, decl, &graph.node_defaults, Some(&sg.node_defaults)),
                );
            }
        }

        for decl in &graph.edges {
            all_edges.push(edge_from_decl(decl, &graph.edge_defaults));
        }
        for sg in &graph.subgraphs {
            let mut sg_defaults = graph.edge_defaults.clone();
            sg_defaults.extend(sg.edge_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
            for decl in &sg.edges {
                all_edges.push(edge_from_decl(decl, &sg_defaults));
            }
        }

        // Stable sort keeps authored order within each node's slice.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = all_edges[i].from.clone();
            while i < all_edges.len() && all_edges[i].from == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        Ok(PipelineGraph {
            name: graph.name,
            attrs: graph.attrs,
            nodes,
            edges: all_edges,
            adjacency,
        })
    }

    /// Whether a node is the pipeline entry point.
    pub fn is_start(node: &PipelineNode) -> bool {
        node.shape == "Mdiamond" || node.node_type.as_deref() == Some("start")
    }

    /// Whether a node is terminal.
    pub fn is_terminal(node: &PipelineNode) -> bool {
        node.shape == "Msquare" || node.node_type.as_deref() == Some("exit")
    }

    /// The unique start node, when exactly one exists.
    pub fn start_node(&self) -> Option<&PipelineNode> {
        let mut starts = self.nodes.values().filter(|n| Self::is_start(n));
        let first = starts.next()?;
        if starts.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// All terminal nodes.
    pub fn terminal_nodes(&self) -> Vec<&PipelineNode> {
        self.nodes.values().filter(|n| Self::is_terminal(n)).collect()
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    /// Outgoing edges of `node_id` in authored order.
    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    /// Incoming edges of `node_id` (authored order across the edge list).
    pub fn incoming_edges(&self, node_id: &str) -> Vec<&PipelineEdge> {
        self.edges.iter().filter(|e| e.to == node_id).collect()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn all_nodes_mut(&mut self) -> impl Iterator<Item = &mut PipelineNode> {
        self.nodes.values_mut()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }
}
