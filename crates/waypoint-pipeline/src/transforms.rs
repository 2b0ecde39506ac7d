//! Post-parse graph rewrites.
//!
//! Applied once by the engine between parsing and validation. All
//! transforms are idempotent: applying them twice is equivalent to
//! applying them once.

use std::collections::HashMap;

use waypoint_dot::AttrValue;

use crate::graph::PipelineGraph;
use crate::handler::shape_to_type;

/// Canonical casings for the recognized shapes.
const CANONICAL_SHAPES: &[&str] = &[
    "Mdiamond",
    "Msquare",
    "box",
    "diamond",
    "component",
    "tripleoctagon",
    "parallelogram",
    "house",
    "hexagon",
];

/// Graph-level attributes that promote into nodes which did not set them.
const PROMOTED_ATTRS: &[&str] = &["llm_model", "llm_provider", "base_url", "workdir", "fidelity"];

/// Apply all transforms in order.
pub fn apply_transforms(graph: &mut PipelineGraph) {
    normalize_shapes(graph);
    map_shape_to_type(graph);
    promote_graph_attrs(graph);
    expand_prompt_variables(graph);
}

/// Case-insensitive canonicalization of recognized shape names.
fn normalize_shapes(graph: &mut PipelineGraph) {
    for node in graph.all_nodes_mut() {
        if let Some(canonical) = CANONICAL_SHAPES
            .iter()
            .find(|s| s.eq_ignore_ascii_case(&node.shape))
        {
            if node.shape != *canonical {
                node.shape = (*canonical).to_string();
                node.raw_attrs
                    .insert("shape".into(), AttrValue::Str((*canonical).to_string()));
            }
        }
    }
}

/// Fill in `node_type` from the shape table when no explicit `type` is set.
fn map_shape_to_type(graph: &mut PipelineGraph) {
    for node in graph.all_nodes_mut() {
        if node.node_type.is_none() {
            let t = shape_to_type(&node.shape);
            node.node_type = Some(t.to_string());
        }
    }
}

/// Promote selected graph attributes into nodes that did not set them.
fn promote_graph_attrs(graph: &mut PipelineGraph) {
    let promoted: Vec<(String, AttrValue)> = PROMOTED_ATTRS
        .iter()
        .filter_map(|key| graph.attrs.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect();
    if promoted.is_empty() {
        return;
    }

    for node in graph.all_nodes_mut() {
        for (key, value) in &promoted {
            if node.raw_attrs.contains_key(key) {
                continue;
            }
            node.raw_attrs.insert(key.clone(), value.clone());
            let str_value = value.as_str().map(String::from);
            match key.as_str() {
                "llm_model" => node.llm_model = str_value,
                "llm_provider" => node.llm_provider = str_value,
                "base_url" => node.base_url = str_value,
                "workdir" => node.workdir = str_value,
                "fidelity" => node.fidelity = str_value,
                _ => {}
            }
        }
    }
}

/// Expand `${key}` references in node prompts from graph attributes.
/// Unknown variables are left verbatim.
fn expand_prompt_variables(graph: &mut PipelineGraph) {
    let vars: HashMap<String, String> = graph
        .attrs
        .iter()
        .filter(|(_, v)| !matches!(v, AttrValue::Duration(_)))
        .map(|(k, v)| (k.clone(), v.to_string_value()))
        .collect();
    if vars.is_empty() {
        return;
    }

    for node in graph.all_nodes_mut() {
        if let Some(ref prompt) = node.prompt {
            let expanded = expand_variables(prompt, &vars);
            if expanded != *prompt {
                node.prompt = Some(expanded);
            }
        }
    }
}

/// Replace each `${key}` occurrence with its value from `vars`.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let pattern = format!("${{{key}}}");
        result = result.replace(&pattern, value);
    }
    result
}
