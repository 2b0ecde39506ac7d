use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A parsed top-level `digraph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedGraph {
    pub name: String,
    pub attrs: HashMap<String, AttrValue>,
    pub nodes: HashMap<String, NodeDecl>,
    pub edges: Vec<EdgeDecl>,
    pub subgraphs: Vec<SubgraphDecl>,
    pub node_defaults: HashMap<String, AttrValue>,
    pub edge_defaults: HashMap<String, AttrValue>,
}

/// A node declaration with its merged attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    pub attrs: HashMap<String, AttrValue>,
}

/// A single directed edge (chains are expanded by the parser).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
    pub attrs: HashMap<String, AttrValue>,
}

/// A `subgraph { ... }` scope. Default mutations inside it do not escape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphDecl {
    pub name: Option<String>,
    pub attrs: HashMap<String, AttrValue>,
    pub nodes: HashMap<String, NodeDecl>,
    pub edges: Vec<EdgeDecl>,
    pub node_defaults: HashMap<String, AttrValue>,
    pub edge_defaults: HashMap<String, AttrValue>,
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    #[serde(with = "crate::duration_serde")]
    Duration(Duration),
}

impl AttrValue {
    /// The string form used when attributes are mirrored into the context.
    pub fn to_string_value(&self) -> String {
        match self {
            AttrValue::Str(s) => s.clone(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => f.to_string(),
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Duration(d) => format!("{}ms", d.as_millis()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Str(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            AttrValue::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            AttrValue::Duration(d) => Some(*d),
            _ => None,
        }
    }
}
