//! Parser for the directed-graph DSL used by Waypoint pipelines.
//!
//! Accepts a single `digraph Name { ... }` with nodes, chained edges,
//! subgraphs, defaults, and typed attributes, and produces the AST types
//! [`ParsedGraph`], [`NodeDecl`], [`EdgeDecl`], [`SubgraphDecl`],
//! [`AttrValue`]. Strict graphs, undirected edges, and multiple top-level
//! graphs are rejected with a positioned parse error.
//!
//! # Example
//! ```
//! let src = r#"digraph Pipeline { start -> work -> done }"#;
//! let graph = waypoint_dot::parse(src).unwrap();
//! assert_eq!(graph.name, "Pipeline");
//! assert_eq!(graph.edges.len(), 2);
//! ```

pub mod ast;
mod duration_serde;
mod parser;

pub use ast::*;
pub use parser::parse;
