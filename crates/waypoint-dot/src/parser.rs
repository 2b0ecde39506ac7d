use std::collections::HashMap;
use std::time::Duration;

use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt, preceded, repeat};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;

fn cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

/// Strip `//` line comments and `/* */` block comments, preserving
/// newlines so error positions still line up with the source.
pub(crate) fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                chars.next();
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '"' => {
                // String literal: copy verbatim, honoring escapes.
                out.push('"');
                let mut escaped = false;
                for c in chars.by_ref() {
                    out.push(c);
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == '"' {
                        break;
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Dotted key like `style.model`, or a plain identifier.
fn dotted_key(input: &mut &str) -> ModalResult<String> {
    let first = identifier.parse_next(input)?;
    let rest: Vec<&str> = repeat(0.., preceded('.', identifier)).parse_next(input)?;
    let mut key = first.to_string();
    for part in rest {
        key.push('.');
        key.push_str(part);
    }
    Ok(key)
}

/// Double-quoted string with `\n`, `\t`, `\\`, `\"` escapes.
fn quoted_string(input: &mut &str) -> ModalResult<String> {
    let _ = '"'.parse_next(input)?;
    let mut s = String::new();
    loop {
        match winnow::token::any.parse_next(input)? {
            '"' => break,
            '\\' => match winnow::token::any.parse_next(input)? {
                'n' => s.push('\n'),
                't' => s.push('\t'),
                '\\' => s.push('\\'),
                '"' => s.push('"'),
                other => {
                    s.push('\\');
                    s.push(other);
                }
            },
            other => s.push(other),
        }
    }
    Ok(s)
}

/// Integer + unit suffix: `250ms`, `30s`, `5m`, `2h`, `7d`.
fn duration_value(input: &mut &str) -> ModalResult<Duration> {
    let digits: &str = digit1.parse_next(input)?;
    let val: u64 = digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))?;
    let suffix = alt(("ms", "s", "m", "h", "d")).parse_next(input)?;
    Ok(match suffix {
        "ms" => Duration::from_millis(val),
        "s" => Duration::from_secs(val),
        "m" => Duration::from_secs(val * 60),
        "h" => Duration::from_secs(val * 3600),
        "d" => Duration::from_secs(val * 86400),
        _ => unreachable!(),
    })
}

fn boolean_value(input: &mut &str) -> ModalResult<bool> {
    alt((literal("true").value(true), literal("false").value(false))).parse_next(input)
}

fn float_value(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt(alt(('-', '+'))), digit1, '.', digit1)
        .take()
        .parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

fn integer_value(input: &mut &str) -> ModalResult<i64> {
    let s: &str = (opt(alt(('-', '+'))), digit1).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Attribute value: quoted string, boolean, duration, float, integer, or a
/// bareword (which parses as a string).
fn attr_value(input: &mut &str) -> ModalResult<AttrValue> {
    alt((
        quoted_string.map(AttrValue::Str),
        boolean_value.map(AttrValue::Bool),
        duration_value.map(AttrValue::Duration),
        float_value.map(AttrValue::Float),
        integer_value.map(AttrValue::Int),
        dotted_key.map(AttrValue::Str),
    ))
    .parse_next(input)
}

/// `key = value`
fn attr(input: &mut &str) -> ModalResult<(String, AttrValue)> {
    let key = dotted_key.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '='.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let value = attr_value
        .context(StrContext::Expected(StrContextValue::Description(
            "attribute value",
        )))
        .parse_next(input)?;
    Ok((key, value))
}

/// `[ key = value (,|;)? ... ]`
fn attr_block(input: &mut &str) -> ModalResult<HashMap<String, AttrValue>> {
    let _ = '['.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let mut attrs = HashMap::new();
    while let Some((key, value)) = opt(attr).parse_next(input)? {
        attrs.insert(key, value);
        let _ = ws.parse_next(input)?;
        let _ = opt(alt((',', ';'))).parse_next(input)?;
        let _ = ws.parse_next(input)?;
    }

    let _ = ']'
        .context(StrContext::Expected(StrContextValue::CharLiteral(']')))
        .parse_next(input)?;
    Ok(attrs)
}

/// Parsed statement, merged into the graph afterwards.
enum Statement {
    GraphAttrs(HashMap<String, AttrValue>),
    NodeDefaults(HashMap<String, AttrValue>),
    EdgeDefaults(HashMap<String, AttrValue>),
    GraphAttrDecl(String, AttrValue),
    Node(String, HashMap<String, AttrValue>),
    Edge(Vec<String>, HashMap<String, AttrValue>),
    Subgraph(Option<String>, Vec<Statement>),
}

/// `graph [...]`, `node [...]`, or `edge [...]`
fn defaults_stmt(input: &mut &str) -> ModalResult<Statement> {
    let keyword = alt((literal("graph"), literal("node"), literal("edge"))).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let attrs = attr_block.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(match keyword {
        "graph" => Statement::GraphAttrs(attrs),
        "node" => Statement::NodeDefaults(attrs),
        _ => Statement::EdgeDefaults(attrs),
    })
}

/// `subgraph name? { statements }`
fn subgraph_stmt(input: &mut &str) -> ModalResult<Statement> {
    let _ = literal("subgraph").parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = opt(identifier).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Subgraph(name.map(str::to_string), stmts))
}

/// Anything that starts with an identifier: a graph attribute declaration
/// (`key = value`), a node statement, or a (chained) edge statement.
fn node_or_edge_stmt(input: &mut &str) -> ModalResult<Statement> {
    let first = identifier.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    if opt(literal("->")).parse_next(input)?.is_some() {
        let mut chain = vec![first.to_string()];
        loop {
            let _ = ws.parse_next(input)?;
            let next = identifier
                .context(StrContext::Expected(StrContextValue::Description(
                    "edge target identifier",
                )))
                .parse_next(input)?;
            chain.push(next.to_string());
            let _ = ws.parse_next(input)?;
            if opt(literal("->")).parse_next(input)?.is_none() {
                break;
            }
        }
        let attrs = opt(attr_block).parse_next(input)?.unwrap_or_default();
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Edge(chain, attrs));
    }

    if opt(literal("--")).parse_next(input)?.is_some() {
        return Err(cut_error(
            "directed edge (->); undirected edges (--) are not supported",
        ));
    }

    if let Some(attrs) = opt(attr_block).parse_next(input)? {
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::Node(first.to_string(), attrs));
    }

    if opt('=').parse_next(input)?.is_some() {
        let _ = ws.parse_next(input)?;
        let val = attr_value.parse_next(input)?;
        let _ = ws.parse_next(input)?;
        let _ = opt(';').parse_next(input)?;
        return Ok(Statement::GraphAttrDecl(first.to_string(), val));
    }

    // Bare identifier: node without attributes.
    let _ = opt(';').parse_next(input)?;
    Ok(Statement::Node(first.to_string(), HashMap::new()))
}

fn statement(input: &mut &str) -> ModalResult<Statement> {
    let _ = ws.parse_next(input)?;
    alt((defaults_stmt, subgraph_stmt, node_or_edge_stmt)).parse_next(input)
}

fn statements(input: &mut &str) -> ModalResult<Vec<Statement>> {
    let mut stmts = Vec::new();
    loop {
        let _ = ws.parse_next(input)?;
        if input.is_empty() || input.starts_with('}') {
            break;
        }
        stmts.push(statement.parse_next(input)?);
    }
    Ok(stmts)
}

struct MergedScope {
    graph_attrs: HashMap<String, AttrValue>,
    nodes: HashMap<String, NodeDecl>,
    edges: Vec<EdgeDecl>,
    subgraphs: Vec<SubgraphDecl>,
    node_defaults: HashMap<String, AttrValue>,
    edge_defaults: HashMap<String, AttrValue>,
}

/// Merge statements into a scope. Subgraphs recurse with a *copy* of the
/// current defaults so their mutations do not escape.
fn merge_statements(
    stmts: Vec<Statement>,
    parent_node_defaults: &HashMap<String, AttrValue>,
    parent_edge_defaults: &HashMap<String, AttrValue>,
) -> MergedScope {
    let mut scope = MergedScope {
        graph_attrs: HashMap::new(),
        nodes: HashMap::new(),
        edges: Vec::new(),
        subgraphs: Vec::new(),
        node_defaults: parent_node_defaults.clone(),
        edge_defaults: parent_edge_defaults.clone(),
    };

    for stmt in stmts {
        match stmt {
            Statement::GraphAttrs(attrs) => scope.graph_attrs.extend(attrs),
            Statement::GraphAttrDecl(key, val) => {
                scope.graph_attrs.insert(key, val);
            }
            Statement::NodeDefaults(attrs) => scope.node_defaults.extend(attrs),
            Statement::EdgeDefaults(attrs) => scope.edge_defaults.extend(attrs),
            Statement::Node(id, explicit) => match scope.nodes.get_mut(&id) {
                // Re-declaration merges the explicit attributes in.
                Some(existing) => existing.attrs.extend(explicit),
                None => {
                    let mut attrs = scope.node_defaults.clone();
                    attrs.extend(explicit);
                    scope.nodes.insert(id.clone(), NodeDecl { id, attrs });
                }
            },
            Statement::Edge(chain, explicit) => {
                for pair in chain.windows(2) {
                    let mut attrs = scope.edge_defaults.clone();
                    attrs.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
                    scope.edges.push(EdgeDecl {
                        from: pair[0].clone(),
                        to: pair[1].clone(),
                        attrs,
                    });
                }
                // Endpoints referenced only by edges still become nodes.
                for id in &chain {
                    if !scope.nodes.contains_key(id) {
                        scope.nodes.insert(
                            id.clone(),
                            NodeDecl {
                                id: id.clone(),
                                attrs: scope.node_defaults.clone(),
                            },
                        );
                    }
                }
            }
            Statement::Subgraph(name, inner) => {
                let mut sub =
                    merge_statements(inner, &scope.node_defaults, &scope.edge_defaults);
                apply_subgraph_class(&mut sub);
                scope.subgraphs.push(SubgraphDecl {
                    name,
                    attrs: sub.graph_attrs,
                    nodes: sub.nodes,
                    edges: sub.edges,
                    node_defaults: sub.node_defaults,
                    edge_defaults: sub.edge_defaults,
                });
                scope.subgraphs.extend(sub.subgraphs);
            }
        }
    }

    scope
}

/// A subgraph `label` derives a `class` attribute for contained nodes
/// that lack one: lowercased, spaces to hyphens, everything else that is
/// not alphanumeric or `-` stripped.
fn apply_subgraph_class(scope: &mut MergedScope) {
    let Some(AttrValue::Str(label)) = scope.graph_attrs.get("label") else {
        return;
    };
    let class = derive_class_name(label);
    if class.is_empty() {
        return;
    }
    for node in scope.nodes.values_mut() {
        node.attrs
            .entry("class".to_string())
            .or_insert_with(|| AttrValue::Str(class.clone()));
    }
}

pub(crate) fn derive_class_name(label: &str) -> String {
    label
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

/// `digraph name { statements }`
fn parse_digraph(input: &mut &str) -> ModalResult<ParsedGraph> {
    let _ = ws.parse_next(input)?;

    if input.starts_with("strict") {
        return Err(cut_error(
            "'digraph' keyword (the strict modifier is not supported)",
        ));
    }
    if input.starts_with("graph") {
        let rest = input["graph".len()..].trim_start();
        if rest.starts_with('{') || rest.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(cut_error(
                "'digraph' keyword (undirected graphs are not supported)",
            ));
        }
    }

    let _ = literal("digraph")
        .context(StrContext::Expected(StrContextValue::StringLiteral(
            "digraph",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let name = identifier
        .context(StrContext::Expected(StrContextValue::Description(
            "graph name identifier",
        )))
        .parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '{'.parse_next(input)?;
    let stmts = statements.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = '}'.parse_next(input)?;
    let _ = ws.parse_next(input)?;

    let empty = HashMap::new();
    let scope = merge_statements(stmts, &empty, &empty);

    Ok(ParsedGraph {
        name: name.to_string(),
        attrs: scope.graph_attrs,
        nodes: scope.nodes,
        edges: scope.edges,
        subgraphs: scope.subgraphs,
        node_defaults: scope.node_defaults,
        edge_defaults: scope.edge_defaults,
    })
}

/// Map the unconsumed tail back to a 1-based (line, col) in the stripped
/// source. Comment stripping preserves newlines, so lines match the input.
fn offset_to_line_col(stripped: &str, remaining_len: usize) -> (usize, usize) {
    let consumed = stripped.len().saturating_sub(remaining_len);
    let prefix = &stripped[..consumed.min(stripped.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(pos) => consumed - pos,
        None => consumed + 1,
    };
    (line, col)
}

fn parse_error_at(
    stripped: &str,
    remaining: &str,
    message: String,
) -> waypoint_types::WaypointError {
    let (line, col) = offset_to_line_col(stripped, remaining.len());
    let snippet: String = remaining.chars().take(40).collect();
    waypoint_types::WaypointError::ParseError {
        line,
        col,
        message,
        source_snippet: (!snippet.is_empty()).then_some(snippet),
    }
}

/// Parse a single top-level directed graph from DSL source.
pub fn parse(input: &str) -> waypoint_types::Result<ParsedGraph> {
    let stripped = strip_comments(input);
    let mut remaining = stripped.as_str();

    let graph = parse_digraph
        .parse_next(&mut remaining)
        .map_err(|e| parse_error_at(&stripped, remaining, e.to_string()))?;

    // Exactly one top-level graph per source.
    let trailing = remaining.trim_start();
    if !trailing.is_empty() {
        let message = if trailing.starts_with("digraph") || trailing.starts_with("strict") {
            "multiple top-level graphs are not supported".to_string()
        } else {
            "unexpected content after the top-level graph".to_string()
        };
        return Err(parse_error_at(&stripped, trailing, message));
    }

    tracing::debug!(
        graph = %graph.name,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "parsed pipeline graph"
    );
    Ok(graph)
}
