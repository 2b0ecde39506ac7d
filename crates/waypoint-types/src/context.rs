//! Run-scoped key-value store shared across pipeline nodes.

use std::collections::HashMap;
use std::sync::Arc;

/// Concurrent key-value store for pipeline state plus an append-only log.
///
/// Cloning a `Context` yields another handle to the **same** inner state;
/// use [`fork`](Context::fork) to get an isolated deep copy for parallel
/// branches. Reads take a shared lock, writes an exclusive one.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner::default())),
        }
    }

    /// Rebuild a context from checkpointed values and logs.
    pub fn from_parts(values: HashMap<String, serde_json::Value>, logs: Vec<String>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner { values, logs })),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Delete a key. Absent keys are ignored.
    pub async fn remove(&self, key: &str) {
        self.inner.write().await.values.remove(key);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Read a value coerced to its string form, falling back to `default`
    /// when the key is absent.
    ///
    /// `Value::String` passes through unquoted; other variants render as
    /// their JSON text (`true`, `42`, `[1,2]`, ...).
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.inner.read().await.values.get(key) {
            Some(v) => coerce_to_string(v),
            None => default.to_owned(),
        }
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    /// Read all log entries in append order.
    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Read-stable copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Deep copy of the value map with a fresh, empty log.
    ///
    /// Parallel branches fork the parent context so they cannot race; logs
    /// are deliberately not shared.
    pub async fn fork(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                values: guard.values.clone(),
                logs: Vec::new(),
            })),
        }
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        if updates.is_empty() {
            return;
        }
        self.inner.write().await.values.extend(updates);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// String coercion used at the condition-evaluation boundary.
pub fn coerce_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let ctx = Context::new();
        ctx.set("key", json!("hello")).await;
        assert_eq!(ctx.get("key").await, Some(json!("hello")));
    }

    #[tokio::test]
    async fn get_string_returns_default_when_missing() {
        let ctx = Context::new();
        assert_eq!(ctx.get_string("missing", "fallback").await, "fallback");
    }

    #[tokio::test]
    async fn get_string_coerces_non_strings() {
        let ctx = Context::new();
        ctx.set("n", json!(42)).await;
        ctx.set("b", json!(true)).await;
        ctx.set("s", json!("plain")).await;
        assert_eq!(ctx.get_string("n", "").await, "42");
        assert_eq!(ctx.get_string("b", "").await, "true");
        assert_eq!(ctx.get_string("s", "").await, "plain");
    }

    #[tokio::test]
    async fn remove_deletes_key() {
        let ctx = Context::new();
        ctx.set("gone", json!(1)).await;
        ctx.remove("gone").await;
        assert_eq!(ctx.get("gone").await, None);
        // Removing again is a no-op.
        ctx.remove("gone").await;
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let ctx = Context::new();
        let handle = ctx.clone();
        handle.set("shared", json!("yes")).await;
        assert_eq!(ctx.get("shared").await, Some(json!("yes")));
    }

    #[tokio::test]
    async fn fork_is_independent_and_drops_logs() {
        let ctx = Context::new();
        ctx.set("a", json!(1)).await;
        ctx.append_log("parent log").await;

        let forked = ctx.fork().await;
        forked.set("a", json!(999)).await;
        forked.set("b", json!(2)).await;

        assert_eq!(ctx.get("a").await, Some(json!(1)));
        assert_eq!(ctx.get("b").await, None);
        // Branch logs start empty.
        assert!(forked.logs().await.is_empty());
        assert_eq!(ctx.logs().await, vec!["parent log".to_string()]);
    }

    #[tokio::test]
    async fn apply_updates_merges() {
        let ctx = Context::new();
        ctx.set("keep", json!("old")).await;
        ctx.set("overwrite", json!("old")).await;

        let mut updates = HashMap::new();
        updates.insert("overwrite".into(), json!("new"));
        updates.insert("added".into(), json!("fresh"));
        ctx.apply_updates(updates).await;

        assert_eq!(ctx.get("keep").await, Some(json!("old")));
        assert_eq!(ctx.get("overwrite").await, Some(json!("new")));
        assert_eq!(ctx.get("added").await, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn snapshot_returns_current_values() {
        let ctx = Context::new();
        ctx.set("x", json!(10)).await;
        ctx.set("y", json!(20)).await;

        let snap = ctx.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("x"), Some(&json!(10)));
        assert_eq!(snap.get("y"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn from_parts_restores_values_and_logs() {
        let mut values = HashMap::new();
        values.insert("k".to_string(), json!("v"));
        let ctx = Context::from_parts(values, vec!["restored".into()]);
        assert_eq!(ctx.get("k").await, Some(json!("v")));
        assert_eq!(ctx.logs().await, vec!["restored".to_string()]);
    }
}
