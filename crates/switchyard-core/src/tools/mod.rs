pub mod message;
pub mod spawn;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::providers::{ToolCallRequest, ToolDefinition};

/// Conversation a tool call was issued from. Passed to every execution so
/// concurrent sessions never share mutable routing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
}

impl ToolContext {
    pub fn new(channel: &str, chat_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Trait for tools callable by the LLM agent.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Invalid parameters for tool '{tool}': {}", .errors.join("; "))]
    InvalidArguments { tool: String, errors: Vec<String> },

    #[error("executing {tool} failed: {cause:#}")]
    Execution { tool: String, cause: anyhow::Error },
}

/// Result of dispatching one tool call.
#[derive(Debug)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: Result<String, ToolError>,
}

impl ToolOutcome {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }

    /// Text fed back to the model. Failures become readable error results
    /// instead of aborting the turn.
    pub fn content(&self) -> String {
        match &self.result {
            Ok(text) => text.clone(),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// A copy of this registry without the named tools.
    pub fn without(&self, excluded: &[&str]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| !excluded.contains(&name.as_str()))
                .map(|(name, tool)| (name.clone(), tool.clone()))
                .collect(),
        }
    }

    /// Definitions offered to the model, sorted by name so prompts are stable.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate and execute one call. Never panics the caller's turn: every
    /// failure is reported in the outcome.
    pub async fn dispatch(&self, call: &ToolCallRequest, ctx: &ToolContext) -> ToolOutcome {
        let result = self.run(call, ctx).await;
        if let Err(e) = &result {
            debug!("Tool call {} ({}) failed: {e}", call.id, call.name);
        }
        ToolOutcome {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result,
        }
    }

    async fn run(&self, call: &ToolCallRequest, ctx: &ToolContext) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        // Some models send `null` for tools without parameters.
        let params = match &call.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };

        let errors = validate_params(&params, &tool.parameters_schema());
        if !errors.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: call.name.clone(),
                errors,
            });
        }

        tool.execute(params, ctx)
            .await
            .map_err(|cause| ToolError::Execution {
                tool: call.name.clone(),
                cause,
            })
    }

    /// Dispatch a batch with at most `concurrency` calls in flight. Outcomes
    /// come back in the order the calls were given.
    pub async fn dispatch_all(
        &self,
        calls: &[ToolCallRequest],
        ctx: &ToolContext,
        concurrency: usize,
    ) -> Vec<ToolOutcome> {
        // Collected before streaming so the returned future stays `Send`.
        let pending: Vec<BoxFuture<'_, ToolOutcome>> = calls
            .iter()
            .map(|call| self.dispatch(call, ctx).boxed())
            .collect();
        stream::iter(pending)
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}

/// Check `params` against the subset of JSON Schema tools declare: `type`,
/// `enum`, numeric and length bounds, `required`, `properties`, `items`.
/// Returns one message per violation; empty means valid.
pub fn validate_params(params: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    check(params, schema, "", &mut errors);
    errors
}

fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

fn type_matches(val: &Value, expected: &str) -> bool {
    match expected {
        "object" => val.is_object(),
        "array" => val.is_array(),
        "string" => val.is_string(),
        "integer" => val.is_i64() || val.is_u64(),
        "number" => val.is_number(),
        "boolean" => val.is_boolean(),
        "null" => val.is_null(),
        _ => true,
    }
}

fn check(val: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let at = if path.is_empty() { "root" } else { path };
    let bound = |key: &str| schema.get(key).and_then(Value::as_f64);

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(val, expected) {
            errors.push(format!("{at}: expected type '{expected}'"));
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(val) {
            errors.push(format!("{at}: value not in allowed enum"));
        }
    }

    match val {
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or_default();
            if let Some(min) = bound("minimum").filter(|min| n < *min) {
                errors.push(format!("{at}: value {n} < minimum {min}"));
            }
            if let Some(max) = bound("maximum").filter(|max| n > *max) {
                errors.push(format!("{at}: value {n} > maximum {max}"));
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as f64;
            if let Some(min) = bound("minLength").filter(|min| len < *min) {
                errors.push(format!("{at}: string length {len} < minLength {min}"));
            }
            if let Some(max) = bound("maxLength").filter(|max| len > *max) {
                errors.push(format!("{at}: string length {len} > maxLength {max}"));
            }
        }
        Value::Object(obj) => {
            let required = schema
                .get("required")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str);
            for field in required.filter(|f| !obj.contains_key(*f)) {
                errors.push(format!("{}: required field missing", join_path(path, field)));
            }
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop_schema) in props {
                    if let Some(prop_val) = obj.get(key) {
                        check(prop_val, prop_schema, &join_path(path, key), errors);
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item, item_schema, &format!("{at}[{i}]"), errors);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo text back"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<String> {
            Ok(format!(
                "{}@{}",
                params["text"].as_str().unwrap_or_default(),
                ctx.session_key()
            ))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<String> {
            anyhow::bail!("disk on fire")
        }
    }

    /// Sleeps for `ms`, tracking peak concurrency.
    struct Slow {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"ms": {"type": "integer"}}})
        }
        async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let ms = params["ms"].as_u64().unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("slept {ms}"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        reg.register(Arc::new(Broken));
        reg
    }

    fn ctx() -> ToolContext {
        ToolContext::new("cli", "1")
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let out = registry()
            .dispatch(&ToolCallRequest::new("c1", "nope", json!({})), &ctx())
            .await;
        assert!(matches!(out.result, Err(ToolError::NotFound(_))));
        assert_eq!(out.call_id, "c1");
        assert_eq!(out.content(), "Error: Tool 'nope' not found");
    }

    #[tokio::test]
    async fn invalid_arguments_rejected_before_execution() {
        let out = registry()
            .dispatch(&ToolCallRequest::new("c1", "echo", json!({"text": 5})), &ctx())
            .await;
        assert!(matches!(out.result, Err(ToolError::InvalidArguments { .. })));
        assert!(out.content().contains("text: expected type 'string'"));
    }

    #[tokio::test]
    async fn execution_failure_is_text() {
        let out = registry()
            .dispatch(&ToolCallRequest::new("c1", "broken", Value::Null), &ctx())
            .await;
        assert!(out.is_error());
        assert_eq!(out.content(), "Error: executing broken failed: disk on fire");
    }

    #[tokio::test]
    async fn context_reaches_the_tool() {
        let out = registry()
            .dispatch(
                &ToolCallRequest::new("c1", "echo", json!({"text": "hi"})),
                &ToolContext::new("telegram", "42"),
            )
            .await;
        assert_eq!(out.content(), "hi@telegram:42");
    }

    #[tokio::test]
    async fn dispatch_all_keeps_order_and_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Slow {
            active: active.clone(),
            peak: peak.clone(),
        }));

        let calls: Vec<ToolCallRequest> = [40, 5, 30, 5, 20, 5]
            .iter()
            .enumerate()
            .map(|(i, ms)| ToolCallRequest::new(format!("c{i}"), "slow", json!({"ms": ms})))
            .collect();
        let outcomes = reg.dispatch_all(&calls, &ctx(), 2).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1", "c2", "c3", "c4", "c5"]);
        assert_eq!(outcomes[0].content(), "slept 40");
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn dispatch_all_runs_inside_spawned_task() {
        let reg = registry();
        let handle = tokio::spawn(async move {
            let calls = vec![
                ToolCallRequest::new("c1", "echo", json!({"text": "a"})),
                ToolCallRequest::new("c2", "broken", json!({})),
            ];
            reg.dispatch_all(&calls, &ToolContext::new("telegram", "9"), 2)
                .await
        });
        let outcomes = handle.await.unwrap();
        assert_eq!(outcomes[0].content(), "a@telegram:9");
        assert!(outcomes[1].is_error());
    }

    #[test]
    fn without_and_definitions() {
        let reg = registry();
        let defs = reg.definitions();
        assert_eq!(
            defs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["broken", "echo"]
        );
        let trimmed = reg.without(&["broken"]);
        assert_eq!(trimmed.names(), vec!["echo".to_string()]);
        assert_eq!(reg.len(), 2);

        let mut reg = reg;
        assert!(reg.unregister("echo").is_some());
        assert!(!reg.has("echo"));
        assert!(reg.has("broken"));
    }

    #[test]
    fn test_valid_params() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "count": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        });
        let params = json!({"query": "test", "count": 5});
        assert!(validate_params(&params, &schema).is_empty());
    }

    #[test]
    fn test_missing_required() {
        let schema = json!({
            "type": "object",
            "properties": {"task": {"type": "string"}},
            "required": ["task"]
        });
        let errors = validate_params(&json!({}), &schema);
        assert_eq!(errors, vec!["task: required field missing".to_string()]);
    }

    #[test]
    fn test_numeric_range() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer", "minimum": 1, "maximum": 10}}
        });
        let errors = validate_params(&json!({"count": 15}), &schema);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("maximum"));
    }

    #[test]
    fn test_enum_and_nested_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["read", "write"]},
                "tags": {"type": "array", "items": {"type": "string", "maxLength": 3}}
            }
        });
        let errors = validate_params(&json!({"mode": "delete", "tags": ["ok", "toolong"]}), &schema);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("enum")));
        assert!(errors.iter().any(|e| e.starts_with("tags[1]")));
    }

    #[test]
    fn test_extra_fields_ignored() {
        let schema = json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        });
        assert!(validate_params(&json!({"query": "q", "extra": 1}), &schema).is_empty());
    }
}
