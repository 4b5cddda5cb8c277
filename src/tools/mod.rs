use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{SchemaError, SetupError, ToolError};
use crate::llm::{ModelToolCall, ModelToolDefinition};
use crate::schema::{validate_parameter_schema, validate_value};

type HandlerFuture = BoxFuture<'static, Result<Value, ToolError>>;
type RetrieverHandler<C> = dyn Fn(RunContext<C>, Value) -> HandlerFuture + Send + Sync;

/// An application function the model may ask to have invoked.
pub struct Retriever<C> {
    name: String,
    description: String,
    json_schema: Value,
    max_retries: u32,
    handler: Arc<RetrieverHandler<C>>,
}

impl<C> Clone for Retriever<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            json_schema: self.json_schema.clone(),
            max_retries: self.max_retries,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<C> std::fmt::Debug for Retriever<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("json_schema", &self.json_schema)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl<C> Retriever<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            }),
            max_retries: 0,
            handler: Arc::new(|_ctx: RunContext<C>, _args: Value| -> HandlerFuture {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "retriever handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        validate_parameter_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Handler over raw JSON arguments.
    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(RunContext<C>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |ctx: RunContext<C>, args: Value| -> HandlerFuture {
            Box::pin(handler(ctx, args))
        });
        self
    }

    /// Handler over arguments deserialized into `P`. A deserialization
    /// failure counts as a failed attempt.
    pub fn with_typed_handler<P, R, F, Fut>(mut self, handler: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(RunContext<C>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
    {
        let tool = self.name.clone();
        self.handler = Arc::new(move |ctx: RunContext<C>, args: Value| -> HandlerFuture {
            match serde_json::from_value::<P>(args) {
                Ok(params) => {
                    let pending = handler(ctx, params);
                    Box::pin(async move {
                        let result = pending.await?;
                        serde_json::to_value(result).map_err(|err| {
                            ToolError::Execution(format!("unserializable result: {err}"))
                        })
                    })
                }
                Err(err) => {
                    let error = ToolError::InvalidArguments {
                        tool: tool.clone(),
                        message: err.to_string(),
                    };
                    Box::pin(async move { Err(error) })
                }
            }
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.json_schema.clone(),
        }
    }

    /// One attempt: argument check, then the handler. Panics inside the
    /// handler are reported as failures.
    pub async fn execute(&self, ctx: RunContext<C>, args: Value) -> Result<Value, ToolError> {
        validate_value(&self.json_schema, &args).map_err(|message| {
            ToolError::InvalidArguments {
                tool: self.name.clone(),
                message,
            }
        })?;

        let handler = Arc::clone(&self.handler);
        AssertUnwindSafe(async move { handler(ctx, args).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ToolError::Panicked(panic_message(payload.as_ref()))))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registration-time overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieverOptions {
    pub max_retries: Option<u32>,
}

impl RetrieverOptions {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
        }
    }
}

/// Consecutive failures per retriever within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    failures: HashMap<String, u32>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, tool: &str) -> u32 {
        self.failures.get(tool).copied().unwrap_or(0)
    }

    fn record_success(&mut self, tool: &str) {
        self.failures.remove(tool);
    }

    fn record_failure(&mut self, tool: &str) -> u32 {
        let failures = self.failures.entry(tool.to_string()).or_insert(0);
        *failures += 1;
        *failures
    }
}

/// Result of dispatching one requested invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(String),
    /// Recoverable: fed back to the model as a tool error.
    Retry(ToolError),
    /// Budget spent; the run must abort.
    Exhausted { attempts: u32, last_error: ToolError },
}

impl DispatchOutcome {
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success(_))
    }

    pub fn result_text(&self) -> String {
        match self {
            Self::Success(text) => text.clone(),
            Self::Retry(err) | Self::Exhausted { last_error: err, .. } => err.to_string(),
        }
    }
}

/// Retrievers of one agent. Filled at setup, read-only afterwards.
pub struct RetrieverRegistry<C> {
    retrievers: Vec<Retriever<C>>,
    index: HashMap<String, usize>,
}

impl<C> Default for RetrieverRegistry<C> {
    fn default() -> Self {
        Self {
            retrievers: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<C> std::fmt::Debug for RetrieverRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.retrievers.iter().map(|retriever| &retriever.name))
            .finish()
    }
}

impl<C> RetrieverRegistry<C>
where
    C: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, retriever: Retriever<C>) -> Result<(), SetupError> {
        self.register_with_options(retriever, RetrieverOptions::default())
    }

    pub fn register_with_options(
        &mut self,
        mut retriever: Retriever<C>,
        options: RetrieverOptions,
    ) -> Result<(), SetupError> {
        if self.index.contains_key(retriever.name()) {
            return Err(SetupError::DuplicateRetriever(retriever.name().to_string()));
        }
        validate_parameter_schema(retriever.json_schema()).map_err(|source| {
            SetupError::InvalidSchema {
                name: retriever.name().to_string(),
                source,
            }
        })?;

        if let Some(max_retries) = options.max_retries {
            retriever.max_retries = max_retries;
        }

        self.index
            .insert(retriever.name().to_string(), self.retrievers.len());
        self.retrievers.push(retriever);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Retriever<C>> {
        self.index.get(name).map(|&slot| &self.retrievers[slot])
    }

    pub fn len(&self) -> usize {
        self.retrievers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retrievers.is_empty()
    }

    /// Schemas in registration order.
    pub fn definitions(&self) -> Vec<ModelToolDefinition> {
        self.retrievers.iter().map(Retriever::definition).collect()
    }

    /// Dispatches one invocation and settles it against `retries`.
    pub async fn dispatch(
        &self,
        call: &ModelToolCall,
        ctx: &RunContext<C>,
        retries: &mut RetryState,
    ) -> DispatchOutcome {
        let attempt = self.attempt(call, ctx, retries).await;
        self.settle(call, attempt, retries)
    }

    /// Dispatches a turn's invocations. Outcomes come back in request order
    /// whether or not the handlers ran concurrently; one failure never
    /// cancels the others.
    pub async fn dispatch_all(
        &self,
        calls: &[ModelToolCall],
        ctx: &RunContext<C>,
        retries: &mut RetryState,
        parallel: bool,
    ) -> Vec<DispatchOutcome> {
        if !parallel {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.dispatch(call, ctx, retries).await);
            }
            return outcomes;
        }

        let snapshot = &*retries;
        let attempts = join_all(calls.iter().map(|call| self.attempt(call, ctx, snapshot))).await;

        calls
            .iter()
            .zip(attempts)
            .map(|(call, attempt)| self.settle(call, attempt, retries))
            .collect()
    }

    async fn attempt(
        &self,
        call: &ModelToolCall,
        ctx: &RunContext<C>,
        retries: &RetryState,
    ) -> Result<Value, ToolError> {
        let Some(retriever) = self.get(&call.name) else {
            return Err(ToolError::NotFound(call.name.clone()));
        };

        debug!(tool = %call.name, tool_call_id = %call.id, "dispatching retriever");
        let tool_ctx = ctx.for_tool(&call.name, retries.current(&call.name));
        retriever.execute(tool_ctx, call.arguments.clone()).await
    }

    fn settle(
        &self,
        call: &ModelToolCall,
        attempt: Result<Value, ToolError>,
        retries: &mut RetryState,
    ) -> DispatchOutcome {
        let error = match attempt {
            Ok(value) => {
                retries.record_success(&call.name);
                return DispatchOutcome::Success(render_result(value));
            }
            Err(error) => error,
        };

        let Some(retriever) = self.get(&call.name) else {
            warn!(tool = %call.name, "model requested unknown retriever");
            return DispatchOutcome::Retry(error);
        };

        let failures = retries.record_failure(&call.name);
        warn!(
            tool = %call.name,
            attempt = failures,
            max_retries = retriever.max_retries,
            error = %error,
            "retriever failed"
        );

        if failures > retriever.max_retries {
            DispatchOutcome::Exhausted {
                attempts: failures,
                last_error: error,
            }
        } else {
            DispatchOutcome::Retry(error)
        }
    }
}

fn render_result(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    fn ctx() -> RunContext<AtomicU32> {
        RunContext::new(Arc::new(AtomicU32::new(0)), "run-1", "prompt")
    }

    fn call(id: &str, name: &str, arguments: Value) -> ModelToolCall {
        ModelToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn counting_failure() -> Retriever<AtomicU32> {
        Retriever::new("flaky", "always fails").with_handler(
            |ctx: RunContext<AtomicU32>, _args| {
                ctx.deps().fetch_add(1, Ordering::SeqCst);
                async move { Err(ToolError::Execution("boom".to_string())) }
            },
        )
    }

    #[derive(Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    #[test]
    fn schema_validation_rejects_non_object_root() {
        let result = Retriever::<()>::new("bad", "bad").with_schema(json!({"type": "string"}));
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_names_fail_at_registration() {
        let mut registry = RetrieverRegistry::new();
        registry
            .register(Retriever::<()>::new("lookup", "first"))
            .expect("first registration");

        let err = registry
            .register(Retriever::new("lookup", "second"))
            .expect_err("duplicate must fail");
        assert!(matches!(err, SetupError::DuplicateRetriever(name) if name == "lookup"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn options_override_retriever_budget() {
        let mut registry = RetrieverRegistry::new();
        registry
            .register_with_options(
                Retriever::<()>::new("lookup", "x").with_max_retries(5),
                RetrieverOptions::retries(2),
            )
            .expect("registers");
        assert_eq!(registry.get("lookup").map(Retriever::max_retries), Some(2));
    }

    #[tokio::test]
    async fn argument_validation_reports_missing_required() {
        let retriever = Retriever::new("req", "required")
            .with_schema(json!({
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"],
                "additionalProperties": false
            }))
            .expect("schema valid")
            .with_handler(|_ctx, _args| async move { Ok(json!("ok")) });

        let err = retriever
            .execute(ctx(), json!({}))
            .await
            .expect_err("should fail");

        assert!(err.to_string().contains("\"value\" is a required property"));
    }

    #[tokio::test]
    async fn typed_handler_receives_parsed_params() {
        let retriever = Retriever::new("add", "add numbers")
            .with_typed_handler(|_ctx: RunContext<AtomicU32>, args: AddArgs| async move {
                Ok::<_, ToolError>(args.a + args.b)
            });

        let value = retriever
            .execute(ctx(), json!({"a": 2, "b": 3}))
            .await
            .expect("adds");
        assert_eq!(value, json!(5));

        let err = retriever
            .execute(ctx(), json!({"a": "two"}))
            .await
            .expect_err("bad params");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn handler_panics_become_failures() {
        let retriever = Retriever::<AtomicU32>::new("explode", "panics").with_handler(
            |_ctx, _args| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            },
        );

        let err = retriever
            .execute(ctx(), json!({}))
            .await
            .expect_err("panic is a failure");
        assert_eq!(err, ToolError::Panicked("kaboom".to_string()));
    }

    #[tokio::test]
    async fn always_failing_retriever_exhausts_after_budget_plus_one() {
        let mut registry = RetrieverRegistry::new();
        registry
            .register_with_options(counting_failure(), RetrieverOptions::retries(2))
            .expect("registers");

        let ctx = ctx();
        let mut retries = RetryState::new();
        let request = call("c", "flaky", json!({}));

        assert!(matches!(
            registry.dispatch(&request, &ctx, &mut retries).await,
            DispatchOutcome::Retry(_)
        ));
        assert!(matches!(
            registry.dispatch(&request, &ctx, &mut retries).await,
            DispatchOutcome::Retry(_)
        ));
        let outcome = registry.dispatch(&request, &ctx, &mut retries).await;
        assert!(matches!(outcome, DispatchOutcome::Exhausted { attempts: 3, .. }));
        assert_eq!(ctx.deps().load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let mut registry = RetrieverRegistry::new();
        registry
            .register_with_options(
                Retriever::new("sometimes", "fails on even calls").with_handler(
                    |ctx: RunContext<AtomicU32>, _args| {
                        let call_number = ctx.deps().fetch_add(1, Ordering::SeqCst);
                        async move {
                            if call_number % 2 == 0 {
                                Err(ToolError::Execution("even".to_string()))
                            } else {
                                Ok(json!("odd"))
                            }
                        }
                    },
                ),
                RetrieverOptions::retries(1),
            )
            .expect("registers");

        let ctx = ctx();
        let mut retries = RetryState::new();
        let request = call("c", "sometimes", json!({}));

        let first = registry.dispatch(&request, &ctx, &mut retries).await;
        assert!(matches!(first, DispatchOutcome::Retry(_)));
        assert_eq!(retries.current("sometimes"), 1);

        let second = registry.dispatch(&request, &ctx, &mut retries).await;
        assert_eq!(second, DispatchOutcome::Success("odd".to_string()));
        assert_eq!(retries.current("sometimes"), 0);

        // Would exhaust a budget of 1 if the earlier failure still counted.
        let third = registry.dispatch(&request, &ctx, &mut retries).await;
        assert!(matches!(third, DispatchOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn unknown_retriever_is_a_soft_failure() {
        let registry = RetrieverRegistry::<AtomicU32>::new();
        let mut retries = RetryState::new();
        let outcome = registry
            .dispatch(&call("c", "missing", json!({})), &ctx(), &mut retries)
            .await;

        assert_eq!(
            outcome,
            DispatchOutcome::Retry(ToolError::NotFound("missing".to_string()))
        );
        assert_eq!(retries.current("missing"), 0);
    }

    #[tokio::test]
    async fn parallel_dispatch_keeps_request_order() {
        let mut registry = RetrieverRegistry::new();
        registry
            .register(
                Retriever::new("sleepy", "sleeps for the given millis").with_handler(
                    |_ctx, args| async move {
                        let millis = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                        Ok(json!(millis))
                    },
                ),
            )
            .expect("registers");

        let calls = vec![
            call("slow", "sleepy", json!({"ms": 40})),
            call("fast", "sleepy", json!({"ms": 1})),
        ];
        let mut retries = RetryState::new();
        let outcomes = registry
            .dispatch_all(&calls, &ctx(), &mut retries, true)
            .await;

        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Success("40".to_string()),
                DispatchOutcome::Success("1".to_string()),
            ]
        );
    }
}
