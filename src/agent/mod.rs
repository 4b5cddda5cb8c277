mod run;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::conversation::SystemPrompt;
use crate::error::{AgentError, SetupError};
use crate::llm::{ChatModel, ModelMessage, ModelToolDefinition};
use crate::output::{OutputSchema, TextOutput};
use crate::tools::{Retriever, RetrieverOptions, RetrieverRegistry};

use self::run::{ModelMode, drive};
pub use self::stream::RunStream;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Cap on model requests per run.
    pub max_iterations: u32,
    /// Corrections allowed after the final answer fails validation.
    pub max_result_retries: u32,
    pub timeout_ms: Option<u64>,
    pub parallel_tool_calls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 24,
            max_result_retries: 1,
            timeout_ms: None,
            parallel_tool_calls: true,
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, SetupError> {
        let config: Self = toml::from_str(raw).map_err(|err| SetupError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.max_iterations == 0 {
            return Err(SetupError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent<O> {
    /// Streamed fragment of model text. Provisional: the same turn may
    /// still end in tool requests.
    TextDelta {
        content: String,
    },
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    ValidationRetry {
        detail: String,
        attempt: u32,
    },
    FinalResult {
        result: RunResult<O>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunUsage {
    pub requests: u32,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Validated output of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult<O> {
    output: O,
    messages: Vec<ModelMessage>,
    usage: RunUsage,
    run_id: String,
}

impl<O> RunResult<O> {
    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn into_output(self) -> O {
        self.output
    }

    /// The whole conversation, final model message included.
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    pub fn usage(&self) -> &RunUsage {
        &self.usage
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

/// Per-run knobs layered over the agent's config.
pub struct RunOptions<C> {
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
    context: Option<Arc<C>>,
}

impl<C> Default for RunOptions<C> {
    fn default() -> Self {
        Self {
            cancel: None,
            timeout: None,
            context: None,
        }
    }
}

impl<C> std::fmt::Debug for RunOptions<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("cancel", &self.cancel)
            .field("timeout", &self.timeout)
            .field("context_override", &self.context.is_some())
            .finish()
    }
}

impl<C> RunOptions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the agent's context value for this run only.
    pub fn with_context(self, context: C) -> Self {
        self.with_shared_context(Arc::new(context))
    }

    pub fn with_shared_context(mut self, context: Arc<C>) -> Self {
        self.context = Some(context);
        self
    }
}

pub struct AgentBuilder<C, O> {
    model: Option<Arc<dyn ChatModel>>,
    system_prompts: Vec<SystemPrompt<C>>,
    retrievers: RetrieverRegistry<C>,
    output: Arc<dyn OutputSchema<O>>,
    context: Arc<C>,
    config: AgentConfig,
}

impl<C> AgentBuilder<C, String>
where
    C: Send + Sync + 'static,
{
    pub fn new(context: C) -> Self {
        Self {
            model: None,
            system_prompts: Vec::new(),
            retrievers: RetrieverRegistry::new(),
            output: Arc::new(TextOutput),
            context: Arc::new(context),
            config: AgentConfig::default(),
        }
    }
}

impl<C, O> AgentBuilder<C, O>
where
    C: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn shared_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompts
            .push(SystemPrompt::literal(system_prompt));
        self
    }

    /// Registers a prompt computed from the run context at the start of
    /// every run, in order with the literal prompts.
    pub fn system_prompt_fn<F>(mut self, render: F) -> Self
    where
        F: Fn(&RunContext<C>) -> String + Send + Sync + 'static,
    {
        self.system_prompts.push(SystemPrompt::dynamic(render));
        self
    }

    pub fn retriever(mut self, retriever: Retriever<C>) -> Result<Self, SetupError> {
        self.retrievers.register(retriever)?;
        Ok(self)
    }

    pub fn retriever_with_options(
        mut self,
        retriever: Retriever<C>,
        options: RetrieverOptions,
    ) -> Result<Self, SetupError> {
        self.retrievers.register_with_options(retriever, options)?;
        Ok(self)
    }

    /// Declares the response shape. Replaces the default plain text.
    pub fn output<O2, S>(self, schema: S) -> AgentBuilder<C, O2>
    where
        S: OutputSchema<O2> + 'static,
        O2: Send + 'static,
    {
        AgentBuilder {
            model: self.model,
            system_prompts: self.system_prompts,
            retrievers: self.retrievers,
            output: Arc::new(schema),
            context: self.context,
            config: self.config,
        }
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn max_result_retries(mut self, max_result_retries: u32) -> Self {
        self.config.max_result_retries = max_result_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn parallel_tool_calls(mut self, parallel_tool_calls: bool) -> Self {
        self.config.parallel_tool_calls = parallel_tool_calls;
        self
    }

    pub fn build(self) -> Result<Agent<C, O>, SetupError> {
        let Some(model) = self.model else {
            return Err(SetupError::MissingModel);
        };
        self.config.validate()?;

        let tool_definitions = self.retrievers.definitions();

        Ok(Agent {
            inner: Arc::new(AgentInner {
                model,
                system_prompts: self.system_prompts,
                retrievers: self.retrievers,
                tool_definitions,
                output: self.output,
                context: self.context,
                config: self.config,
            }),
        })
    }
}

pub(crate) struct AgentInner<C, O> {
    pub(crate) model: Arc<dyn ChatModel>,
    pub(crate) system_prompts: Vec<SystemPrompt<C>>,
    pub(crate) retrievers: RetrieverRegistry<C>,
    pub(crate) tool_definitions: Vec<ModelToolDefinition>,
    pub(crate) output: Arc<dyn OutputSchema<O>>,
    pub(crate) context: Arc<C>,
    pub(crate) config: AgentConfig,
}

/// Immutable agent definition. Cloning is cheap and every clone can run
/// concurrently.
pub struct Agent<C = (), O = String> {
    inner: Arc<AgentInner<C, O>>,
}

impl<C, O> Clone for Agent<C, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Agent<(), String> {
    pub fn builder() -> AgentBuilder<(), String> {
        AgentBuilder::new(())
    }
}

impl<C> Agent<C, String>
where
    C: Send + Sync + 'static,
{
    pub fn builder_with_context(context: C) -> AgentBuilder<C, String> {
        AgentBuilder::new(context)
    }
}

impl<C, O> Agent<C, O>
where
    C: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn tool_definitions(&self) -> &[ModelToolDefinition] {
        &self.inner.tool_definitions
    }

    pub fn context(&self) -> &C {
        &self.inner.context
    }

    pub async fn run(&self, user_prompt: impl Into<String>) -> Result<RunResult<O>, AgentError> {
        self.run_with(user_prompt, RunOptions::default()).await
    }

    pub async fn run_with(
        &self,
        user_prompt: impl Into<String>,
        options: RunOptions<C>,
    ) -> Result<RunResult<O>, AgentError> {
        let events = drive(
            Arc::clone(&self.inner),
            user_prompt.into(),
            options,
            ModelMode::Blocking,
        );
        RunStream::new(events.boxed()).result().await
    }

    /// Runs to completion on a private current-thread runtime. Fails with
    /// [`AgentError::Runtime`] when called from inside an async runtime.
    pub fn run_sync(&self, user_prompt: impl Into<String>) -> Result<RunResult<O>, AgentError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(AgentError::Runtime(
                "run_sync cannot block inside an async runtime; use run instead".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| AgentError::Runtime(err.to_string()))?;
        runtime.block_on(self.run(user_prompt))
    }

    /// Starts the run on the current tokio runtime.
    pub fn spawn(&self, user_prompt: impl Into<String>, mut options: RunOptions<C>) -> RunHandle<O> {
        let cancel = options
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let agent = self.clone();
        let user_prompt = user_prompt.into();
        let join = tokio::spawn(async move { agent.run_with(user_prompt, options).await });
        RunHandle { cancel, join }
    }

    pub fn run_stream(&self, user_prompt: impl Into<String>) -> RunStream<O> {
        self.run_stream_with(user_prompt, RunOptions::default())
    }

    pub fn run_stream_with(
        &self,
        user_prompt: impl Into<String>,
        options: RunOptions<C>,
    ) -> RunStream<O> {
        let events = drive(
            Arc::clone(&self.inner),
            user_prompt.into(),
            options,
            ModelMode::Streaming,
        );
        RunStream::new(events.boxed())
    }
}

/// A spawned run: cancel it or wait for its result.
#[derive(Debug)]
pub struct RunHandle<O> {
    cancel: CancellationToken,
    join: JoinHandle<Result<RunResult<O>, AgentError>>,
}

impl<O> RunHandle<O> {
    /// Takes effect before the next model call or retriever dispatch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<RunResult<O>, AgentError> {
        self.join
            .await
            .map_err(|err| AgentError::Runtime(err.to_string()))?
    }
}
