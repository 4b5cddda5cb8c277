//! Typed agent run loop for Rust.
//!
//! An [`Agent`] pairs a [`ChatModel`] with system prompts, a set of
//! [`Retriever`]s the model may call, and an [`OutputSchema`] its final
//! answer must satisfy. Each run drives the model until it produces a
//! validated answer or fails with an [`AgentError`]:
//! - `run` / `run_with` / `run_sync` return the validated [`RunResult`]
//! - `run_stream` yields [`AgentEvent`]s as the run progresses
//! - `spawn` runs in the background behind a cancellable [`RunHandle`]
//!
//! Retriever failures are fed back to the model until the retriever's retry
//! budget is spent. Invalid final answers get a corrective prompt until
//! `max_result_retries` is spent.

pub mod agent;
pub mod context;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod output;
pub mod schema;
pub mod tools;

pub use agent::{
    Agent, AgentBuilder, AgentConfig, AgentEvent, RunHandle, RunOptions, RunResult, RunStream,
    RunUsage,
};
pub use context::RunContext;
pub use conversation::{Conversation, SystemPrompt};
pub use error::{AgentError, ProviderError, SchemaError, SetupError, ToolError};
pub use llm::{
    ChatModel, FinishReason, ModelCompletion, ModelMessage, ModelRequest, ModelStreamEvent,
    ModelToolCall, ModelToolChoice, ModelToolDefinition, ModelUsage,
};
pub use output::{JsonOutput, OutputSchema, TextOutput, Validated, ValidationFailure};
pub use tokio_util::sync::CancellationToken;
pub use tools::{DispatchOutcome, Retriever, RetrieverOptions, RetrieverRegistry, RetryState};
