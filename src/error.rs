use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema must be a JSON object")]
    SchemaNotObject,
    #[error("retriever schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("schema type must be a string")]
    InvalidType,
    #[error("required must be an array of strings")]
    InvalidRequired,
    #[error("properties must be a JSON object")]
    InvalidProperties,
    #[error("enum must be an array")]
    InvalidEnum,
    #[error("schema does not compile: {0}")]
    Uncompilable(String),
}

/// Failures raised while assembling an agent. Never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("duplicate retriever registered: {0}")]
    DuplicateRetriever(String),
    #[error("invalid schema for {name}: {source}")]
    InvalidSchema {
        name: String,
        #[source]
        source: SchemaError,
    },
    #[error("agent model must be configured via AgentBuilder::model(...)")]
    MissingModel,
    #[error("invalid agent config: {0}")]
    Config(String),
}

/// A single retriever failure. Fed back to the model while the retriever's
/// retry budget lasts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("unknown retriever '{0}'")]
    NotFound(String),
    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("retriever execution failed: {0}")]
    Execution(String),
    #[error("retriever panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

/// Terminal failure of a run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error("retriever '{tool}' exhausted its retries after {attempts} attempts: {last_error}")]
    ToolExhausted {
        tool: String,
        attempts: u32,
        last_error: ToolError,
    },
    #[error("output validation failed after {retries} retries: {detail}")]
    ValidationExhausted { retries: u32, detail: String },
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("run timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("run cancelled")]
    Cancelled,
    #[error("agent stream ended without final result")]
    MissingFinalResponse,
    #[error("runtime failure: {0}")]
    Runtime(String),
}
