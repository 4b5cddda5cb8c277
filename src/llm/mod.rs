use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;

use crate::error::ProviderError;

#[derive(Clone, Debug, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ModelToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
    /// Corrective feedback after the final answer failed validation.
    RetryPrompt {
        content: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Everything one model call gets to see.
#[derive(Clone, Debug)]
pub struct ModelRequest<'a> {
    pub messages: &'a [ModelMessage],
    pub tools: &'a [ModelToolDefinition],
    pub tool_choice: ModelToolChoice,
    /// Declared response shape, when the agent has a structured one.
    pub output_schema: Option<&'a Value>,
}

/// How a streamed response ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    FinalAnswer,
    ToolRequests,
}

/// One fragment of a streamed model response. A well-formed stream ends
/// with exactly one `Finish`.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelStreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCall(ModelToolCall),
    Usage(ModelUsage),
    Finish(FinishReason),
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError>;

    /// Streams the response as fragments. The default replays a blocking
    /// `invoke` as a single burst.
    fn stream<'a>(
        &'a self,
        request: ModelRequest<'a>,
    ) -> BoxStream<'a, Result<ModelStreamEvent, ProviderError>> {
        stream::once(async move { self.invoke(request).await })
            .map(|result| {
                let events = match result {
                    Ok(completion) => completion_events(completion)
                        .into_iter()
                        .map(Ok)
                        .collect::<Vec<_>>(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(events)
            })
            .flatten()
            .boxed()
    }
}

/// Splits a completion into the fragment sequence a streaming backend would
/// have produced. A completion with neither text nor tool calls gets no
/// `Finish` marker.
pub fn completion_events(completion: ModelCompletion) -> Vec<ModelStreamEvent> {
    let mut events = Vec::new();

    if let Some(thinking) = completion.thinking {
        events.push(ModelStreamEvent::ThinkingDelta(thinking));
    }

    let has_text = completion.text.is_some();
    if let Some(text) = completion.text {
        if !text.is_empty() {
            events.push(ModelStreamEvent::TextDelta(text));
        }
    }

    let has_tool_calls = !completion.tool_calls.is_empty();
    events.extend(completion.tool_calls.into_iter().map(ModelStreamEvent::ToolCall));

    if let Some(usage) = completion.usage {
        events.push(ModelStreamEvent::Usage(usage));
    }

    if has_tool_calls {
        events.push(ModelStreamEvent::Finish(FinishReason::ToolRequests));
    } else if has_text {
        events.push(ModelStreamEvent::Finish(FinishReason::FinalAnswer));
    }

    events
}
