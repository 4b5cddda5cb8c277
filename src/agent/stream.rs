use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};

use super::{AgentEvent, RunResult};
use crate::error::AgentError;
use crate::llm::{FinishReason, ModelCompletion, ModelStreamEvent, ModelToolCall, ModelUsage};

/// Rebuilds a full completion from streamed fragments so tool detection and
/// validation see exactly what the blocking path would.
#[derive(Debug, Default)]
pub(crate) struct CompletionAccumulator {
    text: Option<String>,
    thinking: Option<String>,
    tool_calls: Vec<ModelToolCall>,
    usage: Option<ModelUsage>,
    finish: Option<FinishReason>,
}

impl CompletionAccumulator {
    /// Returns the text fragment to forward, if any.
    pub(crate) fn push(&mut self, event: ModelStreamEvent) -> Result<Option<String>, AgentError> {
        if self.finish.is_some() {
            return Err(AgentError::MalformedResponse(
                "model stream continued after its finish marker".to_string(),
            ));
        }

        match event {
            ModelStreamEvent::TextDelta(delta) => {
                if delta.is_empty() {
                    return Ok(None);
                }
                self.text.get_or_insert_with(String::new).push_str(&delta);
                Ok(Some(delta))
            }
            ModelStreamEvent::ThinkingDelta(delta) => {
                self.thinking
                    .get_or_insert_with(String::new)
                    .push_str(&delta);
                Ok(None)
            }
            ModelStreamEvent::ToolCall(call) => {
                self.tool_calls.push(call);
                Ok(None)
            }
            ModelStreamEvent::Usage(usage) => {
                let total = self.usage.get_or_insert_with(ModelUsage::default);
                total.input_tokens = total.input_tokens.saturating_add(usage.input_tokens);
                total.output_tokens = total.output_tokens.saturating_add(usage.output_tokens);
                Ok(None)
            }
            ModelStreamEvent::Finish(reason) => {
                self.finish = Some(reason);
                Ok(None)
            }
        }
    }

    pub(crate) fn finish(self) -> Result<ModelCompletion, AgentError> {
        let text = match self.finish {
            None => {
                return Err(AgentError::MalformedResponse(
                    "model stream ended without a finish marker".to_string(),
                ));
            }
            Some(FinishReason::ToolRequests) if self.tool_calls.is_empty() => {
                return Err(AgentError::MalformedResponse(
                    "model signalled tool requests but sent none".to_string(),
                ));
            }
            Some(FinishReason::ToolRequests) => self.text,
            Some(FinishReason::FinalAnswer) => Some(self.text.unwrap_or_default()),
        };

        Ok(ModelCompletion {
            text,
            thinking: self.thinking,
            tool_calls: self.tool_calls,
            usage: self.usage,
        })
    }
}

/// Lazily produced events of one run. Single pass: once consumed it cannot
/// be replayed. Only [`AgentEvent::FinalResult`] carries committed output.
pub struct RunStream<O> {
    events: BoxStream<'static, Result<AgentEvent<O>, AgentError>>,
}

impl<O> RunStream<O> {
    pub(crate) fn new(events: BoxStream<'static, Result<AgentEvent<O>, AgentError>>) -> Self {
        Self { events }
    }

    /// Drains the remaining events and returns the validated result.
    pub async fn result(mut self) -> Result<RunResult<O>, AgentError> {
        while let Some(event) = self.events.next().await {
            if let AgentEvent::FinalResult { result } = event? {
                return Ok(result);
            }
        }
        Err(AgentError::MissingFinalResponse)
    }
}

impl<O> std::fmt::Debug for RunStream<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream").finish_non_exhaustive()
    }
}

impl<O> Stream for RunStream<O> {
    type Item = Result<AgentEvent<O>, AgentError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accumulates_text_and_forwards_deltas() {
        let mut accumulator = CompletionAccumulator::default();
        assert_eq!(
            accumulator
                .push(ModelStreamEvent::TextDelta("4".to_string()))
                .expect("ok"),
            Some("4".to_string())
        );
        assert_eq!(
            accumulator
                .push(ModelStreamEvent::TextDelta("2".to_string()))
                .expect("ok"),
            Some("2".to_string())
        );
        accumulator
            .push(ModelStreamEvent::Finish(FinishReason::FinalAnswer))
            .expect("ok");

        let completion = accumulator.finish().expect("complete");
        assert_eq!(completion.text.as_deref(), Some("42"));
        assert!(completion.tool_calls.is_empty());
    }

    #[test]
    fn tool_requests_keep_provisional_text() {
        let mut accumulator = CompletionAccumulator::default();
        for event in [
            ModelStreamEvent::TextDelta("let me check".to_string()),
            ModelStreamEvent::ToolCall(ModelToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: json!({"q": "rust"}),
            }),
            ModelStreamEvent::Finish(FinishReason::ToolRequests),
        ] {
            accumulator.push(event).expect("ok");
        }

        let completion = accumulator.finish().expect("complete");
        assert_eq!(completion.text.as_deref(), Some("let me check"));
        assert_eq!(completion.tool_calls.len(), 1);
    }

    #[test]
    fn missing_finish_marker_is_malformed() {
        let mut accumulator = CompletionAccumulator::default();
        accumulator
            .push(ModelStreamEvent::TextDelta("partial".to_string()))
            .expect("ok");
        assert!(matches!(
            accumulator.finish(),
            Err(AgentError::MalformedResponse(_))
        ));
    }

    #[test]
    fn tool_request_marker_without_calls_is_malformed() {
        let mut accumulator = CompletionAccumulator::default();
        accumulator
            .push(ModelStreamEvent::Finish(FinishReason::ToolRequests))
            .expect("ok");
        assert!(matches!(
            accumulator.finish(),
            Err(AgentError::MalformedResponse(_))
        ));
    }

    #[test]
    fn fragments_after_finish_are_rejected() {
        let mut accumulator = CompletionAccumulator::default();
        accumulator
            .push(ModelStreamEvent::Finish(FinishReason::FinalAnswer))
            .expect("ok");
        assert!(
            accumulator
                .push(ModelStreamEvent::TextDelta("late".to_string()))
                .is_err()
        );
    }

    #[test]
    fn usage_fragments_are_summed() {
        let mut accumulator = CompletionAccumulator::default();
        for usage in [(3, 1), (0, 4)] {
            accumulator
                .push(ModelStreamEvent::Usage(ModelUsage {
                    input_tokens: usage.0,
                    output_tokens: usage.1,
                }))
                .expect("ok");
        }
        accumulator
            .push(ModelStreamEvent::Finish(FinishReason::FinalAnswer))
            .expect("ok");

        let completion = accumulator.finish().expect("complete");
        assert_eq!(
            completion.usage,
            Some(ModelUsage {
                input_tokens: 3,
                output_tokens: 5
            })
        );
    }
}
