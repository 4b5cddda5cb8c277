//! The run state machine:
//! `Start -> AwaitingModel -> (ToolDispatch -> AwaitingModel)* -> Validating -> Done | Failed`.
//!
//! Both public modes share this loop; they only differ in how the model is
//! asked for a response.

use std::future::{Future, pending};
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stream::CompletionAccumulator;
use super::{AgentEvent, AgentInner, RunOptions, RunResult, RunUsage};
use crate::context::RunContext;
use crate::conversation::Conversation;
use crate::error::AgentError;
use crate::llm::{ModelCompletion, ModelMessage, ModelRequest, ModelToolCall, ModelToolChoice};
use crate::tools::{DispatchOutcome, RetryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModelMode {
    Blocking,
    Streaming,
}

enum RunState {
    AwaitingModel,
    ToolDispatch(Vec<ModelToolCall>),
    Validating(String),
}

/// Cancellation and deadline for one run.
struct RunControl {
    cancel: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl RunControl {
    fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
        }
    }

    /// Checked before every suspension.
    fn checkpoint(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        if let Some((deadline, timeout)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AgentError::Timeout { timeout });
            }
        }
        Ok(())
    }

    /// Races a model call against cancellation and the deadline.
    async fn guard<F>(&self, pending_call: F) -> Result<F::Output, AgentError>
    where
        F: Future,
    {
        let expired = async {
            match self.deadline {
                Some((deadline, timeout)) => {
                    sleep_until(deadline).await;
                    timeout
                }
                None => pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            timeout = expired => Err(AgentError::Timeout { timeout }),
            output = pending_call => Ok(output),
        }
    }
}

pub(crate) fn drive<C, O>(
    agent: Arc<AgentInner<C, O>>,
    user_prompt: String,
    options: RunOptions<C>,
    mode: ModelMode,
) -> impl Stream<Item = Result<AgentEvent<O>, AgentError>> + Send + 'static
where
    C: Send + Sync + 'static,
    O: Send + 'static,
{
    let run_id = Uuid::new_v4().to_string();
    let failed_run_id = run_id.clone();

    run_events(agent, run_id, user_prompt, options, mode).inspect_err(move |err| {
        warn!(run_id = %failed_run_id, error = %err, "agent run failed");
    })
}

fn run_events<C, O>(
    agent: Arc<AgentInner<C, O>>,
    run_id: String,
    user_prompt: String,
    options: RunOptions<C>,
    mode: ModelMode,
) -> impl Stream<Item = Result<AgentEvent<O>, AgentError>> + Send + 'static
where
    C: Send + Sync + 'static,
    O: Send + 'static,
{
    try_stream! {
        let config = agent.config.clone();
        let control = RunControl::new(
            options.cancel.unwrap_or_else(CancellationToken::new),
            options.timeout.or_else(|| config.timeout()),
        );
        let deps = options.context.unwrap_or_else(|| Arc::clone(&agent.context));
        let ctx = RunContext::new(deps, run_id.as_str(), user_prompt.as_str());

        info!(run_id = %run_id, mode = ?mode, "agent run started");

        let mut conversation = Conversation::initial(&agent.system_prompts, &ctx, &user_prompt);
        let tool_choice = if agent.tool_definitions.is_empty() {
            ModelToolChoice::None
        } else {
            ModelToolChoice::Auto
        };
        let mut retries = RetryState::new();
        let mut validation_failures = 0_u32;
        // Set while the model is being asked to correct a rejected answer.
        let mut pending_correction: Option<String> = None;
        let mut usage = RunUsage::default();
        let mut state = RunState::AwaitingModel;

        loop {
            state = match state {
                RunState::AwaitingModel => {
                    control.checkpoint()?;
                    if usage.requests >= config.max_iterations {
                        let error = match pending_correction.take() {
                            Some(detail) => AgentError::ValidationExhausted {
                                retries: validation_failures,
                                detail,
                            },
                            None => AgentError::MaxIterationsReached {
                                max_iterations: config.max_iterations,
                            },
                        };
                        Err::<(), AgentError>(error)?;
                    }
                    usage.requests += 1;
                    debug!(
                        run_id = %run_id,
                        request = usage.requests,
                        messages = conversation.len(),
                        "awaiting model"
                    );

                    let request = ModelRequest {
                        messages: conversation.messages(),
                        tools: &agent.tool_definitions,
                        tool_choice: tool_choice.clone(),
                        output_schema: agent.output.json_schema(),
                    };

                    let completion = match mode {
                        ModelMode::Blocking => control.guard(agent.model.invoke(request)).await??,
                        ModelMode::Streaming => {
                            let mut fragments = agent.model.stream(request);
                            let mut accumulator = CompletionAccumulator::default();
                            while let Some(fragment) = control.guard(fragments.next()).await? {
                                if let Some(content) = accumulator.push(fragment?)? {
                                    yield AgentEvent::TextDelta { content };
                                }
                            }
                            accumulator.finish()?
                        }
                    };

                    if let Some(model_usage) = &completion.usage {
                        usage.input_tokens += u64::from(model_usage.input_tokens);
                        usage.output_tokens += u64::from(model_usage.output_tokens);
                    }

                    let ModelCompletion { text, thinking, tool_calls, .. } = completion;

                    if let Some(content) = thinking {
                        yield AgentEvent::Thinking { content };
                    }
                    if let Some(content) = text.as_ref().filter(|text| !text.is_empty()) {
                        yield AgentEvent::Text { content: content.clone() };
                    }

                    if tool_calls.is_empty() && text.is_none() {
                        Err::<(), AgentError>(AgentError::MalformedResponse(
                            "model returned neither a final answer nor tool requests".to_string(),
                        ))?;
                    }

                    conversation = conversation.append_model_message(ModelMessage::Assistant {
                        content: text.clone(),
                        tool_calls: tool_calls.clone(),
                    });

                    if !tool_calls.is_empty() {
                        if text.as_deref().is_some_and(|text| !text.is_empty()) {
                            debug!(run_id = %run_id, "tool requests take precedence over answer text");
                        }
                        RunState::ToolDispatch(tool_calls)
                    } else {
                        RunState::Validating(text.unwrap_or_default())
                    }
                }

                RunState::ToolDispatch(calls) => {
                    control.checkpoint()?;
                    pending_correction = None;

                    for call in &calls {
                        yield AgentEvent::ToolCall {
                            tool: call.name.clone(),
                            args_json: call.arguments.clone(),
                            tool_call_id: call.id.clone(),
                        };
                    }

                    usage.tool_calls += calls.len();
                    let outcomes = agent
                        .retrievers
                        .dispatch_all(&calls, &ctx, &mut retries, config.parallel_tool_calls)
                        .await;

                    let mut exhausted = None;
                    let mut results = Vec::with_capacity(calls.len());
                    for (call, outcome) in calls.iter().zip(&outcomes) {
                        results.push(ModelMessage::ToolResult {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            content: outcome.result_text(),
                            is_error: outcome.is_error(),
                        });

                        if let DispatchOutcome::Exhausted { attempts, last_error } = outcome {
                            if exhausted.is_none() {
                                exhausted = Some(AgentError::ToolExhausted {
                                    tool: call.name.clone(),
                                    attempts: *attempts,
                                    last_error: last_error.clone(),
                                });
                            }
                        }
                    }
                    conversation = conversation.append_tool_results(results);

                    for (call, outcome) in calls.iter().zip(&outcomes) {
                        yield AgentEvent::ToolResult {
                            tool: call.name.clone(),
                            result_text: outcome.result_text(),
                            tool_call_id: call.id.clone(),
                            is_error: outcome.is_error(),
                        };
                    }

                    if let Some(error) = exhausted {
                        Err::<(), AgentError>(error)?;
                    }
                    RunState::AwaitingModel
                }

                RunState::Validating(text) => match agent.output.validate(&text) {
                    Ok(output) => {
                        info!(
                            run_id = %run_id,
                            requests = usage.requests,
                            tool_calls = usage.tool_calls,
                            "agent run completed"
                        );
                        let result = RunResult {
                            output,
                            messages: conversation.clone().into_messages(),
                            usage: usage.clone(),
                            run_id: run_id.clone(),
                        };
                        yield AgentEvent::FinalResult { result };
                        return;
                    }
                    Err(failure) => {
                        validation_failures += 1;
                        warn!(
                            run_id = %run_id,
                            attempt = validation_failures,
                            detail = %failure.detail,
                            "final answer failed validation"
                        );
                        if validation_failures > config.max_result_retries {
                            Err::<(), AgentError>(AgentError::ValidationExhausted {
                                retries: config.max_result_retries,
                                detail: failure.detail.clone(),
                            })?;
                        }

                        conversation = conversation.append_retry_prompt(retry_prompt(&failure.detail));
                        pending_correction = Some(failure.detail.clone());
                        yield AgentEvent::ValidationRetry {
                            detail: failure.detail,
                            attempt: validation_failures,
                        };
                        RunState::AwaitingModel
                    }
                },
            };
        }
    }
}

fn retry_prompt(detail: &str) -> String {
    format!("Validation failed: {detail}\n\nFix the errors and try again.")
}
