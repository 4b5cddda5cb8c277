use std::collections::VecDeque;
use std::error::Error;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use typed_agent_rs::{
    Agent, AgentEvent, ChatModel, JsonOutput, ModelCompletion, ModelRequest, ModelToolCall,
    ProviderError, Retriever, RunContext, ToolError,
};

#[derive(Default)]
struct ScriptedModel {
    responses: Mutex<VecDeque<Result<ModelCompletion, ProviderError>>>,
}

impl ScriptedModel {
    fn new(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn invoke(&self, _request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        let mut guard = self.responses.lock().expect("lock poisoned");
        guard.pop_front().unwrap_or_else(|| {
            Err(ProviderError::Response(
                "scripted model exhausted responses".to_string(),
            ))
        })
    }
}

#[derive(Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[derive(Debug, Deserialize)]
struct Sum {
    expression: String,
    value: i64,
}

fn add_retriever() -> Retriever<()> {
    Retriever::new("add", "add two numbers")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "integer"}
            },
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_typed_handler(|_ctx: RunContext<()>, args: AddArgs| async move {
            Ok::<_, ToolError>(args.a + args.b)
        })
}

fn build_agent(responses: Vec<Result<ModelCompletion, ProviderError>>) -> Agent<(), Sum> {
    Agent::builder()
        .model(ScriptedModel::new(responses))
        .system_prompt("Answer arithmetic questions as JSON.")
        .retriever(add_retriever())
        .expect("registers")
        .output(
            JsonOutput::<Sum>::with_schema(json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string"},
                    "value": {"type": "integer"}
                },
                "required": ["expression", "value"]
            }))
            .expect("valid schema"),
        )
        .build()
        .expect("agent builds")
}

fn add_call(id: &str, a: i64, b: i64) -> ModelCompletion {
    ModelCompletion {
        text: Some("Working on it".to_string()),
        thinking: Some("Need arithmetic".to_string()),
        tool_calls: vec![ModelToolCall {
            id: id.to_string(),
            name: "add".to_string(),
            arguments: json!({"a": a, "b": b}),
        }],
        usage: None,
    }
}

fn final_answer(text: &str) -> ModelCompletion {
    ModelCompletion {
        text: Some(text.to_string()),
        ..ModelCompletion::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let agent = build_agent(vec![
        Ok(add_call("call_1", 2, 3)),
        Ok(final_answer(r#"{"expression": "2 + 3", "value": 5}"#)),
    ]);

    let result = agent.run("What is 2 + 3?").await?;
    println!(
        "run final: {} = {} ({} model requests)",
        result.output().expression,
        result.output().value,
        result.usage().requests
    );

    // The first answer is missing a field, so the model gets one correction.
    let streaming_agent = build_agent(vec![
        Ok(add_call("call_2", 10, 7)),
        Ok(final_answer(r#"{"expression": "10 + 7"}"#)),
        Ok(final_answer(
            "```json\n{\"expression\": \"10 + 7\", \"value\": 17}\n```",
        )),
    ]);

    let mut stream = streaming_agent.run_stream("What is 10 + 7?");
    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::TextDelta { content } => println!("delta: {content}"),
            AgentEvent::Thinking { content } => println!("thinking: {content}"),
            AgentEvent::Text { content } => println!("text: {content}"),
            AgentEvent::ToolCall {
                tool,
                args_json,
                tool_call_id,
            } => println!("tool call [{tool_call_id}] {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                tool_call_id,
                is_error,
            } => println!("tool result [{tool_call_id}] {tool}: {result_text} (error={is_error})"),
            AgentEvent::ValidationRetry { detail, attempt } => {
                println!("validation retry {attempt}: {detail}")
            }
            AgentEvent::FinalResult { result } => println!("stream final: {:?}", result.output()),
        }
    }

    Ok(())
}
