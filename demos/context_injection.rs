use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use typed_agent_rs::{
    Agent, AgentError, ChatModel, ModelCompletion, ModelMessage, ModelRequest, ModelToolCall,
    ProviderError, Retriever, RetrieverOptions, RunContext, RunOptions, ToolError,
};

struct Inventory {
    shop: String,
    stock: HashMap<String, u32>,
}

impl Inventory {
    fn new(shop: &str, stock: &[(&str, u32)]) -> Self {
        Self {
            shop: shop.to_string(),
            stock: stock
                .iter()
                .map(|(item, count)| (item.to_string(), *count))
                .collect(),
        }
    }
}

/// Looks up stock for the first item it sees, then reports what came back.
struct ClerkModel {
    delay: Duration,
}

#[async_trait]
impl ChatModel for ClerkModel {
    async fn invoke(&self, request: ModelRequest<'_>) -> Result<ModelCompletion, ProviderError> {
        tokio::time::sleep(self.delay).await;

        let tool_result = request.messages.iter().rev().find_map(|message| match message {
            ModelMessage::ToolResult { content, .. } => Some(content.clone()),
            _ => None,
        });
        if let Some(content) = tool_result {
            return Ok(ModelCompletion {
                text: Some(format!("In stock: {content}")),
                ..ModelCompletion::default()
            });
        }

        Ok(ModelCompletion {
            tool_calls: vec![ModelToolCall {
                id: "call_1".to_string(),
                name: "stock".to_string(),
                arguments: json!({"item": "lantern"}),
            }],
            ..ModelCompletion::default()
        })
    }
}

#[derive(Deserialize)]
struct StockArgs {
    item: String,
}

fn stock_retriever() -> Retriever<Inventory> {
    Retriever::new("stock", "units in stock for an item")
        .with_schema(json!({
            "type": "object",
            "properties": {"item": {"type": "string"}},
            "required": ["item"]
        }))
        .expect("valid schema")
        .with_typed_handler(|ctx: RunContext<Inventory>, args: StockArgs| async move {
            ctx.deps()
                .stock
                .get(&args.item)
                .map(|count| format!("{count} x {} at {}", args.item, ctx.deps().shop))
                .ok_or_else(|| ToolError::Execution(format!("unknown item: {}", args.item)))
        })
}

fn build_agent(delay: Duration) -> Result<Agent<Inventory>, Box<dyn Error>> {
    let agent = Agent::builder_with_context(Inventory::new("Harbour Street", &[("lantern", 4)]))
        .model(ClerkModel { delay })
        .system_prompt("You are a shop clerk.")
        .system_prompt_fn(|ctx| format!("You work at {}.", ctx.deps().shop))
        .retriever_with_options(stock_retriever(), RetrieverOptions::retries(1))?
        .build()?;
    Ok(agent)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let agent = build_agent(Duration::from_millis(10))?;

    let default_run = agent.run("Do you have lanterns?").await?;
    println!("default context: {}", default_run.output());

    let override_run = agent
        .run_with(
            "Do you have lanterns?",
            RunOptions::new().with_context(Inventory::new("Hill Road", &[("lantern", 11)])),
        )
        .await?;
    println!("override context: {}", override_run.output());

    let slow_agent = build_agent(Duration::from_secs(30))?;
    let handle = slow_agent.spawn("Do you have lanterns?", RunOptions::new());
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    match handle.wait().await {
        Err(AgentError::Cancelled) => println!("slow run cancelled"),
        other => println!("unexpected outcome: {other:?}"),
    }

    Ok(())
}
