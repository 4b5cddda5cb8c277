//! Outgoing message sequence for each model call.

use std::sync::Arc;

use crate::context::RunContext;
use crate::llm::ModelMessage;

type PromptFn<C> = dyn Fn(&RunContext<C>) -> String + Send + Sync;

/// A system prompt, either fixed or computed from the run context at the
/// start of every run.
pub enum SystemPrompt<C> {
    Literal(String),
    Dynamic(Arc<PromptFn<C>>),
}

impl<C> SystemPrompt<C> {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// Computed prompt. It receives only the run context: prompts render
    /// before any model turn, so the conversation so far is just the user
    /// prompt, available as [`RunContext::prompt`].
    pub fn dynamic<F>(render: F) -> Self
    where
        F: Fn(&RunContext<C>) -> String + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(render))
    }

    pub fn render(&self, ctx: &RunContext<C>) -> String {
        match self {
            Self::Literal(text) => text.clone(),
            Self::Dynamic(render) => render(ctx),
        }
    }
}

impl<C> Clone for SystemPrompt<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Literal(text) => Self::Literal(text.clone()),
            Self::Dynamic(render) => Self::Dynamic(Arc::clone(render)),
        }
    }
}

impl<C> std::fmt::Debug for SystemPrompt<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Ordered messages of one run.
///
/// Appending consumes the conversation and returns the next state; a clone
/// taken earlier keeps seeing the messages it was taken with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conversation {
    messages: Arc<Vec<ModelMessage>>,
}

impl Conversation {
    /// System messages in registration order, then the user prompt. Empty
    /// prompt outputs are skipped.
    pub fn initial<C>(
        system_prompts: &[SystemPrompt<C>],
        ctx: &RunContext<C>,
        user_prompt: &str,
    ) -> Self {
        let mut messages = system_prompts
            .iter()
            .map(|prompt| prompt.render(ctx))
            .filter(|text| !text.is_empty())
            .map(ModelMessage::System)
            .collect::<Vec<_>>();
        messages.push(ModelMessage::User(user_prompt.to_string()));

        Self {
            messages: Arc::new(messages),
        }
    }

    pub fn append_model_message(self, message: ModelMessage) -> Self {
        self.extend([message])
    }

    /// One message per result, in the order given.
    pub fn append_tool_results(self, results: impl IntoIterator<Item = ModelMessage>) -> Self {
        self.extend(results)
    }

    pub fn append_retry_prompt(self, content: impl Into<String>) -> Self {
        self.extend([ModelMessage::RetryPrompt {
            content: content.into(),
        }])
    }

    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<ModelMessage> {
        Arc::unwrap_or_clone(self.messages)
    }

    fn extend(mut self, messages: impl IntoIterator<Item = ModelMessage>) -> Self {
        Arc::make_mut(&mut self.messages).extend(messages);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shop {
        name: &'static str,
    }

    fn ctx() -> RunContext<Shop> {
        RunContext::new(Arc::new(Shop { name: "Corner Books" }), "run-1", "hello")
    }

    #[test]
    fn initial_messages_preserve_prompt_order() {
        let prompts = vec![
            SystemPrompt::literal("You are helpful."),
            SystemPrompt::dynamic(|ctx: &RunContext<Shop>| format!("Shop: {}", ctx.deps().name)),
            SystemPrompt::literal("Be brief."),
        ];

        let conversation = Conversation::initial(&prompts, &ctx(), "2+2?");
        assert_eq!(
            conversation.messages(),
            &[
                ModelMessage::System("You are helpful.".to_string()),
                ModelMessage::System("Shop: Corner Books".to_string()),
                ModelMessage::System("Be brief.".to_string()),
                ModelMessage::User("2+2?".to_string()),
            ]
        );
    }

    #[test]
    fn dynamic_prompts_are_rendered_each_time() {
        let prompts = vec![SystemPrompt::dynamic(|ctx: &RunContext<Shop>| {
            format!("prompt was {}", ctx.prompt())
        })];

        let first = Conversation::initial(&prompts, &ctx(), "a");
        let other_ctx = RunContext::new(Arc::new(Shop { name: "x" }), "run-2", "second");
        let second = Conversation::initial(&prompts, &other_ctx, "b");

        assert_eq!(
            first.messages()[0],
            ModelMessage::System("prompt was hello".to_string())
        );
        assert_eq!(
            second.messages()[0],
            ModelMessage::System("prompt was second".to_string())
        );
    }

    #[test]
    fn empty_prompts_are_skipped() {
        let prompts = vec![SystemPrompt::literal("")];
        let conversation = Conversation::initial(&prompts, &ctx(), "hi");
        assert_eq!(conversation.len(), 1);
    }

    #[test]
    fn snapshots_do_not_see_later_appends() {
        let prompts: Vec<SystemPrompt<Shop>> = Vec::new();
        let conversation = Conversation::initial(&prompts, &ctx(), "hi");
        let snapshot = conversation.clone();

        let conversation = conversation.append_retry_prompt("try again");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(conversation.len(), 2);
        assert_eq!(
            conversation.messages()[1],
            ModelMessage::RetryPrompt {
                content: "try again".to_string()
            }
        );
    }

    #[test]
    fn tool_results_keep_given_order() {
        let prompts: Vec<SystemPrompt<Shop>> = Vec::new();
        let conversation = Conversation::initial(&prompts, &ctx(), "hi").append_tool_results(
            ["b", "a"].map(|id| ModelMessage::ToolResult {
                tool_call_id: id.to_string(),
                tool_name: "lookup".to_string(),
                content: id.to_string(),
                is_error: false,
            }),
        );

        let ids = conversation.messages()[1..]
            .iter()
            .map(|message| match message {
                ModelMessage::ToolResult { tool_call_id, .. } => tool_call_id.as_str(),
                _ => "",
            })
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
