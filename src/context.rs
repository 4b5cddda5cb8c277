use std::sync::Arc;

/// Per-run view handed to every system-prompt function and retriever.
///
/// `deps` is the application's context value. It is shared, never copied
/// or mutated by the run loop.
pub struct RunContext<C> {
    deps: Arc<C>,
    run_id: Arc<str>,
    prompt: Arc<str>,
    tool_name: Option<String>,
    retry: u32,
}

impl<C> Clone for RunContext<C> {
    fn clone(&self) -> Self {
        Self {
            deps: Arc::clone(&self.deps),
            run_id: Arc::clone(&self.run_id),
            prompt: Arc::clone(&self.prompt),
            tool_name: self.tool_name.clone(),
            retry: self.retry,
        }
    }
}

impl<C> std::fmt::Debug for RunContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("prompt", &self.prompt)
            .field("tool_name", &self.tool_name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl<C> RunContext<C> {
    pub fn new(deps: Arc<C>, run_id: impl Into<Arc<str>>, prompt: impl Into<Arc<str>>) -> Self {
        Self {
            deps,
            run_id: run_id.into(),
            prompt: prompt.into(),
            tool_name: None,
            retry: 0,
        }
    }

    pub fn deps(&self) -> &C {
        &self.deps
    }

    pub fn deps_arc(&self) -> Arc<C> {
        Arc::clone(&self.deps)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The user prompt that started this run.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Name of the retriever being invoked. `None` outside retriever calls.
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    /// Consecutive failures this retriever has already had in the run.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub(crate) fn for_tool(&self, tool_name: &str, retry: u32) -> Self {
        Self {
            tool_name: Some(tool_name.to_string()),
            retry,
            ..self.clone()
        }
    }
}
