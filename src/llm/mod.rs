pub mod openai;

use anyhow::Result;

/// A system/user message pair sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self { system: system.into(), user: user.into() }
    }
}

/// One sampled candidate: raw text plus token log-probabilities when the
/// endpoint reports them.
#[derive(Debug, Clone, PartialEq)]
pub struct Choice {
    pub content: String,
    pub logprobs: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub choices: Vec<Choice>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self { choices: vec![Choice { content: content.into(), logprobs: None }] }
    }
}

/// The external inference capability. Output order matches `prompts`; a
/// `None` slot means that request failed after the client's own retries.
#[async_trait::async_trait]
pub trait Llm: Send + Sync {
    async fn chat_many(&self, prompts: Vec<Prompt>) -> Result<Vec<Option<Completion>>>;
}
