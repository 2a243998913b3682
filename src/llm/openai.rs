use std::time::Duration;

use anyhow::Result;
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
    Client,
};
use futures::{stream, StreamExt};
use tracing::{debug, warn};

use super::{Choice, Completion, Llm, Prompt};
use crate::config::LlmConfig;

#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub n: u8,
    pub logprobs: bool,
    pub top_logprobs: u8,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 2500,
            temperature: 0.0,
            top_p: 1.0,
            n: 1,
            logprobs: true,
            top_logprobs: 3,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
    params: SamplingParams,
    max_concurrency: usize,
    request_timeout: Duration,
    request_retries: usize,
}

impl LlmClient {
    pub fn new(
        model: String,
        base_url: Option<String>,
        api_key: Option<String>,
        max_concurrency: usize,
    ) -> Self {
        let mut cfg = OpenAIConfig::default();
        if let Some(url) = base_url { cfg = cfg.with_api_base(url); }
        if let Some(key) = api_key { cfg = cfg.with_api_key(key); }
        let client = Client::with_config(cfg);
        Self {
            client,
            model,
            params: SamplingParams::default(),
            max_concurrency: max_concurrency.max(1),
            request_timeout: Duration::from_secs(1200),
            request_retries: 3,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(cfg.model.clone(), cfg.base_url.clone(), cfg.api_key.clone(), cfg.max_concurrency)
            .with_params(SamplingParams {
                max_tokens: cfg.max_tokens,
                temperature: cfg.temperature,
                top_p: cfg.top_p,
                n: 1,
                logprobs: cfg.logprobs,
                top_logprobs: cfg.top_logprobs,
            })
            .with_timeout(Duration::from_secs(cfg.request_timeout_secs))
            .with_retries(cfg.request_retries)
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.request_retries = retries.max(1);
        self
    }

    fn build_request(&self, prompt: Prompt) -> Result<CreateChatCompletionRequest> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt.system)
                .build()?
                .into(),
            ChatCompletionRequestUserMessageArgs::default().content(prompt.user).build()?.into(),
        ];
        let mut args = CreateChatCompletionRequestArgs::default();
        #[allow(deprecated)]
        args.model(self.model.clone())
            .messages(messages)
            .max_tokens(self.params.max_tokens)
            .temperature(self.params.temperature)
            .top_p(self.params.top_p)
            .n(self.params.n);
        if self.params.logprobs {
            args.logprobs(true).top_logprobs(self.params.top_logprobs);
        }
        Ok(args.build()?)
    }

    async fn request_with_retry(
        &self,
        idx: usize,
        request: CreateChatCompletionRequest,
    ) -> Option<Completion> {
        for attempt in 1..=self.request_retries {
            let chat = self.client.chat();
            let call = chat.create(request.clone());
            match tokio::time::timeout(self.request_timeout, call).await {
                Ok(Ok(resp)) => return Some(into_completion(resp)),
                Ok(Err(e)) => warn!(idx, attempt, error = %e, "chat completion failed"),
                Err(_) => warn!(idx, attempt, "chat completion timed out"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        None
    }
}

fn into_completion(resp: CreateChatCompletionResponse) -> Completion {
    let choices = resp
        .choices
        .into_iter()
        .map(|choice| Choice {
            content: choice.message.content.unwrap_or_default(),
            logprobs: choice
                .logprobs
                .and_then(|lp| lp.content)
                .map(|tokens| tokens.iter().map(|t| f64::from(t.logprob)).collect()),
        })
        .collect();
    Completion { choices }
}

#[async_trait::async_trait]
impl Llm for LlmClient {
    async fn chat_many(&self, prompts: Vec<Prompt>) -> Result<Vec<Option<Completion>>> {
        let mut requests = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            requests.push(self.build_request(prompt)?);
        }
        debug!(count = requests.len(), model = %self.model, "dispatching chat batch");

        let calls = requests
            .into_iter()
            .enumerate()
            .map(|(idx, req)| async move { (idx, self.request_with_retry(idx, req).await) });

        let mut out = stream::iter(calls)
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        out.sort_by_key(|(idx, _)| *idx);
        Ok(out.into_iter().map(|(_, completion)| completion).collect())
    }
}
