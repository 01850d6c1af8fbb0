//! Text generation: one remote call per page.
//!
//! [`GenerationClient`] is the seam between the batch dispatcher and the
//! outside world. It is intentionally thin: the prompt is built by
//! [`crate::prompts`], and what a failure means for the rest of the batch is
//! decided by [`crate::pipeline::dispatch`]. A client makes exactly one
//! attempt per call and never retries.
//!
//! ## Implementations
//!
//! | Client | Transport | Selected when |
//! |--------|-----------|---------------|
//! | [`OpenAiClient`] | reqwest → `{api_base}/chat/completions` | default |
//! | [`ProviderClient`] | edgequake-llm `LLMProvider` | `provider_name` is set (`"auto"` detects one) |
//!
//! ## Error Split
//!
//! A *transport* failure (no usable answer at all) is a [`TransportError`].
//! An answer that is an error body (rate limit, invalid request) is a
//! successful call: it comes back as a [`Generation`] with `error` set, so
//! the page still completes and the caller decides what to show.

use crate::config::ExplainerConfig;
use crate::error::{ExplainerError, TransportError};
use crate::output::Generation;
use crate::prompts::SYSTEM_MESSAGE;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Produces text for one prompt.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Send one prompt. Exactly one attempt; no retries.
    async fn generate(&self, prompt: &str) -> Result<Generation, TransportError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "generation-client"
    }
}

/// Build the client selected by `config`.
///
/// `provider_name` routes through edgequake-llm (see [`provider_route`]);
/// otherwise the direct chat-completions client is used with `api_key` (or
/// the key found in the environment).
pub fn client_from_config(
    config: &ExplainerConfig,
) -> Result<Arc<dyn GenerationClient>, ExplainerError> {
    if config.provider_name.is_some() {
        let route = provider_route(config, env_value);
        let provider = resolve_provider(&route)?;
        return Ok(Arc::new(
            ProviderClient::new(provider, config).with_label(route.label()),
        ));
    }

    let api_key = config
        .api_key
        .clone()
        .or_else(ExplainerConfig::api_key_from_env)
        .ok_or_else(|| ExplainerError::ProviderNotConfigured {
            provider: "openai".to_string(),
            hint: "Set OPENAI_API_KEY (or API_KEY), pass --api-key, or choose a provider \
                   with --provider."
                .to_string(),
        })?;

    Ok(Arc::new(OpenAiClient::new(config, api_key)?))
}

// ── Direct chat-completions client ───────────────────────────────────────

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    timeout_secs: u64,
}

impl OpenAiClient {
    pub fn new(config: &ExplainerConfig, api_key: impl Into<String>) -> Result<Self, ExplainerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api_timeout_secs))
            .build()
            .map_err(|e| ExplainerError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.api_base),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            timeout_secs: config.api_timeout_secs,
        })
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_MESSAGE},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl GenerationClient for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<Generation, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, endpoint = %self.endpoint, "chat completion request failed");
                if e.is_timeout() {
                    TransportError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    TransportError::Network {
                        endpoint: self.endpoint.clone(),
                        detail: e.to_string(),
                    }
                }
            })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    secs: self.timeout_secs,
                }
            } else {
                TransportError::Network {
                    endpoint: self.endpoint.clone(),
                    detail: e.to_string(),
                }
            }
        })?;

        // Any JSON body, success or error status, is an answer from the service.
        let raw: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| TransportError::Protocol {
                status,
                detail: format!(
                    "undecodable body ({e}): {}",
                    String::from_utf8_lossy(&body).chars().take(200).collect::<String>()
                ),
            })?;

        let generation = Generation::from_chat_completion(raw);
        match &generation.error {
            Some(message) => warn!(status, error = %message, "service returned an error body"),
            None => debug!(
                model = %self.model,
                input_tokens = generation.input_tokens,
                output_tokens = generation.output_tokens,
                "chat completion"
            ),
        }
        Ok(generation)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ── edgequake-llm provider client ────────────────────────────────────────

/// Client backed by any edgequake-llm provider.
pub struct ProviderClient {
    provider: Arc<dyn LLMProvider>,
    label: String,
    model: String,
    max_tokens: usize,
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ExplainerConfig) -> Self {
        Self {
            provider,
            label: config
                .provider_name
                .clone()
                .unwrap_or_else(|| "auto".to_string()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }

    /// Name used in logs and `TransportError::Provider`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl GenerationClient for ProviderClient {
    async fn generate(&self, prompt: &str) -> Result<Generation, TransportError> {
        let messages = vec![ChatMessage::system(SYSTEM_MESSAGE), ChatMessage::user(prompt)];
        let options = self.options();

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| TransportError::Provider {
                provider: self.label.clone(),
                detail: e.to_string(),
            })?;

        debug!(
            provider = %self.label,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "provider completion"
        );

        Ok(Generation {
            content: response.content,
            model: Some(self.model.clone()),
            input_tokens: response.prompt_tokens as u32,
            output_tokens: response.completion_tokens as u32,
            error: None,
            raw: serde_json::Value::Null,
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// `provider_name` value that asks for auto-detection.
pub const AUTO_PROVIDER: &str = "auto";

/// How an edgequake-llm provider is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRoute {
    /// Provider by name. The factory reads its key from the provider's
    /// usual variable.
    Named { provider: String, model: String },
    /// Whatever `ProviderFactory::from_env` finds.
    Detect,
}

impl ProviderRoute {
    pub fn label(&self) -> &str {
        match self {
            ProviderRoute::Named { provider, .. } => provider,
            ProviderRoute::Detect => AUTO_PROVIDER,
        }
    }
}

/// Pick the provider route for `config`, reading variables through `env`.
///
/// A concrete `provider_name` is used as is, with `config.model`. With
/// `provider_name = "auto"` the first match wins:
///
/// 1. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, both set.
/// 2. `openai` with `config.model`, when `OPENAI_API_KEY` is set.
/// 3. Full auto-detection.
///
/// Empty values count as unset.
pub fn provider_route(
    config: &ExplainerConfig,
    env: impl Fn(&str) -> Option<String>,
) -> ProviderRoute {
    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(name) = config.provider_name.as_deref() {
        if !name.eq_ignore_ascii_case(AUTO_PROVIDER) {
            return ProviderRoute::Named {
                provider: name.to_string(),
                model: config.model.clone(),
            };
        }
    }

    let pair = (var("EDGEQUAKE_LLM_PROVIDER"), var("EDGEQUAKE_MODEL"));
    if let (Some(provider), Some(model)) = pair {
        return ProviderRoute::Named { provider, model };
    }

    if var("OPENAI_API_KEY").is_some() {
        return ProviderRoute::Named {
            provider: "openai".to_string(),
            model: config.model.clone(),
        };
    }

    ProviderRoute::Detect
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Build the provider a route points at.
pub fn resolve_provider(route: &ProviderRoute) -> Result<Arc<dyn LLMProvider>, ExplainerError> {
    match route {
        ProviderRoute::Named { provider, model } => create_provider(provider, model),
        ProviderRoute::Detect => {
            let (llm_provider, _embedding) =
                ProviderFactory::from_env().map_err(|e| ExplainerError::ProviderNotConfigured {
                    provider: AUTO_PROVIDER.to_string(),
                    hint: format!(
                        "No LLM provider could be auto-detected from environment.\n\
                         Set EDGEQUAKE_LLM_PROVIDER and EDGEQUAKE_MODEL, OPENAI_API_KEY, \
                         or ANTHROPIC_API_KEY.\n\
                         Error: {e}"
                    ),
                })?;
            Ok(llm_provider)
        }
    }
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExplainerError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExplainerError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}
