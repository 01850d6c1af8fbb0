//! Result types shared by the dispatcher, the renderers and the status API.

use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// One response from the text-generation service.
///
/// A transport-level success is not a guarantee of usable text: when the
/// service answers with an error body (rate limit, invalid request) the
/// body is passed through here with `error` set and `content` empty.
/// Callers inspect [`Generation::error`] rather than assuming success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Generation {
    /// The main generated text.
    pub content: String,
    /// Model that produced the text, when the service reports it.
    pub model: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Service-level error message, if the body was an error payload.
    pub error: Option<String>,
    /// The raw response body, for metadata callers care about.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

impl Generation {
    /// A plain text result with no metadata.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// An error body passed through from the service.
    pub fn service_error(message: impl Into<String>, raw: serde_json::Value) -> Self {
        Self {
            error: Some(message.into()),
            raw,
            ..Default::default()
        }
    }

    /// Interpret an OpenAI-style chat-completion body.
    ///
    /// `choices[0].message.content` becomes the content; an `error` object
    /// becomes a service error. A body with neither is also reported as a
    /// service error so it never silently renders as an empty page.
    pub fn from_chat_completion(raw: serde_json::Value) -> Self {
        if let Some(err) = raw.get("error").filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Self::service_error(message, raw);
        }

        let content = raw
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string);

        match content {
            Some(content) => Self {
                content,
                model: raw.get("model").and_then(|m| m.as_str()).map(str::to_string),
                input_tokens: usage(&raw, "prompt_tokens"),
                output_tokens: usage(&raw, "completion_tokens"),
                error: None,
                raw,
            },
            None => Self::service_error("response contained no choices", raw),
        }
    }
}

fn usage(raw: &serde_json::Value, field: &str) -> u32 {
    raw.get("usage")
        .and_then(|u| u.get(field))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32
}

/// One rewritten page, as produced by the batch dispatcher.
///
/// Only `page_number`, `content` and (when set) `error` are persisted;
/// token counts and timing are diagnostics for logs and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed position of the page in the source document.
    pub page_number: usize,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
    #[serde(skip)]
    pub input_tokens: u32,
    #[serde(skip)]
    pub output_tokens: u32,
    #[serde(skip)]
    pub duration_ms: u64,
}

impl PageResult {
    /// Stand-in for a blank page: the content is the page number itself.
    pub fn placeholder(page_number: usize) -> Self {
        Self {
            page_number,
            content: page_number.to_string(),
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
        }
    }

    /// Wrap a generation. A service error body is kept as a page error.
    pub fn from_generation(page_number: usize, generation: Generation, duration_ms: u64) -> Self {
        let error = generation.error.map(|message| PageError::Service {
            page: page_number,
            message,
        });
        Self {
            page_number,
            content: generation.content,
            error,
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            duration_ms,
        }
    }

    /// A page that failed and is kept only under the partial-results policy.
    pub fn failed(error: PageError) -> Self {
        let page_number = match &error {
            PageError::Transport { page, .. } | PageError::Service { page, .. } => *page,
        };
        Self {
            page_number,
            content: String::new(),
            error: Some(error),
            input_tokens: 0,
            output_tokens: 0,
            duration_ms: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
