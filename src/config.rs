//! Configuration for the explainer: directories, polling, and the remote
//! generation service.
//!
//! Everything is set through [`ExplainerConfig::builder()`]; the CLI maps its
//! flags (and their `env` fallbacks) onto the builder. A single config value
//! is built at process start and shared through [`crate::context::Context`].

use crate::error::ExplainerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the worker, the intake layer and the generation client.
#[derive(Clone)]
pub struct ExplainerConfig {
    /// Where uploads are stored as `<job id><ext>`. Default: `uploads`.
    pub uploads_dir: PathBuf,

    /// Where output artifacts are written as `<job id>.<format>`. Default: `outputs`.
    pub outputs_dir: PathBuf,

    /// SQLite database file. Default: `db/explainer.sqlite3`.
    pub database_path: PathBuf,

    /// Pause between two polling cycles of the worker. Default: 10 s.
    pub poll_interval: Duration,

    /// How long an in-flight job may keep running after the stop signal.
    /// Default: 30 s. A job still running after that is abandoned and
    /// stays `pending`.
    pub shutdown_grace: Duration,

    /// Base URL of the OpenAI-compatible API. Default: `https://api.openai.com/v1`.
    pub api_base: String,

    /// Bearer token for the API.
    pub api_key: Option<String>,

    /// Model identifier sent with every request. Default: `gpt-3.5-turbo`.
    pub model: String,

    /// Route generation through an edgequake-llm provider (e.g. `"anthropic"`,
    /// `"ollama"`) instead of the direct chat-completions client.
    pub provider_name: Option<String>,

    /// Token budget per page. Default: 512.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// What a transport failure on one page means for the batch.
    pub batch_policy: BatchPolicy,

    /// Instruction used for jobs without a custom one. `None` uses
    /// [`crate::prompts::DEFAULT_INSTRUCTION`].
    pub default_instruction: Option<String>,

    /// Accepted upload extensions, lower-case, without the dot.
    pub allowed_extensions: Vec<String>,

    /// Largest accepted upload in bytes. Default: 16 MB.
    pub max_upload_bytes: u64,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            outputs_dir: PathBuf::from("outputs"),
            database_path: PathBuf::from("db").join("explainer.sqlite3"),
            poll_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            provider_name: None,
            max_tokens: 512,
            api_timeout_secs: 60,
            batch_policy: BatchPolicy::default(),
            default_instruction: None,
            allowed_extensions: vec!["pptx".to_string(), "pdf".to_string()],
            max_upload_bytes: 16 * 1000 * 1000,
        }
    }
}

impl fmt::Debug for ExplainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplainerConfig")
            .field("uploads_dir", &self.uploads_dir)
            .field("outputs_dir", &self.outputs_dir)
            .field("database_path", &self.database_path)
            .field("poll_interval", &self.poll_interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("batch_policy", &self.batch_policy)
            .field("allowed_extensions", &self.allowed_extensions)
            .finish()
    }
}

impl ExplainerConfig {
    /// Create a new builder for `ExplainerConfig`.
    pub fn builder() -> ExplainerConfigBuilder {
        ExplainerConfigBuilder {
            config: Self::default(),
        }
    }

    /// The API key from the environment: `OPENAI_API_KEY`, then `API_KEY`.
    pub fn api_key_from_env() -> Option<String> {
        ["OPENAI_API_KEY", "API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|v| !v.is_empty())
    }

    /// True if `filename` has one of the accepted extensions.
    pub fn accepts(&self, filename: &str) -> bool {
        extension_of(filename)
            .map(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
            .unwrap_or(false)
    }
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Builder for [`ExplainerConfig`].
#[derive(Debug)]
pub struct ExplainerConfigBuilder {
    config: ExplainerConfig,
}

impl ExplainerConfigBuilder {
    pub fn uploads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.uploads_dir = dir.into();
        self
    }

    pub fn outputs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.outputs_dir = dir.into();
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    /// Place `uploads/`, `outputs/` and `db/` under one root directory.
    pub fn data_root(self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.uploads_dir(root.join("uploads"))
            .outputs_dir(root.join("outputs"))
            .database_path(root.join("db").join("explainer.sqlite3"))
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn api_base(mut self, url: impl Into<String>) -> Self {
        self.config.api_base = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.config.batch_policy = policy;
        self
    }

    pub fn default_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.default_instruction = Some(instruction.into());
        self
    }

    pub fn allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.allowed_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    pub fn max_upload_bytes(mut self, n: u64) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExplainerConfig, ExplainerError> {
        let c = &self.config;
        if c.poll_interval.is_zero() {
            return Err(ExplainerError::InvalidConfig(
                "Poll interval must be greater than zero".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(ExplainerError::InvalidConfig(
                "Max tokens must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ExplainerError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if !(c.api_base.starts_with("http://") || c.api_base.starts_with("https://")) {
            return Err(ExplainerError::InvalidConfig(format!(
                "API base must be an HTTP/HTTPS URL, got '{}'",
                c.api_base
            )));
        }
        if c.allowed_extensions.is_empty() {
            return Err(ExplainerError::InvalidConfig(
                "At least one upload extension must be allowed".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// What the dispatcher returns when some pages fail at the transport level.
///
/// | Policy | One page fails | Result |
/// |--------|----------------|--------|
/// | `AllOrNothing` | any | empty sequence; the job stays `pending` |
/// | `Partial` | any | every page, failed ones with `error` set |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Any transport failure collapses the whole batch to nothing. (default)
    #[default]
    AllOrNothing,
    /// Keep successful pages; failed pages carry a [`crate::error::PageError`].
    Partial,
}

/// How to separate pages in Markdown output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Pages joined with a blank line.
    None,
    /// Horizontal rule: "\n\n---\n\n" (default)
    #[default]
    HorizontalRule,
    /// HTML comment with page number: "<!-- page N -->"
    Comment,
    /// Custom string inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator string for the given page number (1-indexed).
    pub fn render(&self, page_number: usize) -> String {
        match self {
            PageSeparator::None => "\n\n".to_string(),
            PageSeparator::HorizontalRule => "\n\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n\n<!-- page {} -->\n\n", page_number),
            PageSeparator::Custom(s) => format!("\n\n{}\n\n", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ExplainerConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(10));
        assert_eq!(c.model, "gpt-3.5-turbo");
        assert_eq!(c.max_tokens, 512);
        assert_eq!(c.batch_policy, BatchPolicy::AllOrNothing);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = ExplainerConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Poll interval"));
    }

    #[test]
    fn non_http_api_base_is_rejected() {
        assert!(ExplainerConfig::builder().api_base("ftp://x").build().is_err());
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let c = ExplainerConfig::builder()
            .api_base("http://localhost:8080/v1/")
            .build()
            .unwrap();
        assert_eq!(c.api_base, "http://localhost:8080/v1");
    }

    #[test]
    fn data_root_places_all_directories() {
        let c = ExplainerConfig::builder().data_root("/srv/x").build().unwrap();
        assert_eq!(c.uploads_dir, PathBuf::from("/srv/x/uploads"));
        assert_eq!(c.outputs_dir, PathBuf::from("/srv/x/outputs"));
        assert!(c.database_path.starts_with("/srv/x/db"));
    }

    #[test]
    fn accepts_is_case_insensitive() {
        let c = ExplainerConfig::default();
        assert!(c.accepts("Deck.PPTX"));
        assert!(c.accepts("paper.pdf"));
        assert!(!c.accepts("notes.txt"));
        assert!(!c.accepts("no_extension"));
    }

    #[test]
    fn allowed_extensions_are_normalised() {
        let c = ExplainerConfig::builder()
            .allowed_extensions([".PDF"])
            .build()
            .unwrap();
        assert_eq!(c.allowed_extensions, vec!["pdf".to_string()]);
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = ExplainerConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn separator_rendering() {
        assert_eq!(PageSeparator::None.render(2), "\n\n");
        assert_eq!(PageSeparator::Comment.render(4), "\n\n<!-- page 4 -->\n\n");
        assert_eq!(PageSeparator::Custom("***".into()).render(1), "\n\n***\n\n");
    }
}
