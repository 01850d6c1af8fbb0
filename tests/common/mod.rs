//! Shared fixtures for the integration tests: a context over an in-memory
//! database and a temp data root, plus scripted collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use page_explainer::error::{ExtractionError, TransportError};
use page_explainer::{
    BatchPolicy, Context, Database, ExplainerConfig, Generation, GenerationClient, JobStore,
    PageExtractor,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Page separator understood by [`FormFeedExtractor`].
pub const PAGE_BREAK: &str = "\u{c}";

/// Reads the upload as UTF-8 and splits it into pages at form feeds.
/// An empty file has no pages; a file whose text is `FAIL` is malformed.
pub struct FormFeedExtractor;

impl PageExtractor for FormFeedExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let text = std::fs::read_to_string(path).map_err(|e| ExtractionError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        if text == "FAIL" {
            return Err(ExtractionError::Malformed {
                path: path.to_path_buf(),
                detail: "scripted failure".into(),
            });
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split(PAGE_BREAK).map(str::to_string).collect())
    }
}

/// Page number and page text of a prompt built by `build_prompt`.
pub fn parse_prompt(prompt: &str) -> (usize, String) {
    let mut lines = prompt.splitn(3, '\n');
    let _instruction = lines.next();
    let number = lines
        .next()
        .and_then(|l| l.rsplit(' ').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    (number, lines.next().unwrap_or_default().to_string())
}

/// Upper-cases the page text.
///
/// * Later pages answer sooner (`delay_step × (10 − page)`), so completion
///   order is the reverse of page order.
/// * A page containing `boom` fails at the transport level.
/// * A page containing `quota` gets a service error body.
/// * Every page waits `stall` first, if set.
pub struct ScriptedClient {
    pub calls: AtomicUsize,
    pub delay_step: Duration,
    pub stall: Duration,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Self::with_stall(Duration::ZERO)
    }

    pub fn with_stall(stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay_step: Duration::from_millis(5),
            stall,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(&self, prompt: &str) -> Result<Generation, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (page, text) = parse_prompt(prompt);

        if !self.stall.is_zero() {
            tokio::time::sleep(self.stall).await;
        }
        let rank = 10u32.saturating_sub(page as u32);
        tokio::time::sleep(self.delay_step * rank).await;

        if text.contains("boom") {
            return Err(TransportError::Network {
                endpoint: "mock".into(),
                detail: "connection reset".into(),
            });
        }
        if text.contains("quota") {
            return Ok(Generation::service_error(
                "You exceeded your current quota",
                serde_json::json!({"error": {"message": "You exceeded your current quota"}}),
            ));
        }
        Ok(Generation::text(text.to_uppercase()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A context rooted in a fresh temp directory.
pub struct Harness {
    pub ctx: Context,
    pub client: Arc<ScriptedClient>,
    _root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(ScriptedClient::new(), BatchPolicy::AllOrNothing)
    }

    pub fn build(client: Arc<ScriptedClient>, policy: BatchPolicy) -> Self {
        init_logging();
        let root = tempfile::tempdir().expect("temp dir");
        let config = ExplainerConfig::builder()
            .data_root(root.path())
            .poll_interval(Duration::from_millis(20))
            .batch_policy(policy)
            .build()
            .expect("valid config");
        let store = JobStore::new(Database::open_in_memory().expect("in-memory db"));
        let ctx = Context::new(
            config,
            store,
            Arc::clone(&client) as Arc<dyn GenerationClient>,
            Arc::new(FormFeedExtractor),
        );
        Self {
            ctx,
            client,
            _root: root,
        }
    }
}

/// Route worker logs through the test harness (`--nocapture` shows them).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("page_explainer=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Join pages with the form-feed separator.
pub fn document(pages: &[&str]) -> Vec<u8> {
    pages.join(PAGE_BREAK).into_bytes()
}
