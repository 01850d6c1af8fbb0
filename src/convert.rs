//! One-shot conversion: rewrite a single local file without the job store.
//!
//! ## Why a separate entry point?
//!
//! The worker path is built for unattended operation: failures leave the
//! job pending and are retried on the next cycle. An interactive caller
//! wants the opposite, an immediate answer. These functions run the same
//! pipeline stages (extract, dispatch, render) directly and turn "nothing
//! usable came back" into an error the caller sees at once.

use crate::config::ExplainerConfig;
use crate::error::{ExplainerError, ExtractionError};
use crate::output::PageResult;
use crate::pipeline::dispatch::BatchDispatcher;
use crate::pipeline::extract::{extract_pages, DocumentExtractor, PageExtractor};
use crate::pipeline::llm::GenerationClient;
use crate::pipeline::render::OutputStore;
use crate::progress::ProgressCallback;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Options of a one-shot run beyond the shared configuration.
#[derive(Clone, Default)]
pub struct ExplainOptions {
    /// Instruction for every page; falls back to the configured default.
    pub instruction: Option<String>,
    pub progress: Option<ProgressCallback>,
    /// Reader override; [`DocumentExtractor`] when `None`.
    pub extractor: Option<Arc<dyn PageExtractor>>,
}

/// Rewrite every page of `path` and return the results in page order.
///
/// # Errors
/// Returns `Err(ExplainerError)` only when nothing usable was produced:
/// - File missing or of an unsupported type
/// - Document could not be read
/// - Every non-blank page failed (or the batch was discarded)
pub async fn explain_file(
    path: impl AsRef<Path>,
    config: &ExplainerConfig,
    client: Arc<dyn GenerationClient>,
    options: &ExplainOptions,
) -> Result<Vec<PageResult>, ExplainerError> {
    let total_start = Instant::now();
    let path = path.as_ref();
    info!("Starting one-shot run: {}", path.display());

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !config.accepts(&filename) {
        return Err(ExplainerError::UnsupportedFile {
            filename,
            allowed: config.allowed_extensions.join(", "),
        });
    }
    if !path.exists() {
        return Err(ExtractionError::NotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    // ── Step 1: Extract ──────────────────────────────────────────────────
    let extractor = options
        .extractor
        .clone()
        .unwrap_or_else(|| Arc::new(DocumentExtractor::new()));
    let pages = extract_pages(extractor, path).await?;
    info!("Document has {} pages", pages.len());

    // ── Step 2: Dispatch ─────────────────────────────────────────────────
    let mut dispatcher = BatchDispatcher::new(client)
        .with_policy(config.batch_policy)
        .with_timeout(Duration::from_secs(config.api_timeout_secs))
        .with_default_instruction(config.default_instruction.clone());
    if let Some(ref cb) = options.progress {
        dispatcher = dispatcher.with_progress(Arc::clone(cb));
    }

    let outcomes = dispatcher
        .collect_outcomes(&pages, options.instruction.as_deref())
        .await;
    let first_error = outcomes
        .iter()
        .find_map(|o| o.as_ref().err().map(|e| e.to_string()))
        .or_else(|| {
            outcomes
                .iter()
                .filter_map(|o| o.as_ref().ok())
                .find_map(|r| r.error.as_ref().map(|e| e.to_string()))
        });
    let results = config.batch_policy.apply(outcomes);

    // ── Step 3: Check ────────────────────────────────────────────────────
    let usable = results.iter().filter(|r| r.is_ok()).count();
    if !pages.is_empty() && usable == 0 {
        return Err(ExplainerError::AllPagesFailed {
            total: pages.len(),
            first_error: first_error.unwrap_or_else(|| "Unknown error".to_string()),
        });
    }

    info!(
        "One-shot run complete: {}/{} pages, {}ms total",
        usable,
        pages.len(),
        total_start.elapsed().as_millis()
    );
    Ok(results)
}

/// Rewrite `path` and write the results to `output`, the format chosen by
/// the output extension (`json`, `txt`, `md`, `docx`, `pdf`).
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub async fn explain_to_file(
    path: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ExplainerConfig,
    client: Arc<dyn GenerationClient>,
    options: &ExplainOptions,
) -> Result<Vec<PageResult>, ExplainerError> {
    let output = output.as_ref();
    // Reject an unknown output format before spending any remote calls.
    crate::pipeline::render::OutputFormat::from_path(output)?;

    let results = explain_file(path, config, client, options).await?;
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    OutputStore::new(dir).persist(&results, output).await?;
    Ok(results)
}
