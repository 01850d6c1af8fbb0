//! Error types for the page-explainer library.
//!
//! The types mirror the places a failure can be contained:
//!
//! * [`TransportError`]: one remote generation call failed (network,
//!   timeout, protocol, provider). Never retried by the client; the batch
//!   policy decides what it means for the rest of the batch.
//!
//! * [`PageError`]: **Non-fatal**, attached to a single
//!   [`crate::output::PageResult`] when the partial-results policy keeps a
//!   failed page, or when the service answered with an error body.
//!
//! * [`ExtractionError`] / [`RenderError`]: a document could not be read,
//!   or an output artifact could not be written.
//!
//! * [`JobError`]: everything that can make one worker iteration give up on
//!   one job. The worker logs it and moves on; the job stays `pending`.
//!
//! * [`ExplainerError`]: **Fatal** for a top-level call (bad configuration,
//!   rejected upload, one-shot conversion that produced nothing).
//!
//! Store failures live in [`crate::store::StoreError`].

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A failure to obtain any response from the text-generation service.
///
/// Error bodies returned by the service itself (rate limit, invalid
/// request) are *not* transport errors; they come back as a successful
/// [`crate::output::Generation`] whose `error` field is set.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, DNS failure, TLS failure, reset mid-body.
    #[error("network error calling '{endpoint}': {detail}")]
    Network { endpoint: String, detail: String },

    /// The call did not complete within the configured API timeout.
    #[error("generation call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The service answered with something that is not a JSON document.
    #[error("protocol error (HTTP {status}): {detail}")]
    Protocol { status: u16, detail: String },

    /// An edgequake-llm provider returned an error.
    #[error("provider '{provider}' failed: {detail}")]
    Provider { provider: String, detail: String },

    /// The task running the call panicked or was aborted.
    #[error("generation task for page {page} did not complete: {detail}")]
    TaskFailed { page: usize, detail: String },
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PageError {
    /// The remote call for this page failed at the transport level.
    #[error("Page {page}: {source}")]
    Transport {
        page: usize,
        #[source]
        source: TransportError,
    },

    /// The service answered, but with an error body instead of text.
    #[error("Page {page}: service returned an error: {message}")]
    Service { page: usize, message: String },
}

impl PageError {
    /// True when the failure came from the transport, not from the service.
    pub fn is_transport(&self) -> bool {
        matches!(self, PageError::Transport { .. })
    }
}

/// A document could not be turned into page texts.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("document not found: '{path}'")]
    NotFound { path: PathBuf },

    #[error("failed to read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error(
        "failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumUnavailable(String),

    #[error("extraction task panicked: {0}")]
    Panicked(String),
}

/// An output artifact could not be produced.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unsupported output format '{0}' (expected json, txt, md, docx or pdf)")]
    UnsupportedFormat(String),

    #[error("failed to write output file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read output file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialise page results: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to build DOCX package: {0}")]
    Docx(String),

    #[error("failed to build PDF document: {0}")]
    Pdf(String),
}

/// Why one worker iteration gave up on a job. The job stays `pending`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("upload file for job is missing: '{path}'")]
    MissingUpload { path: PathBuf },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("batch of {pages} pages produced no usable results")]
    EmptyBatch { pages: usize },

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job abandoned: shutdown grace period of {secs}s elapsed")]
    Abandoned { secs: u64 },
}

/// All fatal errors returned by the page-explainer library's top-level calls.
#[derive(Debug, Error)]
pub enum ExplainerError {
    // ── Configuration ─────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Intake ────────────────────────────────────────────────────────────
    #[error("Unsupported file '{filename}': expected one of {allowed}")]
    UnsupportedFile { filename: String, allowed: String },

    #[error("Upload is {size} bytes, limit is {limit} bytes")]
    UploadTooLarge { size: u64, limit: u64 },

    #[error("Failed to store upload at '{path}': {source}")]
    UploadWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    // ── Processing ────────────────────────────────────────────────────────
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}
