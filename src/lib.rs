//! # page-explainer
//!
//! Rewrite slide decks (`.pptx`) and PDFs page by page with a chat-completion
//! model, either interactively or through a durable job queue drained by a
//! background worker.
//!
//! ## Why a queue?
//!
//! A 40-slide deck means 40 remote calls. Doing them inside a request
//! handler ties the client up for the slowest call; instead an upload is
//! recorded as a `pending` job, the client gets an opaque id back at once,
//! and a single background [`Worker`] processes jobs in order. Status polls
//! return the rewritten pages once the job is `done`.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload ──▶ intake::submit ──▶ JobStore (pending)
//!                                   │
//!                          Worker::run_cycle
//!                                   │
//!   ├─ 1. Extract   pdf (pdfium) / pptx (zip + XML), spawn_blocking
//!   ├─ 2. Dispatch  one task per page on a JoinSet, blank pages skipped
//!   ├─ 3. Generate  chat-completions call per page (OpenAI or any provider)
//!   ├─ 4. Policy    all-or-nothing (default) or keep partial results
//!   ├─ 5. Persist   <outputs>/<id>.json, atomic write
//!   └─ 6. Complete  mark_done: pending → done, first write wins
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_explainer::{intake, status, Context, ExplainerConfig, Upload, Worker};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key from OPENAI_API_KEY / API_KEY
//!     let ctx = Context::open(ExplainerConfig::default())?;
//!
//!     let id = intake::submit(&ctx, Upload::from_path("deck.pptx").await?).await?;
//!
//!     let shutdown = CancellationToken::new();
//!     let worker = tokio::spawn(Worker::new(ctx.clone()).run(shutdown.clone()));
//!
//!     // ... later
//!     if let Some(report) = status::query(&ctx, id.as_str()).await? {
//!         println!("{}: {}", report.filename, report.status);
//!     }
//!     shutdown.cancel();
//!     worker.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `explainer` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! page-explainer = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cleanup;
pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod intake;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod status;
pub mod store;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BatchPolicy, ExplainerConfig, ExplainerConfigBuilder, PageSeparator};
pub use context::Context;
pub use convert::{explain_file, explain_to_file, ExplainOptions};
pub use error::{
    ExplainerError, ExtractionError, JobError, PageError, RenderError, TransportError,
};
pub use intake::Upload;
pub use output::{Generation, PageResult};
pub use pipeline::dispatch::{BatchDispatcher, PageOutcome};
pub use pipeline::extract::{DocumentExtractor, PageExtractor};
pub use pipeline::llm::{GenerationClient, OpenAiClient, ProviderClient};
pub use pipeline::render::{OutputFormat, OutputStore};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use prompts::build_prompt;
pub use status::StatusReport;
pub use store::{Database, Job, JobId, JobState, JobStore, StoreError, User};
pub use worker::{CycleReport, Worker, WorkerConfig};
