//! Process-wide handles, passed explicitly.
//!
//! A [`Context`] is built once at start-up and cloned into whatever needs
//! it: the background worker, the intake/status/cleanup calls of the
//! request-serving layer, the CLI. Nothing in the crate reaches for a
//! global; tests build a context over an in-memory database and mock
//! collaborators.

use crate::config::ExplainerConfig;
use crate::error::ExplainerError;
use crate::pipeline::dispatch::BatchDispatcher;
use crate::pipeline::extract::{DocumentExtractor, PageExtractor};
use crate::pipeline::llm::{client_from_config, GenerationClient};
use crate::pipeline::render::OutputStore;
use crate::store::{jobs, Database, Job, JobStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Configuration plus every collaborator the operations need.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<ExplainerConfig>,
    pub store: JobStore,
    pub generator: Arc<dyn GenerationClient>,
    pub extractor: Arc<dyn PageExtractor>,
    pub outputs: OutputStore,
}

impl Context {
    /// Assemble a context from explicit parts.
    pub fn new(
        config: ExplainerConfig,
        store: JobStore,
        generator: Arc<dyn GenerationClient>,
        extractor: Arc<dyn PageExtractor>,
    ) -> Self {
        let outputs = OutputStore::new(config.outputs_dir.clone());
        Self {
            config: Arc::new(config),
            store,
            generator,
            extractor,
            outputs,
        }
    }

    /// Open the database at `config.database_path` and build the generation
    /// client and document extractor the configuration asks for.
    pub fn open(config: ExplainerConfig) -> Result<Self, ExplainerError> {
        let db = Database::open(&config.database_path)?;
        let generator = client_from_config(&config)?;
        info!(
            "Context ready: db={}, client={}, model={}",
            config.database_path.display(),
            generator.name(),
            config.model
        );
        Ok(Self::new(
            config,
            JobStore::new(db),
            generator,
            Arc::new(DocumentExtractor::new()),
        ))
    }

    /// Like [`Context::open`] but with a caller-supplied generation client.
    /// Intake, status and cleanup never call the client.
    pub fn open_with_client(
        config: ExplainerConfig,
        generator: Arc<dyn GenerationClient>,
    ) -> Result<Self, ExplainerError> {
        let db = Database::open(&config.database_path)?;
        Ok(Self::new(
            config,
            JobStore::new(db),
            generator,
            Arc::new(DocumentExtractor::new()),
        ))
    }

    /// A dispatcher over this context's client, with the configured policy,
    /// per-call timeout and default instruction.
    pub fn dispatcher(&self) -> BatchDispatcher {
        BatchDispatcher::new(Arc::clone(&self.generator))
            .with_policy(self.config.batch_policy)
            .with_timeout(Duration::from_secs(self.config.api_timeout_secs))
            .with_default_instruction(self.config.default_instruction.clone())
    }

    /// Where the upload of `job` is stored.
    pub fn upload_path(&self, job: &Job) -> PathBuf {
        self.config.uploads_dir.join(job.upload_name())
    }

    /// Where the upload of a job with this id and original name is stored.
    pub fn upload_path_for(&self, id: &jobs::JobId, original_filename: &str) -> PathBuf {
        self.config
            .uploads_dir
            .join(jobs::upload_name(id, original_filename))
    }
}
