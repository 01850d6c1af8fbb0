//! Status queries and result retrieval.

use crate::context::Context;
use crate::error::ExplainerError;
use crate::output::PageResult;
use crate::pipeline::render::OutputFormat;
use crate::store::JobState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Everything a client is told about one upload.
///
/// `explanation` is only populated once the job is `done`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uid: String,
    pub status: JobState,
    pub filename: String,
    pub upload_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Vec<PageResult>>,
}

/// Status of a job. Unknown ids yield `Ok(None)`.
pub async fn query(ctx: &Context, id: &str) -> Result<Option<StatusReport>, ExplainerError> {
    let Some(job) = ctx.store.get(id)? else {
        return Ok(None);
    };

    let explanation = if job.is_done() {
        ctx.outputs.load(job.id.as_str()).await?
    } else {
        None
    };

    Ok(Some(StatusReport {
        uid: job.id.to_string(),
        status: job.state,
        filename: job.original_filename,
        upload_time: job.created_at,
        finish_time: job.completed_at,
        explanation,
    }))
}

/// Path of a finished job's output in `format`, rendered from the stored
/// JSON on first request.
///
/// `Ok(None)` while the job is still pending or its output is missing;
/// [`ExplainerError::JobNotFound`] for unknown ids.
pub async fn output_artifact(
    ctx: &Context,
    id: &str,
    format: OutputFormat,
) -> Result<Option<PathBuf>, ExplainerError> {
    let job = ctx
        .store
        .get(id)?
        .ok_or_else(|| ExplainerError::JobNotFound(id.to_string()))?;

    if !job.is_done() {
        return Ok(None);
    }
    Ok(ctx.outputs.artifact(job.id.as_str(), format).await?)
}
