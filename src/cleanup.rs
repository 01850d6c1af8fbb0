//! Explicit removal of jobs and users together with their files.
//!
//! Files are never deleted implicitly: a finished job keeps its upload and
//! outputs until one of these calls removes them.

use crate::context::Context;
use crate::error::ExplainerError;
use crate::store::Job;
use tracing::{info, warn};

/// What a removal deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Removal {
    pub jobs: usize,
    pub files: usize,
}

/// Delete a job record, its upload and all its output artifacts.
///
/// `Ok(None)` for unknown ids.
pub async fn remove_job(ctx: &Context, id: &str) -> Result<Option<Removal>, ExplainerError> {
    let Some(job) = ctx.store.get(id)? else {
        return Ok(None);
    };

    ctx.store.delete(job.id.as_str())?;
    let files = remove_files(ctx, &job).await?;
    info!(job_id = %job.id, files, "job removed");

    Ok(Some(Removal { jobs: 1, files }))
}

/// Delete a user; their jobs go with them (database cascade), and so do the
/// jobs' files.
///
/// `Ok(None)` for unknown emails.
pub async fn remove_user(ctx: &Context, email: &str) -> Result<Option<Removal>, ExplainerError> {
    let Some(jobs) = ctx.store.delete_user(email)? else {
        return Ok(None);
    };

    let mut removal = Removal {
        jobs: jobs.len(),
        files: 0,
    };
    for job in &jobs {
        removal.files += remove_files(ctx, job).await?;
    }
    info!(email = %email, jobs = removal.jobs, files = removal.files, "user removed");

    Ok(Some(removal))
}

async fn remove_files(ctx: &Context, job: &Job) -> Result<usize, ExplainerError> {
    let mut files = ctx.outputs.remove(job.id.as_str()).await?;

    let upload = ctx.upload_path(job);
    match tokio::fs::remove_file(&upload).await {
        Ok(()) => files += 1,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job.id, path = %upload.display(), error = %e, "failed to delete upload"),
    }

    Ok(files)
}
