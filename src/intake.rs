//! Intake: accept an upload and queue it as a pending job.
//!
//! The record is created first and the file placed second. If placing the
//! file fails the record is deleted again, so the worker never sees a job
//! whose upload does not exist and no file is left without a record.

use crate::context::Context;
use crate::error::{ExplainerError, ExtractionError};
use crate::store::JobId;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// An uploaded document and its submission options.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Name as supplied by the client. Only the final path component is kept.
    pub filename: String,
    pub bytes: Vec<u8>,
    pub owner_email: Option<String>,
    pub instruction: Option<String>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
            owner_email: None,
            instruction: None,
        }
    }

    /// Read a local file as an upload named after it.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ExplainerError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ExtractionError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(filename, bytes))
    }

    pub fn with_owner(mut self, email: impl Into<String>) -> Self {
        self.owner_email = Some(email.into());
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }
}

/// Strip directories from a client-supplied name (`../../x.pdf` → `x.pdf`).
fn sanitise_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}

/// Validate an upload, create its `pending` job and store the file as
/// `<uploads>/<job id><ext>`.
pub async fn submit(ctx: &Context, upload: Upload) -> Result<JobId, ExplainerError> {
    let config = &ctx.config;

    let filename = sanitise_filename(&upload.filename).ok_or_else(|| {
        ExplainerError::UnsupportedFile {
            filename: upload.filename.clone(),
            allowed: config.allowed_extensions.join(", "),
        }
    })?;

    if !config.accepts(&filename) {
        return Err(ExplainerError::UnsupportedFile {
            filename,
            allowed: config.allowed_extensions.join(", "),
        });
    }

    let size = upload.bytes.len() as u64;
    if size > config.max_upload_bytes {
        return Err(ExplainerError::UploadTooLarge {
            size,
            limit: config.max_upload_bytes,
        });
    }

    let id = ctx.store.create(
        &filename,
        upload.owner_email.as_deref(),
        upload.instruction.as_deref(),
    )?;

    let destination = ctx.upload_path_for(&id, &filename);
    if let Err(source) = place_file(&destination, &upload.bytes).await {
        warn!(job_id = %id, error = %source, "failed to store upload, withdrawing job");
        if let Err(e) = ctx.store.delete(id.as_str()) {
            warn!(job_id = %id, error = %e, "failed to withdraw job record");
        }
        return Err(ExplainerError::UploadWrite {
            path: destination,
            source,
        });
    }

    info!(job_id = %id, filename = %filename, bytes = size, "upload accepted");
    Ok(id)
}

/// Write to a temp name in the uploads directory, then rename into place.
async fn place_file(destination: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = destination.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, destination).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
