//! Progress-callback trait for per-page batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::pipeline::dispatch::BatchDispatcher::with_progress`] to receive
//! events as the dispatcher fans out a document's pages.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a terminal progress bar, a log line, or a status record
//! without the library knowing how the host application communicates. The
//! trait is `Send + Sync` because page calls run as concurrent tasks.
//!
//! # Example
//!
//! ```rust
//! use page_explainer::BatchProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page_num, total_pages, content_len);
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the batch dispatcher as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// `on_page_start`, `on_page_complete` and `on_page_error` are called from
/// the page tasks and may run concurrently. Implementations must protect
/// shared mutable state (e.g. `Mutex`, `AtomicUsize`).
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any page is dispatched.
    fn on_batch_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before the remote call for a page is sent.
    ///
    /// Blank pages never reach the service and get no start event.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page produced text (including blank-page placeholders).
    ///
    /// # Arguments
    /// * `page_num`   : 1-indexed page number
    /// * `total_pages`: pages in the batch
    /// * `content_len`: byte length of the produced text
    fn on_page_complete(&self, page_num: usize, total_pages: usize, content_len: usize) {
        let _ = (page_num, total_pages, content_len);
    }

    /// Called when a page failed, at the transport level or with a service
    /// error body.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called once after every page has been attempted, before the batch
    /// policy is applied.
    ///
    /// # Arguments
    /// * `total_pages`  : pages in the batch
    /// * `success_count`: pages without error
    fn on_batch_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type held by the dispatcher.
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
