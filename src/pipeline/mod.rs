//! Pipeline stages for rewriting a document page by page.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the worker and the one-shot converter can share them.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ dispatch ──▶ llm (×N) ──▶ render
//! (pdf/pptx)  (JoinSet)    (remote)     (json/txt/md/docx/pdf)
//! ```
//!
//! 1. [`extract`] : read page texts; blocking readers run in `spawn_blocking`
//! 2. [`dispatch`]: fan pages out concurrently, reassemble by page number,
//!    apply the batch failure policy
//! 3. [`llm`]     : one remote call per page; the only stage with network I/O
//! 4. [`render`]  : write artifacts atomically; [`postprocess`] cleans text
//!    for the human-readable formats

pub mod dispatch;
pub mod extract;
pub mod llm;
pub mod postprocess;
pub mod render;
