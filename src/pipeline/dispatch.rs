//! Batch dispatch: fan one document's pages out to the generation client.
//!
//! ## Why a `JoinSet`?
//!
//! Every non-blank page becomes its own task, all launched at once, and the
//! set is joined before anything is returned. Completion order is
//! irrelevant: each task reports its page number and results are placed by
//! position. A panicking page task is caught and reported as a failure of
//! *that* page; its siblings keep running.
//!
//! ## Failure policy
//!
//! Joining produces one [`PageOutcome`] per page. What a failure means for
//! the batch is decided afterwards, in one place, by [`BatchPolicy::apply`]:
//!
//! | Policy | Transport failure on any page |
//! |--------|-------------------------------|
//! | [`BatchPolicy::AllOrNothing`] | empty result; caller keeps the job pending |
//! | [`BatchPolicy::Partial`] | failed pages kept with `error` set |
//!
//! Service error bodies are not transport failures: those pages complete
//! with the error attached under either policy.

use crate::config::BatchPolicy;
use crate::error::{PageError, TransportError};
use crate::output::PageResult;
use crate::pipeline::llm::GenerationClient;
use crate::progress::ProgressCallback;
use crate::prompts::build_prompt;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Result of one page before the batch policy is applied.
pub type PageOutcome = Result<PageResult, PageError>;

/// Concurrent fan-out of page prompts over a [`GenerationClient`].
#[derive(Clone)]
pub struct BatchDispatcher {
    client: Arc<dyn GenerationClient>,
    policy: BatchPolicy,
    call_timeout: Option<Duration>,
    default_instruction: Option<String>,
    progress: Option<ProgressCallback>,
}

impl BatchDispatcher {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self {
            client,
            policy: BatchPolicy::default(),
            call_timeout: None,
            default_instruction: None,
            progress: None,
        }
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bound every remote call; an overrun becomes [`TransportError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Instruction for batches that carry none of their own.
    pub fn with_default_instruction(mut self, instruction: Option<String>) -> Self {
        self.default_instruction = instruction;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn policy(&self) -> BatchPolicy {
        self.policy
    }

    /// Rewrite every page and return the results in page order.
    ///
    /// The result has one entry per input page, or is empty when the
    /// all-or-nothing policy saw a transport failure.
    pub async fn process_batch(
        &self,
        pages: &[String],
        instruction: Option<&str>,
    ) -> Vec<PageResult> {
        let outcomes = self.collect_outcomes(pages, instruction).await;
        self.policy.apply(outcomes)
    }

    /// Run every page and return one outcome per page, in page order,
    /// without applying the batch policy.
    pub async fn collect_outcomes(
        &self,
        pages: &[String],
        instruction: Option<&str>,
    ) -> Vec<PageOutcome> {
        let total = pages.len();
        let instruction = instruction
            .filter(|i| !i.trim().is_empty())
            .or(self.default_instruction.as_deref());

        if let Some(ref cb) = self.progress {
            cb.on_batch_start(total);
        }

        let mut slots: Vec<Option<PageOutcome>> = (0..total).map(|_| None).collect();
        let mut tasks = JoinSet::new();

        for (idx, text) in pages.iter().enumerate() {
            let page_number = idx + 1;

            // Blank pages never reach the service.
            if text.trim().is_empty() {
                debug!("Page {}: blank, using placeholder", page_number);
                let result = PageResult::placeholder(page_number);
                if let Some(ref cb) = self.progress {
                    cb.on_page_complete(page_number, total, result.content.len());
                }
                slots[idx] = Some(Ok(result));
                continue;
            }

            let prompt = build_prompt(text, page_number, instruction);
            let client = Arc::clone(&self.client);
            let progress = self.progress.clone();
            let call_timeout = self.call_timeout;

            tasks.spawn(async move {
                if let Some(ref cb) = progress {
                    cb.on_page_start(page_number, total);
                }

                let outcome = AssertUnwindSafe(run_page(
                    client.as_ref(),
                    page_number,
                    &prompt,
                    call_timeout,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(PageError::Transport {
                        page: page_number,
                        source: TransportError::TaskFailed {
                            page: page_number,
                            detail: panic_message(panic.as_ref()),
                        },
                    })
                });

                if let Some(ref cb) = progress {
                    match &outcome {
                        Ok(result) => match &result.error {
                            None => cb.on_page_complete(page_number, total, result.content.len()),
                            Some(e) => cb.on_page_error(page_number, total, &e.to_string()),
                        },
                        Err(e) => cb.on_page_error(page_number, total, &e.to_string()),
                    }
                }

                (page_number, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page_number, outcome)) => slots[page_number - 1] = Some(outcome),
                // The page number of an aborted task is recovered below.
                Err(e) => warn!("Page task did not complete: {}", e),
            }
        }

        let outcomes: Vec<PageOutcome> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    Err(PageError::Transport {
                        page: idx + 1,
                        source: TransportError::TaskFailed {
                            page: idx + 1,
                            detail: "task was cancelled".to_string(),
                        },
                    })
                })
            })
            .collect();

        if let Some(ref cb) = self.progress {
            let ok = outcomes
                .iter()
                .filter(|o| matches!(o, Ok(r) if r.is_ok()))
                .count();
            cb.on_batch_complete(total, ok);
        }

        outcomes
    }
}

/// One remote call for one page.
async fn run_page(
    client: &dyn GenerationClient,
    page_number: usize,
    prompt: &str,
    call_timeout: Option<Duration>,
) -> PageOutcome {
    let start = Instant::now();

    let call = client.generate(prompt);
    let result = match call_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout {
                secs: limit.as_secs(),
            }),
        },
        None => call.await,
    };

    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(generation) => {
            debug!(
                "Page {}: {} input tokens, {} output tokens, {}ms",
                page_number, generation.input_tokens, generation.output_tokens, duration_ms
            );
            let result = PageResult::from_generation(page_number, generation, duration_ms);
            if let Some(ref e) = result.error {
                warn!("{}", e);
            }
            Ok(result)
        }
        Err(source) => {
            let err = PageError::Transport {
                page: page_number,
                source,
            };
            warn!("{}", err);
            Err(err)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl BatchPolicy {
    /// Turn per-page outcomes into the batch result.
    ///
    /// Outcomes must already be in page order; the order is preserved.
    pub fn apply(self, outcomes: Vec<PageOutcome>) -> Vec<PageResult> {
        match self {
            BatchPolicy::AllOrNothing => {
                if let Some(e) = outcomes
                    .iter()
                    .find_map(|o| o.as_ref().err().filter(|e| e.is_transport()))
                {
                    warn!("Discarding batch of {} pages: {}", outcomes.len(), e);
                    return Vec::new();
                }
                outcomes
                    .into_iter()
                    .map(|o| o.unwrap_or_else(PageResult::failed))
                    .collect()
            }
            BatchPolicy::Partial => outcomes
                .into_iter()
                .map(|o| o.unwrap_or_else(PageResult::failed))
                .collect(),
        }
    }
}
