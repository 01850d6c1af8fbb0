//! Prompt construction for page rewriting.
//!
//! Every prompt lives here so that changing the default wording means
//! editing exactly one place, and so tests can pin the rendered text
//! without a remote service.
//!
//! A prompt has three parts, one per line:
//!
//! ```text
//! Rewrite the following page in a better way:
//! Page number: 3
//! <page text, verbatim>
//! ```
//!
//! The unit label follows the instruction: an instruction that talks about
//! slides gets `Slide number:`, anything else gets `Page number:`.

/// Instruction used when the job carries no custom instruction.
pub const DEFAULT_INSTRUCTION: &str = "Rewrite the following page in a better way:";

/// System message sent with every chat-completion request.
pub const SYSTEM_MESSAGE: &str = "You are a helpful assistant.";

/// Build the prompt for one page.
///
/// `instruction` falls back to [`DEFAULT_INSTRUCTION`] when absent or blank.
/// The page text is appended as-is: no truncation, no escaping.
pub fn build_prompt(page_text: &str, page_number: usize, instruction: Option<&str>) -> String {
    let instruction = instruction
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .unwrap_or(DEFAULT_INSTRUCTION);

    format!(
        "{instruction}\n{} number: {page_number}\n{page_text}",
        unit_label(instruction)
    )
}

/// `"Slide"` when the instruction mentions slides, `"Page"` otherwise.
pub fn unit_label(instruction: &str) -> &'static str {
    if instruction.to_lowercase().contains("slide") {
        "Slide"
    } else {
        "Page"
    }
}
