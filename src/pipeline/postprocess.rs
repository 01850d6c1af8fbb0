//! Post-processing: deterministic cleanup of generated page text.
//!
//! ## Why is post-processing necessary?
//!
//! Chat models return text that is *fine to read in a chat window* but
//! awkward in a document:
//!
//! - The answer wrapped in a ` ``` ` fence
//! - Windows-style `\r\n` line endings
//! - Trailing spaces and long runs of blank lines
//! - Zero-width spaces and BOMs copied from the source deck
//!
//! The rules below fix those quirks without touching the wording. They run
//! only in the human-readable renderers (`txt`, `md`, `docx`, `pdf`); the
//! JSON artifact keeps the service's text exactly as returned so that every
//! other format can be rebuilt from it.
//!
//! ## Rule Order
//!
//! Fences are stripped first so the line rules see the inner text; invisible
//! characters go before the final trim so a page made of nothing but a BOM
//! ends up empty.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to one page of generated text.
///
/// Rules (applied in order):
/// 1. Strip an outer code fence (with or without a language tag)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 1
/// 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 6. Trim leading and trailing blank lines
pub fn clean_page(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    trim_blank_edges(&s)
}

// ── Rule 1: Strip outer code fence ───────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}

// ── Rule 5: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 6: Trim blank edges ─────────────────────────────────────────────────

fn trim_blank_edges(input: &str) -> String {
    input.trim_matches('\n').to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────
