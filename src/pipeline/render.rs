//! Output persistence: render page results and own the outputs directory.
//!
//! ## Why JSON first?
//!
//! The worker always persists `<outputs>/<job id>.json`. It is the lossless
//! record of the batch (page numbers, raw generated text, attached errors)
//! and every other format is derived from it on demand by
//! [`OutputStore::artifact`]. Text formats run the generated content through
//! [`crate::pipeline::postprocess::clean_page`]; JSON keeps it verbatim.
//!
//! ## Why atomic writes?
//!
//! A reader polling for a finished job must never see half a file. Every
//! artifact is written to `<name>.<ext>.tmp` next to its destination and
//! renamed into place.

use crate::config::PageSeparator;
use crate::error::RenderError;
use crate::output::PageResult;
use crate::pipeline::postprocess::clean_page;
use lopdf::{dictionary, Document, Object, Stream};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Output formats, selected by destination extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Txt,
    Md,
    Docx,
    Pdf,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Json,
        OutputFormat::Txt,
        OutputFormat::Md,
        OutputFormat::Docx,
        OutputFormat::Pdf,
    ];

    pub fn from_extension(ext: &str) -> Result<Self, RenderError> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "txt" => Ok(OutputFormat::Txt),
            "md" | "markdown" => Ok(OutputFormat::Md),
            "docx" => Ok(OutputFormat::Docx),
            "pdf" => Ok(OutputFormat::Pdf),
            other => Err(RenderError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, RenderError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Self::from_extension(ext)
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Txt => "txt",
            OutputFormat::Md => "md",
            OutputFormat::Docx => "docx",
            OutputFormat::Pdf => "pdf",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Render page results into the bytes of one artifact.
pub fn render(
    results: &[PageResult],
    format: OutputFormat,
    separator: &PageSeparator,
) -> Result<Vec<u8>, RenderError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_vec_pretty(results)?),
        OutputFormat::Txt => Ok(render_txt(results).into_bytes()),
        OutputFormat::Md => Ok(render_markdown(results, separator).into_bytes()),
        OutputFormat::Docx => render_docx(results),
        OutputFormat::Pdf => render_pdf(results),
    }
}

fn cleaned(results: &[PageResult]) -> Vec<String> {
    results.iter().map(|r| clean_page(&r.content)).collect()
}

/// Page contents separated by a blank line.
pub fn render_txt(results: &[PageResult]) -> String {
    cleaned(results).join("\n\n")
}

/// Page contents joined by `separator`, ending with a newline.
pub fn render_markdown(results: &[PageResult], separator: &PageSeparator) -> String {
    let mut out = String::new();
    for (i, (result, text)) in results.iter().zip(cleaned(results)).enumerate() {
        if i > 0 {
            out.push_str(&separator.render(result.page_number));
        }
        out.push_str(&text);
    }
    out.push('\n');
    out
}

// ── DOCX ─────────────────────────────────────────────────────────────────

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;

const PACKAGE_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#;

/// Minimal WordprocessingML package: one paragraph per line, a page break
/// between pages.
pub fn render_docx(results: &[PageResult]) -> Result<Vec<u8>, RenderError> {
    let mut body = String::new();
    for (i, text) in cleaned(results).iter().enumerate() {
        if i > 0 {
            body.push_str(r#"<w:p><w:r><w:br w:type="page"/></w:r></w:p>"#);
        }
        for line in text.lines() {
            body.push_str(&format!(
                r#"<w:p><w:r><w:t xml:space="preserve">{}</w:t></w:r></w:p>"#,
                quick_xml::escape::escape(line)
            ));
        }
    }
    let document = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
    );

    let docx_err = |e: &dyn fmt::Display| RenderError::Docx(e.to_string());
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in [
        ("[Content_Types].xml", CONTENT_TYPES_XML),
        ("_rels/.rels", PACKAGE_RELS_XML),
        ("word/document.xml", document.as_str()),
    ] {
        zip.start_file(name, options).map_err(|e| docx_err(&e))?;
        zip.write_all(contents.as_bytes()).map_err(|e| docx_err(&e))?;
    }
    let cursor = zip.finish().map_err(|e| docx_err(&e))?;
    Ok(cursor.into_inner())
}

// ── PDF ──────────────────────────────────────────────────────────────────

const PDF_LINES_PER_PAGE: usize = 50;
const PDF_LINE_WIDTH: usize = 90;

/// Letter-size pages in Helvetica. Every result page starts a new PDF page
/// and overflows onto further pages after [`PDF_LINES_PER_PAGE`] lines.
pub fn render_pdf(results: &[PageResult]) -> Result<Vec<u8>, RenderError> {
    let mut doc = Document::with_version("1.5");

    let pages_id = doc.new_object_id();
    let font_id = doc.new_object_id();
    let resources_id = doc.new_object_id();

    doc.objects.insert(
        font_id,
        Object::Dictionary(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        }),
    );
    doc.objects.insert(
        resources_id,
        Object::Dictionary(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        }),
    );

    let mut chunks: Vec<Vec<String>> = Vec::new();
    for text in cleaned(results) {
        let lines: Vec<String> = text
            .lines()
            .flat_map(|l| wrap_line(l, PDF_LINE_WIDTH))
            .collect();
        if lines.is_empty() {
            chunks.push(Vec::new());
        } else {
            chunks.extend(lines.chunks(PDF_LINES_PER_PAGE).map(|c| c.to_vec()));
        }
    }
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }

    let mut page_ids = Vec::with_capacity(chunks.len());
    for lines in &chunks {
        let content_id = doc.new_object_id();
        let page_id = doc.new_object_id();

        let content = format_text_for_pdf(lines);
        doc.objects.insert(
            content_id,
            Object::Stream(Stream::new(dictionary! {}, content.into_bytes())),
        );
        doc.objects.insert(
            page_id,
            Object::Dictionary(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Resources" => resources_id,
                "Contents" => content_id,
            }),
        );
        page_ids.push(page_id);
    }

    let kids: Vec<Object> = page_ids.iter().map(|id| (*id).into()).collect();
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_ids.len() as i64,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| RenderError::Pdf(e.to_string()))?;
    Ok(buffer)
}

fn format_text_for_pdf(lines: &[String]) -> String {
    let mut content = String::from("BT\n/F1 11 Tf\n50 742 Td\n14 TL\n");
    for line in lines {
        content.push_str(&format!("({}) Tj T*\n", escape_pdf_string(line)));
    }
    content.push_str("ET\n");
    content
}

/// Helvetica via the standard encoding: non-ASCII becomes a space.
fn escape_pdf_string(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '(' => "\\(".to_string(),
            ')' => "\\)".to_string(),
            '\\' => "\\\\".to_string(),
            c if c.is_ascii() && !c.is_control() => c.to_string(),
            _ => " ".to_string(),
        })
        .collect()
}

/// Greedy word wrap; words longer than `width` are split.
fn wrap_line(line: &str, width: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in line.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            out.push(word.drain(..width).collect());
        }
        let word: String = word.into_iter().collect();
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() || out.is_empty() {
        out.push(current);
    }
    out
}

// ── Output store ─────────────────────────────────────────────────────────

/// Owns the outputs directory: `<dir>/<job id>.<format>`.
#[derive(Debug, Clone)]
pub struct OutputStore {
    dir: PathBuf,
    separator: PageSeparator,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            separator: PageSeparator::default(),
        }
    }

    pub fn with_separator(mut self, separator: PageSeparator) -> Self {
        self.separator = separator;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the artifact of `job_id` in `format` lives (whether or not it exists).
    pub fn path_for(&self, job_id: &str, format: OutputFormat) -> PathBuf {
        self.dir.join(format!("{job_id}.{}", format.extension()))
    }

    /// Render `results` to `destination`, choosing the format by extension.
    ///
    /// Uses atomic write (temp file + rename) to prevent partial files.
    pub async fn persist(
        &self,
        results: &[PageResult],
        destination: &Path,
    ) -> Result<PathBuf, RenderError> {
        let format = OutputFormat::from_path(destination)?;
        let bytes = render(results, format, &self.separator)?;
        write_atomic(destination, &bytes).await?;
        debug!(
            "Wrote {} ({} pages, {} bytes)",
            destination.display(),
            results.len(),
            bytes.len()
        );
        Ok(destination.to_path_buf())
    }

    /// Persist the canonical JSON artifact of a job.
    pub async fn persist_job(
        &self,
        job_id: &str,
        results: &[PageResult],
    ) -> Result<PathBuf, RenderError> {
        self.persist(results, &self.path_for(job_id, OutputFormat::Json))
            .await
    }

    /// Load the page results of a job. `Ok(None)` when nothing was persisted.
    pub async fn load(&self, job_id: &str) -> Result<Option<Vec<PageResult>>, RenderError> {
        let path = self.path_for(job_id, OutputFormat::Json);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RenderError::Read { path, source: e }),
        }
    }

    /// Path of a job's artifact in `format`, rendering it from the JSON
    /// artifact on first request. `Ok(None)` when the job has no output yet.
    pub async fn artifact(
        &self,
        job_id: &str,
        format: OutputFormat,
    ) -> Result<Option<PathBuf>, RenderError> {
        let path = self.path_for(job_id, format);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Some(path));
        }
        if format == OutputFormat::Json {
            return Ok(None);
        }
        match self.load(job_id).await? {
            Some(results) => Ok(Some(self.persist(&results, &path).await?)),
            None => Ok(None),
        }
    }

    /// Delete every artifact of a job. Returns how many files were removed.
    pub async fn remove(&self, job_id: &str) -> Result<usize, RenderError> {
        let mut removed = 0;
        for format in OutputFormat::ALL {
            let path = self.path_for(job_id, format);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(RenderError::Write { path, source: e }),
            }
        }
        Ok(removed)
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RenderError> {
    let write_err = |e| RenderError::Write {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn results(texts: &[&str]) -> Vec<PageResult> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut r = PageResult::placeholder(i + 1);
                r.content = t.to_string();
                r
            })
            .collect()
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(OutputFormat::from_extension("JSON").unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_extension(".md").unwrap(), OutputFormat::Md);
        assert!(matches!(
            OutputFormat::from_extension("html"),
            Err(RenderError::UnsupportedFormat(_))
        ));
        assert!(OutputFormat::from_path(Path::new("no_extension")).is_err());
    }

    #[test]
    fn json_is_ordered_page_list() {
        let bytes = render(&results(&["a", "b"]), OutputFormat::Json, &PageSeparator::default())
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!([
                {"page_number": 1, "content": "a"},
                {"page_number": 2, "content": "b"}
            ])
        );
    }

    #[test]
    fn txt_joins_pages_with_blank_line() {
        assert_eq!(render_txt(&results(&["first\r\n", "```\nsecond\n```"])), "first\n\nsecond");
    }

    #[test]
    fn markdown_uses_separator() {
        let md = render_markdown(&results(&["a", "b"]), &PageSeparator::Comment);
        assert_eq!(md, "a\n\n<!-- page 2 -->\n\nb\n");
    }

    #[test]
    fn docx_contains_escaped_text_and_page_break() {
        let bytes = render_docx(&results(&["Q&A <intro>", "next"])).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .unwrap()
            .read_to_string(&mut xml)
            .unwrap();
        assert!(xml.contains("Q&amp;A &lt;intro&gt;"));
        assert!(xml.contains(r#"<w:br w:type="page"/>"#));
        assert!(archive.by_name("[Content_Types].xml").is_ok());
    }

    #[test]
    fn pdf_has_one_page_per_short_result() {
        let bytes = render_pdf(&results(&["one", "two", "three"])).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn pdf_long_page_overflows() {
        let long = (0..120).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let bytes = render_pdf(&results(&[long.as_str()])).unwrap();
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 3);
    }

    #[test]
    fn pdf_of_nothing_is_still_a_document() {
        let bytes = render_pdf(&[]).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));
    }

    #[test]
    fn escape_pdf_string_handles_specials() {
        assert_eq!(escape_pdf_string("a(b)c\\"), "a\\(b\\)c\\\\");
        assert_eq!(escape_pdf_string("café"), "caf ");
    }

    #[test]
    fn wrap_line_respects_width() {
        assert_eq!(wrap_line("aa bb cc", 5), vec!["aa bb", "cc"]);
        assert_eq!(wrap_line("abcdefgh", 3), vec!["abc", "def", "gh"]);
        assert_eq!(wrap_line("", 10), vec![""]);
    }

    #[tokio::test]
    async fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path().join("outputs"));
        let path = store.persist_job("job-1", &results(&["x", "y"])).await.unwrap();

        assert_eq!(path, dir.path().join("outputs").join("job-1.json"));
        assert!(!dir.path().join("outputs").join("job-1.json.tmp").exists());
        let loaded = store.load("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content, "y");
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn artifact_is_rendered_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        assert!(store.artifact("j", OutputFormat::Txt).await.unwrap().is_none());

        store.persist_job("j", &results(&["hello", "world"])).await.unwrap();
        let txt = store.artifact("j", OutputFormat::Txt).await.unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(txt).unwrap(), "hello\n\nworld");

        assert_eq!(store.remove("j").await.unwrap(), 2);
        assert!(store.artifact("j", OutputFormat::Json).await.unwrap().is_none());
    }
}
