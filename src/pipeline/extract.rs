//! Extraction: turn an uploaded document into one text string per page.
//!
//! ## Why spawn_blocking?
//!
//! Both readers are synchronous: pdfium is a C++ library with thread-local
//! state, and unzipping a deck is plain blocking file I/O. [`extract_pages`]
//! moves the work onto tokio's blocking pool so the worker's runtime threads
//! never stall, and turns a panicking reader into an [`ExtractionError`]
//! instead of taking the worker down.
//!
//! ## Formats
//!
//! | Extension | Reader | Page unit |
//! |-----------|--------|-----------|
//! | `.pdf`  | [`PdfExtractor`] (pdfium) | one PDF page, text trimmed |
//! | `.pptx` | [`PptxExtractor`] (zip + quick-xml) | one slide, in presentation order |
//! | other   | none | no pages |
//!
//! Empty pages are kept as empty strings so page numbers always match the
//! source document.

use crate::error::ExtractionError;
use pdfium_render::prelude::*;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Reads a document into page texts.
///
/// Implementations are blocking; call them through [`extract_pages`].
pub trait PageExtractor: Send + Sync {
    /// Ordered page texts. An unsupported document yields `Ok(vec![])`.
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, ExtractionError>;
}

/// Run an extractor on the blocking pool.
pub async fn extract_pages(
    extractor: Arc<dyn PageExtractor>,
    path: &Path,
) -> Result<Vec<String>, ExtractionError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || extractor.extract_pages(&path))
        .await
        .map_err(|e| ExtractionError::Panicked(e.to_string()))?
}

/// Selects a reader by file extension.
#[derive(Debug, Default, Clone)]
pub struct DocumentExtractor {
    pdf: PdfExtractor,
    pptx: PptxExtractor,
}

impl DocumentExtractor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageExtractor for DocumentExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        if !path.exists() {
            return Err(ExtractionError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        let pages = match ext.as_deref() {
            Some("pdf") => self.pdf.extract_pages(path)?,
            Some("pptx") => self.pptx.extract_pages(path)?,
            _ => {
                debug!("No reader for '{}', treating as empty", path.display());
                Vec::new()
            }
        };

        info!("Extracted {} pages from '{}'", pages.len(), path.display());
        Ok(pages)
    }
}

// ── PDF ──────────────────────────────────────────────────────────────────

/// Reads the text layer of every PDF page through pdfium.
///
/// The library is loaded from `PDFIUM_LIB_PATH` (a file or the directory
/// containing it) when set, otherwise from the system library path.
#[derive(Debug, Default, Clone)]
pub struct PdfExtractor {
    library_path: Option<PathBuf>,
}

impl PdfExtractor {
    /// Bind to a specific pdfium library file or directory.
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }

    fn bind(&self) -> Result<Pdfium, ExtractionError> {
        let configured = self
            .library_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match configured {
            Some(path) => {
                let path = if path.is_dir() {
                    Pdfium::pdfium_platform_library_name_at_path(&path)
                } else {
                    path
                };
                Pdfium::bind_to_library(&path)
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| ExtractionError::PdfiumUnavailable(format!("{:?}", e)))?;

        Ok(Pdfium::new(bindings))
    }
}

impl PageExtractor for PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let pdfium = self.bind()?;

        let document =
            pdfium
                .load_pdf_from_file(path, None)
                .map_err(|e| ExtractionError::Malformed {
                    path: path.to_path_buf(),
                    detail: format!("{:?}", e),
                })?;

        let mut pages = Vec::with_capacity(document.pages().len() as usize);
        for (idx, page) in document.pages().iter().enumerate() {
            let text = page.text().map_err(|e| ExtractionError::Malformed {
                path: path.to_path_buf(),
                detail: format!("page {}: {:?}", idx + 1, e),
            })?;
            pages.push(text.all().trim().to_string());
        }

        Ok(pages)
    }
}

// ── PPTX ─────────────────────────────────────────────────────────────────

/// Reads slide text from the slide parts of a deck.
///
/// Slides come in the order of the deck's `<p:sldIdLst>`, resolved through
/// `ppt/_rels/presentation.xml.rels`. A package without that list falls
/// back to the `slideN` part number.
///
/// Each text run is trimmed, runs are concatenated per paragraph, and
/// paragraphs are joined with `\n`.
#[derive(Debug, Default, Clone)]
pub struct PptxExtractor;

impl PageExtractor for PptxExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<String>, ExtractionError> {
        let malformed = |detail: String| ExtractionError::Malformed {
            path: path.to_path_buf(),
            detail,
        };

        let file = std::fs::File::open(path).map_err(|e| ExtractionError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| malformed(format!("not a zip package: {e}")))?;

        let slides = match presentation_order(&mut archive).map_err(malformed)? {
            Some(order) => order,
            None => {
                debug!("No slide list in '{}', using part numbers", path.display());
                numeric_order(&archive)
            }
        };

        let mut pages = Vec::with_capacity(slides.len());
        for name in slides {
            let xml = read_part(&mut archive, &name)
                .map_err(malformed)?
                .ok_or_else(|| malformed(format!("{name}: part missing")))?;

            let text =
                parse_slide_xml(&xml).map_err(|detail| malformed(format!("{name}: {detail}")))?;
            pages.push(text);
        }

        Ok(pages)
    }
}

const PRESENTATION_PART: &str = "ppt/presentation.xml";
const PRESENTATION_RELS: &str = "ppt/_rels/presentation.xml.rels";

/// Slide part names as listed in `<p:sldIdLst>`.
///
/// `Ok(None)` when the package has no presentation part, no relationships,
/// or a list that names none of the slides actually present.
fn presentation_order<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Option<Vec<String>>, String> {
    let Some(presentation) = read_part(archive, PRESENTATION_PART)? else {
        return Ok(None);
    };
    let Some(rels) = read_part(archive, PRESENTATION_RELS)? else {
        return Ok(None);
    };

    let ids = slide_relationship_ids(&presentation)
        .map_err(|e| format!("{PRESENTATION_PART}: {e}"))?;
    let targets =
        relationship_targets(&rels).map_err(|e| format!("{PRESENTATION_RELS}: {e}"))?;

    let order: Vec<String> = ids
        .iter()
        .filter_map(|id| targets.get(id))
        .map(|target| resolve_target(target))
        .filter(|name| archive.file_names().any(|n| n == name))
        .collect();

    Ok(if order.is_empty() { None } else { Some(order) })
}

/// Fallback for packages without a slide list: `slideN` parts by `N`.
fn numeric_order<R: Read + Seek>(archive: &zip::ZipArchive<R>) -> Vec<String> {
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| slide_number(name).map(|n| (n, name.to_string())))
        .collect();
    slides.sort_by_key(|(n, _)| *n);
    slides.into_iter().map(|(_, name)| name).collect()
}

/// A part as text, or `None` if the package does not contain it.
fn read_part<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, String> {
    let mut part = match archive.by_name(name) {
        Ok(part) => part,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(format!("{name}: {e}")),
    };
    let mut xml = String::new();
    part.read_to_string(&mut xml)
        .map_err(|e| format!("{name}: {e}"))?;
    Ok(Some(xml))
}

/// `ppt/slides/slide12.xml` → `Some(12)`. Layouts, masters and rels do not match.
fn slide_number(name: &str) -> Option<u32> {
    name.strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

/// Relationship targets are relative to `ppt/` unless rooted.
fn resolve_target(target: &str) -> String {
    match target.strip_prefix('/') {
        Some(rooted) => rooted.to_string(),
        None => format!("ppt/{}", target.trim_start_matches("./")),
    }
}

/// The `r:id` of every `<p:sldId>`, in document order.
///
/// `sldId` also carries a plain numeric `id`; only the prefixed one names
/// a relationship.
fn slide_relationship_ids(xml: &str) -> Result<Vec<String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut ids = Vec::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"sldId" =>
            {
                if let Some(id) = attribute(e, |prefixed, local| prefixed && local == b"id") {
                    ids.push(id);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parsing error: {e}")),
            _ => {}
        }
    }
    Ok(ids)
}

/// `Id` → `Target` for every `<Relationship>`.
fn relationship_targets(xml: &str) -> Result<HashMap<String, String>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut targets = HashMap::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let id = attribute(e, |prefixed, local| !prefixed && local == b"Id");
                let target = attribute(e, |prefixed, local| !prefixed && local == b"Target");
                if let (Some(id), Some(target)) = (id, target) {
                    targets.insert(id, target);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parsing error: {e}")),
            _ => {}
        }
    }
    Ok(targets)
}

/// First attribute whose (has prefix, local name) satisfies `wanted`.
fn attribute(e: &BytesStart<'_>, wanted: impl Fn(bool, &[u8]) -> bool) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        let key = attr.key;
        wanted(key.prefix().is_some(), key.local_name().as_ref())
            .then(|| String::from_utf8_lossy(&attr.value).into_owned())
    })
}

fn parse_slide_xml(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut run = String::new();
    let mut in_paragraph = false;
    let mut in_text_element = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"p" => {
                    in_paragraph = true;
                    current.clear();
                }
                b"t" => {
                    in_text_element = true;
                    run.clear();
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => {
                    in_text_element = false;
                    current.push_str(run.trim());
                    run.clear();
                }
                b"p" => {
                    if in_paragraph {
                        paragraphs.push(std::mem::take(&mut current));
                        in_paragraph = false;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"p" {
                    paragraphs.push(String::new());
                }
            }
            Ok(Event::Text(e)) => {
                if in_text_element {
                    let decoded = e.decode().unwrap_or_default();
                    run.push_str(&decoded);
                }
            }
            // `&amp;`, `&#8217;` and friends arrive as separate events.
            Ok(Event::GeneralRef(e)) => {
                if in_text_element {
                    if let Ok(Some(ch)) = e.resolve_char_ref() {
                        run.push(ch);
                    } else if let Ok(name) = e.decode() {
                        if let Some(value) = resolve_predefined_entity(&name) {
                            run.push_str(value);
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parsing error: {e}")),
            _ => {}
        }
    }

    Ok(paragraphs.join("\n").trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn slide(paragraphs: &[&[&str]]) -> String {
        let body: String = paragraphs
            .iter()
            .map(|runs| {
                let runs: String = runs
                    .iter()
                    .map(|r| format!("<a:r><a:rPr lang=\"en-US\"/><a:t>{r}</a:t></a:r>"))
                    .collect();
                format!("<a:p>{runs}</a:p>")
            })
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <p:sld xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\" \
             xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\">\
             <p:cSld><p:spTree><p:sp><p:txBody>{body}</p:txBody></p:sp></p:spTree></p:cSld></p:sld>"
        )
    }

    fn write_deck(dir: &Path, slides: &[(&str, String)]) -> PathBuf {
        let path = dir.join("deck.pptx");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", options).unwrap();
        zip.write_all(b"<Types/>").unwrap();
        zip.start_file("ppt/slideLayouts/slideLayout1.xml", options).unwrap();
        zip.write_all(slide(&[&["layout text"]]).as_bytes()).unwrap();
        for (name, xml) in slides {
            zip.start_file(*name, options).unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn slide_numbers_are_parsed() {
        assert_eq!(slide_number("ppt/slides/slide1.xml"), Some(1));
        assert_eq!(slide_number("ppt/slides/slide12.xml"), Some(12));
        assert_eq!(slide_number("ppt/slides/_rels/slide1.xml.rels"), None);
        assert_eq!(slide_number("ppt/slideLayouts/slideLayout1.xml"), None);
    }

    fn presentation(rel_ids: &[&str]) -> String {
        let entries: String = rel_ids
            .iter()
            .enumerate()
            .map(|(i, rid)| format!("<p:sldId id=\"{}\" r:id=\"{rid}\"/>", 256 + i))
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <p:presentation xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" \
             xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
             <p:sldMasterIdLst><p:sldMasterId id=\"2147483648\" r:id=\"rId1\"/></p:sldMasterIdLst>\
             <p:sldIdLst>{entries}</p:sldIdLst></p:presentation>"
        )
    }

    fn presentation_rels(targets: &[(&str, &str)]) -> String {
        let entries: String = targets
            .iter()
            .map(|(id, target)| {
                format!(
                    "<Relationship Id=\"{id}\" \
                     Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slide\" \
                     Target=\"{target}\"/>"
                )
            })
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
             <Relationship Id=\"rId1\" \
             Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/slideMaster\" \
             Target=\"slideMasters/slideMaster1.xml\"/>{entries}</Relationships>"
        )
    }

    #[test]
    fn rel_targets_resolve_under_ppt() {
        assert_eq!(resolve_target("slides/slide3.xml"), "ppt/slides/slide3.xml");
        assert_eq!(resolve_target("/ppt/slides/slide3.xml"), "ppt/slides/slide3.xml");
    }

    #[test]
    fn slide_list_reads_prefixed_ids_only() {
        let xml = presentation(&["rId7", "rId2"]);
        assert_eq!(slide_relationship_ids(&xml).unwrap(), vec!["rId7", "rId2"]);
    }

    #[test]
    fn runs_are_trimmed_and_joined_per_paragraph() {
        let xml = slide(&[&["  Quarterly ", "results"], &["Revenue up"]]);
        assert_eq!(parse_slide_xml(&xml).unwrap(), "Quarterlyresults\nRevenue up");
    }

    #[test]
    fn entity_references_are_resolved() {
        let xml = slide(&[&["Q&amp;A", "&#8594;next"]]);
        assert_eq!(parse_slide_xml(&xml).unwrap(), "Q&A→next");
    }

    #[test]
    fn pptx_slides_follow_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_deck(
            dir.path(),
            &[
                ("ppt/slides/slide10.xml", slide(&[&["ten"]])),
                ("ppt/slides/slide2.xml", slide(&[&["two"]])),
                ("ppt/slides/slide1.xml", slide(&[&["one"]])),
            ],
        );

        let pages = PptxExtractor.extract_pages(&path).unwrap();
        assert_eq!(pages, vec!["one", "two", "ten"]);
    }

    #[test]
    fn pptx_slides_follow_presentation_order() {
        // Reordered deck: the part names no longer match the slide order.
        let dir = tempfile::tempdir().unwrap();
        let path = write_deck(
            dir.path(),
            &[
                ("ppt/presentation.xml", presentation(&["rId3", "rId4", "rId2"])),
                (
                    "ppt/_rels/presentation.xml.rels",
                    presentation_rels(&[
                        ("rId2", "slides/slide1.xml"),
                        ("rId3", "slides/slide2.xml"),
                        ("rId4", "/ppt/slides/slide10.xml"),
                    ]),
                ),
                ("ppt/slides/slide1.xml", slide(&[&["one"]])),
                ("ppt/slides/slide2.xml", slide(&[&["two"]])),
                ("ppt/slides/slide10.xml", slide(&[&["ten"]])),
            ],
        );

        let pages = PptxExtractor.extract_pages(&path).unwrap();
        assert_eq!(pages, vec!["two", "ten", "one"]);
    }

    #[test]
    fn slide_list_naming_absent_parts_falls_back_to_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_deck(
            dir.path(),
            &[
                ("ppt/presentation.xml", presentation(&["rId9"])),
                (
                    "ppt/_rels/presentation.xml.rels",
                    presentation_rels(&[("rId9", "slides/slide99.xml")]),
                ),
                ("ppt/slides/slide2.xml", slide(&[&["two"]])),
                ("ppt/slides/slide1.xml", slide(&[&["one"]])),
            ],
        );

        let pages = PptxExtractor.extract_pages(&path).unwrap();
        assert_eq!(pages, vec!["one", "two"]);
    }

    #[test]
    fn empty_slides_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_deck(
            dir.path(),
            &[
                ("ppt/slides/slide1.xml", slide(&[&["Intro"]])),
                ("ppt/slides/slide2.xml", slide(&[])),
                ("ppt/slides/slide3.xml", slide(&[&["Outro"]])),
            ],
        );

        let pages = DocumentExtractor::new().extract_pages(&path).unwrap();
        assert_eq!(pages, vec!["Intro", "", "Outro"]);
    }

    #[test]
    fn non_zip_pptx_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pptx");
        std::fs::write(&path, b"definitely not a zip").unwrap();
        let err = DocumentExtractor::new().extract_pages(&path).unwrap_err();
        assert!(matches!(err, ExtractionError::Malformed { .. }), "got: {err:?}");
    }

    #[test]
    fn unsupported_extension_yields_no_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(DocumentExtractor::new().extract_pages(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = DocumentExtractor::new()
            .extract_pages(Path::new("/nonexistent/deck.pptx"))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn extract_pages_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_deck(dir.path(), &[("ppt/slides/slide1.xml", slide(&[&["Hi"]]))]);
        let extractor: Arc<dyn PageExtractor> = Arc::new(DocumentExtractor::new());
        let pages = extract_pages(extractor, &path).await.unwrap();
        assert_eq!(pages, vec!["Hi"]);
    }

    #[tokio::test]
    async fn panicking_extractor_is_contained() {
        struct Boom;
        impl PageExtractor for Boom {
            fn extract_pages(&self, _path: &Path) -> Result<Vec<String>, ExtractionError> {
                panic!("reader crashed");
            }
        }
        let err = extract_pages(Arc::new(Boom), Path::new("x.pdf")).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Panicked(_)));
    }
}
