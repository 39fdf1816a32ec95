use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::result::ZipError;
use zip::ZipArchive;

use super::{DocumentMetadata, ExtractError, ExtractedDocument};
use crate::chunks::ChunkSequence;

const DOCUMENT_PART: &str = "word/document.xml";
const CORE_PROPERTIES_PART: &str = "docProps/core.xml";

/// Upper bound on a single decompressed XML part.
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

/// Paragraphs of the main body, newline-joined into at most one chunk.
/// Tables, text boxes and drawings are not part of the body text.
pub fn extract(path: &Path) -> Result<ExtractedDocument, ExtractError> {
    let file = File::open(path)
        .map_err(|err| ExtractError::Extraction(format!("failed to open DOCX: {err}")))?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|err| ExtractError::Extraction(format!("not a DOCX package: {err}")))?;

    let document_xml = read_part(&mut archive, DOCUMENT_PART)?.ok_or_else(|| {
        ExtractError::Extraction(format!("DOCX package has no {DOCUMENT_PART}"))
    })?;
    let paragraphs = body_paragraphs(&document_xml)?;

    let core = match read_part(&mut archive, CORE_PROPERTIES_PART)? {
        Some(xml) => core_properties(&xml)?,
        None => CoreProperties::default(),
    };

    let text = paragraphs
        .into_iter()
        .filter(|paragraph| !paragraph.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let mut sequence = ChunkSequence::new();
    sequence.push_block(text);

    Ok(ExtractedDocument {
        metadata: DocumentMetadata {
            page_count: None,
            title: core.title,
            author: core.creator,
            language: core.language,
        },
        chunks: sequence.into_drafts(),
    })
}

fn read_part<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>, ExtractError> {
    let entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(ExtractError::Extraction(format!(
                "failed to open {name}: {err}"
            )))
        }
    };

    let mut buffer = Vec::new();
    entry
        .take(MAX_PART_BYTES + 1)
        .read_to_end(&mut buffer)
        .map_err(|err| ExtractError::Extraction(format!("failed to read {name}: {err}")))?;
    if buffer.len() as u64 > MAX_PART_BYTES {
        return Err(ExtractError::Extraction(format!(
            "{name} exceeds {MAX_PART_BYTES} bytes"
        )));
    }
    Ok(Some(buffer))
}

fn xml_error(part: &str, err: impl std::fmt::Display) -> ExtractError {
    ExtractError::Extraction(format!("malformed {part}: {err}"))
}

/// Text of each top-level `w:p` directly under `w:body`, in document order.
fn body_paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut paragraphs = Vec::new();
    let mut current: Option<String> = None;
    let mut in_body = false;
    let mut paragraph_depth = 0usize;
    let mut run_depth = 0usize;
    // Tables, text boxes and drawings.
    let mut skip_depth = 0usize;
    let mut in_text = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| xml_error(DOCUMENT_PART, err))?;
        match event {
            Event::Start(element) => match element.local_name().as_ref() {
                b"body" => in_body = true,
                b"tbl" | b"txbxContent" | b"drawing" | b"pict" => skip_depth += 1,
                b"p" => {
                    paragraph_depth += 1;
                    if in_body && skip_depth == 0 && paragraph_depth == 1 {
                        current = Some(String::new());
                    }
                }
                b"r" => run_depth += 1,
                b"t" => in_text = run_depth > 0,
                b"tab" => push_in_run(&mut current, skip_depth, run_depth, '\t'),
                b"br" | b"cr" => push_in_run(&mut current, skip_depth, run_depth, '\n'),
                _ => {}
            },
            Event::Empty(element) => match element.local_name().as_ref() {
                b"p" if in_body && skip_depth == 0 && paragraph_depth == 0 => {
                    paragraphs.push(String::new());
                }
                b"tab" => push_in_run(&mut current, skip_depth, run_depth, '\t'),
                b"br" | b"cr" => push_in_run(&mut current, skip_depth, run_depth, '\n'),
                _ => {}
            },
            Event::Text(text) if in_text && skip_depth == 0 => {
                if let Some(paragraph) = current.as_mut() {
                    let value = text
                        .unescape()
                        .map_err(|err| xml_error(DOCUMENT_PART, err))?;
                    paragraph.push_str(&value);
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"body" => in_body = false,
                b"tbl" | b"txbxContent" | b"drawing" | b"pict" => {
                    skip_depth = skip_depth.saturating_sub(1)
                }
                b"p" => {
                    if paragraph_depth == 1 {
                        if let Some(paragraph) = current.take() {
                            paragraphs.push(paragraph);
                        }
                    }
                    paragraph_depth = paragraph_depth.saturating_sub(1);
                }
                b"r" => run_depth = run_depth.saturating_sub(1),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(paragraphs)
}

fn push_in_run(current: &mut Option<String>, skip_depth: usize, run_depth: usize, ch: char) {
    if skip_depth > 0 || run_depth == 0 {
        return;
    }
    if let Some(paragraph) = current.as_mut() {
        paragraph.push(ch);
    }
}

#[derive(Debug, Default)]
struct CoreProperties {
    title: Option<String>,
    creator: Option<String>,
    language: Option<String>,
}

/// `dc:title`, `dc:creator` and `dc:language` from the package core properties.
fn core_properties(xml: &[u8]) -> Result<CoreProperties, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut properties = CoreProperties::default();
    let mut field: Option<&'static str> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| xml_error(CORE_PROPERTIES_PART, err))?;
        match event {
            Event::Start(element) => {
                field = match element.local_name().as_ref() {
                    b"title" => Some("title"),
                    b"creator" => Some("creator"),
                    b"language" => Some("language"),
                    _ => None,
                };
            }
            Event::Text(text) => {
                if let Some(name) = field {
                    let value = text
                        .unescape()
                        .map_err(|err| xml_error(CORE_PROPERTIES_PART, err))?
                        .into_owned();
                    let slot = match name {
                        "title" => &mut properties.title,
                        "creator" => &mut properties.creator,
                        _ => &mut properties.language,
                    };
                    slot.get_or_insert_with(String::new).push_str(&value);
                }
            }
            Event::End(_) => field = None,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(properties)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::fixtures;

    fn body(inner: &str) -> String {
        format!(
            "<w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body>{inner}</w:body></w:document>"
        )
    }

    #[test]
    fn joins_non_empty_paragraphs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.docx");
        std::fs::write(
            &path,
            fixtures::docx_with_paragraphs(&["Hello", "", "World"], Some("Greeting"), Some("Ann")),
        )
        .unwrap();

        let extracted = extract(&path).unwrap();
        assert_eq!(extracted.chunks.len(), 1);
        assert_eq!(extracted.chunks[0].seq, 0);
        assert_eq!(extracted.chunks[0].text, "Hello\nWorld");
        assert_eq!(extracted.chunks[0].page_from, None);
        assert_eq!(extracted.metadata.title.as_deref(), Some("Greeting"));
        assert_eq!(extracted.metadata.author.as_deref(), Some("Ann"));
        assert_eq!(extracted.metadata.language.as_deref(), Some("en-GB"));
        assert_eq!(extracted.metadata.page_count, None);
    }

    #[test]
    fn whitespace_paragraphs_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spaced.docx");
        std::fs::write(
            &path,
            fixtures::docx_with_paragraphs(&["Hello", " ", "", "World"], None, None),
        )
        .unwrap();

        let extracted = extract(&path).unwrap();
        assert_eq!(extracted.chunks.len(), 1);
        assert_eq!(extracted.chunks[0].text, "Hello\n \nWorld");
    }

    #[test]
    fn whitespace_only_body_yields_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.docx");
        std::fs::write(&path, fixtures::docx_with_paragraphs(&[" ", "\t"], None, None)).unwrap();

        assert!(extract(&path).unwrap().chunks.is_empty());
    }

    #[test]
    fn empty_body_yields_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.docx");
        std::fs::write(&path, fixtures::docx_with_paragraphs(&["", ""], None, None)).unwrap();

        let extracted = extract(&path).unwrap();
        assert!(extracted.chunks.is_empty());
        assert_eq!(extracted.metadata, DocumentMetadata::default());
    }

    #[test]
    fn runs_tabs_and_breaks_are_preserved() {
        let xml = body(
            "<w:p><w:r><w:t>Name</w:t></w:r><w:r><w:tab/><w:t>Value</w:t></w:r></w:p>\
             <w:p><w:r><w:t>line</w:t><w:br/><w:t>wrap &amp; more</w:t></w:r></w:p>",
        );
        let paragraphs = body_paragraphs(xml.as_bytes()).unwrap();
        assert_eq!(paragraphs, vec!["Name\tValue", "line\nwrap & more"]);
    }

    #[test]
    fn tab_stops_in_paragraph_properties_are_ignored() {
        let xml = body(
            "<w:p><w:pPr><w:tabs><w:tab w:val=\"left\" w:pos=\"720\"/></w:tabs></w:pPr>\
             <w:r><w:t>Plain</w:t></w:r></w:p>",
        );
        assert_eq!(body_paragraphs(xml.as_bytes()).unwrap(), vec!["Plain"]);
    }

    #[test]
    fn tables_and_text_boxes_are_excluded() {
        let xml = body(
            "<w:p><w:r><w:t>Before</w:t></w:r></w:p>\
             <w:tbl><w:tr><w:tc><w:p><w:r><w:t>Cell</w:t></w:r></w:p></w:tc></w:tr></w:tbl>\
             <w:p><w:r><w:drawing><w:txbxContent><w:p><w:r><w:t>Boxed</w:t></w:r></w:p>\
             </w:txbxContent></w:drawing><w:t>After</w:t></w:r></w:p>",
        );
        assert_eq!(
            body_paragraphs(xml.as_bytes()).unwrap(),
            vec!["Before", "After"]
        );
    }

    #[test]
    fn missing_document_part_is_an_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.docx");
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("other.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut writer, b"<x/>").unwrap();
        std::fs::write(&path, writer.finish().unwrap().into_inner()).unwrap();

        let err = extract(&path).unwrap_err();
        assert!(err.to_string().contains(DOCUMENT_PART));
    }

    #[test]
    fn non_zip_input_is_an_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.docx");
        std::fs::write(&path, b"plain text").unwrap();
        assert!(matches!(extract(&path), Err(ExtractError::Extraction(_))));
    }
}
