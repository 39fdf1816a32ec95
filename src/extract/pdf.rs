use std::path::Path;

use lopdf::{Dictionary, Document, Object};

use super::{DocumentMetadata, ExtractError, ExtractedDocument};
use crate::chunks::ChunkSequence;

/// One chunk per page that carries text; blank pages are skipped without
/// leaving gaps in `seq`.
pub fn extract(path: &Path) -> Result<ExtractedDocument, ExtractError> {
    let document = Document::load(path)
        .map_err(|err| ExtractError::Extraction(format!("failed to open PDF: {err}")))?;

    let pages = document.get_pages();
    let page_count = i32::try_from(pages.len())
        .map_err(|_| ExtractError::Extraction("PDF page count out of range".to_string()))?;

    let mut sequence = ChunkSequence::new();
    for page_number in pages.keys() {
        let text = document.extract_text(&[*page_number]).map_err(|err| {
            ExtractError::Extraction(format!("failed to read text of page {page_number}: {err}"))
        })?;
        sequence.push_page(*page_number as i32, text);
    }

    let info = info_dictionary(&document);
    let metadata = DocumentMetadata {
        page_count: Some(page_count),
        title: info.and_then(|dict| text_entry(&document, dict, b"Title")),
        author: info.and_then(|dict| text_entry(&document, dict, b"Author")),
        language: catalog(&document).and_then(|dict| text_entry(&document, dict, b"Lang")),
    };

    Ok(ExtractedDocument {
        metadata,
        chunks: sequence.into_drafts(),
    })
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

fn trailer_dictionary<'a>(document: &'a Document, key: &[u8]) -> Option<&'a Dictionary> {
    let object = document.trailer.get(key).ok()?;
    match resolve(document, object)? {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

fn info_dictionary(document: &Document) -> Option<&Dictionary> {
    trailer_dictionary(document, b"Info")
}

fn catalog(document: &Document) -> Option<&Dictionary> {
    trailer_dictionary(document, b"Root")
}

fn text_entry(document: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    let object = dict.get(key).ok()?;
    match resolve(document, object)? {
        Object::String(bytes, _) => Some(decode_text_string(bytes)),
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

/// PDF text strings are UTF-16BE with a BOM, UTF-8 with a BOM (PDF 2.0),
/// or PDFDocEncoding, which agrees with Latin-1 for printable text.
fn decode_text_string(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    bytes.iter().map(|&byte| byte as char).collect()
}
