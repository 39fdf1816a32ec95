use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DocumentChunk, NewDocumentChunk};
use crate::schema::document_chunks;

/// Rows per INSERT; keeps bind parameters well under the Postgres limit.
const INSERT_BATCH_SIZE: usize = 1000;

/// One chunk as produced by an extractor, before it is tied to a document row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub seq: i32,
    pub text: String,
    pub page_from: Option<i32>,
    pub page_to: Option<i32>,
}

/// Assigns `seq` in reading order as extractors emit text, dropping blank text.
#[derive(Debug, Default)]
pub struct ChunkSequence {
    drafts: Vec<ChunkDraft>,
}

impl ChunkSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text from a single 1-based page. Returns whether a chunk was emitted.
    pub fn push_page(&mut self, page: i32, text: impl Into<String>) -> bool {
        self.push(text.into(), Some(page), Some(page))
    }

    /// Text with no page addressing.
    pub fn push_block(&mut self, text: impl Into<String>) -> bool {
        self.push(text.into(), None, None)
    }

    fn push(&mut self, text: String, page_from: Option<i32>, page_to: Option<i32>) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        let seq = self.drafts.len() as i32;
        self.drafts.push(ChunkDraft {
            seq,
            text,
            page_from,
            page_to,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn into_drafts(self) -> Vec<ChunkDraft> {
        self.drafts
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("chunk sequence gap: expected seq {expected}, found {found}")]
    SequenceGap { expected: i32, found: i32 },
    #[error("chunk {seq} has no text")]
    EmptyText { seq: i32 },
    #[error("chunk {seq} has invalid page range {page_from:?}..{page_to:?}")]
    PageRange {
        seq: i32,
        page_from: Option<i32>,
        page_to: Option<i32>,
    },
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

/// Checks the invariants every persisted chunk set must satisfy: `seq` runs
/// `0..n` without gaps, text is non-blank, page ranges are 1-based and ordered.
pub fn validate(drafts: &[ChunkDraft]) -> Result<(), ChunkError> {
    for (index, draft) in drafts.iter().enumerate() {
        let expected = index as i32;
        if draft.seq != expected {
            return Err(ChunkError::SequenceGap {
                expected,
                found: draft.seq,
            });
        }
        if draft.text.trim().is_empty() {
            return Err(ChunkError::EmptyText { seq: draft.seq });
        }
        let range_ok = match (draft.page_from, draft.page_to) {
            (None, None) => true,
            (Some(from), Some(to)) => from >= 1 && from <= to,
            _ => false,
        };
        if !range_ok {
            return Err(ChunkError::PageRange {
                seq: draft.seq,
                page_from: draft.page_from,
                page_to: draft.page_to,
            });
        }
    }
    Ok(())
}

/// Replaces the full chunk set of a document. Callers run this inside the
/// transaction that flips the document to `ready`.
pub fn replace_chunks(
    conn: &mut PgConnection,
    document_id: Uuid,
    drafts: Vec<ChunkDraft>,
) -> Result<usize, ChunkError> {
    validate(&drafts)?;

    diesel::delete(document_chunks::table.filter(document_chunks::document_id.eq(document_id)))
        .execute(conn)?;

    let rows: Vec<NewDocumentChunk> = drafts
        .into_iter()
        .map(|draft| NewDocumentChunk {
            id: Uuid::new_v4(),
            document_id,
            seq: draft.seq,
            text: draft.text,
            page_from: draft.page_from,
            page_to: draft.page_to,
        })
        .collect();

    let mut written = 0;
    for batch in rows.chunks(INSERT_BATCH_SIZE) {
        written += diesel::insert_into(document_chunks::table)
            .values(batch)
            .execute(conn)?;
    }
    Ok(written)
}

/// Chunks of a document in reading order. Unknown or deleted documents have none.
pub fn list_chunks(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<Vec<DocumentChunk>> {
    document_chunks::table
        .filter(document_chunks::document_id.eq(document_id))
        .order(document_chunks::seq.asc())
        .select(DocumentChunk::as_select())
        .load(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_pages_are_skipped_without_breaking_seq() {
        let mut sequence = ChunkSequence::new();
        assert!(sequence.push_page(1, "first"));
        assert!(!sequence.push_page(2, " \n\t "));
        assert!(sequence.push_page(3, "third"));

        let drafts = sequence.into_drafts();
        assert_eq!(drafts.len(), 2);
        assert_eq!(
            (drafts[0].seq, drafts[0].page_from, drafts[0].page_to),
            (0, Some(1), Some(1))
        );
        assert_eq!(
            (drafts[1].seq, drafts[1].page_from, drafts[1].page_to),
            (1, Some(3), Some(3))
        );
        validate(&drafts).unwrap();
    }

    #[test]
    fn blocks_have_no_page_range() {
        let mut sequence = ChunkSequence::new();
        assert!(sequence.push_block("Hello\nWorld"));
        assert!(!sequence.push_block(""));
        assert_eq!(sequence.len(), 1);

        let drafts = sequence.into_drafts();
        assert_eq!(drafts[0].page_from, None);
        assert_eq!(drafts[0].page_to, None);
    }

    #[test]
    fn validate_rejects_gaps_and_duplicates() {
        let draft = |seq: i32| ChunkDraft {
            seq,
            text: "x".into(),
            page_from: None,
            page_to: None,
        };

        let gap = validate(&[draft(0), draft(2)]).unwrap_err();
        assert!(matches!(
            gap,
            ChunkError::SequenceGap {
                expected: 1,
                found: 2
            }
        ));

        let dup = validate(&[draft(0), draft(0)]).unwrap_err();
        assert!(matches!(
            dup,
            ChunkError::SequenceGap {
                expected: 1,
                found: 0
            }
        ));

        let late_start = validate(&[draft(1)]).unwrap_err();
        assert!(matches!(
            late_start,
            ChunkError::SequenceGap {
                expected: 0,
                found: 1
            }
        ));
    }

    #[test]
    fn validate_rejects_blank_text_and_bad_pages() {
        let blank = ChunkDraft {
            seq: 0,
            text: "   ".into(),
            page_from: None,
            page_to: None,
        };
        assert!(matches!(
            validate(&[blank]),
            Err(ChunkError::EmptyText { seq: 0 })
        ));

        let half_open = ChunkDraft {
            seq: 0,
            text: "x".into(),
            page_from: Some(1),
            page_to: None,
        };
        assert!(matches!(
            validate(&[half_open]),
            Err(ChunkError::PageRange { .. })
        ));

        let zero_page = ChunkDraft {
            seq: 0,
            text: "x".into(),
            page_from: Some(0),
            page_to: Some(0),
        };
        assert!(matches!(
            validate(&[zero_page]),
            Err(ChunkError::PageRange { .. })
        ));
    }

    #[test]
    fn empty_chunk_set_is_valid() {
        validate(&[]).unwrap();
        assert!(ChunkSequence::new().is_empty());
    }
}
