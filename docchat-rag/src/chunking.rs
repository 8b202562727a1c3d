//! Document chunking.
//!
//! [`FixedSizeChunker`] slides a fixed window over the units of a document
//! (characters or whitespace-delimited words). Consecutive chunks share
//! `chunk_overlap` units, every unit is covered, and the output only depends
//! on the input text and the parameters, so re-ingesting a document
//! reproduces the same chunk ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{CHUNK_INDEX_KEY, Chunk, Document};
use crate::error::{RagError, Result};

/// A strategy for splitting documents into chunks.
///
/// Implementations produce [`Chunk`]s with text and metadata but no embeddings.
/// Embeddings are attached later by the pipeline.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks.
    ///
    /// Returns an empty `Vec` if the document has no units.
    /// Each returned chunk has an empty embedding vector.
    fn chunk(&self, document: &Document) -> Vec<Chunk>;
}

/// The unit `chunk_size` and `chunk_overlap` are measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    /// Unicode scalar values.
    #[default]
    Chars,
    /// Maximal runs of non-whitespace characters.
    Words,
}

impl FromStr for ChunkUnit {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chars" | "char" | "characters" => Ok(Self::Chars),
            "words" | "word" | "tokens" => Ok(Self::Words),
            other => Err(RagError::Config(format!(
                "unknown chunk unit '{other}', expected 'chars' or 'words'"
            ))),
        }
    }
}

impl fmt::Display for ChunkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chars => f.write_str("chars"),
            Self::Words => f.write_str("words"),
        }
    }
}

/// Splits text into fixed-size, overlapping chunks.
///
/// Chunk IDs are UUIDv5 values derived from the document id, the chunk index
/// and the chunk text. Each chunk inherits the parent document's metadata plus
/// a `chunk_index` field.
///
/// # Example
///
/// ```rust,ignore
/// use docchat_rag::{ChunkUnit, FixedSizeChunker};
///
/// let chunker = FixedSizeChunker::new(3, 1, ChunkUnit::Words)?;
/// let chunks = chunker.chunk(&Document::new("doc", "A B C D E F G H"));
/// // ["A B C", "C D E", "E F G", "G H"]
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    unit: ChunkUnit,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Chunking`] if `chunk_size` is zero or
    /// `chunk_overlap >= chunk_size`; such a window would never advance.
    pub fn new(chunk_size: usize, chunk_overlap: usize, unit: ChunkUnit) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Chunking("chunk_size must be greater than zero".to_string()));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::Chunking(format!(
                "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self { chunk_size, chunk_overlap, unit })
    }

    /// Maximum number of units per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of units shared by consecutive chunks.
    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// The unit sizes are measured in.
    pub fn unit(&self) -> ChunkUnit {
        self.unit
    }
}

/// Byte ranges of each unit of `text`.
fn unit_spans(text: &str, unit: ChunkUnit) -> Vec<(usize, usize)> {
    match unit {
        ChunkUnit::Chars => text.char_indices().map(|(i, c)| (i, i + c.len_utf8())).collect(),
        ChunkUnit::Words => {
            let mut spans = Vec::new();
            let mut word_start = None;
            for (i, c) in text.char_indices() {
                match (c.is_whitespace(), word_start) {
                    (true, Some(start)) => {
                        spans.push((start, i));
                        word_start = None;
                    }
                    (false, None) => word_start = Some(i),
                    _ => {}
                }
            }
            if let Some(start) = word_start {
                spans.push((start, text.len()));
            }
            spans
        }
    }
}

/// Deterministic chunk id: the same document, position and text always map to
/// the same id.
pub fn chunk_id(document_id: &str, index: usize, text: &str) -> String {
    let key = format!("{document_id}\u{1f}{index}\u{1f}{text}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let spans = unit_spans(&document.text, self.unit);
        if spans.is_empty() {
            return Vec::new();
        }

        let text = &document.text;
        let total = spans.len();
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut previous_end: Option<usize> = None;

        loop {
            let end = (start + self.chunk_size).min(total);
            let byte_start = spans[start].0;
            let byte_end = spans[end - 1].1;
            let overlap = previous_end.map_or(0, |prev| prev.saturating_sub(byte_start));
            let chunk_text = &text[byte_start..byte_end];
            let chunk_index = chunks.len();

            let mut metadata = document.metadata.clone();
            metadata.insert(CHUNK_INDEX_KEY.to_string(), chunk_index.to_string());

            chunks.push(Chunk {
                id: chunk_id(&document.id, chunk_index, chunk_text),
                text: chunk_text.to_string(),
                embedding: Vec::new(),
                metadata,
                document_id: document.id.clone(),
                start: byte_start,
                end: byte_end,
                overlap,
            });

            if end == total {
                break;
            }
            start = end - self.chunk_overlap;
            previous_end = Some(byte_end);
        }

        chunks
    }
}

/// Concatenate chunks, dropping each chunk's leading overlap.
///
/// For character units this reproduces the original document text exactly.
/// For word units, whitespace that falls between two non-overlapping chunks
/// (or before the first and after the last word) belongs to no chunk and is
/// not reproduced.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    for chunk in chunks {
        text.push_str(&chunk.text[chunk.overlap.min(chunk.text.len())..]);
    }
    text
}
