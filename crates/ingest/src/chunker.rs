use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::Chunk;
use crate::document::Document;

/// Chunk sizes are measured in grapheme clusters, so a chunk never splits
/// a user-perceived character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            chunk_overlap: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkerError {
    #[error("invalid chunking configuration: overlap {overlap} must be smaller than size {size}")]
    InvalidConfiguration { size: usize, overlap: usize },
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkerError> {
        if config.chunk_overlap >= config.chunk_size {
            return Err(ChunkerError::InvalidConfiguration {
                size: config.chunk_size,
                overlap: config.chunk_overlap,
            });
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    pub fn chunk_document(&self, document: &Document) -> Vec<Chunk> {
        self.chunk_text(&document.doc_id, &document.text, &document.source)
    }

    /// Split text into overlapping chunks.
    ///
    /// Line breaks are normalized first; after that, every chunk starts
    /// exactly `chunk_overlap` graphemes before the end of its predecessor,
    /// so dropping that prefix from every chunk but the first reproduces the
    /// normalized text. A chunk prefers to end right after whitespace when
    /// one is available in the window.
    pub fn chunk_text(&self, doc_id: &str, text: &str, source: &str) -> Vec<Chunk> {
        let normalized = normalize_line_breaks(text);
        let graphemes: Vec<&str> = normalized.graphemes(true).collect();
        let total = graphemes.len();

        let mut chunks = Vec::new();
        if total == 0 {
            return chunks;
        }

        let mut start = 0;
        loop {
            let hard_end = (start + self.config.chunk_size).min(total);
            let end = if hard_end == total {
                total
            } else {
                self.soft_boundary(&graphemes, start, hard_end)
            };

            chunks.push(Chunk::new(
                doc_id.to_string(),
                chunks.len(),
                graphemes[start..end].concat(),
                source.to_string(),
                (start, end),
            ));

            if end == total {
                break;
            }
            start = end - self.config.chunk_overlap;
        }

        tracing::debug!(doc_id, chunks = chunks.len(), graphemes = total, "chunked document");
        chunks
    }

    /// Last position in `(start + overlap, hard_end]` that follows whitespace.
    /// Staying above `start + overlap` guarantees the next chunk advances.
    fn soft_boundary(&self, graphemes: &[&str], start: usize, hard_end: usize) -> usize {
        let lowest = start + self.config.chunk_overlap + 1;
        (lowest..=hard_end)
            .rev()
            .find(|&end| graphemes[end - 1].chars().all(char::is_whitespace))
            .unwrap_or(hard_end)
    }
}

/// Replace every run of line breaks with a single space.
pub fn normalize_line_breaks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_break = false;

    for c in text.chars() {
        if matches!(c, '\n' | '\r' | '\u{2028}' | '\u{2029}') {
            if !in_break {
                out.push(' ');
                in_break = true;
            }
        } else {
            out.push(c);
            in_break = false;
        }
    }

    out
}
