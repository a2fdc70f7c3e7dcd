pub mod chunk;
pub mod chunker;
pub mod document;
pub mod reader;

pub use chunk::Chunk;
pub use chunker::{normalize_line_breaks, Chunker, ChunkerConfig, ChunkerError};
pub use document::Document;
pub use reader::{FileReader, ReadError};

use sha2::{Digest, Sha256};

/// Generate a stable document ID from the source name and content
pub fn generate_doc_id(source: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_depends_on_source_and_text() {
        assert_eq!(generate_doc_id("a.pdf", "x"), generate_doc_id("a.pdf", "x"));
        assert_ne!(generate_doc_id("a.pdf", "x"), generate_doc_id("b.pdf", "x"));
        assert_ne!(generate_doc_id("a.pdf", "x"), generate_doc_id("a.pdf", "y"));
    }
}
