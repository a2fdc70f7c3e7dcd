use std::path::Path;

use tokio::fs;

use crate::document::Document;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("document {0} is not valid UTF-8 text")]
    NotUtf8(String),
    #[error("failed to extract text from PDF {source_name}: {message}")]
    Pdf { source_name: String, message: String },
}

pub struct FileReader;

impl FileReader {
    /// Load a document from disk. Accepts `.txt`, `.md` and `.pdf`.
    pub async fn read_file(path: &Path) -> Result<Document, ReadError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        if !matches!(extension.as_str(), "txt" | "md" | "pdf") {
            return Err(ReadError::UnsupportedFormat(extension));
        }

        let bytes = fs::read(path).await.map_err(|source| ReadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Self::read_bytes(&bytes, &source_name)
    }

    /// Decode uploaded bytes. PDF content is detected by its magic header or
    /// a `.pdf` source name; everything else must be UTF-8 text.
    pub fn read_bytes(bytes: &[u8], source_name: &str) -> Result<Document, ReadError> {
        let text = if Self::is_pdf(bytes, source_name) {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ReadError::Pdf {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?
        } else {
            String::from_utf8(bytes.to_vec())
                .map_err(|_| ReadError::NotUtf8(source_name.to_string()))?
        };

        tracing::info!(source = source_name, bytes = bytes.len(), chars = text.len(), "loaded document");
        Ok(Document::new(source_name, text))
    }

    fn is_pdf(bytes: &[u8], source_name: &str) -> bool {
        bytes.starts_with(b"%PDF") || source_name.to_ascii_lowercase().ends_with(".pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_utf8_bytes() {
        let doc = FileReader::read_bytes("Patient John has Diabetes.".as_bytes(), "note.txt").unwrap();
        assert_eq!(doc.source, "note.txt");
        assert_eq!(doc.text, "Patient John has Diabetes.");
        assert_eq!(doc.doc_id.len(), 32);
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = FileReader::read_bytes(&[0xff, 0xfe, 0x00], "blob.txt").unwrap_err();
        assert!(matches!(err, ReadError::NotUtf8(_)));
    }

    #[tokio::test]
    async fn rejects_unknown_extension() {
        let err = FileReader::read_file(Path::new("scan.docx")).await.unwrap_err();
        assert!(matches!(err, ReadError::UnsupportedFormat(ext) if ext == "docx"));
    }
}
