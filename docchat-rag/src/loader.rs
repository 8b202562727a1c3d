//! Source document loaders.
//!
//! [`PdfLoader`] turns a PDF into one [`Document`] per page; [`TextLoader`]
//! reads plain text and Markdown files whole. [`loader_for_path`] picks one by
//! file extension.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::document::{Document, PAGE_KEY, SOURCE_KEY};
use crate::error::{RagError, Result};

/// Metadata key holding the page count of the source PDF.
pub const TOTAL_PAGES_KEY: &str = "total_pages";

/// Loads a file into documents ready for chunking.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Load `path`, returning documents in source order.
    async fn load(&self, path: &Path) -> Result<Vec<Document>>;
}

fn load_error(path: &Path, message: impl Into<String>) -> RagError {
    RagError::DocumentLoad { path: path.to_path_buf(), message: message.into() }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => load_error(path, "file not found"),
        _ => load_error(path, e.to_string()),
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "document".to_string())
}

/// Split pages `1..=page_count` into at most `workers` contiguous ranges.
///
/// Every range but the last holds `page_count / workers` pages; the last one
/// takes the remainder.
pub fn page_ranges(page_count: u32, workers: usize) -> Vec<(u32, u32)> {
    if page_count == 0 {
        return Vec::new();
    }
    let workers = (workers.max(1) as u32).min(page_count);
    let per_worker = page_count / workers;
    (0..workers)
        .map(|i| {
            let first = i * per_worker + 1;
            let last = if i + 1 == workers { page_count } else { (i + 1) * per_worker };
            (first, last)
        })
        .collect()
}

fn extract_pages(bytes: &[u8], first: u32, last: u32) -> std::result::Result<Vec<(u32, String)>, String> {
    let pdf = lopdf::Document::load_mem(bytes).map_err(|e| format!("failed to parse PDF: {e}"))?;
    (first..=last)
        .map(|page| {
            pdf.extract_text(&[page])
                .map(|text| (page, text))
                .map_err(|e| format!("failed to extract text from page {page}: {e}"))
        })
        .collect()
}

/// Loads a PDF as one [`Document`] per page.
///
/// Large files are split into up to `max_workers` contiguous page ranges,
/// extracted on blocking worker threads and re-joined in page order.
#[derive(Debug, Clone)]
pub struct PdfLoader {
    max_workers: usize,
}

impl Default for PdfLoader {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

impl PdfLoader {
    pub fn new(max_workers: usize) -> Self {
        Self { max_workers: max_workers.max(1) }
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    async fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = Arc::new(read_file(path).await?);

        let page_count = {
            let bytes = Arc::clone(&bytes);
            tokio::task::spawn_blocking(move || {
                lopdf::Document::load_mem(&bytes).map(|pdf| pdf.get_pages().len() as u32)
            })
            .await
            .map_err(|e| load_error(path, format!("PDF worker failed: {e}")))?
            .map_err(|e| load_error(path, format!("failed to parse PDF: {e}")))?
        };
        if page_count == 0 {
            return Err(load_error(path, "PDF has no pages"));
        }

        let ranges = page_ranges(page_count, self.max_workers);
        info!(path = %path.display(), page_count, workers = ranges.len(), "extracting PDF text");

        let handles: Vec<_> = ranges
            .into_iter()
            .map(|(first, last)| {
                let bytes = Arc::clone(&bytes);
                tokio::task::spawn_blocking(move || extract_pages(&bytes, first, last))
            })
            .collect();

        let source = path.display().to_string();
        let stem = file_stem(path);
        let mut documents = Vec::with_capacity(page_count as usize);
        for handle in handles {
            let pages = handle
                .await
                .map_err(|e| load_error(path, format!("PDF worker failed: {e}")))?
                .map_err(|message| load_error(path, message))?;
            for (page, text) in pages {
                documents.push(
                    Document::new(format!("{stem}-p{page}"), text)
                        .with_metadata(SOURCE_KEY, source.clone())
                        .with_metadata(PAGE_KEY, page.to_string())
                        .with_metadata(TOTAL_PAGES_KEY, page_count.to_string()),
                );
            }
        }

        debug!(path = %path.display(), documents = documents.len(), "loaded PDF pages");
        Ok(documents)
    }
}

/// Loads a UTF-8 text or Markdown file as a single [`Document`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TextLoader;

#[async_trait]
impl DocumentLoader for TextLoader {
    async fn load(&self, path: &Path) -> Result<Vec<Document>> {
        let bytes = read_file(path).await?;
        let text = String::from_utf8(bytes).map_err(|_| load_error(path, "file is not valid UTF-8"))?;
        Ok(vec![Document::new(file_stem(path), text).with_metadata(SOURCE_KEY, path.display().to_string())])
    }
}

/// Choose a loader for `path` by its extension.
pub fn loader_for_path(path: &Path, max_workers: usize) -> Result<Box<dyn DocumentLoader>> {
    let extension = path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => Ok(Box::new(PdfLoader::new(max_workers))),
        Some("txt" | "md" | "markdown") => Ok(Box::new(TextLoader)),
        other => Err(RagError::DocumentLoad {
            path: PathBuf::from(path),
            message: format!("unsupported file type: {}", other.unwrap_or("(none)")),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn page_ranges_cover_every_page_once() {
        assert_eq!(page_ranges(10, 3), vec![(1, 3), (4, 6), (7, 10)]);
        assert_eq!(page_ranges(2, 8), vec![(1, 1), (2, 2)]);
        assert_eq!(page_ranges(5, 1), vec![(1, 5)]);
        assert!(page_ranges(0, 4).is_empty());

        for pages in 1..40u32 {
            for workers in 1..10usize {
                let covered: Vec<u32> =
                    page_ranges(pages, workers).into_iter().flat_map(|(a, b)| a..=b).collect();
                assert_eq!(covered, (1..=pages).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn picks_loader_by_extension() {
        assert!(loader_for_path(Path::new("manual.PDF"), 4).is_ok());
        assert!(loader_for_path(Path::new("notes.md"), 4).is_ok());
        let err = loader_for_path(Path::new("sheet.xlsx"), 4).err().unwrap();
        assert!(matches!(err, RagError::DocumentLoad { message, .. } if message.contains("xlsx")));
    }

    #[tokio::test]
    async fn missing_file_is_a_load_error() {
        let err = PdfLoader::default().load(Path::new("/definitely/not/here.pdf")).await.unwrap_err();
        assert!(matches!(err, RagError::DocumentLoad { message, .. } if message == "file not found"));
    }

    #[tokio::test]
    async fn garbage_pdf_is_a_load_error() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"this is not a pdf").unwrap();
        let err = PdfLoader::default().load(file.path()).await.unwrap_err();
        assert!(matches!(err, RagError::DocumentLoad { .. }));
    }

    #[tokio::test]
    async fn text_loader_reads_whole_file() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        write!(file, "first line\nsecond line").unwrap();
        let docs = TextLoader.load(file.path()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "first line\nsecond line");
        assert!(docs[0].metadata.contains_key(SOURCE_KEY));
    }
}
