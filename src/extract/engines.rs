//! Text extraction engines.
//!
//! We shell out to the poppler tools and `tesseract` rather than linking OCR
//! libraries. Searchable PDFs go through `pdftotext`; PDFs with no text layer
//! are rasterized with `pdftoppm` and OCRed page by page.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// The kinds of file we know how to read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    /// A PDF, which may or may not have a text layer.
    Pdf,
    /// A JPEG or PNG image.
    Image,
}

impl DocumentKind {
    /// Classify a file by its name. Returns `None` for anything we can't read.
    pub fn from_path(path: &Path) -> Option<Self> {
        let mime = mime_guess::from_path(path).first()?;
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("application", "pdf") => Some(Self::Pdf),
            ("image", "jpeg") | ("image", "png") => Some(Self::Image),
            _ => None,
        }
    }
}

/// Interface for anything that can pull text out of a document.
#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    /// Extract the text of `path`. An empty string means "no text found".
    async fn extract_text(&self, path: &Path, kind: DocumentKind) -> Result<String>;
}

/// Extraction using the `pdftotext`, `pdftoppm` and `tesseract` CLI tools.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct CliTextExtractor {}

impl CliTextExtractor {
    /// Create a new CLI-based extractor.
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl TextExtractor for CliTextExtractor {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn extract_text(&self, path: &Path, kind: DocumentKind) -> Result<String> {
        match kind {
            DocumentKind::Pdf => {
                let text = pdftotext(path).await?;
                if !text.trim().is_empty() {
                    return Ok(text);
                }
                info!("No text layer in {}, applying OCR", path.display());
                ocr_pdf(path).await
            }
            DocumentKind::Image => {
                info!("Applying OCR to image {}", path.display());
                tesseract(path).await
            }
        }
    }
}

/// Run `pdftotext` and return the text layer.
async fn pdftotext(path: &Path) -> Result<String> {
    let output = with_cpu_semaphore(|| async {
        Command::new("pdftotext")
            .arg("-layout")
            .arg(path)
            .arg("-")
            .output()
            .await
            .context("cannot run pdftotext")
    })
    .await?;
    check_for_command_failure("pdftotext", &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Rasterize a PDF at 300 DPI and OCR each page.
async fn ocr_pdf(path: &Path) -> Result<String> {
    let tmpdir = tempfile::TempDir::with_prefix("pdftoppm")?;
    let prefix = tmpdir.path().join("page");
    let output = with_cpu_semaphore(|| async {
        Command::new("pdftoppm")
            .args(["-r", "300", "-png"])
            .arg(path)
            .arg(&prefix)
            .output()
            .await
            .context("cannot run pdftoppm")
    })
    .await?;
    check_for_command_failure("pdftoppm", &output)?;

    // `pdftoppm` zero-pads page numbers, so sorting by name sorts by page.
    let mut pages = vec![];
    let mut entries = tokio::fs::read_dir(tmpdir.path())
        .await
        .context("cannot list pdftoppm output")?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("cannot list pdftoppm output")?
    {
        pages.push(entry.path());
    }
    pages.sort();

    let mut texts = Vec::with_capacity(pages.len());
    for page in &pages {
        texts.push(tesseract(page).await?);
    }
    Ok(texts.join("\n").trim().to_owned())
}

/// OCR a single image with `tesseract`.
async fn tesseract(path: &Path) -> Result<String> {
    let output = with_cpu_semaphore(|| async {
        Command::new("tesseract")
            .arg(path)
            .arg("stdout")
            .output()
            .await
            .context("cannot run tesseract")
    })
    .await?;
    check_for_command_failure("tesseract", &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_files() {
        assert_eq!(
            DocumentKind::from_path(Path::new("passport.PDF")),
            Some(DocumentKind::Pdf)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("license.jpeg")),
            Some(DocumentKind::Image)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("license.jpg")),
            Some(DocumentKind::Image)
        );
        assert_eq!(
            DocumentKind::from_path(Path::new("scan.png")),
            Some(DocumentKind::Image)
        );
        assert_eq!(DocumentKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(DocumentKind::from_path(Path::new("README")), None);
    }
}
