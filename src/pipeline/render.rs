//! PDF rasterisation via pdfium, behind the [`PageSource`] seam.
//!
//! pdfium is a blocking C++ library, so every call runs inside
//! `tokio::task::spawn_blocking`. The document is opened once at load time to
//! read the page count and every page's size in points; each render call
//! reopens it on the blocking thread, since a pdfium document handle borrows
//! its bindings and cannot be held across `.await`.
//!
//! `max_rendered_pixels` caps the longest rendered edge regardless of the
//! physical page size, keeping request payloads bounded.

use crate::error::IngestError;
use crate::figure::PageDimensions;
use crate::pipeline::encode::encode_page;
use crate::pipeline::input::{resolve_input, ResolvedInput};
use crate::pipeline::partition::PageRange;
use async_trait::async_trait;
use edgequake_llm::ImageData;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// An opened document the pipeline can page through.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Total number of pages.
    fn page_count(&self) -> usize;

    /// Size of a 1-indexed page in points, if known.
    fn page_dimensions(&self, page: usize) -> Option<PageDimensions>;

    /// Render every page of `range` to an encoded image, in page order.
    async fn render(&self, range: PageRange) -> Result<Vec<ImageData>, IngestError>;
}

/// Fetches and opens documents by URL.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<Arc<dyn PageSource>, IngestError>;
}

/// Production loader: reqwest download + pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumLoader {
    pub download_timeout_secs: u64,
    pub max_rendered_pixels: u32,
}

#[async_trait]
impl DocumentLoader for PdfiumLoader {
    async fn load(&self, url: &str) -> Result<Arc<dyn PageSource>, IngestError> {
        let input = resolve_input(url, self.download_timeout_secs).await?;
        let path = input.path().to_path_buf();
        let source = url.to_string();

        let dimensions = tokio::task::spawn_blocking(move || read_dimensions(&path, &source))
            .await
            .map_err(|e| IngestError::Internal(format!("Load task panicked: {e}")))??;
        info!("PDF loaded: {} pages", dimensions.len());

        Ok(Arc::new(PdfiumDocument {
            input,
            url: url.to_string(),
            dimensions,
            max_rendered_pixels: self.max_rendered_pixels,
        }))
    }
}

/// A downloaded PDF with its page geometry.
#[derive(Debug)]
pub struct PdfiumDocument {
    input: ResolvedInput,
    url: String,
    dimensions: Vec<PageDimensions>,
    max_rendered_pixels: u32,
}

impl PdfiumDocument {
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PageSource for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.dimensions.len()
    }

    fn page_dimensions(&self, page: usize) -> Option<PageDimensions> {
        page.checked_sub(1)
            .and_then(|idx| self.dimensions.get(idx))
            .copied()
    }

    async fn render(&self, range: PageRange) -> Result<Vec<ImageData>, IngestError> {
        if range.end > self.page_count() {
            return Err(IngestError::PageOutOfRange {
                page: range.end,
                total: self.page_count(),
            });
        }
        let path = self.input.path().to_path_buf();
        let source = self.url.clone();
        let max_pixels = self.max_rendered_pixels;

        tokio::task::spawn_blocking(move || render_range_blocking(&path, &source, range, max_pixels))
            .await
            .map_err(|e| IngestError::Internal(format!("Render task panicked: {e}")))?
    }
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` when set, else the system library.
fn bind_pdfium() -> Result<Pdfium, IngestError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(PathBuf::from(path)),
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| IngestError::PdfiumBindingFailed(e.to_string()))?;
    Ok(Pdfium::new(bindings))
}

fn open_error(source: &str, e: PdfiumError) -> IngestError {
    IngestError::CorruptPdf {
        url: source.to_string(),
        detail: format!("{e:?}"),
    }
}

fn read_dimensions(path: &Path, source: &str) -> Result<Vec<PageDimensions>, IngestError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| open_error(source, e))?;

    document
        .pages()
        .iter()
        .enumerate()
        .map(|(idx, page)| {
            PageDimensions::new(page.width().value as f64, page.height().value as f64).map_err(
                |e| IngestError::CorruptPdf {
                    url: source.to_string(),
                    detail: format!("page {}: {e}", idx + 1),
                },
            )
        })
        .collect()
}

fn render_range_blocking(
    path: &Path,
    source: &str,
    range: PageRange,
    max_pixels: u32,
) -> Result<Vec<ImageData>, IngestError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| open_error(source, e))?;
    let pages = document.pages();

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut images = Vec::with_capacity(range.page_count());
    for page_num in range.pages() {
        let page = pages
            .get((page_num - 1) as u16)
            .map_err(|e| IngestError::RasterisationFailed {
                page: page_num,
                detail: format!("{e:?}"),
            })?;
        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            IngestError::RasterisationFailed {
                page: page_num,
                detail: format!("{e:?}"),
            }
        })?;
        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_num,
            image.width(),
            image.height()
        );
        let encoded = encode_page(&image).map_err(|e| IngestError::RasterisationFailed {
            page: page_num,
            detail: format!("Image encoding failed: {e}"),
        })?;
        images.push(encoded);
    }
    Ok(images)
}
