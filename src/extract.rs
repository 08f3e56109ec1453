use crate::config::Extraction;
use crate::error::{OcrError, Result};
use image::ImageOutputFormat;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

/// One event from a file's page sequence. A `FileFailed` is terminal and is
/// the only event the file produces; page failures leave the rest of the
/// sequence intact.
#[derive(Debug)]
pub enum PageEvent {
    Page { page_index: u32, image: Vec<u8> },
    PageFailed { page_index: u32, message: String },
    FileFailed { message: String },
}

pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

pub fn is_image(cfg: &Extraction, path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| cfg.image_extensions.iter().any(|e| *e == ext))
}

/// Determine a file's page count without rendering anything. Images are one
/// page by definition; PDFs are opened once and their count read off.
pub async fn page_count(cfg: &Extraction, path: &Path) -> Result<u32> {
    if !is_pdf(path) {
        let meta = std::fs::metadata(path).map_err(|e| OcrError::FileOpenFailure {
            file: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !meta.is_file() {
            return Err(OcrError::FileOpenFailure {
                file: path.to_path_buf(),
                message: "not a regular file".into(),
            });
        }
        return Ok(1);
    }

    let cfg = cfg.clone();
    let path_buf = path.to_path_buf();
    let count = spawn_blocking(move || -> std::result::Result<u32, String> {
        let pdfium = bind_pdfium(&cfg)?;
        let document = pdfium
            .load_pdf_from_file(&path_buf, None)
            .map_err(|e| format!("open PDF: {e}"))?;
        Ok(document.pages().len() as u32)
    })
    .await
    .map_err(|e| OcrError::FileOpenFailure {
        file: path.to_path_buf(),
        message: format!("page count task failed: {e}"),
    })?;

    count.map_err(|message| OcrError::FileOpenFailure {
        file: path.to_path_buf(),
        message,
    })
}

/// Lazily produce a file's page images.
///
/// The rendering runs on a blocking task, strictly sequential within the
/// file, and hands pages to the async side over a bounded channel, so a slow
/// consumer backpressures the rasterizer. Dropping the receiver stops the
/// task at the next page boundary. Re-calling on the same path re-opens the
/// file and yields the same sequence.
pub fn stream_pages(cfg: &Extraction, path: &Path) -> mpsc::Receiver<PageEvent> {
    let (tx, rx) = mpsc::channel(cfg.page_buffer.max(1));
    let cfg = cfg.clone();
    let path = path.to_path_buf();

    spawn_blocking(move || {
        if is_pdf(&path) {
            render_pdf_pages(&cfg, &path, &tx);
        } else {
            send_image_file(&path, &tx);
        }
    });

    rx
}

fn send_image_file(path: &Path, tx: &mpsc::Sender<PageEvent>) {
    // Raw bytes pass through; the worker decodes the image itself.
    let event = match std::fs::read(path) {
        Ok(image) => PageEvent::Page {
            page_index: 0,
            image,
        },
        Err(e) => PageEvent::FileFailed {
            message: e.to_string(),
        },
    };
    let _ = tx.blocking_send(event);
}

fn render_pdf_pages(cfg: &Extraction, path: &Path, tx: &mpsc::Sender<PageEvent>) {
    let pdfium = match bind_pdfium(cfg) {
        Ok(pdfium) => pdfium,
        Err(message) => {
            let _ = tx.blocking_send(PageEvent::FileFailed { message });
            return;
        }
    };
    let document = match pdfium.load_pdf_from_file(path, None) {
        Ok(document) => document,
        Err(e) => {
            let _ = tx.blocking_send(PageEvent::FileFailed {
                message: format!("open PDF: {e}"),
            });
            return;
        }
    };

    let render_config = PdfRenderConfig::new().scale_page_by_factor(cfg.render_scale);
    let page_total = document.pages().len();
    debug!(file = %path.display(), pages = page_total, "rendering PDF");

    for index in 0..page_total {
        let event = match render_one_page(&document, index, &render_config) {
            Ok(image) => PageEvent::Page {
                page_index: index as u32,
                image,
            },
            Err(message) => {
                warn!(file = %path.display(), page = index, "render failed: {message}");
                PageEvent::PageFailed {
                    page_index: index as u32,
                    message,
                }
            }
        };
        if tx.blocking_send(event).is_err() {
            // Consumer is gone (batch cancelled); stop rendering.
            return;
        }
    }
}

fn render_one_page(
    document: &PdfDocument<'_>,
    index: u16,
    config: &PdfRenderConfig,
) -> std::result::Result<Vec<u8>, String> {
    let page = document
        .pages()
        .get(index)
        .map_err(|e| format!("get page: {e}"))?;
    let bitmap = page
        .render_with_config(config)
        .map_err(|e| format!("render: {e}"))?;
    let image = bitmap.as_image();

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| format!("encode PNG: {e}"))?;
    Ok(png)
}

fn bind_pdfium(cfg: &Extraction) -> std::result::Result<Pdfium, String> {
    let bindings = if cfg.pdfium_library.is_empty() {
        Pdfium::bind_to_system_library()
    } else {
        Pdfium::bind_to_library(&cfg.pdfium_library)
    }
    .map_err(|e| format!("bind pdfium: {e}"))?;
    Ok(Pdfium::new(bindings))
}
