use crate::config::Config;
use crate::error::OcrError;
use crate::extract::{self, PageEvent};
use crate::postprocess::Postprocessor;
use crate::report::{BatchReport, FailureReport, FileReport, FileStatus};
use crate::worker::OcrWorker;
use anyhow::Result;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// One input after the pre-scan. Files that would not open keep a page count
/// of 1 so the progress denominator stays meaningful.
#[derive(Debug, Clone)]
pub struct FileScan {
    pub path: PathBuf,
    pub page_count: u32,
    pub open_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub processed_pages: u32,
    pub total_pages: u32,
    pub file_index: u32,
    pub file_processed: u32,
    pub file_total: u32,
}

impl Progress {
    pub fn percent(&self) -> f32 {
        if self.total_pages == 0 {
            100.0
        } else {
            self.processed_pages as f32 * 100.0 / self.total_pages as f32
        }
    }

    pub fn file_percent(&self) -> f32 {
        if self.file_total == 0 {
            100.0
        } else {
            self.file_processed as f32 * 100.0 / self.file_total as f32
        }
    }
}

/// Outcome of one page after extraction, dispatch, and cleanup.
#[derive(Debug)]
pub enum PageOutcome {
    Text { page_index: u32, text: String },
    Failed { page_index: u32, error: OcrError },
}

pub struct BatchOutput {
    pub corpus: String,
    pub report: BatchReport,
}

/// Drives extraction and dispatch across an ordered set of files and
/// assembles the corpus in (file, page) order. Page and file failures are
/// recorded and skipped; the batch always finishes with best-effort partial
/// results.
pub struct Pipeline<W: OcrWorker> {
    cfg: Config,
    worker: W,
    post: Postprocessor,
}

impl<W: OcrWorker> Pipeline<W> {
    pub fn new(cfg: &Config, worker: W) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            worker,
            post: Postprocessor::new(&cfg.postprocess)?,
        })
    }

    /// The dispatcher seam, for callers that also need the worker directly
    /// (the summarization step reuses the batch's worker connection).
    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Open every file once to fix `total_pages` before any dispatch begins.
    pub async fn prescan(&self, inputs: &[PathBuf]) -> Vec<FileScan> {
        let mut scans = Vec::with_capacity(inputs.len());
        for path in inputs {
            match extract::page_count(&self.cfg.extraction, path).await {
                Ok(page_count) => scans.push(FileScan {
                    path: path.clone(),
                    page_count: page_count.max(1),
                    open_error: None,
                }),
                Err(e) => {
                    warn!("pre-scan: {e}");
                    scans.push(FileScan {
                        path: path.clone(),
                        page_count: 1,
                        open_error: Some(e.to_string()),
                    });
                }
            }
        }
        scans
    }

    /// Run the whole batch. Flipping `cancel` to true stops the batch at the
    /// next page boundary; in-flight dispatches finish naturally.
    pub async fn run_batch(
        &self,
        inputs: &[PathBuf],
        cancel: watch::Receiver<bool>,
        mut on_progress: impl FnMut(&Progress),
    ) -> BatchOutput {
        let scans = self.prescan(inputs).await;
        let total_pages: u32 = scans.iter().map(|s| s.page_count).sum();
        info!(files = scans.len(), total_pages, "batch pre-scan complete");

        let mut processed_pages = 0u32;
        let mut corpus_parts: Vec<String> = Vec::new();
        let mut files = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;

        for (file_index, scan) in scans.iter().enumerate() {
            if *cancel.borrow() {
                cancelled = true;
            }
            if cancelled {
                files.push(FileReport {
                    path: scan.path.display().to_string(),
                    page_count: scan.page_count,
                    status: FileStatus::Skipped,
                    pages_ok: 0,
                    pages_failed: 0,
                });
                continue;
            }

            if let Some(message) = &scan.open_error {
                failures.push(FailureReport {
                    path: scan.path.display().to_string(),
                    page: None,
                    kind: "file_open".into(),
                    message: message.clone(),
                });
                // The whole file counts as processed so the denominator
                // does not stall.
                processed_pages = (processed_pages + scan.page_count).min(total_pages);
                on_progress(&Progress {
                    processed_pages,
                    total_pages,
                    file_index: file_index as u32,
                    file_processed: scan.page_count,
                    file_total: scan.page_count,
                });
                files.push(FileReport {
                    path: scan.path.display().to_string(),
                    page_count: scan.page_count,
                    status: FileStatus::Failed,
                    pages_ok: 0,
                    pages_failed: 0,
                });
                continue;
            }

            info!(file = %scan.path.display(), pages = scan.page_count, "processing file");
            let events = receiver_stream(extract::stream_pages(&self.cfg.extraction, &scan.path));
            let mut file_processed = 0u32;
            let (outcomes, file_error) = dispatch_pages(
                &self.worker,
                &self.post,
                &scan.path,
                events,
                self.cfg.batch.max_concurrent_dispatch,
                &cancel,
                || {
                    if processed_pages < total_pages {
                        processed_pages += 1;
                    }
                    file_processed += 1;
                    on_progress(&Progress {
                        processed_pages,
                        total_pages,
                        file_index: file_index as u32,
                        file_processed,
                        file_total: scan.page_count,
                    });
                },
            )
            .await;

            if let Some(message) = file_error {
                failures.push(FailureReport {
                    path: scan.path.display().to_string(),
                    page: None,
                    kind: "file_open".into(),
                    message,
                });
                processed_pages = (processed_pages + scan.page_count).min(total_pages);
                on_progress(&Progress {
                    processed_pages,
                    total_pages,
                    file_index: file_index as u32,
                    file_processed: scan.page_count,
                    file_total: scan.page_count,
                });
                files.push(FileReport {
                    path: scan.path.display().to_string(),
                    page_count: scan.page_count,
                    status: FileStatus::Failed,
                    pages_ok: 0,
                    pages_failed: 0,
                });
                continue;
            }

            let mut pages_ok = 0u32;
            let mut pages_failed = 0u32;
            let multi_page = scan.page_count > 1;

            for outcome in &outcomes {
                match outcome {
                    PageOutcome::Text { .. } => pages_ok += 1,
                    PageOutcome::Failed { page_index, error } => {
                        pages_failed += 1;
                        failures.push(FailureReport {
                            path: scan.path.display().to_string(),
                            page: Some(page_index + 1),
                            kind: error.kind().into(),
                            message: error.to_string(),
                        });
                    }
                }
            }

            let file_corpus = assemble_file_text(&outcomes, multi_page);
            if !file_corpus.is_empty() {
                corpus_parts.push(file_corpus);
            }

            if *cancel.borrow() {
                cancelled = true;
            }
            let complete = pages_ok + pages_failed >= scan.page_count;
            let status = if pages_failed == 0 && complete {
                FileStatus::Done
            } else if pages_ok > 0 {
                FileStatus::Partial
            } else if pages_failed > 0 {
                FileStatus::Failed
            } else {
                FileStatus::Skipped
            };
            files.push(FileReport {
                path: scan.path.display().to_string(),
                page_count: scan.page_count,
                status,
                pages_ok,
                pages_failed,
            });
        }

        if cancelled {
            warn!("batch cancelled; {processed_pages}/{total_pages} pages processed");
        }

        BatchOutput {
            corpus: corpus_parts.join("\n\n"),
            report: BatchReport {
                total_pages,
                processed_pages,
                files,
                failures,
                cancelled,
            },
        }
    }
}

/// Dispatch one file's page events against the worker, up to
/// `max_concurrent` pages in flight, yielding outcomes in page order no
/// matter which network calls return first. `on_page_done` fires once per
/// completed page, in completion order.
pub async fn dispatch_pages<W, S>(
    worker: &W,
    post: &Postprocessor,
    file: &Path,
    events: S,
    max_concurrent: usize,
    cancel: &watch::Receiver<bool>,
    mut on_page_done: impl FnMut(),
) -> (Vec<PageOutcome>, Option<String>)
where
    W: OcrWorker,
    S: Stream<Item = PageEvent>,
{
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("page")
        .to_string();

    let cancel = cancel.clone();
    let dispatched = events
        .take_while(move |_| {
            let keep_going = !*cancel.borrow();
            async move { keep_going }
        })
        .map(|event| {
            let stem = stem.clone();
            let file = file.to_path_buf();
            async move {
                match event {
                    PageEvent::Page { page_index, image } => {
                        let name = format!("{stem}_p{:04}.png", page_index + 1);
                        match worker.extract_text(&image, &name).await {
                            Ok(page) => Dispatched::Outcome(PageOutcome::Text {
                                page_index,
                                text: post.clean(&page.text, &page.language),
                            }),
                            Err(e) => Dispatched::Outcome(PageOutcome::Failed {
                                page_index,
                                error: OcrError::PageDispatchFailure {
                                    file,
                                    page: page_index + 1,
                                    message: e.to_string(),
                                },
                            }),
                        }
                    }
                    PageEvent::PageFailed {
                        page_index,
                        message,
                    } => Dispatched::Outcome(PageOutcome::Failed {
                        page_index,
                        error: OcrError::PageExtractionFailure {
                            file,
                            page: page_index + 1,
                            message,
                        },
                    }),
                    PageEvent::FileFailed { message } => Dispatched::FileFailed(message),
                }
            }
        })
        .buffered(max_concurrent.max(1));
    futures::pin_mut!(dispatched);

    let mut outcomes = Vec::new();
    let mut file_error = None;
    while let Some(item) = dispatched.next().await {
        match item {
            Dispatched::Outcome(outcome) => {
                on_page_done();
                outcomes.push(outcome);
            }
            Dispatched::FileFailed(message) => file_error = Some(message),
        }
    }
    (outcomes, file_error)
}

enum Dispatched {
    Outcome(PageOutcome),
    FileFailed(String),
}

/// Join one file's successful page texts in page order. Multi-page files get
/// a `--- Page N ---` marker per page; single-page files contribute bare
/// text. Failed pages contribute nothing.
pub fn assemble_file_text(outcomes: &[PageOutcome], multi_page: bool) -> String {
    let mut parts = Vec::new();
    for outcome in outcomes {
        if let PageOutcome::Text { page_index, text } = outcome {
            if text.is_empty() {
                continue;
            }
            if multi_page {
                parts.push(format!("--- Page {} ---\n{}", page_index + 1, text));
            } else {
                parts.push(text.clone());
            }
        }
    }
    parts.join("\n\n")
}

/// Adapt a bounded page channel into a stream the dispatcher can consume.
pub fn receiver_stream<T>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}
