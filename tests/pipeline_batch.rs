use async_trait::async_trait;
use futures::stream;
use ocr_foreman::config::Config;
use ocr_foreman::error::{OcrError, Result};
use ocr_foreman::extract::PageEvent;
use ocr_foreman::pipeline::{
    assemble_file_text, dispatch_pages, PageOutcome, Pipeline,
};
use ocr_foreman::postprocess::Postprocessor;
use ocr_foreman::worker::{OcrWorker, PageText};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::watch;

/// Fake dispatcher: answers with a text derived from the upload name, fails
/// any name containing `fail_marker`, and finishes later pages sooner so the
/// ordering guarantee is actually exercised.
struct FakeWorker {
    calls: AtomicU32,
    fail_marker: Option<&'static str>,
    reverse_latency: bool,
}

impl FakeWorker {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_marker: None,
            reverse_latency: false,
        }
    }
}

fn page_number(file_name: &str) -> u32 {
    file_name
        .rsplit("_p")
        .next()
        .and_then(|s| s.trim_end_matches(".png").parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl OcrWorker for FakeWorker {
    async fn extract_text(&self, _image: &[u8], file_name: &str) -> Result<PageText> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = self.fail_marker {
            if file_name.contains(marker) {
                return Err(OcrError::WorkerResponse("no text detected".into()));
            }
        }
        if self.reverse_latency {
            // Page 1 waits longest; completion order is the reverse of
            // page order.
            let delay = 40u64.saturating_mul(4u64.saturating_sub(page_number(file_name) as u64));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(PageText {
            text: format!("text {file_name}"),
            language: "english".into(),
        })
    }

    async fn summarize(&self, _text: &str, _prompt: &str) -> Result<String> {
        Ok(String::new())
    }
}

fn page(page_index: u32) -> PageEvent {
    PageEvent::Page {
        page_index,
        image: vec![page_index as u8],
    }
}

#[tokio::test]
async fn assembly_is_in_page_order_despite_completion_order() {
    let worker = FakeWorker {
        reverse_latency: true,
        ..FakeWorker::new()
    };
    let post = Postprocessor::new(&Default::default()).unwrap();
    let (_tx, cancel) = watch::channel(false);
    let events = stream::iter(vec![page(0), page(1), page(2)]);

    let mut completions = 0u32;
    let (outcomes, file_error) = dispatch_pages(
        &worker,
        &post,
        Path::new("doc.pdf"),
        events,
        3,
        &cancel,
        || completions += 1,
    )
    .await;

    assert!(file_error.is_none());
    assert_eq!(completions, 3);

    let text = assemble_file_text(&outcomes, true);
    let p1 = text.find("--- Page 1 ---").expect("page 1 marker");
    let p2 = text.find("--- Page 2 ---").expect("page 2 marker");
    let p3 = text.find("--- Page 3 ---").expect("page 3 marker");
    assert!(p1 < p2 && p2 < p3);
    assert!(text.contains("text doc_p0001.png"));
}

#[tokio::test]
async fn page_failure_contributes_no_text_but_counts() {
    let worker = FakeWorker {
        fail_marker: Some("_p0001"),
        ..FakeWorker::new()
    };
    let post = Postprocessor::new(&Default::default()).unwrap();
    let (_tx, cancel) = watch::channel(false);
    let events = stream::iter(vec![page(0), page(1)]);

    let mut completions = 0u32;
    let (outcomes, _) = dispatch_pages(
        &worker,
        &post,
        Path::new("doc.pdf"),
        events,
        2,
        &cancel,
        || completions += 1,
    )
    .await;

    assert_eq!(completions, 2);
    assert!(matches!(
        outcomes[0],
        PageOutcome::Failed {
            page_index: 0,
            error: OcrError::PageDispatchFailure { page: 1, .. },
        }
    ));

    let text = assemble_file_text(&outcomes, true);
    assert!(!text.contains("--- Page 1 ---"));
    assert!(text.contains("--- Page 2 ---"));
}

#[tokio::test]
async fn extraction_failure_passes_through_as_page_error() {
    let worker = FakeWorker::new();
    let post = Postprocessor::new(&Default::default()).unwrap();
    let (_tx, cancel) = watch::channel(false);
    let events = stream::iter(vec![
        PageEvent::PageFailed {
            page_index: 0,
            message: "render failed".into(),
        },
        page(1),
    ]);

    let (outcomes, file_error) = dispatch_pages(
        &worker,
        &post,
        Path::new("doc.pdf"),
        events,
        2,
        &cancel,
        || {},
    )
    .await;

    assert!(file_error.is_none());
    assert!(matches!(
        outcomes[0],
        PageOutcome::Failed {
            error: OcrError::PageExtractionFailure { .. },
            ..
        }
    ));
    // Only the surviving page went over the wire.
    assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_reports_fixed_totals_and_partial_corpus() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.png");
    let bad = dir.path().join("bad.png");
    let c = dir.path().join("c.png");
    let missing = dir.path().join("missing.png");
    for p in [&a, &bad, &c] {
        std::fs::write(p, b"not really a png").unwrap();
    }

    let cfg = Config::default();
    let worker = FakeWorker {
        fail_marker: Some("bad"),
        ..FakeWorker::new()
    };
    let pipeline = Pipeline::new(&cfg, worker).unwrap();

    let inputs = vec![a, bad, c, missing];
    let (_tx, cancel) = watch::channel(false);
    let mut seen_processed = Vec::new();
    let output = pipeline
        .run_batch(&inputs, cancel, |progress| {
            assert_eq!(progress.total_pages, 4);
            seen_processed.push(progress.processed_pages);
        })
        .await;

    // processedPages is monotonic and lands exactly on the pre-scanned total.
    assert!(seen_processed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(output.report.total_pages, 4);
    assert_eq!(output.report.processed_pages, 4);
    assert!(!output.report.cancelled);

    // Corpus holds only the two successful files, in submission order.
    let pos_a = output.corpus.find("text a_p0001.png").expect("file a text");
    let pos_c = output.corpus.find("text c_p0001.png").expect("file c text");
    assert!(pos_a < pos_c);
    assert!(!output.corpus.contains("bad"));

    assert_eq!(output.report.failures.len(), 2);
    let kinds: Vec<&str> = output
        .report
        .failures
        .iter()
        .map(|f| f.kind.as_str())
        .collect();
    assert!(kinds.contains(&"page_dispatch"));
    assert!(kinds.contains(&"file_open"));
}

#[tokio::test]
async fn prescan_fixes_totals_before_processing() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.jpg");
    std::fs::write(&a, b"x").unwrap();
    std::fs::write(&b, b"y").unwrap();

    let cfg = Config::default();
    let pipeline = Pipeline::new(&cfg, FakeWorker::new()).unwrap();
    let scans = pipeline.prescan(&[a, b]).await;

    assert_eq!(scans.len(), 2);
    assert!(scans.iter().all(|s| s.page_count == 1 && s.open_error.is_none()));
}

#[tokio::test]
async fn cancelled_batch_skips_remaining_files() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a.png");
    std::fs::write(&a, b"x").unwrap();

    let cfg = Config::default();
    let pipeline = Pipeline::new(&cfg, FakeWorker::new()).unwrap();

    let (tx, cancel) = watch::channel(false);
    tx.send(true).unwrap();
    let output = pipeline.run_batch(&[a], cancel, |_| {}).await;

    assert!(output.report.cancelled);
    assert!(output.corpus.is_empty());
    assert_eq!(output.report.processed_pages, 0);
}
