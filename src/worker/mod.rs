pub mod client;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;

pub use client::HttpWorker;
pub use types::PageText;

/// The worker process seen as a remote capability. Batch and summarization
/// code depend only on this trait, so tests can substitute a fake worker.
#[async_trait]
pub trait OcrWorker: Send + Sync {
    /// Send one page image to the extraction endpoint.
    async fn extract_text(&self, image: &[u8], file_name: &str) -> Result<PageText>;

    /// Send a text (one chunk or the whole corpus) to the summarization
    /// endpoint.
    async fn summarize(&self, text: &str, prompt: &str) -> Result<String>;
}
