use std::path::PathBuf;
use thiserror::Error;

/// Failure taxonomy for the supervisor, pipeline, and summarizer.
///
/// Startup variants abort the whole session; page/file variants are recorded
/// in the batch report and recovered locally; a chunk variant aborts only the
/// summarization step.
#[derive(Error, Debug)]
pub enum OcrError {
    #[error("port discovery exhausted {attempts} attempts without a handshake file")]
    PortDiscoveryTimeout { attempts: u32 },

    #[error("worker would not launch: {0}")]
    WorkerSpawnFailure(#[source] std::io::Error),

    #[error("worker crashed before ready ({reason})")]
    WorkerCrashedBeforeReady { reason: CrashReason },

    #[error("worker degraded: {log_line}")]
    WorkerDegraded { log_line: String },

    #[error("worker launched but never became healthy within {timeout_secs}s")]
    HealthCheckTimeout { timeout_secs: u64 },

    #[error("startup cancelled by a termination signal")]
    StartupCancelled,

    #[error("page {page} of {} could not be extracted: {message}", file.display())]
    PageExtractionFailure {
        file: PathBuf,
        page: u32,
        message: String,
    },

    #[error("page {page} of {} could not be dispatched: {message}", file.display())]
    PageDispatchFailure {
        file: PathBuf,
        page: u32,
        message: String,
    },

    #[error("{} could not be opened: {message}", file.display())]
    FileOpenFailure { file: PathBuf, message: String },

    #[error("summarization chunk {chunk_index} failed: {message}")]
    SummarizationChunkFailure { chunk_index: u32, message: String },

    #[error("worker returned an error: {0}")]
    WorkerResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OcrError {
    /// Short machine-readable tag, used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            OcrError::PortDiscoveryTimeout { .. } => "port_discovery_timeout",
            OcrError::WorkerSpawnFailure(_) => "worker_spawn",
            OcrError::WorkerCrashedBeforeReady { .. } => "worker_crashed_before_ready",
            OcrError::WorkerDegraded { .. } => "worker_degraded",
            OcrError::HealthCheckTimeout { .. } => "health_check_timeout",
            OcrError::StartupCancelled => "startup_cancelled",
            OcrError::PageExtractionFailure { .. } => "page_extraction",
            OcrError::PageDispatchFailure { .. } => "page_dispatch",
            OcrError::FileOpenFailure { .. } => "file_open",
            OcrError::SummarizationChunkFailure { .. } => "summarization_chunk",
            OcrError::WorkerResponse(_) => "worker_response",
            OcrError::Http(_) => "http",
            OcrError::Io(_) => "io",
        }
    }
}

/// Why the worker died before reaching Ready: a process exit or a fatal log line.
#[derive(Debug, Clone)]
pub enum CrashReason {
    Exit(Option<i32>),
    LogLine(String),
}

impl std::fmt::Display for CrashReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashReason::Exit(Some(code)) => write!(f, "exit code {code}"),
            CrashReason::Exit(None) => write!(f, "killed by signal"),
            CrashReason::LogLine(line) => write!(f, "log line: {line}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, OcrError>;
