use serde::{Deserialize, Serialize};

/// Final accounting for one batch, written as `report.json` next to the
/// corpus. Partial success is the normal case; failures are listed, not
/// fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub total_pages: u32,
    pub processed_pages: u32,
    pub files: Vec<FileReport>,
    pub failures: Vec<FailureReport>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub path: String,
    pub page_count: u32,
    pub status: FileStatus,
    pub pages_ok: u32,
    pub pages_failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Done,
    /// Some pages produced text, some failed.
    Partial,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub path: String,
    /// 1-based page number; absent for file-level failures.
    pub page: Option<u32>,
    pub kind: String,
    pub message: String,
}
