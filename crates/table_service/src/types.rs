use std::collections::BTreeMap;

use common::TableId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableEntity {
    pub id: TableId,
    pub name: String,
}

/// Opaque token identifying an in-flight async job on the remote table
/// service (CSV export or bulk attachment download).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct JobToken(pub String);

/// Result of a completed CSV export job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadResult {
    pub results_file_handle_id: String,
}

/// Per-handle outcome inside a completed bulk download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleResult {
    /// Path of the file inside the resulting zip, relative to the zip root.
    LocalPath(String),
    /// A short failure code, rendered into CSV cells as `[failed: <code>]`.
    Failed(String),
}

/// Result of a completed bulk attachment download job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkDownloadResult {
    pub file_handle_id: String,
    pub handle_results: BTreeMap<String, HandleResult>,
}

/// Request to start a bulk download of the given file handles for a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkDownloadRequest {
    pub table_id: TableId,
    pub file_handle_ids: Vec<String>,
}
