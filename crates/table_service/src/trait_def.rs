use std::path::Path;

use async_trait::async_trait;
use common::TableId;

use crate::poller::PollError;
use crate::types::{
    BulkDownloadRequest,
    BulkDownloadResult,
    DownloadResult,
    JobToken,
    TableEntity,
};

/// Remote table service client: resolve table entities, run async CSV
/// exports, download file handles, run bulk attachment downloads. See spec
/// §6 "TableService contract".
#[async_trait]
pub trait TableService: Send + Sync + 'static {
    async fn get_table(&self, table_id: &TableId) -> anyhow::Result<TableEntity>;

    /// `write_header`/`include_row_metadata` correspond to the source's
    /// `(true/false, null descriptor)` export flags.
    async fn start_csv_export(
        &self,
        query: &str,
        table_id: &TableId,
        write_header: bool,
        include_row_metadata: bool,
    ) -> anyhow::Result<JobToken>;

    async fn poll_csv_export(
        &self,
        token: &JobToken,
        table_id: &TableId,
    ) -> Result<DownloadResult, PollError>;

    async fn download_file_handle(
        &self,
        handle_id: &str,
        local_path: &Path,
    ) -> anyhow::Result<()>;

    async fn start_bulk_download(
        &self,
        request: BulkDownloadRequest,
    ) -> anyhow::Result<JobToken>;

    async fn poll_bulk_download(
        &self,
        token: &JobToken,
    ) -> Result<BulkDownloadResult, PollError>;
}
