//! In-memory `TableService` double, in the spirit of the teacher's
//! `LocalDirStorage` sitting beside `S3Storage`: same trait, no network.
//! Built as a fixture registry rather than a scripted call sequence so
//! scenario tests can set up a whole study's worth of tables in one place.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use common::TableId;
use errors::ErrorMetadata;

use crate::poller::PollError;
use crate::trait_def::TableService;
use crate::types::{
    BulkDownloadRequest,
    BulkDownloadResult,
    DownloadResult,
    HandleResult,
    JobToken,
    TableEntity,
};

#[derive(Clone)]
pub struct BulkFixture {
    pub zip_bytes: Vec<u8>,
    pub handle_results: BTreeMap<String, HandleResult>,
}

#[derive(Default)]
pub struct FakeTableService {
    names: Mutex<BTreeMap<TableId, String>>,
    csv_fixtures: Mutex<BTreeMap<TableId, String>>,
    bulk_fixtures: Mutex<BTreeMap<TableId, BulkFixture>>,
    failing_tables: Mutex<BTreeMap<TableId, String>>,
}

fn csv_handle_id(table_id: &TableId) -> String {
    format!("{table_id}-csv-handle")
}

fn bulk_handle_id(table_id: &TableId) -> String {
    format!("{table_id}-bulk-handle")
}

impl FakeTableService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table_name(self, table_id: impl Into<TableId>, name: impl Into<String>) -> Self {
        self.names
            .lock()
            .expect("lock poisoned")
            .insert(table_id.into(), name.into());
        self
    }

    /// Registers a table whose CSV export succeeds with the given content.
    pub fn with_csv(self, table_id: impl Into<TableId>, content: impl Into<String>) -> Self {
        self.csv_fixtures
            .lock()
            .expect("lock poisoned")
            .insert(table_id.into(), content.into());
        self
    }

    /// Registers a table whose bulk attachment download succeeds.
    pub fn with_bulk(self, table_id: impl Into<TableId>, fixture: BulkFixture) -> Self {
        self.bulk_fixtures
            .lock()
            .expect("lock poisoned")
            .insert(table_id.into(), fixture);
        self
    }

    /// Registers a table whose CSV export fails at poll time.
    pub fn with_failure(self, table_id: impl Into<TableId>, message: impl Into<String>) -> Self {
        self.failing_tables
            .lock()
            .expect("lock poisoned")
            .insert(table_id.into(), message.into());
        self
    }
}

#[async_trait]
impl TableService for FakeTableService {
    async fn get_table(&self, table_id: &TableId) -> anyhow::Result<TableEntity> {
        let name = self
            .names
            .lock()
            .expect("lock poisoned")
            .get(table_id)
            .cloned()
            .unwrap_or_else(|| table_id.0.clone());
        Ok(TableEntity {
            id: table_id.clone(),
            name,
        })
    }

    async fn start_csv_export(
        &self,
        _query: &str,
        table_id: &TableId,
        _write_header: bool,
        _include_row_metadata: bool,
    ) -> anyhow::Result<JobToken> {
        Ok(JobToken(table_id.0.clone()))
    }

    async fn poll_csv_export(
        &self,
        token: &JobToken,
        _table_id: &TableId,
    ) -> Result<DownloadResult, PollError> {
        let table_id = TableId::from(token.0.clone());
        if let Some(message) = self
            .failing_tables
            .lock()
            .expect("lock poisoned")
            .get(&table_id)
        {
            return Err(PollError::Other(anyhow::Error::new(
                ErrorMetadata::service_unavailable("ServiceError", message.clone()),
            )));
        }
        Ok(DownloadResult {
            results_file_handle_id: csv_handle_id(&table_id),
        })
    }

    async fn download_file_handle(&self, handle_id: &str, local_path: &Path) -> anyhow::Result<()> {
        for (table_id, content) in self.csv_fixtures.lock().expect("lock poisoned").iter() {
            if csv_handle_id(table_id) == handle_id {
                tokio::fs::write(local_path, content.as_bytes()).await?;
                return Ok(());
            }
        }
        for (table_id, fixture) in self.bulk_fixtures.lock().expect("lock poisoned").iter() {
            if bulk_handle_id(table_id) == handle_id {
                tokio::fs::write(local_path, &fixture.zip_bytes).await?;
                return Ok(());
            }
        }
        anyhow::bail!(ErrorMetadata::service_unavailable(
            "ServiceError",
            format!("no fixture registered for file handle {handle_id}"),
        ))
    }

    async fn start_bulk_download(&self, request: BulkDownloadRequest) -> anyhow::Result<JobToken> {
        Ok(JobToken(request.table_id.0))
    }

    async fn poll_bulk_download(&self, token: &JobToken) -> Result<BulkDownloadResult, PollError> {
        let table_id = TableId::from(token.0.clone());
        let fixture = self
            .bulk_fixtures
            .lock()
            .expect("lock poisoned")
            .get(&table_id)
            .cloned()
            .ok_or_else(|| {
                PollError::Other(anyhow::Error::new(ErrorMetadata::service_unavailable(
                    "ServiceError",
                    format!("no bulk download fixture registered for {table_id}"),
                )))
            })?;
        Ok(BulkDownloadResult {
            file_handle_id: bulk_handle_id(&table_id),
            handle_results: fixture.handle_results,
        })
    }
}
