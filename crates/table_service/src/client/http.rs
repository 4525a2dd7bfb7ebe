//! Real `TableService` implementation: a thin REST client over
//! `reqwest-middleware`, with transient-failure retry on the transport
//! layer (distinct from [`crate::poller`]'s domain-level "job not ready
//! yet" retry). Grounded on the teacher's `http_client` crate: a single
//! shared `ClientWithMiddleware` wrapping a plain `reqwest::Client`.

use std::path::Path;

use async_trait::async_trait;
use common::TableId;
use reqwest_middleware::{
    ClientBuilder,
    ClientWithMiddleware,
};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;

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

pub struct HttpTableService {
    client: ClientWithMiddleware,
    base_url: String,
}

impl HttpTableService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(serde::Deserialize)]
struct TableEntityResponse {
    id: String,
    name: String,
}

#[derive(serde::Serialize)]
struct StartExportRequest<'a> {
    query: &'a str,
    table_id: &'a str,
    write_header: bool,
    include_row_metadata: bool,
}

#[derive(serde::Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum PollCsvResponse {
    #[serde(rename_all = "camelCase")]
    Ready { results_file_handle_id: String },
    NotReady,
}

#[derive(serde::Serialize)]
struct StartBulkDownloadRequest<'a> {
    table_id: &'a str,
    file_handle_ids: &'a [String],
}

#[derive(serde::Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
enum PollBulkResponse {
    #[serde(rename_all = "camelCase")]
    Ready {
        file_handle_id: String,
        handle_results: std::collections::BTreeMap<String, HandleResultWire>,
    },
    NotReady,
}

#[derive(serde::Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum HandleResultWire {
    LocalPath { path: String },
    Failed { code: String },
}

impl From<HandleResultWire> for HandleResult {
    fn from(w: HandleResultWire) -> Self {
        match w {
            HandleResultWire::LocalPath { path } => HandleResult::LocalPath(path),
            HandleResultWire::Failed { code } => HandleResult::Failed(code),
        }
    }
}

fn service_error(context: &str, e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::Error::new(errors::ErrorMetadata::service_unavailable(
        "TableServiceError",
        format!("{context}: {e}"),
    ))
}

#[async_trait]
impl TableService for HttpTableService {
    async fn get_table(&self, table_id: &TableId) -> anyhow::Result<TableEntity> {
        let resp: TableEntityResponse = self
            .client
            .get(self.url(&format!("/tables/{}", table_id)))
            .send()
            .await
            .map_err(|e| service_error("getTable request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("getTable returned an error status", e))?
            .json()
            .await
            .map_err(|e| service_error("getTable response was malformed", e))?;
        Ok(TableEntity {
            id: TableId::from(resp.id),
            name: resp.name,
        })
    }

    async fn start_csv_export(
        &self,
        query: &str,
        table_id: &TableId,
        write_header: bool,
        include_row_metadata: bool,
    ) -> anyhow::Result<JobToken> {
        let resp = self
            .client
            .post(self.url("/exports/csv"))
            .json(&StartExportRequest {
                query,
                table_id: &table_id.0,
                write_header,
                include_row_metadata,
            })
            .send()
            .await
            .map_err(|e| service_error("startCsvExport request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("startCsvExport returned an error status", e))?;
        let token: JobToken = resp
            .json()
            .await
            .map_err(|e| service_error("startCsvExport response was malformed", e))?;
        Ok(token)
    }

    async fn poll_csv_export(
        &self,
        token: &JobToken,
        table_id: &TableId,
    ) -> Result<DownloadResult, PollError> {
        let resp = self
            .client
            .get(self.url(&format!("/exports/csv/{}", token.0)))
            .query(&[("tableId", &table_id.0)])
            .send()
            .await
            .map_err(|e| service_error("pollCsvExport request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("pollCsvExport returned an error status", e))?;
        let body: PollCsvResponse = resp
            .json()
            .await
            .map_err(|e| service_error("pollCsvExport response was malformed", e))?;
        match body {
            PollCsvResponse::Ready {
                results_file_handle_id,
            } => Ok(DownloadResult {
                results_file_handle_id,
            }),
            PollCsvResponse::NotReady => Err(PollError::NotReady),
        }
    }

    async fn download_file_handle(&self, handle_id: &str, local_path: &Path) -> anyhow::Result<()> {
        let mut resp = self
            .client
            .get(self.url(&format!("/files/{handle_id}")))
            .send()
            .await
            .map_err(|e| service_error("downloadFileHandle request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("downloadFileHandle returned an error status", e))?;

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| service_error("failed to create local download target", e))?;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| service_error("downloadFileHandle stream failed", e))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| service_error("failed to write downloaded bytes", e))?;
        }
        file.flush()
            .await
            .map_err(|e| service_error("failed to flush downloaded file", e))?;
        Ok(())
    }

    async fn start_bulk_download(&self, request: BulkDownloadRequest) -> anyhow::Result<JobToken> {
        let resp = self
            .client
            .post(self.url("/exports/bulk"))
            .json(&StartBulkDownloadRequest {
                table_id: &request.table_id.0,
                file_handle_ids: &request.file_handle_ids,
            })
            .send()
            .await
            .map_err(|e| service_error("startBulkDownload request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("startBulkDownload returned an error status", e))?;
        let token: JobToken = resp
            .json()
            .await
            .map_err(|e| service_error("startBulkDownload response was malformed", e))?;
        Ok(token)
    }

    async fn poll_bulk_download(&self, token: &JobToken) -> Result<BulkDownloadResult, PollError> {
        let resp = self
            .client
            .get(self.url(&format!("/exports/bulk/{}", token.0)))
            .send()
            .await
            .map_err(|e| service_error("pollBulkDownload request failed", e))?
            .error_for_status()
            .map_err(|e| service_error("pollBulkDownload returned an error status", e))?;
        let body: PollBulkResponse = resp
            .json()
            .await
            .map_err(|e| service_error("pollBulkDownload response was malformed", e))?;
        match body {
            PollBulkResponse::Ready {
                file_handle_id,
                handle_results,
            } => Ok(BulkDownloadResult {
                file_handle_id,
                handle_results: handle_results
                    .into_iter()
                    .map(|(k, v)| (k, v.into()))
                    .collect(),
            }),
            PollBulkResponse::NotReady => Err(PollError::NotReady),
        }
    }
}
