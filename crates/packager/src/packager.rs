//! §4.4 Packager: the orchestrator. Creates the request's temp directory,
//! fans out one task per table/survey to a bounded pool, collects outputs
//! and failures, zips and uploads the archive, mints a pre-signed URL, and
//! tears down the temp directory on every exit path.
//!
//! Fan-out/join is grounded on the teacher's
//! `crates/application/src/exports/export_storage.rs` (`Semaphore` +
//! bounded concurrency), adapted from `try_buffer_unordered` (which
//! short-circuits on first error) to `JoinSet` + per-task `Result`
//! collection, since sibling task failures must never cancel each other
//! (spec §5 Cancellation).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{
    DateTime,
    Utc,
};
use common::{
    Clock,
    PackagerConfig,
    Request,
    SurveyTableSet,
    TableId,
    TableMapping,
};
use errors::ErrorMetadata;
use file_space::FileSpace;
use futures::FutureExt;
use object_store::ObjectStore;
use table_service::TableService;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error_log::{
    format_error_log,
    ErrorEntry,
};
use crate::tasks::table::TableDownloadOutput;
use crate::{
    tasks,
    zip_helper,
};

const DEFAULT_CONCURRENCY: usize = 8;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresignedUrlInfo {
    pub url: String,
    pub expiration_time: DateTime<Utc>,
}

pub struct Packager<C: Clock> {
    table_service: Arc<dyn TableService>,
    file_space: Arc<dyn FileSpace>,
    object_store: Arc<dyn ObjectStore>,
    clock: C,
    config: PackagerConfig,
    concurrency: usize,
}

enum TaskOutcome {
    Data {
        table_id: TableId,
        result: anyhow::Result<TableDownloadOutput>,
    },
    Survey {
        table_id: TableId,
        result: anyhow::Result<PathBuf>,
    },
}

impl<C: Clock> Packager<C> {
    pub fn new(
        table_service: Arc<dyn TableService>,
        file_space: Arc<dyn FileSpace>,
        object_store: Arc<dyn ObjectStore>,
        clock: C,
        config: PackagerConfig,
    ) -> Self {
        Self {
            table_service,
            file_space,
            object_store,
            clock,
            config,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn package_synapse_data(
        &self,
        table_to_schema: TableMapping,
        health_code: String,
        request: Request,
        survey_table_ids: SurveyTableSet,
    ) -> anyhow::Result<Option<PresignedUrlInfo>> {
        if table_to_schema.is_empty() && survey_table_ids.is_empty() {
            tracing::info!("nothing to package: no schemas and no surveys");
            return Ok(None);
        }

        let temp_dir = self.file_space.create_temp_dir().await?;
        let result = self
            .package_within_temp_dir(
                &temp_dir,
                table_to_schema,
                health_code,
                request,
                survey_table_ids,
            )
            .await;
        self.file_space.delete_dir(&temp_dir).await?;
        result
    }

    async fn package_within_temp_dir(
        &self,
        temp_dir: &std::path::Path,
        table_to_schema: TableMapping,
        health_code: String,
        request: Request,
        survey_table_ids: SurveyTableSet,
    ) -> anyhow::Result<Option<PresignedUrlInfo>> {
        let outcomes = self
            .run_tasks(temp_dir, table_to_schema, &health_code, &request, survey_table_ids)
            .await;

        let mut output_files: Vec<PathBuf> = Vec::new();
        let mut data_errors: Vec<ErrorEntry> = Vec::new();
        let mut survey_errors: Vec<ErrorEntry> = Vec::new();

        for outcome in outcomes {
            match outcome {
                TaskOutcome::Data { table_id, result } => match result {
                    Ok(output) => output_files.extend(output.into_files()),
                    Err(error) => {
                        tracing::warn!(table_id = %table_id, "data table task failed");
                        data_errors.push(ErrorEntry { table_id, error });
                    },
                },
                TaskOutcome::Survey { table_id, result } => match result {
                    Ok(path) => output_files.push(path),
                    Err(error) => {
                        tracing::warn!(table_id = %table_id, "survey task failed");
                        survey_errors.push(ErrorEntry { table_id, error });
                    },
                },
            }
        }

        if !data_errors.is_empty() {
            let path = self.file_space.new_file(temp_dir, "error.log");
            self.write_text_file(&path, &format_error_log(&data_errors)).await?;
            output_files.push(path);
        }
        if !survey_errors.is_empty() {
            let path = self.file_space.new_file(temp_dir, "metadata-error.log");
            self.write_text_file(&path, &format_error_log(&survey_errors)).await?;
            output_files.push(path);
        }

        if output_files.is_empty() {
            tracing::info!("no files produced, skipping upload");
            return Ok(None);
        }

        let archive_name = archive_key(&request);
        let archive_path = self.file_space.new_file(temp_dir, &archive_name);
        zip_helper::zip_files(&archive_path, &output_files).await?;

        self.object_store
            .put_file(&self.config.userdata_bucket, &archive_name, &archive_path)
            .await?;

        let expiration_time =
            self.clock.now() + chrono::Duration::hours(self.config.url_expiration_hours);
        let url = self
            .object_store
            .generate_presigned_url(&self.config.userdata_bucket, &archive_name, expiration_time)
            .await?;

        Ok(Some(PresignedUrlInfo {
            url,
            expiration_time,
        }))
    }

    async fn run_tasks(
        &self,
        temp_dir: &std::path::Path,
        table_to_schema: TableMapping,
        health_code: &str,
        request: &Request,
        survey_table_ids: SurveyTableSet,
    ) -> Vec<TaskOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut joins = JoinSet::new();

        for (table_id, schema) in table_to_schema.iter() {
            let table_id = table_id.clone();
            let schema = schema.clone();
            let health_code = health_code.to_string();
            let start_date = request.start_date;
            let end_date = request.end_date;
            let temp_dir = temp_dir.to_path_buf();
            let table_service = self.table_service.clone();
            let file_space = self.file_space.clone();
            let semaphore = semaphore.clone();
            let config = self.config.clone();
            joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = catch_task_panic(tasks::table::run(
                    table_id.clone(),
                    schema,
                    health_code,
                    start_date,
                    end_date,
                    temp_dir,
                    table_service,
                    file_space,
                    &config,
                ))
                .await;
                TaskOutcome::Data { table_id, result }
            });
        }

        for table_id in survey_table_ids.iter() {
            let table_id = table_id.clone();
            let temp_dir = temp_dir.to_path_buf();
            let table_service = self.table_service.clone();
            let file_space = self.file_space.clone();
            let semaphore = semaphore.clone();
            let config = self.config.clone();
            joins.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = catch_task_panic(tasks::survey::run(
                    table_id.clone(),
                    temp_dir,
                    table_service,
                    file_space,
                    &config,
                ))
                .await;
                TaskOutcome::Survey { table_id, result }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // Only reachable if something outside catch_task_panic's
                // scope panics (e.g. the runtime itself); every task's own
                // panic is already folded into its TaskOutcome above.
                Err(join_error) => {
                    tracing::error!(%join_error, "task panicked outside its own future");
                },
            }
        }
        outcomes
    }

    async fn write_text_file(&self, path: &std::path::Path, contents: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut writer = self.file_space.writer(path).await?;
        writer.write_all(contents.as_bytes()).await.map_err(|e| {
            anyhow::Error::new(e).context(ErrorMetadata::fatal(
                "ErrorLogWriteFailed",
                format!("failed to write {}", path.display()),
            ))
        })?;
        writer.flush().await?;
        Ok(())
    }
}

/// Folds a task panic into its own `Result` instead of letting it surface as
/// a `JoinError`, so one table/survey's bug degrades to a normal per-task
/// failure (spec §5: a sibling's panic must not cancel anything or go
/// unrecorded).
async fn catch_task_panic<T>(
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&panic);
            Err(anyhow::Error::new(ErrorMetadata::fatal(
                "TaskPanicked",
                format!("task panicked: {message}"),
            )))
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn archive_key(request: &Request) -> String {
    let suffix = random_suffix();
    format!(
        "userdata-{}-to-{}-{}.zip",
        request.start_date, request.end_date, suffix
    )
}

fn random_suffix() -> String {
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[fastrand::usize(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
