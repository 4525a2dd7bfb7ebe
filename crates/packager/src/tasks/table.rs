//! §4.3 TableDownloadTask: export a study+user+date-range subset of a data
//! table to CSV, and, when the schema has attachment columns referenced by
//! at least one row, fetch those attachments in bulk and rewrite the CSV
//! so attachment cells name local files inside the attachment zip.

use std::collections::{
    BTreeSet,
    HashSet,
};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use common::{
    PackagerConfig,
    TableId,
    UploadSchema,
};
use csv_async::{
    AsyncReaderBuilder,
    AsyncWriterBuilder,
};
use file_space::FileSpace;
use futures::StreamExt;
use table_service::{
    BulkDownloadRequest,
    HandleResult,
    TableService,
};
use tokio_util::compat::{
    TokioAsyncReadCompatExt,
    TokioAsyncWriteCompatExt,
};

/// Files produced by a successful task run, per spec's `DownloadTaskContext`
/// retention invariant: either `(edited_csv, bulk_download)` or `(csv,)`
/// alone.
pub enum TableDownloadOutput {
    CsvOnly(PathBuf),
    CsvWithAttachments {
        edited_csv: PathBuf,
        bulk_download: PathBuf,
    },
}

impl TableDownloadOutput {
    pub fn into_files(self) -> Vec<PathBuf> {
        match self {
            TableDownloadOutput::CsvOnly(csv) => vec![csv],
            TableDownloadOutput::CsvWithAttachments {
                edited_csv,
                bulk_download,
            } => vec![edited_csv, bulk_download],
        }
    }
}

/// Tracks which of this task's files currently exist on disk, so any exit
/// path can clean up exactly the files it created (spec's "cleanupFiles").
#[derive(Default)]
struct TaskContext {
    csv_file: Option<PathBuf>,
    bulk_download_file: Option<PathBuf>,
    edited_csv_file: Option<PathBuf>,
}

impl TaskContext {
    /// Idempotent: deletes whatever is present, clears the fields, so a
    /// second call is a no-op (spec invariant: "cleanup twice is a no-op").
    async fn cleanup(&mut self, file_space: &dyn FileSpace) -> anyhow::Result<()> {
        for slot in [
            &mut self.csv_file,
            &mut self.bulk_download_file,
            &mut self.edited_csv_file,
        ] {
            if let Some(path) = slot.take() {
                if file_space.exists(&path).await {
                    file_space.delete_file(&path).await?;
                }
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    table_id: TableId,
    schema: UploadSchema,
    health_code: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    temp_dir: PathBuf,
    table_service: Arc<dyn TableService>,
    file_space: Arc<dyn FileSpace>,
    config: &PackagerConfig,
) -> anyhow::Result<TableDownloadOutput> {
    let mut ctx = TaskContext::default();
    match run_inner(
        &table_id,
        &schema,
        &health_code,
        start_date,
        end_date,
        &temp_dir,
        &*table_service,
        &*file_space,
        &mut ctx,
        config,
    )
    .await
    {
        Ok(output) => Ok(output),
        Err(e) => {
            ctx.cleanup(&*file_space).await?;
            Err(e)
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    table_id: &TableId,
    schema: &UploadSchema,
    health_code: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    temp_dir: &std::path::Path,
    table_service: &dyn TableService,
    file_space: &dyn FileSpace,
    ctx: &mut TaskContext,
    config: &PackagerConfig,
) -> anyhow::Result<TableDownloadOutput> {
    // Step 1: build the query.
    let query = format!(
        "SELECT * FROM {table_id} WHERE healthCode='{health_code}' AND uploadDate >= '{start_date}' AND uploadDate <= '{end_date}'"
    );

    // Step 2: run the export, download the raw CSV.
    let token = table_service
        .start_csv_export(&query, table_id, true, false)
        .await?;
    let download_result = table_service::poll(config.poll_interval, config.poll_max_tries, || {
        table_service.poll_csv_export(&token, table_id)
    })
    .await?;
    let csv_path = file_space.new_file(temp_dir, &format!("{table_id}.csv"));
    ctx.csv_file = Some(csv_path.clone());
    table_service
        .download_file_handle(&download_result.results_file_handle_id, &csv_path)
        .await?;

    // Step 3/4/5: decide whether any attachment handles need a bulk
    // download.
    let attachment_columns: HashSet<&str> = schema
        .attachment_field_names()
        .into_iter()
        .collect();
    let (has_data_rows, handle_ids) = if attachment_columns.is_empty() {
        (has_data_rows(file_space, &csv_path).await?, BTreeSet::new())
    } else {
        collect_attachment_handles(file_space, &csv_path, &attachment_columns).await?
    };

    if !has_data_rows || attachment_columns.is_empty() || handle_ids.is_empty() {
        return Ok(TableDownloadOutput::CsvOnly(csv_path));
    }

    // Step 6: bulk-download the referenced attachments.
    let bulk_token = table_service
        .start_bulk_download(BulkDownloadRequest {
            table_id: table_id.clone(),
            file_handle_ids: handle_ids.iter().cloned().collect(),
        })
        .await?;
    let bulk_result = table_service::poll(config.poll_interval, config.poll_max_tries, || {
        table_service.poll_bulk_download(&bulk_token)
    })
    .await?;
    let bulk_path = file_space.new_file(temp_dir, &format!("{table_id}-attachments.zip"));
    ctx.bulk_download_file = Some(bulk_path.clone());
    table_service
        .download_file_handle(&bulk_result.file_handle_id, &bulk_path)
        .await?;

    // Step 7: rewrite the CSV, replacing attachment cells with local paths
    // or failure placeholders.
    let edited_path = file_space.new_file(temp_dir, &format!("{table_id}-edited.csv"));
    ctx.edited_csv_file = Some(edited_path.clone());
    rewrite_csv(
        file_space,
        &csv_path,
        &edited_path,
        &attachment_columns,
        &bulk_result.handle_results,
    )
    .await?;

    file_space.delete_file(&csv_path).await?;
    ctx.csv_file = None;

    Ok(TableDownloadOutput::CsvWithAttachments {
        edited_csv: edited_path,
        bulk_download: bulk_path,
    })
}

async fn has_data_rows(file_space: &dyn FileSpace, csv_path: &std::path::Path) -> anyhow::Result<bool> {
    let reader = file_space.reader(csv_path).await?;
    let mut csv_reader = AsyncReaderBuilder::new().create_reader(reader.compat());
    let mut records = csv_reader.records();
    Ok(records.next().await.is_some())
}

/// Single streaming pass: determines the attachment column indices from
/// the header, then scans every row collecting non-empty file-handle ids
/// under those columns.
async fn collect_attachment_handles(
    file_space: &dyn FileSpace,
    csv_path: &std::path::Path,
    attachment_columns: &HashSet<&str>,
) -> anyhow::Result<(bool, BTreeSet<String>)> {
    let reader = file_space.reader(csv_path).await?;
    let mut csv_reader = AsyncReaderBuilder::new().create_reader(reader.compat());
    let headers = csv_reader.headers().await?.clone();
    let attachment_indices: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| attachment_columns.contains(name))
        .map(|(i, _)| i)
        .collect();

    let mut handles = BTreeSet::new();
    let mut has_rows = false;
    let mut records = csv_reader.records();
    while let Some(record) = records.next().await {
        let record = record?;
        has_rows = true;
        for &idx in &attachment_indices {
            if let Some(cell) = record.get(idx) {
                if !cell.is_empty() {
                    handles.insert(cell.to_string());
                }
            }
        }
    }
    Ok((has_rows, handles))
}

/// Streaming row-by-row rewrite (spec §9 "CSV editing"): the header row
/// determines attachment column indices up front; every subsequent row is
/// copied through, substituting mapped local paths or failure placeholders
/// for attachment cells.
async fn rewrite_csv(
    file_space: &dyn FileSpace,
    source: &std::path::Path,
    dest: &std::path::Path,
    attachment_columns: &HashSet<&str>,
    handle_results: &std::collections::BTreeMap<String, HandleResult>,
) -> anyhow::Result<()> {
    let reader = file_space.reader(source).await?;
    let mut csv_reader = AsyncReaderBuilder::new().create_reader(reader.compat());
    let headers = csv_reader.headers().await?.clone();
    let attachment_indices: BTreeSet<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| attachment_columns.contains(name))
        .map(|(i, _)| i)
        .collect();

    let writer = file_space.writer(dest).await?;
    let mut csv_writer = AsyncWriterBuilder::new().create_writer(writer.compat_write());
    csv_writer.write_record(headers.iter()).await?;

    let mut records = csv_reader.records();
    while let Some(record) = records.next().await {
        let record = record?;
        let mut out_fields: Vec<String> = Vec::with_capacity(record.len());
        for (idx, cell) in record.iter().enumerate() {
            if attachment_indices.contains(&idx) && !cell.is_empty() {
                out_fields.push(render_attachment_cell(cell, handle_results));
            } else {
                out_fields.push(cell.to_string());
            }
        }
        csv_writer.write_record(&out_fields).await?;
    }
    csv_writer.flush().await?;
    Ok(())
}

fn render_attachment_cell(
    handle_id: &str,
    handle_results: &std::collections::BTreeMap<String, HandleResult>,
) -> String {
    match handle_results.get(handle_id) {
        Some(HandleResult::LocalPath(path)) => path.clone(),
        Some(HandleResult::Failed(code)) => format!("[failed: {code}]"),
        None => "[failed: missing]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use common::{
        FieldDef,
        FieldType,
        SchemaKey,
    };
    use table_service::{
        BulkFixture,
        FakeTableService,
    };

    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn test_config() -> PackagerConfig {
        PackagerConfig::new(std::time::Duration::ZERO, 3, 12, "bucket").unwrap()
    }

    fn schema_without_attachments() -> UploadSchema {
        UploadSchema::new(
            SchemaKey {
                study_id: "study".into(),
                schema_id: "schema".into(),
                revision: 1,
            },
            vec![FieldDef {
                name: "weight".into(),
                field_type: FieldType::Float,
            }],
        )
    }

    fn schema_with_attachments() -> UploadSchema {
        UploadSchema::new(
            SchemaKey {
                study_id: "study".into(),
                schema_id: "schema".into(),
                revision: 1,
            },
            vec![
                FieldDef {
                    name: "weight".into(),
                    field_type: FieldType::Float,
                },
                FieldDef {
                    name: "photo".into(),
                    field_type: FieldType::Attachment,
                },
            ],
        )
    }

    #[tokio::test]
    async fn csv_only_table_produces_sole_csv_output() {
        let service: Arc<dyn TableService> =
            Arc::new(FakeTableService::new().with_csv("t1", "weight\n10\n"));
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let output = run(
            TableId::from("t1"),
            schema_without_attachments(),
            "hc".into(),
            date("2024-01-01"),
            date("2024-01-31"),
            dir.clone(),
            service,
            space.clone(),
            &test_config(),
        )
        .await
        .unwrap();

        match output {
            TableDownloadOutput::CsvOnly(path) => {
                assert_eq!(path.file_name().unwrap(), "t1.csv");
            },
            _ => panic!("expected CsvOnly"),
        }
        space.delete_dir(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn attachment_columns_trigger_bulk_download_and_rewrite() {
        let mut handle_results = BTreeMap::new();
        handle_results.insert(
            "handle-1".to_string(),
            HandleResult::LocalPath("photo1.jpg".to_string()),
        );
        handle_results.insert(
            "handle-2".to_string(),
            HandleResult::Failed("NOT_FOUND".to_string()),
        );

        let service: Arc<dyn TableService> = Arc::new(
            FakeTableService::new()
                .with_csv("t1", "weight,photo\n10,handle-1\n20,handle-2\n30,\n")
                .with_bulk(
                    "t1",
                    BulkFixture {
                        zip_bytes: b"fake zip bytes".to_vec(),
                        handle_results,
                    },
                ),
        );
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let output = run(
            TableId::from("t1"),
            schema_with_attachments(),
            "hc".into(),
            date("2024-01-01"),
            date("2024-01-31"),
            dir.clone(),
            service,
            space.clone(),
            &test_config(),
        )
        .await
        .unwrap();

        let (edited, bulk) = match output {
            TableDownloadOutput::CsvWithAttachments {
                edited_csv,
                bulk_download,
            } => (edited_csv, bulk_download),
            _ => panic!("expected CsvWithAttachments"),
        };
        assert!(!space.exists(&dir.join("t1.csv")).await);
        let contents = tokio::fs::read_to_string(&edited).await.unwrap();
        assert!(contents.contains("photo1.jpg"));
        assert!(contents.contains("[failed: NOT_FOUND]"));
        assert!(contents.contains("30,\n") || contents.ends_with("30,"));
        assert!(space.exists(&bulk).await);

        space.delete_dir(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn header_only_csv_skips_bulk_download() {
        let service: Arc<dyn TableService> =
            Arc::new(FakeTableService::new().with_csv("t1", "weight,photo\n"));
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let output = run(
            TableId::from("t1"),
            schema_with_attachments(),
            "hc".into(),
            date("2024-01-01"),
            date("2024-01-31"),
            dir.clone(),
            service,
            space.clone(),
            &test_config(),
        )
        .await
        .unwrap();

        assert!(matches!(output, TableDownloadOutput::CsvOnly(_)));
        space.delete_dir(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn failure_cleans_up_all_context_files() {
        let service: Arc<dyn TableService> = Arc::new(FakeTableService::new().with_failure(
            "t1",
            "synapse export failed",
        ));
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let err = run(
            TableId::from("t1"),
            schema_without_attachments(),
            "hc".into(),
            date("2024-01-01"),
            date("2024-01-31"),
            dir.clone(),
            service,
            space.clone(),
            &test_config(),
        )
        .await
        .unwrap_err();

        assert!(errors::ErrorMetadataAnyhowExt::is_service_unavailable(
            &err
        ));
        assert!(space.is_empty(&dir).await.unwrap());
        space.delete_dir(&dir).await.unwrap();
    }
}
