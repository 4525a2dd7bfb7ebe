//! §4.2 SurveyDownloadTask: resolve a survey table's display name, export
//! its full contents, download into the request's temp directory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use common::{
    PackagerConfig,
    TableId,
};
use file_space::FileSpace;
use table_service::TableService;

pub async fn run(
    table_id: TableId,
    temp_dir: PathBuf,
    table_service: Arc<dyn TableService>,
    file_space: Arc<dyn FileSpace>,
    config: &PackagerConfig,
) -> anyhow::Result<PathBuf> {
    let entity = table_service.get_table(&table_id).await?;
    let query = format!("SELECT * FROM {}", table_id);
    let token = table_service
        .start_csv_export(&query, &table_id, true, false)
        .await?;

    let download_result = table_service::poll(config.poll_interval, config.poll_max_tries, || {
        table_service.poll_csv_export(&token, &table_id)
    })
    .await?;

    let csv_path = file_space.new_file(&temp_dir, &format!("{}.csv", entity.name));
    let start = Instant::now();
    let download = table_service
        .download_file_handle(&download_result.results_file_handle_id, &csv_path)
        .await;
    let elapsed = start.elapsed();
    tracing::info!(table_id = %table_id, ?elapsed, ok = download.is_ok(), "survey download finished");

    if let Err(e) = download {
        if file_space.exists(&csv_path).await {
            file_space.delete_file(&csv_path).await?;
        }
        return Err(e);
    }

    Ok(csv_path)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use table_service::FakeTableService;

    use super::*;

    fn test_config() -> PackagerConfig {
        PackagerConfig::new(Duration::ZERO, 3, 12, "bucket").unwrap()
    }

    #[tokio::test]
    async fn downloads_and_names_file_after_table_name() {
        let service: Arc<dyn TableService> = Arc::new(
            FakeTableService::new()
                .with_table_name("s1", "foo-survey")
                .with_csv("s1", "q,a\n1,yes\n"),
        );
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let path = run(
            TableId::from("s1"),
            dir.clone(),
            service,
            space.clone(),
            &test_config(),
        )
        .await
        .unwrap();
        assert_eq!(path.file_name().unwrap(), "foo-survey.csv");
        assert!(space.exists(&path).await);

        space.delete_dir(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn deletes_partial_file_on_failure() {
        let service: Arc<dyn TableService> =
            Arc::new(FakeTableService::new().with_table_name("s1", "foo-survey"));
        let space: Arc<dyn FileSpace> = Arc::new(file_space::LocalFileSpace::new());
        let dir = space.create_temp_dir().await.unwrap();

        let err = run(
            TableId::from("s1"),
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
