//! Streaming zip assembly. Grounded on the teacher's
//! `ZipSnapshotUpload`/`ZipSnapshotTableUpload` (`crates/exports/src/zip_uploader.rs`):
//! a `ZipFileWriter` wrapping the destination, one `write_entry_stream` per
//! entry, bytes copied through rather than buffered whole.

use std::path::{
    Path,
    PathBuf,
};

use async_zip::tokio::write::ZipFileWriter;
use async_zip::{
    Compression,
    ZipEntryBuilder,
};
use errors::ErrorMetadata;
use tokio::fs::File;
use tokio_util::compat::FuturesAsyncWriteCompatExt;

const ZIP_ENTRY_PERMISSIONS: u16 = 0o644;

/// Zip `inputs` (in order) into `output_path`. Entries are named by each
/// input's basename; basenames must be unique (spec §9 Open Questions: "at
/// minimum assert uniqueness before zipping"). On any failure the partial
/// output file is deleted.
pub async fn zip_files(output_path: &Path, inputs: &[PathBuf]) -> anyhow::Result<()> {
    match zip_files_inner(output_path, inputs).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(output_path).await;
            Err(e)
        },
    }
}

async fn zip_files_inner(output_path: &Path, inputs: &[PathBuf]) -> anyhow::Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for input in inputs {
        let basename = entry_name(input)?;
        if !seen.insert(basename.clone()) {
            anyhow::bail!(ErrorMetadata::fatal(
                "DuplicateArchiveEntry",
                format!("archive entry name {basename} is not unique"),
            ));
        }
    }

    let out_file = File::create(output_path).await?;
    let mut writer = ZipFileWriter::with_tokio(out_file);
    for input in inputs {
        let basename = entry_name(input)?;
        let builder = ZipEntryBuilder::new(basename.into(), Compression::Deflate)
            .unix_permissions(ZIP_ENTRY_PERMISSIONS);
        let entry_writer = writer.write_entry_stream(builder.build()).await?;
        let mut entry_writer = entry_writer.compat_write();
        let mut reader = File::open(input).await?;
        tokio::io::copy(&mut reader, &mut entry_writer).await?;
        entry_writer.into_inner().close().await?;
    }
    writer.close().await?;
    Ok(())
}

fn entry_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow::Error::new(ErrorMetadata::fatal(
                "InvalidArchiveEntry",
                format!("{} has no valid basename", path.display()),
            ))
        })
}
