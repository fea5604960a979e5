// pgbackup/src/backup/archive.rs
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tar::Builder;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};
use crate::utils::cancellable;

/// Packs a directory tree into a single archive file.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(
        &self,
        source_dir: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Writes `.tar.gz` archives on a blocking worker thread.
pub struct TarGzArchiver;

#[async_trait]
impl Archiver for TarGzArchiver {
    async fn archive(
        &self,
        source_dir: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source_dir = source_dir.to_path_buf();
        let destination = destination.to_path_buf();
        let handle =
            tokio::task::spawn_blocking(move || create_tar_gz_archive(&source_dir, &destination));

        cancellable(cancel, "data directory archive", async move { handle.await? })
            .await
            .map(|_| ())
    }
}

/// Creates a GZipped TAR archive from a source directory.
///
/// Entries are rooted at the directory's own name, the same layout
/// `tar -C <parent> -czf <dest> <name>` produces. Symlinks are stored as links.
/// Files that disappear while the archive is written (a live server recycles WAL
/// segments and temp files) are skipped with a warning.
///
/// # Returns
/// Path to the created archive file.
pub fn create_tar_gz_archive(source_dir: &Path, archive_dest_path: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(AppError::MissingDataDirectory(source_dir.to_path_buf()));
    }
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let root_name = source_dir
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));

    tracing::debug!(
        "Creating tar.gz archive from {} to {}",
        source_dir.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path)?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_vanished(e.io_error()) => {
                tracing::warn!("Skipping entry that vanished during archiving: {}", e);
                continue;
            }
            Err(e) => return Err(AppError::Walk(e)),
        };

        let path = entry.path();
        let relative = path.strip_prefix(source_dir).map_err(|e| {
            AppError::Io(io::Error::other(format!(
                "Failed to strip prefix {} from {}: {}",
                source_dir.display(),
                path.display(),
                e
            )))
        })?;
        let name = root_name.join(relative);
        let file_type = entry.file_type();

        let appended = if file_type.is_dir() {
            tar_builder.append_dir(&name, path)
        } else if file_type.is_file() || file_type.is_symlink() {
            tar_builder.append_path_with_name(path, &name)
        } else {
            // sockets, fifos: nothing to restore from them
            continue;
        };

        match appended {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("Skipping {} which vanished during archiving", path.display());
            }
            Err(e) => return Err(AppError::Io(e)),
        }
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?.sync_all()?;

    tracing::debug!("Tar.gz archive created at {}", archive_dest_path.display());
    Ok(archive_dest_path.to_path_buf())
}

fn is_vanished(err: Option<&io::Error>) -> bool {
    err.is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}
