//! Cleanup policies for removed local objects

use sstio_common::{FileType, Result, ResultExt};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Name of the archive subdirectory used by `ArchiveCleaner`
pub const ARCHIVE_DIR: &str = "archive";

/// Disposes of local object files once they are removed from the provider
pub trait Cleaner: Send + Sync + fmt::Debug {
    fn clean(&self, path: &Path, file_type: FileType) -> Result<()>;
}

/// Deletes the file
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteCleaner;

impl Cleaner for DeleteCleaner {
    fn clean(&self, path: &Path, _file_type: FileType) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

/// Moves the file into an `archive` directory next to it
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveCleaner;

impl Cleaner for ArchiveCleaner {
    fn clean(&self, path: &Path, file_type: FileType) -> Result<()> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(sstio_common::Error::invalid_argument(format!(
                "cannot archive {}",
                path.display()
            )));
        };
        let archive = parent.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive)
            .with_context(|| format!("creating archive directory {}", archive.display()))?;
        let dest = archive.join(name);
        fs::rename(path, &dest)?;
        debug!("Archived {} file {} to {}", file_type, path.display(), dest.display());
        Ok(())
    }
}
