//! Directory-backed remote storage
//!
//! Each object is a file in one flat directory. Writes go to a uniquely named
//! temporary file that is renamed into place on close, so readers never see
//! a partial object.

use crate::storage::{ObjectReader, ObjectWriter, RemoteStorage, check_range, group_listing};
use sstio_common::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of in-progress uploads; never returned by `list`
const TEMP_PREFIX: &str = ".tmp-";

/// Remote storage rooted at a local directory
#[derive(Debug)]
pub struct LocalDirStorage {
    root: PathBuf,
}

impl LocalDirStorage {
    /// Open (creating if needed) a storage directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with(TEMP_PREFIX) {
            return Err(Error::invalid_argument(format!(
                "invalid remote object name {name:?}"
            )));
        }
        Ok(self.root.join(name))
    }

    fn map_not_found(name: &str, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::NotFound {
            Error::RemoteObjectNotFound {
                name: name.to_string(),
            }
        } else {
            Error::Io(err)
        }
    }
}

impl RemoteStorage for LocalDirStorage {
    fn create_object(&self, name: &str) -> Result<Box<dyn ObjectWriter>> {
        let final_path = self.object_path(name)?;
        let temp_path = self
            .root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        Ok(Box::new(LocalDirWriter {
            writer: Some(BufWriter::new(file)),
            temp_path,
            final_path,
        }))
    }

    fn read_object(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<(Box<dyn ObjectReader>, u64)> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let path = self.object_path(name)?;
        let file = File::open(&path).map_err(|e| Self::map_not_found(name, e))?;
        let size = file.metadata()?.len();
        let reader = LocalDirReader {
            name: name.to_string(),
            file,
            size,
        };
        Ok((Box::new(reader), size))
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        fs::remove_file(&path).map_err(|e| Self::map_not_found(name, e))?;
        debug!("Deleted remote object {}", path.display());
        Ok(())
    }

    fn list(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            names.push(name);
        }
        Ok(group_listing(
            names.iter().map(String::as_str),
            prefix,
            delimiter,
        ))
    }

    fn size(&self, name: &str) -> Result<u64> {
        let path = self.object_path(name)?;
        let meta = fs::metadata(&path).map_err(|e| Self::map_not_found(name, e))?;
        Ok(meta.len())
    }
}

struct LocalDirWriter {
    writer: Option<BufWriter<File>>,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl LocalDirWriter {
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("writer already closed"))
    }
}

impl Write for LocalDirWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl ObjectWriter for LocalDirWriter {
    fn close(mut self: Box<Self>) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Err(Error::internal("remote writer closed twice"));
        };
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for LocalDirWriter {
    fn drop(&mut self) {
        // Abandoned upload
        if self.writer.take().is_some() {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                warn!(
                    "Failed to remove abandoned upload {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
    }
}

struct LocalDirReader {
    name: String,
    file: File,
    size: u64,
}

impl ObjectReader for LocalDirReader {
    fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        check_range(&self.name, offset, buf.len(), self.size)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete() {
        let dir = tempdir().unwrap();
        let storage = LocalDirStorage::open(dir.path().join("bucket")).unwrap();

        let mut w = storage.create_object("0001-1-000001.sst").unwrap();
        w.write_all(b"0123456789").unwrap();
        // In-progress uploads are invisible
        assert!(storage.list("", "").unwrap().is_empty());
        w.close().unwrap();

        assert_eq!(storage.size("0001-1-000001.sst").unwrap(), 10);
        let ctx = CancellationToken::new();
        let (reader, size) = storage.read_object(&ctx, "0001-1-000001.sst").unwrap();
        assert_eq!(size, 10);
        let mut buf = [0u8; 4];
        reader.read_at(&ctx, &mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");

        storage.delete("0001-1-000001.sst").unwrap();
        let err = storage.delete("0001-1-000001.sst").unwrap_err();
        assert!(storage.is_not_exist_error(&err));
    }

    #[test]
    fn test_abandoned_writer_cleans_up() {
        let dir = tempdir().unwrap();
        let storage = LocalDirStorage::open(dir.path()).unwrap();
        {
            let mut w = storage.create_object("partial").unwrap();
            w.write_all(b"abc").unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_list_prefix() {
        let dir = tempdir().unwrap();
        let storage = LocalDirStorage::open(dir.path()).unwrap();
        for name in ["a.sst", "a.sst.ref.1.000001", "a.sst.ref.4.000002"] {
            storage.create_object(name).unwrap().close().unwrap();
        }
        assert_eq!(
            storage.list("a.sst.ref.", "").unwrap(),
            vec!["1.000001", "4.000002"]
        );
        assert!(storage.create_object("x/y").is_err());
    }
}
