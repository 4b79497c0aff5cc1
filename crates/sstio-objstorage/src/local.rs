//! Local object backend
//!
//! Local objects are files named `NNNNNN.<ext>` directly in the provider's
//! directory. Their existence is recorded by the directory itself, so making
//! a creation or removal durable only takes a directory fsync.

use crate::leaktrack::{HandleTracker, TrackedHandle};
use crate::metadata::ObjectMetadata;
use crate::readable::{ReadHandle, Readable};
use crate::readahead::ReadaheadState;
use crate::writable::{AbortHook, Writable};
use sstio_common::{
    DiskFileNum, Error, FileType, LocalConfig, ReadaheadConfig, ReadaheadMode, Result, ResultExt,
    make_filename, parse_filename,
};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Path of a local object
#[must_use]
pub fn object_path(dir: &Path, file_type: FileType, file_num: DiskFileNum) -> PathBuf {
    dir.join(make_filename(file_type, file_num))
}

/// File names in a directory
pub(crate) fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        if let Ok(name) = entry?.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

/// Objects recognizable in a directory listing
pub(crate) fn objects_in_listing(listing: &[String]) -> Vec<ObjectMetadata> {
    listing
        .iter()
        .filter_map(|name| parse_filename(name))
        .map(|(file_type, file_num)| ObjectMetadata::local(file_type, file_num))
        .collect()
}

/// Human-readable summary of a directory, for corruption reports
pub(crate) fn directory_summary(dir: &Path) -> String {
    let listing = match list_dir(dir) {
        Ok(listing) => listing,
        Err(e) => return format!("directory {} cannot be listed: {}", dir.display(), e),
    };
    let (mut tables, mut blobs) = (0, 0);
    for name in &listing {
        match parse_filename(name) {
            Some((FileType::Table, _)) => tables += 1,
            Some((FileType::Blob, _)) => blobs += 1,
            None => {}
        }
    }
    format!(
        "directory {} contains {} files: {} tables, {} blob files, {} other",
        dir.display(),
        listing.len(),
        tables,
        blobs,
        listing.len() - tables - blobs
    )
}

/// Create a new local object file
pub(crate) fn create(path: PathBuf, config: &LocalConfig, on_abort: AbortHook) -> Result<LocalWritable> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(LocalWritable {
        path,
        writer: Some(BufWriter::new(file)),
        bytes_per_sync: config.bytes_per_sync,
        unsynced: 0,
        no_sync_on_close: config.no_sync_on_close,
        on_abort: Some(on_abort),
    })
}

/// Hard link `src` to `dst`, or copy it if linking is not possible
pub(crate) fn link_or_copy(src: &Path, dst: &Path, config: &LocalConfig) -> Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::AlreadyExists) => {
            return Err(Error::Io(e).context(format!("linking {} to {}", src.display(), dst.display())));
        }
        Err(e) => debug!("Hard link {} failed ({}), copying", src.display(), e),
    }

    let mut reader = BufReader::new(File::open(src)?);
    let file = OpenOptions::new().write(true).create_new(true).open(dst)?;
    let mut writer = BufWriter::new(file);
    io::copy(&mut reader, &mut writer).with_context(|| format!("copying {}", src.display()))?;
    let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    if !config.no_sync_on_close {
        file.sync_all()?;
    }
    Ok(())
}

/// Writer for a new local object
pub(crate) struct LocalWritable {
    path: PathBuf,
    /// `None` once finished or aborted
    writer: Option<BufWriter<File>>,
    bytes_per_sync: usize,
    unsynced: usize,
    no_sync_on_close: bool,
    on_abort: Option<AbortHook>,
}

impl LocalWritable {
    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::internal("write to a closed object"))
    }
}

impl Writable for LocalWritable {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let bytes_per_sync = self.bytes_per_sync;
        let writer = self.writer()?;
        writer.write_all(data)?;
        if bytes_per_sync == 0 {
            return Ok(());
        }
        self.unsynced += data.len();
        if self.unsynced >= bytes_per_sync {
            let writer = self.writer()?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
            self.unsynced = 0;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::internal("object already closed"))?;
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        if !self.no_sync_on_close {
            file.sync_all()
                .with_context(|| format!("syncing {}", self.path.display()))?;
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        if let Some(writer) = self.writer.take() {
            // Discard buffered data
            let (_file, _unflushed) = writer.into_parts();
        }
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!("Failed to delete aborted object {}: {}", self.path.display(), e);
            }
            _ => {}
        }
        if let Some(on_abort) = self.on_abort.take() {
            on_abort();
        }
    }
}

/// An open local object file
#[derive(Debug)]
struct LocalFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl LocalFile {
    fn read_at(&self, file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
        file.read_exact_at(buf, offset).map_err(|e| {
            Error::Io(e).context(format!(
                "reading {} bytes at offset {} of {}",
                buf.len(),
                offset,
                self.path.display()
            ))
        })
    }
}

/// Open a local object for reading
pub(crate) fn open(
    path: PathBuf,
    file_num: DiskFileNum,
    readahead: ReadaheadConfig,
    tracker: &Arc<HandleTracker>,
) -> Result<LocalReadable> {
    let file = File::open(&path)?;
    let size = file.metadata()?.len();
    Ok(LocalReadable {
        file: Arc::new(LocalFile { file, path, size }),
        readahead,
        _tracked: tracker.track(file_num),
    })
}

/// Local object opened for reading
pub(crate) struct LocalReadable {
    file: Arc<LocalFile>,
    readahead: ReadaheadConfig,
    _tracked: TrackedHandle,
}

impl Readable for LocalReadable {
    fn read_at(&self, _ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_at(&self.file.file, buf, offset)
    }

    fn size(&self) -> u64 {
        self.file.size
    }

    fn new_read_handle(&self) -> Box<dyn ReadHandle> {
        Box::new(LocalReadHandle {
            file: Arc::clone(&self.file),
            state: ReadaheadState::new(self.readahead.max_readahead_size),
            mode: self.readahead.speculative,
            config: self.readahead.clone(),
            sequential_file: None,
        })
    }
}

/// Read handle for a local object
struct LocalReadHandle {
    file: Arc<LocalFile>,
    state: ReadaheadState,
    mode: ReadaheadMode,
    config: ReadaheadConfig,
    /// Descriptor opened with the sequential hint, once the OS does the
    /// readahead for this handle
    sequential_file: Option<File>,
}

impl LocalReadHandle {
    fn switch_to_os_readahead(&mut self) {
        if self.sequential_file.is_some() {
            return;
        }
        match File::open(&self.file.path) {
            Ok(file) => {
                if let Err(e) = fadvise(&file, 0, 0, Advice::Sequential) {
                    debug!("fadvise(SEQUENTIAL) failed on {}: {}", self.file.path.display(), e);
                }
                self.sequential_file = Some(file);
            }
            Err(e) => debug!(
                "Failed to reopen {} for sequential reads: {}",
                self.file.path.display(),
                e
            ),
        }
    }
}

impl ReadHandle for LocalReadHandle {
    fn read_at(&mut self, _ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()> {
        if let Some(file) = &self.sequential_file {
            return self.file.read_at(file, buf, offset);
        }
        if self.mode != ReadaheadMode::Off {
            let size = self.state.maybe_readahead(offset, buf.len() as u64);
            if size > 0 {
                if self.mode == ReadaheadMode::FadviseSequential
                    && size >= self.config.max_readahead_size
                {
                    self.switch_to_os_readahead();
                } else if let Err(e) = fadvise(&self.file.file, offset, size, Advice::WillNeed) {
                    debug!("Prefetch of {} failed: {}", self.file.path.display(), e);
                }
            }
        }
        let file = self.sequential_file.as_ref().unwrap_or(&self.file.file);
        self.file.read_at(file, buf, offset)
    }

    fn setup_for_compaction(&mut self) {
        self.mode = self.config.informed;
        if self.mode == ReadaheadMode::FadviseSequential {
            self.switch_to_os_readahead();
        }
    }

    fn record_cache_hit(&mut self, offset: u64, len: u64) {
        if self.sequential_file.is_some() || self.mode == ReadaheadMode::Off {
            return;
        }
        self.state.record_cache_hit(offset, len);
    }
}

#[derive(Debug, Clone, Copy)]
enum Advice {
    WillNeed,
    Sequential,
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_wrap)]
fn fadvise(file: &File, offset: u64, len: u64, advice: Advice) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let advice = match advice {
        Advice::WillNeed => libc::POSIX_FADV_WILLNEED,
        Advice::Sequential => libc::POSIX_FADV_SEQUENTIAL,
    };
    // SAFETY: the descriptor is valid for the lifetime of `file`.
    let ret = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off_t,
            len as libc::off_t,
            advice,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

#[cfg(not(target_os = "linux"))]
fn fadvise(_file: &File, _offset: u64, _len: u64, _advice: Advice) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sstio_common::DEFAULT_MAX_READAHEAD_SIZE;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn write_object(path: &Path, data: &[u8]) {
        let mut w = Box::new(create(path.to_path_buf(), &LocalConfig::default(), Box::new(|| {})).unwrap());
        w.write(data).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_listing_recognizes_objects() {
        let listing: Vec<String> = ["000001.sst", "000002.blob", "MANIFEST-000003", "000004.log", "REMOTE-OBJ-CATALOG"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let objects = objects_in_listing(&listing);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].file_type, FileType::Table);
        assert_eq!(objects[1].file_num, DiskFileNum::new(2));
    }

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = object_path(dir.path(), FileType::Table, DiskFileNum::new(7));
        assert!(path.ends_with("000007.sst"));
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        write_object(&path, &data);

        let tracker = HandleTracker::new();
        let r = open(path, DiskFileNum::new(7), ReadaheadConfig::default(), &tracker).unwrap();
        assert_eq!(r.size(), data.len() as u64);
        assert_eq!(tracker.open_count(), 1);

        let ctx = CancellationToken::new();
        let mut buf = vec![0u8; 1000];
        r.read_at(&ctx, &mut buf, 5000).unwrap();
        assert_eq!(buf, data[5000..6000]);
        assert!(r.read_at(&ctx, &mut buf, 99_500).is_err());

        drop(r);
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_read_handle_switches_to_os_readahead() {
        let dir = tempdir().unwrap();
        let path = object_path(dir.path(), FileType::Table, DiskFileNum::new(1));
        let data = vec![7u8; 4 * 1024 * 1024];
        write_object(&path, &data);

        let tracker = HandleTracker::new();
        let config = ReadaheadConfig {
            speculative: ReadaheadMode::FadviseSequential,
            ..Default::default()
        };
        let r = open(path.clone(), DiskFileNum::new(1), config, &tracker).unwrap();
        let mut handle = LocalReadHandle {
            file: Arc::clone(&r.file),
            state: ReadaheadState::new(DEFAULT_MAX_READAHEAD_SIZE),
            mode: ReadaheadMode::FadviseSequential,
            config: r.readahead.clone(),
            sequential_file: None,
        };

        let ctx = CancellationToken::new();
        let mut buf = vec![0u8; 32 * 1024];
        let mut offset = 0;
        while handle.sequential_file.is_none() && offset < data.len() as u64 {
            handle.read_at(&ctx, &mut buf, offset).unwrap();
            offset += buf.len() as u64;
        }
        assert!(handle.sequential_file.is_some());
        assert!(buf.iter().all(|&b| b == 7));

        // Cache hits are ignored once the OS does readahead
        let before = handle.state.clone();
        handle.record_cache_hit(offset, 4096);
        assert_eq!(handle.state, before);

        // Compaction setup switches immediately
        let mut handle = r.new_read_handle();
        handle.setup_for_compaction();
        handle.read_at(&ctx, &mut buf, 0).unwrap();
    }

    #[test]
    fn test_readahead_off_ignores_cache_hits() {
        let dir = tempdir().unwrap();
        let path = object_path(dir.path(), FileType::Blob, DiskFileNum::new(2));
        write_object(&path, &[1u8; 1024]);
        let tracker = HandleTracker::new();
        let config = ReadaheadConfig {
            speculative: ReadaheadMode::Off,
            ..Default::default()
        };
        let r = open(path, DiskFileNum::new(2), config, &tracker).unwrap();
        let mut handle = LocalReadHandle {
            file: Arc::clone(&r.file),
            state: ReadaheadState::new(DEFAULT_MAX_READAHEAD_SIZE),
            mode: ReadaheadMode::Off,
            config: r.readahead.clone(),
            sequential_file: None,
        };
        let ctx = CancellationToken::new();
        let mut buf = [0u8; 16];
        handle.read_at(&ctx, &mut buf, 0).unwrap();
        handle.record_cache_hit(16, 16);
        assert_eq!(handle.state.num_reads(), 0);
    }

    #[test]
    fn test_abort_deletes_file() {
        let dir = tempdir().unwrap();
        let path = object_path(dir.path(), FileType::Table, DiskFileNum::new(3));
        let aborted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&aborted);
        let mut w = Box::new(
            create(
                path.clone(),
                &LocalConfig {
                    bytes_per_sync: 16,
                    ..Default::default()
                },
                Box::new(move || flag.store(true, Ordering::SeqCst)),
            )
            .unwrap(),
        );
        w.write(&[0u8; 100]).unwrap();
        assert!(path.exists());
        w.abort();
        assert!(!path.exists());
        assert!(aborted.load(Ordering::SeqCst));

        // Creating over an existing file fails
        write_object(&path, b"x");
        assert!(create(path, &LocalConfig::default(), Box::new(|| {})).is_err());
    }

    #[test]
    fn test_link_or_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("ingest.sst");
        fs::write(&src, b"external table").unwrap();
        let dst = object_path(dir.path(), FileType::Table, DiskFileNum::new(9));
        link_or_copy(&src, &dst, &LocalConfig::default()).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"external table");

        // Existing destination and missing source are not retried as copies
        let err = link_or_copy(&src, &dst, &LocalConfig::default()).unwrap_err();
        assert!(!err.is_not_found());
        let err = link_or_copy(&dir.path().join("missing"), &dir.path().join("x"), &LocalConfig::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_directory_summary() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("000001.sst"), b"").unwrap();
        fs::write(dir.path().join("000002.blob"), b"").unwrap();
        fs::write(dir.path().join("OPTIONS"), b"").unwrap();
        let summary = directory_summary(dir.path());
        assert!(summary.contains("3 files: 1 tables, 1 blob files, 1 other"));
    }
}
