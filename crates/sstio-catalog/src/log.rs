//! Catalog record log
//!
//! Append-only file of checksummed records.
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```

use sstio_common::{Error, Result, ResultExt};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Catalog record magic number
const CATALOG_MAGIC: u32 = 0x5243_4154; // "RCAT"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// Trailing checksum size
const RECORD_TRAILER_SIZE: usize = 4;

/// A single log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: u64,
    /// Serialized edit
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.data.len())
            .map_err(|_| Error::catalog("catalog record too large"))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.data.len() + RECORD_TRAILER_SIZE);

        buf.extend_from_slice(&CATALOG_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Parse one record from the front of `data`, returning it and its size
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
            return Err(Error::CatalogCorruption("catalog record truncated".into()));
        }

        let magic = read_u32(&data[0..4]);
        if magic != CATALOG_MAGIC {
            return Err(Error::CatalogCorruption("invalid catalog record magic".into()));
        }

        let lsn = read_u64(&data[4..12]);
        let data_len = read_u32(&data[12..16]) as usize;

        let total_size = RECORD_HEADER_SIZE + data_len + RECORD_TRAILER_SIZE;
        if data.len() < total_size {
            return Err(Error::CatalogCorruption("catalog record truncated".into()));
        }

        let body_end = RECORD_HEADER_SIZE + data_len;
        let stored_crc = read_u32(&data[body_end..total_size]);
        let computed_crc = crc32c::crc32c(&data[..body_end]);
        if computed_crc != stored_crc {
            return Err(Error::CatalogCorruption(
                "catalog record CRC mismatch".into(),
            ));
        }

        let record = Self {
            lsn,
            data: data[RECORD_HEADER_SIZE..body_end].to_vec(),
        };
        Ok((record, total_size))
    }
}

fn read_u32(b: &[u8]) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(b);
    u32::from_le_bytes(arr)
}

fn read_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    u64::from_le_bytes(arr)
}

/// Writer for the catalog log
///
/// Not internally synchronized; the catalog serializes access.
pub struct CatalogLog {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    next_lsn: u64,
    write_buffer_size: usize,
}

impl CatalogLog {
    /// Create a new, empty log file (replacing any existing one)
    pub fn create(path: impl AsRef<Path>, write_buffer_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create catalog {}", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::with_capacity(write_buffer_size, file),
            size: 0,
            next_lsn: 1,
            write_buffer_size,
        })
    }

    /// Open a log, replaying its valid records
    ///
    /// A torn or corrupt tail (left by a crash during append) is truncated
    /// away. A missing file is created empty.
    pub fn open(path: impl AsRef<Path>, write_buffer_size: usize) -> Result<(Self, Vec<LogRecord>)> {
        let path = path.as_ref().to_path_buf();
        let (records, valid_len, file_len) = Self::scan(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open catalog {}", path.display()))?;
        if valid_len < file_len {
            warn!(
                "Truncating catalog {} from {} to {} bytes (torn tail)",
                path.display(),
                file_len,
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        let next_lsn = records.last().map_or(1, |r| r.lsn + 1);
        let log = Self {
            path,
            writer: BufWriter::with_capacity(write_buffer_size, file),
            size: valid_len,
            next_lsn,
            write_buffer_size,
        };
        Ok((log, records))
    }

    /// Read all valid records, returning them with the valid prefix length and
    /// the file length
    fn scan(path: &Path) -> Result<(Vec<LogRecord>, u64, u64)> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), 0, 0));
            }
            Err(e) => {
                return Err(Error::Io(e).context(format!("failed to open catalog {}", path.display())));
            }
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut records = Vec::new();
        let mut offset = 0;
        let mut last_lsn = 0;
        while offset < data.len() {
            match LogRecord::from_bytes(&data[offset..]) {
                Ok((record, size)) if record.lsn > last_lsn => {
                    last_lsn = record.lsn;
                    records.push(record);
                    offset += size;
                }
                // Partial, corrupted or stale record - stop here
                _ => break,
            }
        }

        Ok((records, offset as u64, data.len() as u64))
    }

    /// Append a record and make it durable
    pub fn append(&mut self, data: Vec<u8>) -> Result<u64> {
        let lsn = self.next_lsn;
        let bytes = LogRecord { lsn, data }.to_bytes()?;

        self.writer
            .write_all(&bytes)
            .context("catalog write failed")?;
        self.sync()?;

        self.next_lsn += 1;
        self.size += bytes.len() as u64;
        Ok(lsn)
    }

    /// Flush buffered data and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush().context("catalog flush failed")?;
        self.writer
            .get_ref()
            .sync_data()
            .context("catalog sync failed")
    }

    /// Cut the log back to `len` bytes and reopen it
    ///
    /// Used after a failed append, whose bytes may or may not have reached
    /// the file. Buffered bytes are dropped unflushed.
    pub fn rollback(self, len: u64) -> Result<(Self, Vec<LogRecord>)> {
        let path = self.path;
        let write_buffer_size = self.write_buffer_size;
        let (file, _unflushed) = self.writer.into_parts();
        file.set_len(len)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to roll back catalog {}", path.display()))?;
        drop(file);
        Self::open(path, write_buffer_size)
    }

    /// Read the valid records of a log without modifying it
    ///
    /// A missing file reads as empty and a torn tail is skipped.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
        let (records, _, _) = Self::scan(path.as_ref())?;
        Ok(records)
    }

    /// Current log size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Last assigned LSN
    #[must_use]
    pub const fn current_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog");

        {
            let mut log = CatalogLog::create(&path, 4096).unwrap();
            assert_eq!(log.append(b"one".to_vec()).unwrap(), 1);
            assert_eq!(log.append(b"two".to_vec()).unwrap(), 2);
            assert_eq!(log.size(), 2 * (16 + 3 + 4));
        }

        let (mut log, records) = CatalogLog::open(&path, 4096).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data, b"two");
        assert_eq!(log.current_lsn(), 2);
        assert_eq!(log.append(b"three".to_vec()).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog");

        {
            let mut log = CatalogLog::create(&path, 4096).unwrap();
            log.append(b"good".to_vec()).unwrap();
            log.append(b"torn".to_vec()).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(full - 3).unwrap();

        let (mut log, records) = CatalogLog::open(&path, 4096).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, b"good");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16 + 4 + 4);

        // New appends land after the valid prefix
        log.append(b"next".to_vec()).unwrap();
        drop(log);
        let (_, records) = CatalogLog::open(&path, 4096).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].data, b"next");
        assert_eq!(records[1].lsn, 2);
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let mut bytes = LogRecord {
            lsn: 1,
            data: b"payload".to_vec(),
        }
        .to_bytes()
        .unwrap();
        assert!(LogRecord::from_bytes(&bytes).is_ok());
        bytes[18] ^= 0xff;
        assert!(LogRecord::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rollback_discards_landed_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog");

        let mut log = CatalogLog::create(&path, 4096).unwrap();
        log.append(b"kept".to_vec()).unwrap();
        let len = log.size();
        log.append(b"dropped".to_vec()).unwrap();

        let (mut log, records) = log.rollback(len).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(log.size(), len);
        assert_eq!(log.append(b"retry".to_vec()).unwrap(), 2);
        drop(log);

        let records = CatalogLog::read(&path).unwrap();
        let data: Vec<&[u8]> = records.iter().map(|r| r.data.as_slice()).collect();
        assert_eq!(data, vec![&b"kept"[..], &b"retry"[..]]);
    }

    #[test]
    fn test_read_leaves_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog");
        assert!(CatalogLog::read(&path).unwrap().is_empty());
        assert!(!path.exists());

        {
            let mut log = CatalogLog::create(&path, 4096).unwrap();
            log.append(b"good".to_vec()).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"junk").unwrap();
        let len = std::fs::metadata(&path).unwrap().len();

        let records = CatalogLog::read(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len);
    }

    #[test]
    fn test_open_missing_creates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog");
        let (log, records) = CatalogLog::open(&path, 4096).unwrap();
        assert!(records.is_empty());
        assert_eq!(log.size(), 0);
        assert!(path.exists());
    }
}
