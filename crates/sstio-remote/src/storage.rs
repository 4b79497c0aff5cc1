//! Remote storage interface
//!
//! A remote store is a flat namespace of immutable objects. Objects are
//! written once through an `ObjectWriter` and become visible when the writer
//! is closed; readers address them by byte offset.

use sstio_common::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use tokio_util::sync::CancellationToken;

/// Client for one remote storage target
pub trait RemoteStorage: Send + Sync + fmt::Debug {
    /// Start writing a new object; it becomes visible once the writer is closed
    fn create_object(&self, name: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Open an object for reading, returning the reader and the object size
    fn read_object(
        &self,
        ctx: &CancellationToken,
        name: &str,
    ) -> Result<(Box<dyn ObjectReader>, u64)>;

    /// Delete an object
    fn delete(&self, name: &str) -> Result<()>;

    /// List the objects whose names start with `prefix`
    ///
    /// The prefix is trimmed from the results. With a non-empty `delimiter`,
    /// names sharing the same part up to the first delimiter after the prefix
    /// are grouped into a single entry ending in the delimiter.
    fn list(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>>;

    /// Size of an object in bytes
    fn size(&self, name: &str) -> Result<u64>;

    /// Whether an error returned by this client means the object is missing
    fn is_not_exist_error(&self, err: &Error) -> bool {
        err.is_not_found()
    }

    /// Release client resources
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Positional reader over one remote object
pub trait ObjectReader: Send + Sync {
    /// Fill `buf` with the bytes at `offset`; reading past the end is an error
    fn read_at(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> Result<()>;
}

/// Streaming writer for a new remote object
pub trait ObjectWriter: Write + Send {
    /// Complete the upload
    fn close(self: Box<Self>) -> Result<()>;
}

/// Apply the prefix/delimiter listing rules to a set of names
pub fn group_listing<'a, I>(names: I, prefix: &str, delimiter: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = BTreeSet::new();
    for name in names {
        let Some(rest) = name.strip_prefix(prefix) else {
            continue;
        };
        let entry = if delimiter.is_empty() {
            rest
        } else {
            match rest.find(delimiter) {
                Some(idx) => &rest[..idx + delimiter.len()],
                None => rest,
            }
        };
        out.insert(entry.to_string());
    }
    out.into_iter().collect()
}

/// Check a requested range against the object size
pub(crate) fn check_range(name: &str, offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("read of {len} bytes at offset {offset} beyond end of {name} ({size} bytes)"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_listing_trims_prefix() {
        let names = ["a.ref.1.000001", "a.ref.2.000007", "ab", "b.ref.1.000001"];
        let listed = group_listing(names, "a.ref.", "");
        assert_eq!(listed, vec!["1.000001", "2.000007"]);
    }

    #[test]
    fn test_group_listing_delimiter() {
        let names = ["dir/x", "dir/y", "dir/sub/z", "other"];
        assert_eq!(group_listing(names, "", "/"), vec!["dir/", "other"]);
        assert_eq!(group_listing(names, "dir/", "/"), vec!["sub/", "x", "y"]);
    }

    #[test]
    fn test_check_range() {
        assert!(check_range("o", 0, 10, 10).is_ok());
        assert!(check_range("o", 10, 0, 10).is_ok());
        assert!(check_range("o", 5, 6, 10).is_err());
        assert!(check_range("o", u64::MAX, 2, 10).is_err());
    }
}
