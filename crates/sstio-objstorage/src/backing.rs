//! Shareable object backings
//!
//! A backing is a self-describing blob that lets another provider attach a
//! remote object. It is a sequence of `(tag, value)` pairs, with tags and
//! integers encoded as unsigned LEB128 varints and strings as a length
//! followed by the bytes:
//!
//! | tag | value                                         |
//! |-----|-----------------------------------------------|
//! | 1   | creator id                                    |
//! | 2   | creator file num                              |
//! | 3   | cleanup method                                |
//! | 4   | ref to check: creator id, file num            |
//! | 5   | locator                                       |
//! | 6   | custom object name                            |
//!
//! Unknown tags with bit 64 set must be understood and fail decoding. Other
//! unknown tags carry a length-prefixed value and are skipped, which lets
//! newer writers add optional fields.

use crate::metadata::{ObjectBacking, ObjectMetadata, RemoteBacking};
use crate::naming::{ref_marker_name, remote_object_name};
use crate::options::RemoteObjectToAttach;
use crate::provider::Provider;
use crate::remote::create_marker;
use sstio_common::{CleanupMethod, CreatorId, DiskFileNum, Error, Locator, Result, ResultExt};
use sstio_remote::RemoteStorage;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TAG_CREATOR_ID: u64 = 1;
const TAG_CREATOR_FILE_NUM: u64 = 2;
const TAG_CLEANUP_METHOD: u64 = 3;
const TAG_REF_CHECK: u64 = 4;
const TAG_LOCATOR: u64 = 5;
const TAG_CUSTOM_OBJECT_NAME: u64 = 6;

/// Unknown tags with this bit set cannot be skipped
const TAG_NOT_SAFE_TO_IGNORE_MASK: u64 = 64;

/// Decoded form of a backing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectBacking {
    pub creator_id: CreatorId,
    pub creator_file_num: DiskFileNum,
    pub cleanup_method: CleanupMethod,
    pub locator: Locator,
    pub custom_object_name: Option<String>,
    /// Marker that must still exist when the object is attached; set for
    /// ref-tracked objects
    pub ref_to_check: Option<(CreatorId, DiskFileNum)>,
}

impl RemoteObjectBacking {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        put_uvarint(&mut buf, TAG_CREATOR_ID);
        put_uvarint(&mut buf, self.creator_id.get());
        put_uvarint(&mut buf, TAG_CREATOR_FILE_NUM);
        put_uvarint(&mut buf, self.creator_file_num.get());
        put_uvarint(&mut buf, TAG_CLEANUP_METHOD);
        put_uvarint(&mut buf, self.cleanup_method.as_u64());
        if let Some((creator_id, file_num)) = self.ref_to_check {
            put_uvarint(&mut buf, TAG_REF_CHECK);
            put_uvarint(&mut buf, creator_id.get());
            put_uvarint(&mut buf, file_num.get());
        }
        if !self.locator.is_empty() {
            put_uvarint(&mut buf, TAG_LOCATOR);
            put_bytes(&mut buf, self.locator.as_str().as_bytes());
        }
        if let Some(name) = &self.custom_object_name {
            put_uvarint(&mut buf, TAG_CUSTOM_OBJECT_NAME);
            put_bytes(&mut buf, name.as_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader { data, pos: 0 };
        let mut creator_id = CreatorId::default();
        let mut creator_file_num = DiskFileNum::new(0);
        let mut cleanup_method = CleanupMethod::RefTracking;
        let mut locator = Locator::default();
        let mut custom_object_name = None;
        let mut ref_to_check = None;

        while !r.is_empty() {
            let tag = r.uvarint()?;
            match tag {
                TAG_CREATOR_ID => creator_id = CreatorId::new(r.uvarint()?),
                TAG_CREATOR_FILE_NUM => creator_file_num = DiskFileNum::new(r.uvarint()?),
                TAG_CLEANUP_METHOD => {
                    let v = r.uvarint()?;
                    cleanup_method = CleanupMethod::from_u64(v)
                        .ok_or_else(|| Error::invalid_backing(format!("invalid cleanup method {v}")))?;
                }
                TAG_REF_CHECK => {
                    let creator = CreatorId::new(r.uvarint()?);
                    let file_num = DiskFileNum::new(r.uvarint()?);
                    ref_to_check = Some((creator, file_num));
                }
                TAG_LOCATOR => locator = Locator::new(r.string()?),
                TAG_CUSTOM_OBJECT_NAME => custom_object_name = Some(r.string()?),
                _ if tag & TAG_NOT_SAFE_TO_IGNORE_MASK != 0 => {
                    return Err(Error::UnknownBackingTag(tag));
                }
                _ => {
                    r.bytes()?;
                }
            }
        }

        if custom_object_name.is_none() && (!creator_id.is_set() || creator_file_num.get() == 0) {
            return Err(Error::invalid_backing("creator id or creator file num missing"));
        }
        if cleanup_method == CleanupMethod::RefTracking {
            match ref_to_check {
                Some((creator, file_num)) if creator.is_set() && file_num.get() != 0 => {}
                _ => return Err(Error::invalid_backing("ref-tracked object without a ref to check")),
            }
        }

        Ok(Self {
            creator_id,
            creator_file_num,
            cleanup_method,
            locator,
            custom_object_name,
            ref_to_check,
        })
    }
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.push(v as u8);
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_uvarint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn uvarint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::invalid_backing("truncated varint"))?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(Error::invalid_backing("varint overflows u64"));
            }
            v |= u64::from(byte & 0x7f) << shift;
            if byte < 0x80 {
                return Ok(v);
            }
        }
        Err(Error::invalid_backing("varint overflows u64"))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.uvarint()?)
            .map_err(|_| Error::invalid_backing("field length overflow"))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::invalid_backing("truncated field"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::invalid_backing("string is not valid UTF-8"))
    }
}

/// Encoded backing of an object, keeping the object protected while open
///
/// While any handle for an object is open, removing the object from the
/// provider does not drop the provider's ref marker; the marker is dropped
/// when the last handle is closed. This keeps the object alive until the
/// receiving provider has attached it.
pub struct RemoteObjectBackingHandle {
    provider: Provider,
    file_num: DiskFileNum,
    /// `None` once closed
    backing: Option<Vec<u8>>,
}

impl RemoteObjectBackingHandle {
    /// Encoded backing; empty after `close`
    #[must_use]
    pub fn get(&self) -> &[u8] {
        self.backing.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub const fn file_num(&self) -> DiskFileNum {
        self.file_num
    }

    /// Release the protection, running a deferred unref if this was the last
    /// handle for a removed object
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.backing.take().is_none() {
            return Ok(());
        }
        self.provider.unprotect(self.file_num)
    }
}

impl Drop for RemoteObjectBackingHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Releasing backing of object {} failed: {}", self.file_num, e);
        }
    }
}

impl Provider {
    /// Encode the backing of a remote object so that another provider can
    /// attach it
    pub fn remote_object_backing(&self, meta: &ObjectMetadata) -> Result<RemoteObjectBackingHandle> {
        let remote = meta.remote().ok_or_else(|| {
            Error::invalid_argument(format!("object {} is not on remote storage", meta.file_num))
        })?;
        let ref_to_check = if remote.cleanup_method == CleanupMethod::RefTracking {
            Some((self.check_shared_initialized()?, meta.file_num))
        } else {
            None
        };
        let backing = RemoteObjectBacking {
            creator_id: remote.creator_id,
            creator_file_num: remote.creator_file_num,
            cleanup_method: remote.cleanup_method,
            locator: remote.locator.clone(),
            custom_object_name: remote.custom_object_name.clone(),
            ref_to_check,
        }
        .encode();

        {
            let mut state = self.inner.state.write();
            if !state.known_objects.contains_key(&meta.file_num) {
                return Err(Error::UnknownObject {
                    file_type: meta.file_type,
                    file_num: meta.file_num,
                });
            }
            *state.protected_objects.entry(meta.file_num).or_insert(0) += 1;
        }

        Ok(RemoteObjectBackingHandle {
            provider: self.clone(),
            file_num: meta.file_num,
            backing: Some(backing),
        })
    }

    /// Drop one protection of an object
    pub(crate) fn unprotect(&self, file_num: DiskFileNum) -> Result<()> {
        let deferred = {
            let mut state = self.inner.state.write();
            let Some(count) = state.protected_objects.get_mut(&file_num) else {
                return Err(Error::InvalidProtectionCount { file_num });
            };
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
            state.protected_objects.remove(&file_num);
            state.deferred_unrefs.remove(&file_num)
        };

        match deferred {
            Some(meta) => {
                info!("Running deferred unref of object {}", file_num);
                match meta.remote() {
                    Some(remote) => self.remote_unref_now(&meta, remote),
                    None => Ok(()),
                }
            }
            None => Ok(()),
        }
    }

    /// Backing for an object that was not created by any provider
    ///
    /// The object is never deleted by the providers that attach it.
    pub fn create_external_object_backing(&self, locator: &Locator, object_name: &str) -> Result<Vec<u8>> {
        self.ensure_storage(locator)?;
        Ok(RemoteObjectBacking {
            creator_id: CreatorId::default(),
            creator_file_num: DiskFileNum::new(0),
            cleanup_method: CleanupMethod::NoCleanup,
            locator: locator.clone(),
            custom_object_name: Some(object_name.to_string()),
            ref_to_check: None,
        }
        .encode())
    }

    /// Attach remote objects created elsewhere
    ///
    /// For ref-tracked objects a marker for this provider is created, then
    /// the marker of the provider that handed out the backing is checked. If
    /// anything fails, the markers created so far are removed and nothing is
    /// attached.
    pub fn attach_remote_objects(&self, objs: &[RemoteObjectToAttach]) -> Result<Vec<ObjectMetadata>> {
        if objs.is_empty() {
            return Ok(Vec::new());
        }

        let mut decoded = Vec::with_capacity(objs.len());
        for obj in objs {
            let backing = RemoteObjectBacking::decode(&obj.backing)
                .with_context(|| format!("decoding backing of object {}", obj.file_num))?;
            decoded.push((obj, backing));
        }
        {
            let state = self.inner.state.read();
            let mut seen = HashSet::with_capacity(objs.len());
            for obj in objs {
                if state.known_objects.contains_key(&obj.file_num)
                    || state.creating.contains(&obj.file_num)
                    || !seen.insert(obj.file_num)
                {
                    return Err(Error::ObjectExists {
                        file_num: obj.file_num,
                    });
                }
            }
        }

        let mut attached = Vec::with_capacity(decoded.len());
        for (obj, backing) in decoded {
            let storage = self.ensure_storage(&backing.locator)?;
            let meta = ObjectMetadata {
                file_num: obj.file_num,
                file_type: obj.file_type,
                backing: ObjectBacking::Remote(RemoteBacking {
                    creator_id: backing.creator_id,
                    creator_file_num: backing.creator_file_num,
                    cleanup_method: backing.cleanup_method,
                    locator: backing.locator,
                    custom_object_name: backing.custom_object_name,
                    storage,
                }),
            };
            attached.push((meta, backing.ref_to_check));
        }

        let mut created = Vec::new();
        if let Err(e) = self.create_attach_markers(&attached, &mut created) {
            remove_markers(&created);
            return Err(e);
        }

        {
            let mut state = self.inner.state.write();
            if let Some((meta, _)) = attached
                .iter()
                .find(|(meta, _)| {
                    state.known_objects.contains_key(&meta.file_num)
                        || state.creating.contains(&meta.file_num)
                })
            {
                let file_num = meta.file_num;
                drop(state);
                remove_markers(&created);
                return Err(Error::ObjectExists { file_num });
            }
            for (meta, _) in &attached {
                if let Some(record) = meta.to_catalog() {
                    state.catalog_batch.add_object(record);
                }
                state.known_objects.insert(meta.file_num, meta.clone());
            }
        }

        info!("Attached {} remote objects", attached.len());
        Ok(attached.into_iter().map(|(meta, _)| meta).collect())
    }

    fn create_attach_markers(
        &self,
        attached: &[(ObjectMetadata, Option<(CreatorId, DiskFileNum)>)],
        created: &mut Vec<(Arc<dyn RemoteStorage>, String)>,
    ) -> Result<()> {
        if !attached.iter().any(|(meta, _)| meta.is_shared()) {
            return Ok(());
        }
        let creator_id = self.check_shared_initialized()?;

        for (meta, ref_to_check) in attached {
            let Some(remote) = meta.remote() else {
                continue;
            };
            if remote.cleanup_method != CleanupMethod::RefTracking {
                continue;
            }
            let storage = &remote.storage;
            let object_name = remote_object_name(meta.file_type, remote);

            let marker = ref_marker_name(&object_name, creator_id, meta.file_num);
            create_marker(storage.as_ref(), &marker)?;
            created.push((Arc::clone(storage), marker));

            let (origin_creator, origin_file_num) = ref_to_check
                .ok_or_else(|| Error::invalid_backing("ref-tracked object without a ref to check"))?;
            let origin = ref_marker_name(&object_name, origin_creator, origin_file_num);
            if let Err(e) = storage.size(&origin) {
                if storage.is_not_exist_error(&e) {
                    return Err(Error::OriginMarkerMissing { name: origin });
                }
                return Err(e.context(format!("checking marker object {origin}")));
            }
            debug!("Attached {} as object {}", object_name, meta.file_num);
        }
        Ok(())
    }
}

fn remove_markers(created: &[(Arc<dyn RemoteStorage>, String)]) {
    for (storage, marker) in created {
        if let Err(e) = storage.delete(marker) {
            warn!("Failed to remove marker {} after failed attach: {}", marker, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_backing() -> RemoteObjectBacking {
        RemoteObjectBacking {
            creator_id: CreatorId::new(100),
            creator_file_num: DiskFileNum::new(1),
            cleanup_method: CleanupMethod::RefTracking,
            locator: Locator::new("bucket-a"),
            custom_object_name: None,
            ref_to_check: Some((CreatorId::new(100), DiskFileNum::new(7))),
        }
    }

    #[test]
    fn test_encode_decode() {
        let b = shared_backing();
        assert_eq!(RemoteObjectBacking::decode(&b.encode()).unwrap(), b);

        let external = RemoteObjectBacking {
            creator_id: CreatorId::default(),
            creator_file_num: DiskFileNum::new(0),
            cleanup_method: CleanupMethod::NoCleanup,
            locator: Locator::default(),
            custom_object_name: Some("ingest/foo.sst".to_string()),
            ref_to_check: None,
        };
        assert_eq!(RemoteObjectBacking::decode(&external.encode()).unwrap(), external);
    }

    #[test]
    fn test_large_values_use_multibyte_varints() {
        let mut b = shared_backing();
        b.creator_id = CreatorId::new(u64::MAX);
        b.creator_file_num = DiskFileNum::new(300);
        let encoded = b.encode();
        // tag + 10-byte varint for u64::MAX
        assert_eq!(&encoded[..11], &[1, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        assert_eq!(RemoteObjectBacking::decode(&encoded).unwrap(), b);
    }

    #[test]
    fn test_unknown_tags() {
        let mut encoded = shared_backing().encode();
        // Skippable tag with a 3-byte value
        encoded.extend_from_slice(&[10, 3, 0xaa, 0xbb, 0xcc]);
        assert_eq!(RemoteObjectBacking::decode(&encoded).unwrap(), shared_backing());

        // Tag that must be understood
        let mut bad = shared_backing().encode();
        bad.extend_from_slice(&[64 | 10, 0]);
        assert!(matches!(
            RemoteObjectBacking::decode(&bad),
            Err(Error::UnknownBackingTag(74))
        ));

        // Skippable tag with a truncated value
        let mut truncated = shared_backing().encode();
        truncated.extend_from_slice(&[10, 5, 1]);
        assert!(matches!(
            RemoteObjectBacking::decode(&truncated),
            Err(Error::InvalidBacking(_))
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        // No creator id
        let mut buf = Vec::new();
        put_uvarint(&mut buf, TAG_CREATOR_FILE_NUM);
        put_uvarint(&mut buf, 5);
        put_uvarint(&mut buf, TAG_CLEANUP_METHOD);
        put_uvarint(&mut buf, CleanupMethod::NoCleanup.as_u64());
        assert!(matches!(RemoteObjectBacking::decode(&buf), Err(Error::InvalidBacking(_))));

        // Ref-tracked without a ref to check
        let mut b = shared_backing();
        b.ref_to_check = None;
        assert!(matches!(
            RemoteObjectBacking::decode(&b.encode()),
            Err(Error::InvalidBacking(_))
        ));

        // Invalid cleanup method
        let mut buf = shared_backing().encode();
        buf.extend_from_slice(&[TAG_CLEANUP_METHOD as u8, 9]);
        assert!(matches!(RemoteObjectBacking::decode(&buf), Err(Error::InvalidBacking(_))));

        // Truncated varint
        assert!(RemoteObjectBacking::decode(&[1, 0x80]).is_err());
    }
}
