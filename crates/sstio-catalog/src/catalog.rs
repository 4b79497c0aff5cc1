//! Remote object catalog
//!
//! Durable record of the remote objects known to a provider and of its
//! creator ID. Changes are applied in batches; each batch becomes one log
//! record. When the log grows past the configured size it is rewritten as a
//! single snapshot record (written to a temporary file and renamed over the
//! log).

use crate::batch::{BatchOp, CatalogBatch, RemoteObjectMetadata};
use crate::edit::CatalogEdit;
use crate::log::{CatalogLog, LogRecord};
use parking_lot::Mutex;
use sstio_common::{CatalogConfig, CreatorId, DiskFileNum, Error, Result, ResultExt};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the catalog log inside the data directory
pub const CATALOG_FILENAME: &str = "REMOTE-OBJ-CATALOG";

/// Suffix of the snapshot being written during rotation
const CATALOG_TEMP_SUFFIX: &str = ".tmp";

/// State recovered when opening the catalog
#[derive(Debug, Clone, Default)]
pub struct CatalogContents {
    pub creator_id: Option<CreatorId>,
    /// Remote objects, ordered by file number
    pub objects: Vec<RemoteObjectMetadata>,
}

struct CatalogState {
    /// `None` once closed
    log: Option<CatalogLog>,
    creator_id: Option<CreatorId>,
    objects: BTreeMap<DiskFileNum, RemoteObjectMetadata>,
    /// Log size right after the last rotation
    snapshot_size: u64,
}

/// Durable catalog of remote objects
pub struct RemoteCatalog {
    dir: PathBuf,
    config: CatalogConfig,
    state: Mutex<CatalogState>,
}

impl RemoteCatalog {
    /// Open the catalog in `dir`, creating it if needed, and replay it
    pub fn open(dir: impl AsRef<Path>, config: CatalogConfig) -> Result<(Self, CatalogContents)> {
        let dir = dir.as_ref().to_path_buf();

        // Leftover from an interrupted rotation; the log itself is intact.
        let temp = temp_path(&dir);
        if temp.exists() {
            warn!("Removing stale catalog snapshot {}", temp.display());
            std::fs::remove_file(&temp)?;
        }

        let (log, records) = CatalogLog::open(dir.join(CATALOG_FILENAME), config.write_buffer_size)?;

        let (creator_id, objects) = replay(&records)?;

        info!(
            "Opened remote object catalog in {}: {} records, {} objects, creator ID {:?}",
            dir.display(),
            records.len(),
            objects.len(),
            creator_id
        );

        let contents = CatalogContents {
            creator_id,
            objects: objects.values().cloned().collect(),
        };
        let catalog = Self {
            dir,
            config,
            state: Mutex::new(CatalogState {
                log: Some(log),
                creator_id,
                objects,
                snapshot_size: 0,
            }),
        };
        Ok((catalog, contents))
    }

    /// Read the catalog in `dir` without modifying anything on disk
    ///
    /// A missing catalog reads as empty. A torn log tail is ignored rather
    /// than truncated and a stale rotation snapshot is left in place.
    pub fn read_contents(dir: impl AsRef<Path>) -> Result<CatalogContents> {
        let records = CatalogLog::read(dir.as_ref().join(CATALOG_FILENAME))?;
        let (creator_id, objects) = replay(&records)?;
        Ok(CatalogContents {
            creator_id,
            objects: objects.into_values().collect(),
        })
    }

    /// Record the creator ID
    ///
    /// Setting the same ID again is a no-op; a different ID is an error.
    pub fn set_creator_id(&self, id: CreatorId) -> Result<()> {
        if !id.is_set() {
            return Err(Error::invalid_argument("creator ID must be non-zero"));
        }
        let mut state = self.state.lock();
        match state.creator_id {
            Some(current) if current == id => return Ok(()),
            Some(current) => {
                return Err(Error::CreatorIdMismatch {
                    current,
                    requested: id,
                });
            }
            None => {}
        }

        let edit = CatalogEdit {
            creator_id: Some(id),
            ..Default::default()
        };
        self.write_edit(&mut state, &edit)?;
        state.creator_id = Some(id);
        info!("Catalog creator ID set to {}", id);
        Ok(())
    }

    /// Durably apply a batch of changes
    ///
    /// The operations are validated in order against the current contents:
    /// adding a known object or deleting an unknown one fails the whole batch
    /// without writing anything.
    pub fn apply_batch(&self, batch: &CatalogBatch) -> Result<()> {
        let mut state = self.state.lock();
        Self::validate(&state.objects, batch)?;

        let edit = CatalogEdit::from_batch(batch);
        if edit.is_empty() {
            return Ok(());
        }
        self.write_edit(&mut state, &edit)?;

        let CatalogState {
            creator_id,
            objects,
            ..
        } = &mut *state;
        edit.apply(creator_id, objects)?;
        debug!("Applied catalog batch of {} ops", batch.len());

        self.maybe_rotate(&mut state)
    }

    fn validate(
        objects: &BTreeMap<DiskFileNum, RemoteObjectMetadata>,
        batch: &CatalogBatch,
    ) -> Result<()> {
        // Presence changes made earlier in the same batch
        let mut overlay: HashMap<DiskFileNum, bool> = HashMap::new();
        for op in batch.ops() {
            let (file_num, adding) = match op {
                BatchOp::Add(meta) => (meta.file_num, true),
                BatchOp::Delete(file_num) => (*file_num, false),
            };
            let present = overlay
                .get(&file_num)
                .copied()
                .unwrap_or_else(|| objects.contains_key(&file_num));
            if adding && present {
                return Err(Error::catalog(format!(
                    "adding existing object {file_num}"
                )));
            }
            if !adding && !present {
                return Err(Error::catalog(format!(
                    "deleting non-existent object {file_num}"
                )));
            }
            overlay.insert(file_num, adding);
        }
        Ok(())
    }

    fn write_edit(&self, state: &mut CatalogState, edit: &CatalogEdit) -> Result<()> {
        let data = edit.to_bytes()?;
        let log = state
            .log
            .as_mut()
            .ok_or_else(|| Error::catalog("catalog is closed"))?;
        let len = log.size();
        if let Err(e) = log.append(data) {
            if let Err(reopen) = self.recover_failed_append(state, len) {
                warn!("Failed to recover catalog after write error: {}", reopen);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Roll the log back to `len` bytes and reload the state from it
    ///
    /// The failed record may have reached the file; it must not be replayed
    /// later next to its retry. The catalog stays closed if this fails.
    fn recover_failed_append(&self, state: &mut CatalogState, len: u64) -> Result<()> {
        let Some(log) = state.log.take() else {
            return Ok(());
        };
        let (log, records) = log.rollback(len)?;
        let (creator_id, objects) = replay(&records)?;
        warn!(
            "Rolled back catalog {} to {} bytes after a failed write",
            log.path().display(),
            len
        );
        state.creator_id = creator_id;
        state.objects = objects;
        state.log = Some(log);
        Ok(())
    }

    fn maybe_rotate(&self, state: &mut CatalogState) -> Result<()> {
        // A snapshot larger than the threshold must not trigger a rotation on
        // every write.
        let size = state.log.as_ref().map_or(0, CatalogLog::size);
        let threshold = self
            .config
            .rotation_size_bytes
            .max(state.snapshot_size.saturating_mul(2));
        if size <= threshold {
            return Ok(());
        }
        self.rotate(state)
    }

    /// Rewrite the log as a single snapshot record
    fn rotate(&self, state: &mut CatalogState) -> Result<()> {
        let snapshot = CatalogEdit {
            creator_id: state.creator_id,
            new_objects: state.objects.values().cloned().collect(),
            deleted_objects: Vec::new(),
        };
        let temp = temp_path(&self.dir);
        {
            let mut log = CatalogLog::create(&temp, self.config.write_buffer_size)?;
            log.append(snapshot.to_bytes()?)?;
        }

        std::fs::rename(&temp, self.log_path()).context("catalog rename failed")?;
        sync_dir(&self.dir)?;

        let old_size = state.log.as_ref().map_or(0, CatalogLog::size);
        let (log, _) = CatalogLog::open(self.log_path(), self.config.write_buffer_size)?;
        info!(
            "Rotated remote object catalog: {} -> {} bytes, {} objects",
            old_size,
            log.size(),
            state.objects.len()
        );
        state.snapshot_size = log.size();
        state.log = Some(log);
        Ok(())
    }

    /// Creator ID, if recorded
    #[must_use]
    pub fn creator_id(&self) -> Option<CreatorId> {
        self.state.lock().creator_id
    }

    /// Current remote objects, ordered by file number
    #[must_use]
    pub fn objects(&self) -> Vec<RemoteObjectMetadata> {
        self.state.lock().objects.values().cloned().collect()
    }

    /// Current log size in bytes
    #[must_use]
    pub fn log_size(&self) -> u64 {
        self.state.lock().log.as_ref().map_or(0, CatalogLog::size)
    }

    /// Sync and close the log; further changes fail
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut log) = state.log.take() {
            log.sync()?;
            debug!("Closed remote object catalog {}", log.path().display());
        }
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILENAME)
    }
}

type CatalogObjects = BTreeMap<DiskFileNum, RemoteObjectMetadata>;

fn replay(records: &[LogRecord]) -> Result<(Option<CreatorId>, CatalogObjects)> {
    let mut creator_id = None;
    let mut objects = BTreeMap::new();
    for record in records {
        CatalogEdit::from_bytes(&record.data)?
            .apply(&mut creator_id, &mut objects)
            .with_context(|| format!("replaying catalog record {}", record.lsn))?;
    }
    Ok((creator_id, objects))
}

fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!("{CATALOG_FILENAME}{CATALOG_TEMP_SUFFIX}"))
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("failed to sync directory {}", dir.display()))
}
