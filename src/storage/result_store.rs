use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::config::{ArtifactPolicy, LockPolicy};
use crate::core::errors::{GridError, Result};
use crate::storage::lock::{self, WriteLock};
use crate::sweep::model::{Coordinate, GridShape};

/// Name of the result array inside the artifact
pub const ARRAY_NAME: &str = "simulation_result";
/// Namespace for run metadata written by the recorder itself
pub const ANNOTATIONS_NAMESPACE: &str = "annotations";
/// Value of every cell that has not been written yet
pub const FILL_VALUE: f64 = 0.0;

const META_KEY: &[u8] = b"shape";
const ANNOTATION_TREE_PREFIX: &str = "annotations.";

fn meta_tree() -> String {
    format!("{ARRAY_NAME}.meta")
}

fn grid_tree() -> String {
    format!("{ARRAY_NAME}.grid")
}

fn written_tree() -> String {
    format!("{ARRAY_NAME}.written")
}

fn annotation_tree(namespace: &str) -> String {
    format!("{ANNOTATION_TREE_PREFIX}{namespace}")
}

/// Persisted description of the grid, stored bincode-encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GridMeta {
    array_name: String,
    shape: GridShape,
    fill_value: f64,
    created_at: DateTime<Utc>,
}

/// Handle to a persisted result artifact.
///
/// The descriptor itself holds no open resources and is cheap to clone into
/// every worker. All reads and writes go through a [`StoreHandle`], which
/// owns the artifact's write lock for as long as it lives.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
    shape: GridShape,
    lock: LockPolicy,
}

impl ResultStore {
    /// Create the artifact, or resolve an existing one according to `policy`.
    pub fn create(
        path: impl AsRef<Path>,
        shape: GridShape,
        policy: ArtifactPolicy,
        lock: LockPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if shape.is_empty() {
            return Err(GridError::InvalidSize {
                num_points: shape.rows.min(shape.cols),
            });
        }

        let _guard = lock::acquire(&path, &lock)?;

        if path.exists() {
            match policy {
                ArtifactPolicy::Fail => return Err(GridError::StoreAlreadyExists { path }),
                ArtifactPolicy::Overwrite => {
                    info!(path = %path.display(), "Removing existing artifact");
                    remove_artifact(&path)?;
                }
                ArtifactPolicy::Resume => {
                    let db = open_db(&path, &lock)?;
                    let meta = read_meta(&db, &path)?;
                    if meta.shape != shape {
                        return Err(GridError::corrupted(
                            &path,
                            format!(
                                "cannot resume: artifact holds a {} grid but the sweep needs {}",
                                meta.shape, shape
                            ),
                        ));
                    }
                    info!(path = %path.display(), shape = %shape, "Resuming existing artifact");
                    return Ok(Self { path, shape, lock });
                }
            }
        }

        let db = open_db(&path, &lock)?;
        let meta = GridMeta {
            array_name: ARRAY_NAME.to_string(),
            shape,
            fill_value: FILL_VALUE,
            created_at: Utc::now(),
        };
        db.open_tree(meta_tree())?
            .insert(META_KEY, bincode::serialize(&meta)?)?;
        db.open_tree(grid_tree())?;
        db.open_tree(written_tree())?;
        db.flush()
            .map_err(|e| GridError::database("flush new artifact", e))?;

        info!(path = %path.display(), shape = %shape, "Created result artifact");
        Ok(Self { path, shape, lock })
    }

    /// Attach to an existing artifact and read its shape.
    pub fn open(path: impl AsRef<Path>, lock: LockPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(GridError::StoreNotFound { path });
        }

        let _guard = lock::acquire(&path, &lock)?;
        let db = open_db(&path, &lock)?;
        let meta = read_meta(&db, &path)?;
        debug!(path = %path.display(), shape = %meta.shape, "Opened result artifact");
        Ok(Self {
            path,
            shape: meta.shape,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Take the write lock and open the container.
    ///
    /// Blocks while another thread or process holds the lock.
    pub fn open_for_write(&self) -> Result<StoreHandle> {
        let guard = lock::acquire(&self.path, &self.lock)?;
        if !self.path.exists() {
            return Err(GridError::StoreNotFound {
                path: self.path.clone(),
            });
        }
        let db = open_db(&self.path, &self.lock)?;
        let meta = read_meta(&db, &self.path)?;
        if meta.shape != self.shape {
            return Err(GridError::corrupted(
                &self.path,
                format!("shape changed from {} to {}", self.shape, meta.shape),
            ));
        }

        Ok(StoreHandle {
            grid: db.open_tree(grid_tree())?,
            written: db.open_tree(written_tree())?,
            db,
            shape: meta.shape,
            fill_value: meta.fill_value,
            path: self.path.clone(),
            dirty: false,
            _lock: guard,
        })
    }

    /// Read the grid, written mask and all provenance in one locked pass.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let handle = self.open_for_write()?;
        let mut provenance = BTreeMap::new();
        for namespace in handle.provenance_namespaces()? {
            let entries = handle.provenance_entries(&namespace)?;
            provenance.insert(namespace, entries);
        }
        Ok(StoreSnapshot {
            shape: handle.shape,
            values: handle.read_grid()?,
            written: handle.written_mask()?,
            provenance,
        })
    }
}

/// Exclusive, open view of the artifact.
///
/// Field order matters: the database closes before the lock is released.
pub struct StoreHandle {
    db: sled::Db,
    grid: sled::Tree,
    written: sled::Tree,
    shape: GridShape,
    fill_value: f64,
    path: PathBuf,
    dirty: bool,
    _lock: WriteLock,
}

impl StoreHandle {
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    fn slot_for(&self, coordinate: Coordinate) -> Result<usize> {
        self.shape.slot(coordinate).ok_or(GridError::OutOfBounds {
            coordinate,
            shape: self.shape,
        })
    }

    /// Store `value` at `coordinate` and mark the cell written.
    ///
    /// Rewriting a cell replaces the previous value.
    pub fn write_cell(&mut self, coordinate: Coordinate, value: f64) -> Result<()> {
        let key = slot_key(self.slot_for(coordinate)?);
        self.grid
            .insert(key, value.to_le_bytes().to_vec())
            .map_err(|e| GridError::database(format!("write cell {coordinate}"), e))?;
        self.written
            .insert(key, Vec::<u8>::new())
            .map_err(|e| GridError::database(format!("mark cell {coordinate}"), e))?;
        self.dirty = true;
        debug!(coordinate = %coordinate, value, "Wrote cell");
        Ok(())
    }

    pub fn read_cell(&self, coordinate: Coordinate) -> Result<f64> {
        let key = slot_key(self.slot_for(coordinate)?);
        match self.grid.get(key)? {
            Some(bytes) => decode_value(&bytes).ok_or_else(|| {
                GridError::corrupted(&self.path, format!("bad value encoding at {coordinate}"))
            }),
            None => Ok(self.fill_value),
        }
    }

    pub fn is_written(&self, coordinate: Coordinate) -> Result<bool> {
        let key = slot_key(self.slot_for(coordinate)?);
        Ok(self.written.contains_key(key)?)
    }

    /// Dense row-major copy of the grid
    pub fn read_grid(&self) -> Result<Vec<f64>> {
        let mut values = vec![self.fill_value; self.shape.len()];
        for entry in self.grid.iter() {
            let (key, bytes) = entry?;
            let slot = self.decode_slot(&key)?;
            values[slot] = decode_value(&bytes).ok_or_else(|| {
                GridError::corrupted(&self.path, format!("bad value encoding at slot {slot}"))
            })?;
        }
        Ok(values)
    }

    /// Row-major written mask
    pub fn written_mask(&self) -> Result<Vec<bool>> {
        let mut mask = vec![false; self.shape.len()];
        for key in self.written.iter().keys() {
            let slot = self.decode_slot(&key?)?;
            mask[slot] = true;
        }
        Ok(mask)
    }

    /// Coordinates whose written bit is still unset, in row-major order
    pub fn unwritten_coordinates(&self) -> Result<Vec<Coordinate>> {
        let mask = self.written_mask()?;
        Ok(self
            .shape
            .coordinates()
            .zip(mask)
            .filter_map(|(coordinate, written)| (!written).then_some(coordinate))
            .collect())
    }

    pub fn write_provenance<T: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &T,
        namespace: &str,
    ) -> Result<()> {
        let tree = self.db.open_tree(annotation_tree(namespace))?;
        tree.insert(key.as_bytes(), serde_json::to_vec(value)?)
            .map_err(|e| GridError::database(format!("write provenance {namespace}/{key}"), e))?;
        self.dirty = true;
        debug!(namespace, key, "Wrote provenance");
        Ok(())
    }

    /// Drop a provenance entry; returns whether it existed
    pub fn remove_provenance(&mut self, key: &str, namespace: &str) -> Result<bool> {
        let tree = self.db.open_tree(annotation_tree(namespace))?;
        let removed = tree
            .remove(key.as_bytes())
            .map_err(|e| GridError::database(format!("remove provenance {namespace}/{key}"), e))?;
        if removed.is_some() {
            self.dirty = true;
            debug!(namespace, key, "Removed provenance");
        }
        Ok(removed.is_some())
    }

    pub fn read_provenance(&self, key: &str, namespace: &str) -> Result<Option<Value>> {
        let tree = self.db.open_tree(annotation_tree(namespace))?;
        match tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn provenance_entries(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        let tree = self.db.open_tree(annotation_tree(namespace))?;
        let mut entries = BTreeMap::new();
        for entry in tree.iter() {
            let (key, bytes) = entry?;
            let key = String::from_utf8(key.to_vec()).map_err(|_| {
                GridError::corrupted(&self.path, format!("non-utf8 provenance key in {namespace}"))
            })?;
            entries.insert(key, serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }

    /// Namespaces that hold at least one provenance tree
    pub fn provenance_namespaces(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                std::str::from_utf8(&name)
                    .ok()
                    .and_then(|n| n.strip_prefix(ANNOTATION_TREE_PREFIX))
                    .map(str::to_string)
            })
            .collect())
    }

    /// Flush everything written through this handle to disk.
    pub fn commit(&mut self) -> Result<()> {
        let bytes = self
            .db
            .flush()
            .map_err(|e| GridError::database("commit", e))?;
        self.dirty = false;
        debug!(path = %self.path.display(), bytes, "Committed");
        Ok(())
    }

    fn decode_slot(&self, key: &[u8]) -> Result<usize> {
        let slot = <[u8; 8]>::try_from(key)
            .map(|raw| u64::from_be_bytes(raw) as usize)
            .map_err(|_| GridError::corrupted(&self.path, "bad slot key encoding"))?;
        if slot >= self.shape.len() {
            return Err(GridError::corrupted(
                &self.path,
                format!("slot {slot} outside {} grid", self.shape),
            ));
        }
        Ok(slot)
    }
}

impl Drop for StoreHandle {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.db.flush() {
                warn!(path = %self.path.display(), error = %e, "Flush on drop failed; uncommitted writes may be lost");
            }
        }
    }
}

/// Point-in-time copy of an artifact
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub shape: GridShape,
    pub values: Vec<f64>,
    pub written: Vec<bool>,
    pub provenance: BTreeMap<String, BTreeMap<String, Value>>,
}

impl StoreSnapshot {
    pub fn value(&self, coordinate: Coordinate) -> Option<f64> {
        self.shape.slot(coordinate).map(|slot| self.values[slot])
    }

    pub fn is_written(&self, coordinate: Coordinate) -> bool {
        self.shape
            .slot(coordinate)
            .is_some_and(|slot| self.written[slot])
    }

    pub fn written_count(&self) -> usize {
        self.written.iter().filter(|w| **w).count()
    }

    pub fn unwritten(&self) -> Vec<Coordinate> {
        self.shape
            .coordinates()
            .filter(|c| !self.is_written(*c))
            .collect()
    }

    pub fn provenance(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.provenance.get(namespace).and_then(|ns| ns.get(key))
    }
}

fn slot_key(slot: usize) -> [u8; 8] {
    (slot as u64).to_be_bytes()
}

fn decode_value(bytes: &[u8]) -> Option<f64> {
    <[u8; 8]>::try_from(bytes).ok().map(f64::from_le_bytes)
}

fn read_meta(db: &sled::Db, path: &Path) -> Result<GridMeta> {
    let raw = db
        .open_tree(meta_tree())?
        .get(META_KEY)?
        .ok_or_else(|| GridError::corrupted(path, "missing grid metadata"))?;
    let meta: GridMeta = bincode::deserialize(&raw)
        .map_err(|e| GridError::corrupted(path, format!("malformed grid metadata: {e}")))?;
    if meta.array_name != ARRAY_NAME || meta.shape.is_empty() {
        return Err(GridError::corrupted(
            path,
            format!("unexpected array {} with shape {}", meta.array_name, meta.shape),
        ));
    }
    Ok(meta)
}

/// Open the sled container, waiting out a previous holder that has not yet
/// released sled's own file lock.
fn open_db(path: &Path, policy: &LockPolicy) -> Result<sled::Db> {
    let mut attempt = 0;
    loop {
        match sled::Config::new()
            .path(path)
            .flush_every_ms(None)
            .open()
        {
            Ok(db) => return Ok(db),
            Err(sled::Error::Io(e)) if is_lock_contention(&e) && !policy.is_exhausted(attempt) => {
                std::thread::sleep(policy.backoff_delay(attempt));
                attempt += 1;
            }
            Err(sled::Error::Corruption { .. }) => {
                return Err(GridError::corrupted(path, "container failed integrity checks"))
            }
            Err(e) => return Err(GridError::database(format!("open {}", path.display()), e)),
        }
    }
}

fn is_lock_contention(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.to_string().contains("could not acquire")
}

fn remove_artifact(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    removed.map_err(|e| GridError::io(format!("remove artifact {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn quick_lock() -> LockPolicy {
        LockPolicy {
            max_retries: Some(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            ..LockPolicy::default()
        }
    }

    fn new_store(dir: &tempfile::TempDir, shape: GridShape) -> ResultStore {
        ResultStore::create(
            dir.path().join("grid.db"),
            shape,
            ArtifactPolicy::Fail,
            quick_lock(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_artifact_is_filled_and_unwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(&dir, GridShape::new(2, 3));

        let handle = store.open_for_write().unwrap();
        assert_eq!(handle.read_grid().unwrap(), vec![0.0; 6]);
        assert_eq!(handle.unwritten_coordinates().unwrap().len(), 6);
        assert!(!handle.is_written(Coordinate::new(1, 2)).unwrap());
    }

    #[test]
    fn test_write_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.db");
        let store = new_store(&dir, GridShape::square(3));

        {
            let mut handle = store.open_for_write().unwrap();
            handle.write_cell(Coordinate::new(0, 1), 42.5).unwrap();
            handle.write_cell(Coordinate::new(2, 2), 0.0).unwrap();
            handle.write_cell(Coordinate::new(0, 1), 43.5).unwrap();
            handle.commit().unwrap();
        }

        let reopened = ResultStore::open(&path, quick_lock()).unwrap();
        assert_eq!(reopened.shape(), GridShape::square(3));
        let handle = reopened.open_for_write().unwrap();
        assert_eq!(handle.read_cell(Coordinate::new(0, 1)).unwrap(), 43.5);
        assert_eq!(handle.read_cell(Coordinate::new(1, 1)).unwrap(), 0.0);
        // A genuine zero result is distinguishable from an unwritten cell
        assert!(handle.is_written(Coordinate::new(2, 2)).unwrap());
        assert!(!handle.is_written(Coordinate::new(1, 1)).unwrap());
        assert_eq!(handle.unwritten_coordinates().unwrap().len(), 7);
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(&dir, GridShape::square(2));
        let mut handle = store.open_for_write().unwrap();

        let err = handle.write_cell(Coordinate::new(2, 0), 1.0).unwrap_err();
        assert!(matches!(
            err,
            GridError::OutOfBounds { coordinate, .. } if coordinate == Coordinate::new(2, 0)
        ));
        assert!(handle.read_cell(Coordinate::new(0, 5)).is_err());
    }

    #[test]
    fn test_artifact_policies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.db");
        let store = new_store(&dir, GridShape::square(2));
        {
            let mut handle = store.open_for_write().unwrap();
            handle.write_cell(Coordinate::new(0, 0), 7.0).unwrap();
            handle.commit().unwrap();
        }

        let err = ResultStore::create(&path, GridShape::square(2), ArtifactPolicy::Fail, quick_lock())
            .unwrap_err();
        assert!(matches!(err, GridError::StoreAlreadyExists { .. }));

        let resumed =
            ResultStore::create(&path, GridShape::square(2), ArtifactPolicy::Resume, quick_lock())
                .unwrap();
        assert!(resumed
            .open_for_write()
            .unwrap()
            .is_written(Coordinate::new(0, 0))
            .unwrap());

        let err =
            ResultStore::create(&path, GridShape::square(3), ArtifactPolicy::Resume, quick_lock())
                .unwrap_err();
        assert!(matches!(err, GridError::StoreCorrupted { .. }));

        let fresh = ResultStore::create(
            &path,
            GridShape::square(3),
            ArtifactPolicy::Overwrite,
            quick_lock(),
        )
        .unwrap();
        let handle = fresh.open_for_write().unwrap();
        assert_eq!(handle.shape(), GridShape::square(3));
        assert_eq!(handle.unwritten_coordinates().unwrap().len(), 9);
    }

    #[test]
    fn test_open_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = ResultStore::open(dir.path().join("nope.db"), quick_lock()).unwrap_err();
        assert!(matches!(err, GridError::StoreNotFound { .. }));
    }

    #[test]
    fn test_missing_metadata_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.db");
        {
            let db = sled::open(&path).unwrap();
            db.open_tree(meta_tree())
                .unwrap()
                .insert(META_KEY, b"garbage".to_vec())
                .unwrap();
            db.flush().unwrap();
        }

        let err = ResultStore::open(&path, quick_lock()).unwrap_err();
        assert!(matches!(err, GridError::StoreCorrupted { .. }));
    }

    #[test]
    fn test_provenance_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(&dir, GridShape::square(1));
        {
            let mut handle = store.open_for_write().unwrap();
            handle
                .write_provenance("script_input_parameters", &json!({"num_points": 1}), "custom")
                .unwrap();
            handle.write_provenance("end_time", "first", "custom").unwrap();
            handle.write_provenance("end_time", "second", "custom").unwrap();
            handle
                .write_provenance("run_id", "abc", ANNOTATIONS_NAMESPACE)
                .unwrap();
            handle.commit().unwrap();
        }

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.provenance("custom", "end_time"), Some(&json!("second")));
        assert_eq!(
            snapshot.provenance("custom", "script_input_parameters"),
            Some(&json!({"num_points": 1}))
        );
        assert_eq!(
            snapshot.provenance(ANNOTATIONS_NAMESPACE, "run_id"),
            Some(&json!("abc"))
        );
        assert_eq!(snapshot.provenance.len(), 2);

        let mut handle = store.open_for_write().unwrap();
        assert_eq!(handle.read_provenance("missing", "custom").unwrap(), None);
        assert!(handle.remove_provenance("end_time", "custom").unwrap());
        assert!(!handle.remove_provenance("end_time", "custom").unwrap());
        handle.commit().unwrap();
        drop(handle);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.provenance("custom", "end_time"), None);
        assert!(snapshot.provenance("custom", "script_input_parameters").is_some());
    }

    #[test]
    fn test_handle_holds_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = new_store(&dir, GridShape::square(1));
        let _held = store.open_for_write().unwrap();

        let impatient = ResultStore {
            lock: LockPolicy {
                max_retries: Some(2),
                ..quick_lock()
            },
            ..store.clone()
        };
        assert!(matches!(
            impatient.open_for_write(),
            Err(GridError::StoreLockTimeout { .. })
        ));
    }
}
