use fs2::FileExt;
use wire::FilesystemDescriptor;

use crate::error::{Error, Result};
use crate::store::BlockStore;

use std::collections::HashMap;
use std::collections::hash_map::Iter;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "filesystems.bin";
const SNAPSHOT_LOCK_FILE: &str = "filesystems.lock";

pub struct Filesystem {
    descriptor: FilesystemDescriptor,
    directory: PathBuf,
    store: BlockStore,
}

impl Filesystem {
    pub fn descriptor(&self) -> &FilesystemDescriptor {
        &self.descriptor
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut BlockStore {
        &mut self.store
    }

    pub fn spool_path(&self, query_id: &str) -> PathBuf {
        let mut path = self.directory.clone();
        path.push("spool");
        path.push(query_id);
        path.set_extension("json");
        path
    }
}

/// Per node registry of named filesystems. Every mutation rewrites
/// the full descriptor map to a single snapshot file; the write is
/// best effort and the in-memory map stays authoritative.
pub struct FilesystemManager {
    directory: PathBuf,
    filesystems: HashMap<String, Filesystem>,
}

impl FilesystemManager {
    pub fn open(directory: &Path) -> Result<FilesystemManager> {
        std::fs::create_dir_all(directory)?;

        // restore descriptors from the latest snapshot
        let mut filesystems = HashMap::new();
        let snapshot_path = directory.join(SNAPSHOT_FILE);
        if snapshot_path.exists() {
            let buffer = std::fs::read(&snapshot_path)?;
            let descriptors: HashMap<String, FilesystemDescriptor> =
                bincode::deserialize(&buffer)?;

            for (name, descriptor) in descriptors {
                let filesystem =
                    open_filesystem(directory, descriptor)?;
                filesystems.insert(name, filesystem);
            }
        }

        Ok(FilesystemManager {
            directory: directory.to_path_buf(),
            filesystems: filesystems,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Filesystem> {
        self.filesystems.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Filesystem> {
        self.filesystems.get_mut(name)
    }

    pub fn iter(&self) -> Iter<String, Filesystem> {
        self.filesystems.iter()
    }

    pub fn len(&self) -> usize {
        self.filesystems.len()
    }

    /// Idempotent: an existing filesystem with the same name is left
    /// untouched.
    pub fn create(&mut self, descriptor: FilesystemDescriptor)
            -> Result<()> {
        if self.filesystems.contains_key(&descriptor.name) {
            return Ok(());
        }

        let name = descriptor.name.clone();
        let filesystem =
            open_filesystem(&self.directory, descriptor)?;
        self.filesystems.insert(name, filesystem);

        self.snapshot();
        Ok(())
    }

    /// Shut down the handle, remove the on-disk directory, erase the
    /// entry. Unknown names are ignored so repeated delete events
    /// converge.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let filesystem = match self.filesystems.remove(name) {
            Some(filesystem) => filesystem,
            None => {
                warn!("delete of unknown filesystem '{}'", name);
                return Ok(());
            },
        };

        drop(filesystem.store);
        std::fs::remove_dir_all(&filesystem.directory)?;

        self.snapshot();
        Ok(())
    }

    // full map rewrite under an exclusive lock, temp file renamed
    // into place; failure leaves memory authoritative
    fn snapshot(&self) {
        if let Err(e) = self.write_snapshot() {
            warn!("filesystem snapshot failed: {}", e);
        }
    }

    fn write_snapshot(&self) -> Result<()> {
        let lock_path = self.directory.join(SNAPSHOT_LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true).write(true).open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let descriptors: HashMap<&String, &FilesystemDescriptor> =
            self.filesystems.iter()
                .map(|(name, filesystem)|
                    (name, &filesystem.descriptor))
                .collect();
        let buffer = bincode::serialize(&descriptors)?;

        let temp_path = self.directory.join(
            format!("{}.tmp", SNAPSHOT_FILE));
        std::fs::write(&temp_path, &buffer)?;
        std::fs::rename(&temp_path,
            self.directory.join(SNAPSHOT_FILE))?;

        lock_file.unlock()?;
        Ok(())
    }
}

fn open_filesystem(root: &Path, descriptor: FilesystemDescriptor)
        -> Result<Filesystem> {
    let directory = root.join(&descriptor.name);
    std::fs::create_dir_all(&directory)
        .map_err(|e| Error::Filesystem(format!(
            "failed to create '{:?}': {}", directory, e)))?;

    let store = BlockStore::open(&directory.join("blocks"))?;

    Ok(Filesystem {
        descriptor: descriptor,
        directory: directory,
        store: store,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::TemporalType;

    fn descriptor(name: &str) -> FilesystemDescriptor {
        FilesystemDescriptor {
            name: name.to_string(),
            spatial_precision: 4,
            temporal_type: TemporalType::Day,
            nodes_per_group: 2,
            feature_schema: Vec::new(),
            spatial_hint: None,
        }
    }

    #[test]
    fn create_is_idempotent() {
        let directory = tempfile::tempdir().unwrap();
        let mut manager =
            FilesystemManager::open(directory.path()).unwrap();

        manager.create(descriptor("weather")).unwrap();
        assert_eq!(manager.len(), 1);

        // second create with a different precision is ignored
        let mut changed = descriptor("weather");
        changed.spatial_precision = 8;
        manager.create(changed).unwrap();

        assert_eq!(manager.get("weather").unwrap()
            .descriptor().spatial_precision, 4);
    }

    #[test]
    fn delete_removes_directory() {
        let directory = tempfile::tempdir().unwrap();
        let mut manager =
            FilesystemManager::open(directory.path()).unwrap();

        manager.create(descriptor("weather")).unwrap();
        let filesystem_directory = manager.get("weather").unwrap()
            .directory().to_path_buf();
        assert!(filesystem_directory.exists());

        manager.delete("weather").unwrap();
        assert!(manager.get("weather").is_none());
        assert!(!filesystem_directory.exists());

        // unknown delete converges silently
        manager.delete("weather").unwrap();
    }

    #[test]
    fn snapshot_restores_on_open() {
        let directory = tempfile::tempdir().unwrap();
        {
            let mut manager =
                FilesystemManager::open(directory.path()).unwrap();
            manager.create(descriptor("weather")).unwrap();
            manager.create(descriptor("traffic")).unwrap();
            manager.delete("traffic").unwrap();
        }

        let manager =
            FilesystemManager::open(directory.path()).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.get("weather").is_some());
        assert!(manager.get("traffic").is_none());
    }
}
