use crate::error::Error;
use crate::model::FolderInfo;
use ahash::AHashMap;
use lru::LruCache;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

const MAGIC: &[u8; 8] = b"DFSTORE1";
const LRU_CAPACITY: usize = 256;

/// Scans whose estimated weight-map footprint stays under this keep the
/// decoded index in RAM; larger scans serve reads from `store.bin`.
pub const SPILL_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024;

/// Per-scan folder index with random access by relative path.
///
/// Single-writer during the scan (`persist` runs once, at aggregation end),
/// multi-reader afterwards. The on-disk form is always written so diff and
/// deletion keep working after a restart.
pub struct FolderStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

enum Inner {
    Memory(AHashMap<String, Arc<FolderInfo>>),
    Disk {
        file: File,
        index: AHashMap<String, (u64, u32)>,
        recent: LruCache<String, Arc<FolderInfo>>,
    },
}

impl FolderStore {
    /// Write `store.bin` and return a handle for reads.
    pub fn persist(path: &Path, folders: &[FolderInfo]) -> Result<Self, Error> {
        Self::persist_with_threshold(path, folders, SPILL_THRESHOLD_BYTES)
    }

    pub fn persist_with_threshold(
        path: &Path,
        folders: &[FolderInfo],
        spill_threshold: u64,
    ) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;

        let mut offset = MAGIC.len() as u64;
        let mut index: Vec<(String, u64, u32)> = Vec::with_capacity(folders.len());
        for folder in folders {
            let encoded = bincode::serialize(folder)?;
            let len = encoded.len() as u32;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(&encoded)?;
            index.push((folder.relative_path.clone(), offset, len));
            offset += 4 + len as u64;
        }

        let index_offset = offset;
        let encoded_index = bincode::serialize(&index)?;
        writer.write_all(&encoded_index)?;
        writer.write_all(&index_offset.to_le_bytes())?;
        writer.write_all(MAGIC)?;
        writer.flush()?;
        drop(writer);

        let estimated = estimate_resident_bytes(folders);
        let inner = if estimated <= spill_threshold {
            debug!(
                "Folder index kept in RAM ({} folders, ~{} bytes)",
                folders.len(),
                estimated
            );
            Inner::Memory(
                folders
                    .iter()
                    .map(|f| (f.relative_path.clone(), Arc::new(f.clone())))
                    .collect(),
            )
        } else {
            debug!(
                "Folder index spilled to {} ({} folders, ~{} bytes)",
                path.display(),
                folders.len(),
                estimated
            );
            Self::open_disk(path)?
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(inner),
        })
    }

    /// Reopen a previously persisted index, e.g. after a restart.
    pub fn open(path: &Path) -> Result<Self, Error> {
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Self::open_disk(path)?),
        })
    }

    fn open_disk(path: &Path) -> Result<Inner, Error> {
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        if total < (MAGIC.len() as u64) * 2 + 8 {
            return Err(Error::Store(format!("{} is truncated", path.display())));
        }

        let mut head = [0u8; 8];
        file.read_exact(&mut head)?;
        if &head != MAGIC {
            return Err(Error::Store(format!("{} has a bad header", path.display())));
        }

        file.seek(SeekFrom::End(-16))?;
        let mut footer = [0u8; 16];
        file.read_exact(&mut footer)?;
        if &footer[8..] != MAGIC {
            return Err(Error::Store(format!("{} has a bad footer", path.display())));
        }
        let index_offset = u64::from_le_bytes(footer[..8].try_into().unwrap());
        if index_offset >= total {
            return Err(Error::Store(format!("{} index out of bounds", path.display())));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let index_len = (total - 16 - index_offset) as usize;
        let mut encoded_index = vec![0u8; index_len];
        file.read_exact(&mut encoded_index)?;
        let entries: Vec<(String, u64, u32)> = bincode::deserialize(&encoded_index)?;

        let index: AHashMap<String, (u64, u32)> = entries
            .into_iter()
            .map(|(rel, offset, len)| (rel, (offset, len)))
            .collect();

        Ok(Inner::Disk {
            file,
            index,
            recent: LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        match &*self.inner.lock().unwrap() {
            Inner::Memory(map) => map.len(),
            Inner::Disk { index, .. } => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        match &*self.inner.lock().unwrap() {
            Inner::Memory(map) => map.contains_key(relative_path),
            Inner::Disk { index, .. } => index.contains_key(relative_path),
        }
    }

    pub fn get(&self, relative_path: &str) -> Result<Arc<FolderInfo>, Error> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Inner::Memory(map) => map
                .get(relative_path)
                .cloned()
                .ok_or_else(|| Error::FolderNotIndexed(relative_path.to_string())),
            Inner::Disk {
                file,
                index,
                recent,
            } => {
                if let Some(cached) = recent.get(relative_path) {
                    return Ok(Arc::clone(cached));
                }
                let &(offset, len) = index
                    .get(relative_path)
                    .ok_or_else(|| Error::FolderNotIndexed(relative_path.to_string()))?;

                file.seek(SeekFrom::Start(offset))?;
                let mut len_bytes = [0u8; 4];
                file.read_exact(&mut len_bytes)?;
                let stored_len = u32::from_le_bytes(len_bytes);
                if stored_len != len {
                    return Err(Error::Store(format!(
                        "record length mismatch for '{relative_path}'"
                    )));
                }
                let mut encoded = vec![0u8; len as usize];
                file.read_exact(&mut encoded)?;
                let folder: FolderInfo = bincode::deserialize(&encoded)?;
                let folder = Arc::new(folder);
                recent.put(relative_path.to_string(), Arc::clone(&folder));
                Ok(folder)
            }
        }
    }
}

fn estimate_resident_bytes(folders: &[FolderInfo]) -> u64 {
    folders
        .iter()
        .map(|f| {
            f.file_weights
                .keys()
                .map(|k| k.len() as u64 + 24)
                .sum::<u64>()
                + 128
        })
        .sum()
}
