use crate::error::Error;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Stat identity of a file; the cache is authoritative only when all four
/// components match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime_ns: i64,
}

/// Process-wide persistent `(device, inode, size, mtime) → sha256` cache.
/// Survives across scans; any mtime or size change misses.
pub struct FileHashCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl FileHashCache {
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = match Self::open_connection(path) {
            Ok(conn) => conn,
            Err(err) => {
                // Unreadable cache is recoverable: drop it and start clean,
                // forcing re-hash of anything it used to cover.
                warn!("Fingerprint cache at {} unusable ({}), resetting", path.display(), err);
                Self::remove_cache_files(path);
                Self::open_connection(path)?
            }
        };
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn open_connection(path: &Path) -> Result<Connection, Error> {
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(conn)
    }

    fn configure(conn: &Connection) -> Result<(), Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            conn.execute_batch(
                "DROP TABLE IF EXISTS file_hashes;
                 CREATE TABLE file_hashes (
                     device INTEGER NOT NULL,
                     inode INTEGER NOT NULL,
                     size INTEGER NOT NULL,
                     mtime_ns INTEGER NOT NULL,
                     sha256 TEXT NOT NULL,
                     PRIMARY KEY (device, inode, size, mtime_ns)
                 );
                 PRAGMA user_version = 1;",
            )?;
            debug!("Fingerprint cache schema initialized (version 1)");
        }
        Ok(())
    }

    fn remove_cache_files(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = path.as_os_str().to_owned();
            candidate.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(candidate));
        }
    }

    /// Rebuild the backing database after detected corruption. Entries are
    /// derived data, so losing them only costs re-hashing.
    fn recover(&self, conn: &mut Connection) {
        let Some(path) = &self.path else { return };
        warn!("Fingerprint cache corrupted, resetting {}", path.display());
        Self::remove_cache_files(path);
        if let Ok(fresh) = Self::open_connection(path) {
            *conn = fresh;
        }
    }

    fn is_corruption(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
                )
        )
    }

    /// `Some(digest)` only when the full stat identity matches.
    pub fn lookup(&self, key: &CacheKey) -> Option<String> {
        let mut conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT sha256 FROM file_hashes \
             WHERE device = ?1 AND inode = ?2 AND size = ?3 AND mtime_ns = ?4",
            params![
                key.device as i64,
                key.inode as i64,
                key.size as i64,
                key.mtime_ns
            ],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(digest) => Some(digest),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                if Self::is_corruption(&err) {
                    self.recover(&mut conn);
                }
                None
            }
        }
    }

    pub fn insert(&self, key: &CacheKey, digest: &str) {
        let mut conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT OR REPLACE INTO file_hashes (device, inode, size, mtime_ns, sha256) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.device as i64,
                key.inode as i64,
                key.size as i64,
                key.mtime_ns,
                digest
            ],
        );
        if let Err(err) = result {
            if Self::is_corruption(&err) {
                self.recover(&mut conn);
            } else {
                warn!("Fingerprint cache insert failed: {}", err);
            }
        }
    }

    pub fn len(&self) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_hashes", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM file_hashes", [])?;
        debug!("Fingerprint cache cleared");
        Ok(())
    }
}
