use fvr_lib::{FvrError, FvrPath, FvrResult, RemoteId};
use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlError, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

const DENTRY_KIND_DIR: i64 = 0;
const DENTRY_KIND_FILE: i64 = 1;

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Dir,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub path: FvrPath,
    pub name: String,
    pub subdirs: Vec<String>,
    pub subfiles: Vec<String>,
}

impl DirectoryEntry {
    pub fn new_empty(path: FvrPath) -> Self {
        let name = path.name().to_string();
        Self {
            path,
            name,
            subdirs: Vec::new(),
            subfiles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subdirs.is_empty() && self.subfiles.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileStatus {
    Pending,
    Complete,
    Failed,
}

impl FileStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "complete" => Some(FileStatus::Complete),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Complete => "complete",
            FileStatus::Failed => "failed",
        }
    }
}

impl ToSql for FileStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for FileStatus {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        FileStatus::from_str(s).ok_or_else(|| FromSqlError::Other(format!("bad status {}", s).into()))
    }
}

/// Upload path: Planned -> Uploading -> Stored (or back to Planned / Aborted).
/// Download path: Stored -> Fetching -> Local, only tracked per transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChunkState {
    Planned,
    Uploading,
    Stored,
    Aborted,
    Fetching,
    Local,
}

impl ChunkState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(ChunkState::Planned),
            "uploading" => Some(ChunkState::Uploading),
            "stored" => Some(ChunkState::Stored),
            "aborted" => Some(ChunkState::Aborted),
            "fetching" => Some(ChunkState::Fetching),
            "local" => Some(ChunkState::Local),
            _ => None,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            ChunkState::Planned => "planned",
            ChunkState::Uploading => "uploading",
            ChunkState::Stored => "stored",
            ChunkState::Aborted => "aborted",
            ChunkState::Fetching => "fetching",
            ChunkState::Local => "local",
        }
    }

    pub fn is_stored(&self) -> bool {
        matches!(self, ChunkState::Stored)
    }
}

impl ToSql for ChunkState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for ChunkState {
    fn column_result(value: ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        ChunkState::from_str(s)
            .ok_or_else(|| FromSqlError::Other(format!("bad chunk state {}", s).into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkRecord {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
    pub hash: String,
    pub remote_id: Option<RemoteId>,
    pub state: ChunkState,
}

impl ChunkRecord {
    pub fn new_planned(index: u64, offset: u64, length: u64, hash: String) -> Self {
        Self {
            index,
            offset,
            length,
            hash,
            remote_id: None,
            state: ChunkState::Planned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: FvrPath,
    pub size: u64,
    pub content_hash: Option<String>,
    pub chunks: Vec<ChunkRecord>,
    pub status: FileStatus,
}

impl FileEntry {
    pub fn new_pending(path: FvrPath, size: u64, chunks: Vec<ChunkRecord>) -> Self {
        Self {
            path,
            size,
            content_hash: None,
            chunks,
            status: FileStatus::Pending,
        }
    }

    pub fn stored_chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.state.is_stored()).count()
    }

    pub fn all_chunks_stored(&self) -> bool {
        self.chunks.iter().all(|c| c.state.is_stored())
    }
}

pub(crate) fn map_db_err(err: rusqlite::Error) -> FvrError {
    FvrError::DbError(err.to_string())
}

fn kind_to_int(kind: EntryKind) -> i64 {
    match kind {
        EntryKind::Dir => DENTRY_KIND_DIR,
        EntryKind::File => DENTRY_KIND_FILE,
    }
}

fn kind_from_int(value: i64) -> FvrResult<EntryKind> {
    match value {
        DENTRY_KIND_DIR => Ok(EntryKind::Dir),
        DENTRY_KIND_FILE => Ok(EntryKind::File),
        _ => Err(FvrError::StoreInconsistency(format!(
            "invalid dentry kind {}",
            value
        ))),
    }
}

/// Record-level operations over one connection.
///
/// Obtained from [`FsMetaDB::transaction`] (all writes commit together or not
/// at all) or [`FsMetaDB::read`] (plain reads).
pub struct MetaTxn<'a> {
    conn: &'a Connection,
}

impl<'a> MetaTxn<'a> {
    pub fn directory_exists(&self, path: &FvrPath) -> FvrResult<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM directory WHERE path = ?1",
                params![path.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_db_err)?;
        Ok(found.is_some())
    }

    pub fn get_directory(&self, path: &FvrPath) -> FvrResult<Option<DirectoryEntry>> {
        let name = self
            .conn
            .query_row(
                "SELECT name FROM directory WHERE path = ?1",
                params![path.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(map_db_err)?;
        let Some(name) = name else {
            return Ok(None);
        };

        let mut entry = DirectoryEntry {
            path: path.clone(),
            name,
            subdirs: Vec::new(),
            subfiles: Vec::new(),
        };
        for (child, kind) in self.list_children(path)? {
            match kind {
                EntryKind::Dir => entry.subdirs.push(child),
                EntryKind::File => entry.subfiles.push(child),
            }
        }
        Ok(Some(entry))
    }

    /// Upsert the directory row and make its child listing match `entry`.
    pub fn put_directory(&self, entry: &DirectoryEntry) -> FvrResult<()> {
        self.conn
            .execute(
                "INSERT INTO directory (path, name, create_time) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path) DO UPDATE SET name = excluded.name",
                params![entry.path.as_str(), entry.name, unix_timestamp() as i64],
            )
            .map_err(|e| {
                warn!("FsMetaDB: put directory {} failed! {}", entry.path, e);
                map_db_err(e)
            })?;

        self.conn
            .execute(
                "DELETE FROM dentries WHERE parent_path = ?1",
                params![entry.path.as_str()],
            )
            .map_err(map_db_err)?;
        for name in entry.subdirs.iter() {
            self.add_child(&entry.path, name, EntryKind::Dir)?;
        }
        for name in entry.subfiles.iter() {
            self.add_child(&entry.path, name, EntryKind::File)?;
        }
        Ok(())
    }

    /// Removes the directory row and whatever listing it still owns.
    pub fn delete_directory(&self, path: &FvrPath) -> FvrResult<bool> {
        self.conn
            .execute(
                "DELETE FROM dentries WHERE parent_path = ?1",
                params![path.as_str()],
            )
            .map_err(map_db_err)?;
        let removed = self
            .conn
            .execute("DELETE FROM directory WHERE path = ?1", params![path.as_str()])
            .map_err(|e| {
                warn!("FsMetaDB: delete directory {} failed! {}", path, e);
                map_db_err(e)
            })?;
        Ok(removed > 0)
    }

    pub fn add_child(&self, parent: &FvrPath, name: &str, kind: EntryKind) -> FvrResult<()> {
        self.conn
            .execute(
                "INSERT INTO dentries (parent_path, name, kind, create_time) VALUES (?1, ?2, ?3, ?4)",
                params![
                    parent.as_str(),
                    name,
                    kind_to_int(kind),
                    unix_timestamp() as i64
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    FvrError::AlreadyExists(format!("{} already listed in {}", name, parent))
                }
                _ => {
                    warn!("FsMetaDB: add child {} to {} failed! {}", name, parent, e);
                    map_db_err(e)
                }
            })?;
        Ok(())
    }

    pub fn remove_child(&self, parent: &FvrPath, name: &str) -> FvrResult<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM dentries WHERE parent_path = ?1 AND name = ?2",
                params![parent.as_str(), name],
            )
            .map_err(map_db_err)?;
        Ok(removed > 0)
    }

    pub fn get_child_kind(&self, parent: &FvrPath, name: &str) -> FvrResult<Option<EntryKind>> {
        let kind = self
            .conn
            .query_row(
                "SELECT kind FROM dentries WHERE parent_path = ?1 AND name = ?2",
                params![parent.as_str(), name],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(map_db_err)?;
        kind.map(kind_from_int).transpose()
    }

    /// Children in insertion order.
    pub fn list_children(&self, parent: &FvrPath) -> FvrResult<Vec<(String, EntryKind)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, kind FROM dentries WHERE parent_path = ?1 ORDER BY rowid")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![parent.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(map_db_err)?;

        let mut children = Vec::new();
        for row in rows {
            let (name, kind) = row.map_err(map_db_err)?;
            children.push((name, kind_from_int(kind)?));
        }
        Ok(children)
    }

    pub fn count_children(&self, parent: &FvrPath) -> FvrResult<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM dentries WHERE parent_path = ?1",
                params![parent.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(map_db_err)?;
        Ok(count as u64)
    }

    /// Files under `parent` that are not listed yet (pending or failed transfers).
    pub fn count_unlisted_files(&self, parent: &FvrPath) -> FvrResult<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM file WHERE parent_path = ?1 AND status != ?2",
                params![parent.as_str(), FileStatus::Complete],
                |row| row.get::<_, i64>(0),
            )
            .map_err(map_db_err)?;
        Ok(count as u64)
    }

    pub fn file_exists(&self, path: &FvrPath) -> FvrResult<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM file WHERE path = ?1",
                params![path.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(map_db_err)?;
        Ok(found.is_some())
    }

    pub fn get_file(&self, path: &FvrPath) -> FvrResult<Option<FileEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT size, status, content_hash FROM file WHERE path = ?1",
                params![path.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, FileStatus>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| {
                warn!("FsMetaDB: get file {} failed! {}", path, e);
                map_db_err(e)
            })?;
        let Some((size, status, content_hash)) = row else {
            return Ok(None);
        };

        Ok(Some(FileEntry {
            path: path.clone(),
            size: size as u64,
            content_hash,
            chunks: self.get_chunks(path)?,
            status,
        }))
    }

    fn get_chunks(&self, path: &FvrPath) -> FvrResult<Vec<ChunkRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT chunk_index, chunk_offset, chunk_length, hash, remote_id, state
                 FROM chunk WHERE file_path = ?1 ORDER BY chunk_index",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![path.as_str()], |row| {
                Ok(ChunkRecord {
                    index: row.get::<_, i64>(0)? as u64,
                    offset: row.get::<_, i64>(1)? as u64,
                    length: row.get::<_, i64>(2)? as u64,
                    hash: row.get(3)?,
                    remote_id: row.get(4)?,
                    state: row.get(5)?,
                })
            })
            .map_err(map_db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_db_err)
    }

    /// Upsert the file row and replace its whole chunk list.
    pub fn put_file(&self, entry: &FileEntry) -> FvrResult<()> {
        let parent = entry.path.parent().ok_or_else(|| {
            FvrError::InvalidParam("root cannot be a file".to_string())
        })?;
        let now = unix_timestamp() as i64;
        self.conn
            .execute(
                "INSERT INTO file (path, parent_path, size, status, content_hash, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(path) DO UPDATE SET
                    size = excluded.size,
                    status = excluded.status,
                    content_hash = excluded.content_hash,
                    update_time = excluded.update_time",
                params![
                    entry.path.as_str(),
                    parent.as_str(),
                    entry.size as i64,
                    entry.status,
                    entry.content_hash,
                    now
                ],
            )
            .map_err(|e| {
                warn!("FsMetaDB: put file {} failed! {}", entry.path, e);
                map_db_err(e)
            })?;

        self.conn
            .execute(
                "DELETE FROM chunk WHERE file_path = ?1",
                params![entry.path.as_str()],
            )
            .map_err(map_db_err)?;

        let mut stmt = self
            .conn
            .prepare(
                "INSERT INTO chunk (file_path, chunk_index, chunk_offset, chunk_length, hash, remote_id, state)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(map_db_err)?;
        for chunk in entry.chunks.iter() {
            stmt.execute(params![
                entry.path.as_str(),
                chunk.index as i64,
                chunk.offset as i64,
                chunk.length as i64,
                chunk.hash,
                chunk.remote_id,
                chunk.state,
            ])
            .map_err(|e| {
                warn!(
                    "FsMetaDB: insert chunk {}#{} failed! {}",
                    entry.path, chunk.index, e
                );
                map_db_err(e)
            })?;
        }
        Ok(())
    }

    /// Drops the file row and its chunk records. The parent listing is the
    /// caller's business.
    pub fn delete_file(&self, path: &FvrPath) -> FvrResult<bool> {
        self.conn
            .execute(
                "DELETE FROM chunk WHERE file_path = ?1",
                params![path.as_str()],
            )
            .map_err(map_db_err)?;
        let removed = self
            .conn
            .execute("DELETE FROM file WHERE path = ?1", params![path.as_str()])
            .map_err(|e| {
                warn!("FsMetaDB: delete file {} failed! {}", path, e);
                map_db_err(e)
            })?;
        Ok(removed > 0)
    }

    pub fn set_file_status(
        &self,
        path: &FvrPath,
        status: FileStatus,
        content_hash: Option<&str>,
    ) -> FvrResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE file SET status = ?1, content_hash = ?2, update_time = ?3 WHERE path = ?4",
                params![status, content_hash, unix_timestamp() as i64, path.as_str()],
            )
            .map_err(map_db_err)?;
        if updated == 0 {
            return Err(FvrError::NotFound(format!("file not found: {}", path)));
        }
        Ok(())
    }

    pub fn update_chunk(&self, path: &FvrPath, chunk: &ChunkRecord) -> FvrResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE chunk SET state = ?1, remote_id = ?2 WHERE file_path = ?3 AND chunk_index = ?4",
                params![chunk.state, chunk.remote_id, path.as_str(), chunk.index as i64],
            )
            .map_err(|e| {
                warn!(
                    "FsMetaDB: update chunk {}#{} failed! {}",
                    path, chunk.index, e
                );
                map_db_err(e)
            })?;
        if updated == 0 {
            return Err(FvrError::NotFound(format!(
                "chunk not found: {}#{}",
                path, chunk.index
            )));
        }
        Ok(())
    }

    /// Remote id of any stored chunk carrying `hash`, from any file.
    pub fn find_stored_chunk_by_hash(&self, hash: &str) -> FvrResult<Option<RemoteId>> {
        self.conn
            .query_row(
                "SELECT remote_id FROM chunk
                 WHERE hash = ?1 AND state = ?2 AND remote_id IS NOT NULL
                 LIMIT 1",
                params![hash, ChunkState::Stored],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(map_db_err)
    }
}

/// SQLite-backed store for the directory tree, file entries and chunk records.
pub struct FsMetaDB {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl FsMetaDB {
    pub fn new(db_path: impl Into<String>) -> FvrResult<Self> {
        let db_path = db_path.into();
        debug!("FsMetaDB: open db path: {}", db_path);
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| {
            warn!("FsMetaDB: open db failed! {}", e);
            map_db_err(e)
        })?;
        Self::init_connection(&conn)?;
        Self::create_schema(&conn)?;

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection) -> FvrResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| FvrError::DbError(format!("pragma failed: {}", e)))
    }

    fn create_schema(conn: &Connection) -> FvrResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS directory (
                path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                create_time INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dentries (
                parent_path TEXT NOT NULL REFERENCES directory(path),
                name TEXT NOT NULL,
                kind INTEGER NOT NULL,
                create_time INTEGER NOT NULL,
                PRIMARY KEY (parent_path, name),
                CHECK (kind IN (0, 1))
            );

            CREATE TABLE IF NOT EXISTS file (
                path TEXT PRIMARY KEY,
                parent_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                status TEXT NOT NULL,
                content_hash TEXT,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_file_parent ON file(parent_path, status);

            CREATE TABLE IF NOT EXISTS chunk (
                file_path TEXT NOT NULL REFERENCES file(path),
                chunk_index INTEGER NOT NULL,
                chunk_offset INTEGER NOT NULL,
                chunk_length INTEGER NOT NULL,
                hash TEXT NOT NULL,
                remote_id TEXT,
                state TEXT NOT NULL,
                UNIQUE (file_path, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunk_hash ON chunk(hash, state);",
        )
        .map_err(|e| {
            warn!("FsMetaDB: create schema failed! {}", e);
            FvrError::DbError(format!("create schema failed: {}", e))
        })
    }

    fn lock_conn(&self) -> FvrResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FvrError::Internal(format!("conn lock poisoned: {}", e)))
    }

    /// Runs `f` inside `BEGIN IMMEDIATE`; commits when it returns `Ok`, rolls
    /// back on `Err` or unwind.
    pub fn transaction<T, F>(&self, f: F) -> FvrResult<T>
    where
        F: FnOnce(&MetaTxn<'_>) -> FvrResult<T>,
    {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                warn!("FsMetaDB: begin transaction failed! {}", e);
                map_db_err(e)
            })?;
        let result = f(&MetaTxn { conn: &*tx })?;
        tx.commit().map_err(|e| {
            warn!("FsMetaDB: commit failed! {}", e);
            map_db_err(e)
        })?;
        Ok(result)
    }

    pub fn read<T, F>(&self, f: F) -> FvrResult<T>
    where
        F: FnOnce(&MetaTxn<'_>) -> FvrResult<T>,
    {
        let conn = self.lock_conn()?;
        f(&MetaTxn { conn: &*conn })
    }

    pub fn get_directory(&self, path: &FvrPath) -> FvrResult<Option<DirectoryEntry>> {
        self.read(|txn| txn.get_directory(path))
    }

    pub fn put_directory(&self, entry: &DirectoryEntry) -> FvrResult<()> {
        self.transaction(|txn| txn.put_directory(entry))
    }

    pub fn delete_directory(&self, path: &FvrPath) -> FvrResult<bool> {
        self.transaction(|txn| txn.delete_directory(path))
    }

    pub fn get_file(&self, path: &FvrPath) -> FvrResult<Option<FileEntry>> {
        self.read(|txn| txn.get_file(path))
    }

    pub fn put_file(&self, entry: &FileEntry) -> FvrResult<()> {
        self.transaction(|txn| txn.put_file(entry))
    }

    pub fn delete_file(&self, path: &FvrPath) -> FvrResult<bool> {
        self.transaction(|txn| txn.delete_file(path))
    }

    pub fn update_chunk(&self, path: &FvrPath, chunk: &ChunkRecord) -> FvrResult<()> {
        self.transaction(|txn| txn.update_chunk(path, chunk))
    }

    pub fn set_file_status(
        &self,
        path: &FvrPath,
        status: FileStatus,
        content_hash: Option<&str>,
    ) -> FvrResult<()> {
        self.transaction(|txn| txn.set_file_status(path, status, content_hash))
    }

    pub fn find_stored_chunk_by_hash(&self, hash: &str) -> FvrResult<Option<RemoteId>> {
        self.read(|txn| txn.find_stored_chunk_by_hash(hash))
    }
}
