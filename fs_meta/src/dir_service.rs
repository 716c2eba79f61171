use crate::meta_db::{DirectoryEntry, EntryKind, FileEntry, FileStatus, FsMetaDB, MetaTxn};
use fvr_lib::{FvrError, FvrPath, FvrResult};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ListEntry {
    Directory(String),
    File(String),
}

impl ListEntry {
    pub fn name(&self) -> &str {
        match self {
            ListEntry::Directory(name) | ListEntry::File(name) => name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ListEntry::Directory(_))
    }
}

/// Makes a fully stored file visible: status goes to `Complete` and the name
/// is listed in the parent, both inside the caller's transaction.
pub fn register_complete_file(
    txn: &MetaTxn<'_>,
    path: &FvrPath,
    content_hash: &str,
) -> FvrResult<()> {
    let (parent, name) = path
        .split_parent_name()
        .ok_or_else(|| FvrError::InvalidParam("root cannot be a file".to_string()))?;
    if !txn.directory_exists(&parent)? {
        return Err(FvrError::ParentNotFound(parent.to_string()));
    }
    if txn.directory_exists(path)? {
        return Err(FvrError::AlreadyExists(format!("{} is a directory", path)));
    }

    txn.set_file_status(path, FileStatus::Complete, Some(content_hash))?;
    match txn.get_child_kind(&parent, &name)? {
        None => txn.add_child(&parent, &name, EntryKind::File),
        Some(EntryKind::File) => Err(FvrError::StoreInconsistency(format!(
            "{} listed before completion",
            path
        ))),
        Some(EntryKind::Dir) => Err(FvrError::AlreadyExists(path.to_string())),
    }
}

/// Namespace operations over the metadata store. Never touches the backend.
pub struct DirectoryService {
    db: Arc<FsMetaDB>,
}

impl DirectoryService {
    pub fn new(db: Arc<FsMetaDB>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<FsMetaDB> {
        &self.db
    }

    pub fn mkdir(&self, path: &str) -> FvrResult<()> {
        let path = FvrPath::normalize(path)?;
        let Some((parent, name)) = path.split_parent_name() else {
            return self.create_root();
        };

        self.db.transaction(|txn| {
            if !txn.directory_exists(&parent)? {
                return Err(FvrError::ParentNotFound(parent.to_string()));
            }
            if txn.directory_exists(&path)?
                || txn.file_exists(&path)?
                || txn.get_child_kind(&parent, &name)?.is_some()
            {
                return Err(FvrError::AlreadyExists(path.to_string()));
            }

            txn.put_directory(&DirectoryEntry::new_empty(path.clone()))?;
            txn.add_child(&parent, &name, EntryKind::Dir)?;
            Ok(())
        })?;
        debug!("DirectoryService: mkdir {}", path);
        Ok(())
    }

    fn create_root(&self) -> FvrResult<()> {
        let root = FvrPath::root();
        self.db.transaction(|txn| {
            if txn.directory_exists(&root)? {
                return Err(FvrError::AlreadyExists(root.to_string()));
            }
            txn.put_directory(&DirectoryEntry::new_empty(root.clone()))
        })?;
        info!("DirectoryService: root directory created");
        Ok(())
    }

    /// Creates the root if missing. Returns whether it was created.
    pub fn ensure_root(&self) -> FvrResult<bool> {
        match self.create_root() {
            Ok(()) => Ok(true),
            Err(FvrError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children in insertion order, tagged by kind. A listed name whose entry is
    /// missing (or whose file is not complete) is reported, never skipped.
    pub fn lsdir(&self, path: &str) -> FvrResult<Vec<ListEntry>> {
        let path = FvrPath::normalize(path)?;
        self.db.read(|txn| {
            if !txn.directory_exists(&path)? {
                return Err(FvrError::NotFound(path.to_string()));
            }

            let children = txn.list_children(&path)?;
            let mut result = Vec::with_capacity(children.len());
            for (name, kind) in children {
                let child = path.join(&name).map_err(|_| {
                    FvrError::StoreInconsistency(format!("bad child name {:?} in {}", name, path))
                })?;
                match kind {
                    EntryKind::Dir => {
                        if !txn.directory_exists(&child)? {
                            warn!("DirectoryService: dangling dir {} in listing", child);
                            return Err(FvrError::StoreInconsistency(format!(
                                "listed directory {} has no entry",
                                child
                            )));
                        }
                        result.push(ListEntry::Directory(name));
                    }
                    EntryKind::File => {
                        let status = txn.get_file(&child)?.map(|f| f.status);
                        if status != Some(FileStatus::Complete) {
                            warn!(
                                "DirectoryService: listed file {} has status {:?}",
                                child, status
                            );
                            return Err(FvrError::StoreInconsistency(format!(
                                "listed file {} is not complete",
                                child
                            )));
                        }
                        result.push(ListEntry::File(name));
                    }
                }
            }
            Ok(result)
        })
    }

    pub fn rmdir(&self, path: &str) -> FvrResult<()> {
        let path = FvrPath::normalize(path)?;
        let (parent, name) = path
            .split_parent_name()
            .ok_or_else(|| FvrError::InvalidParam("cannot remove root".to_string()))?;

        self.db.transaction(|txn| {
            if !txn.directory_exists(&path)? {
                return Err(FvrError::NotFound(path.to_string()));
            }
            // pending or failed uploads count as children too
            if txn.count_children(&path)? > 0 || txn.count_unlisted_files(&path)? > 0 {
                return Err(FvrError::NotEmpty(path.to_string()));
            }
            if !txn.directory_exists(&parent)? {
                return Err(FvrError::StoreInconsistency(format!(
                    "parent of {} missing",
                    path
                )));
            }
            if txn.get_child_kind(&parent, &name)? != Some(EntryKind::Dir) {
                return Err(FvrError::StoreInconsistency(format!(
                    "{} not listed in {}",
                    name, parent
                )));
            }

            txn.delete_directory(&path)?;
            txn.remove_child(&parent, &name)?;
            Ok(())
        })?;
        debug!("DirectoryService: rmdir {}", path);
        Ok(())
    }

    /// Drops a file entry, its chunk records and its listing. Remote chunk
    /// bytes are left alone since copies and dedup may share them.
    pub fn remove_file(&self, path: &str) -> FvrResult<FileEntry> {
        let path = FvrPath::normalize(path)?;
        let (parent, name) = path
            .split_parent_name()
            .ok_or_else(|| FvrError::InvalidParam("root is not a file".to_string()))?;

        let entry = self.db.transaction(|txn| {
            let entry = txn
                .get_file(&path)?
                .ok_or_else(|| FvrError::NotFound(path.to_string()))?;
            let listed = txn.get_child_kind(&parent, &name)? == Some(EntryKind::File);
            if listed != (entry.status == FileStatus::Complete) {
                return Err(FvrError::StoreInconsistency(format!(
                    "{} is {} but listed={}",
                    path,
                    entry.status.to_str(),
                    listed
                )));
            }

            txn.delete_file(&path)?;
            if listed {
                txn.remove_child(&parent, &name)?;
            }
            Ok(entry)
        })?;
        info!(
            "DirectoryService: removed file {} ({} chunks)",
            path,
            entry.chunks.len()
        );
        Ok(entry)
    }

    pub fn stat_file(&self, path: &str) -> FvrResult<FileEntry> {
        let path = FvrPath::normalize(path)?;
        self.db
            .get_file(&path)?
            .ok_or_else(|| FvrError::NotFound(path.to_string()))
    }
}
