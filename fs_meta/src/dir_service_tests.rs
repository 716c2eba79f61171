use crate::dir_service::*;
use crate::meta_db::*;
use fvr_lib::{FvrError, FvrPath};
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_service() -> (DirectoryService, TempDir) {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("test.db");
    let db = Arc::new(FsMetaDB::new(db_path.to_str().unwrap()).unwrap());
    let svc = DirectoryService::new(db);
    svc.ensure_root().unwrap();
    (svc, tmp_dir)
}

fn names(entries: &[ListEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name()).collect()
}

fn p(path: &str) -> FvrPath {
    FvrPath::normalize(path).unwrap()
}

/// Writes a complete single-chunk file entry and lists it, the way a finished
/// upload leaves it.
fn add_complete_file(svc: &DirectoryService, path: &str) {
    let path = p(path);
    let entry = FileEntry::new_pending(
        path.clone(),
        3,
        vec![ChunkRecord {
            index: 0,
            offset: 0,
            length: 3,
            hash: "sha256:abc".to_string(),
            remote_id: Some("r-0".to_string()),
            state: ChunkState::Stored,
        }],
    );
    svc.db()
        .transaction(|txn| {
            txn.put_file(&entry)?;
            register_complete_file(txn, &path, "sha256:file")
        })
        .unwrap();
}

/// Every row of every table, in storage order.
fn dump_store(tmp: &TempDir) -> Vec<String> {
    let conn = rusqlite::Connection::open(tmp.path().join("test.db")).unwrap();
    let mut rows = Vec::new();
    for table in ["directory", "dentries", "file", "chunk"] {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {} ORDER BY rowid", table))
            .unwrap();
        let columns = stmt.column_count();
        let mut query = stmt.query([]).unwrap();
        while let Some(row) = query.next().unwrap() {
            let values: Vec<String> = (0..columns)
                .map(|i| format!("{:?}", row.get_ref(i).unwrap()))
                .collect();
            rows.push(format!("{}: {}", table, values.join(", ")));
        }
    }
    rows
}

fn add_pending_file(svc: &DirectoryService, path: &str) {
    let entry = FileEntry::new_pending(
        p(path),
        3,
        vec![ChunkRecord::new_planned(0, 0, 3, "sha256:abc".to_string())],
    );
    svc.db().put_file(&entry).unwrap();
}

// ==================== Root Tests ====================

#[test]
fn test_root_created_once() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("test.db");
    let svc = DirectoryService::new(Arc::new(FsMetaDB::new(db_path.to_str().unwrap()).unwrap()));

    assert!(svc.lsdir("/").unwrap_err().is_not_found());
    svc.mkdir("/").unwrap();
    assert!(matches!(
        svc.mkdir("/").unwrap_err(),
        FvrError::AlreadyExists(_)
    ));
    assert!(!svc.ensure_root().unwrap());
    assert!(svc.lsdir("/").unwrap().is_empty());
}

#[test]
fn test_root_cannot_be_removed() {
    let (svc, _tmp) = create_test_service();
    assert!(matches!(
        svc.rmdir("/").unwrap_err(),
        FvrError::InvalidParam(_)
    ));
    assert!(svc.lsdir("/").is_ok());
}

// ==================== mkdir / lsdir / rmdir Tests ====================

#[test]
fn test_scenario_mkdir_rmdir() {
    let tmp_dir = TempDir::new().unwrap();
    let db_path = tmp_dir.path().join("test.db");
    let svc = DirectoryService::new(Arc::new(FsMetaDB::new(db_path.to_str().unwrap()).unwrap()));

    svc.mkdir("/").unwrap();
    svc.mkdir("/a").unwrap();
    assert_eq!(
        svc.lsdir("/").unwrap(),
        vec![ListEntry::Directory("a".to_string())]
    );
    svc.mkdir("/a/b").unwrap();
    assert!(matches!(svc.rmdir("/a").unwrap_err(), FvrError::NotEmpty(_)));
    svc.rmdir("/a/b").unwrap();
    svc.rmdir("/a").unwrap();
    assert!(svc.lsdir("/").unwrap().is_empty());
}

#[test]
fn test_mkdir_listed_in_parent() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/music").unwrap();
    svc.mkdir("/music/jazz").unwrap();
    svc.mkdir("/music/rock/").unwrap();
    svc.mkdir("/music//blues").unwrap();

    let listing = svc.lsdir("/music").unwrap();
    assert_eq!(names(&listing), vec!["jazz", "rock", "blues"]);
    assert!(listing.iter().all(|e| e.is_dir()));
    assert!(svc.lsdir("/music/jazz").unwrap().is_empty());
}

#[test]
fn test_mkdir_parent_not_found_no_mutation() {
    let (svc, tmp) = create_test_service();
    svc.mkdir("/a").unwrap();
    let before = dump_store(&tmp);

    let err = svc.mkdir("/x/y").unwrap_err();
    assert!(matches!(err, FvrError::ParentNotFound(_)));
    let err = svc.mkdir("/a/b/c").unwrap_err();
    assert!(matches!(err, FvrError::ParentNotFound(_)));

    assert_eq!(dump_store(&tmp), before);
    assert!(svc.lsdir("/x/y").unwrap_err().is_not_found());
}

#[test]
fn test_mkdir_already_exists_is_repeatable() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/a").unwrap();
    for _ in 0..3 {
        assert!(matches!(
            svc.mkdir("/a").unwrap_err(),
            FvrError::AlreadyExists(_)
        ));
    }
    assert_eq!(names(&svc.lsdir("/").unwrap()), vec!["a"]);
}

#[test]
fn test_mkdir_over_file_fails() {
    let (svc, _tmp) = create_test_service();
    add_complete_file(&svc, "/f.txt");
    add_pending_file(&svc, "/pending.txt");
    assert!(matches!(
        svc.mkdir("/f.txt").unwrap_err(),
        FvrError::AlreadyExists(_)
    ));
    assert!(matches!(
        svc.mkdir("/pending.txt").unwrap_err(),
        FvrError::AlreadyExists(_)
    ));
}

#[test]
fn test_mkdir_relative_path_rejected() {
    let (svc, _tmp) = create_test_service();
    assert!(matches!(
        svc.mkdir("a/b").unwrap_err(),
        FvrError::InvalidParam(_)
    ));
}

#[test]
fn test_rmdir_not_found_is_repeatable() {
    let (svc, _tmp) = create_test_service();
    for _ in 0..2 {
        assert!(svc.rmdir("/ghost").unwrap_err().is_not_found());
    }
    assert!(svc.lsdir("/").unwrap().is_empty());
}

#[test]
fn test_rmdir_inverse_of_mkdir() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/keep").unwrap();
    let before = svc.lsdir("/").unwrap();

    svc.mkdir("/tmp").unwrap();
    svc.rmdir("/tmp").unwrap();
    assert_eq!(svc.lsdir("/").unwrap(), before);
    assert!(svc.lsdir("/tmp").unwrap_err().is_not_found());

    // the name is free again
    svc.mkdir("/tmp").unwrap();
}

#[test]
fn test_rmdir_with_file_not_empty() {
    let (svc, tmp) = create_test_service();
    svc.mkdir("/docs").unwrap();
    add_complete_file(&svc, "/docs/readme");
    let before = dump_store(&tmp);

    assert!(matches!(
        svc.rmdir("/docs").unwrap_err(),
        FvrError::NotEmpty(_)
    ));
    assert_eq!(dump_store(&tmp), before);
    assert_eq!(
        svc.lsdir("/docs").unwrap(),
        vec![ListEntry::File("readme".to_string())]
    );
}

#[test]
fn test_rmdir_with_pending_upload_not_empty() {
    let (svc, tmp) = create_test_service();
    svc.mkdir("/up").unwrap();
    add_pending_file(&svc, "/up/big.iso");

    assert!(svc.lsdir("/up").unwrap().is_empty());
    let before = dump_store(&tmp);
    assert!(matches!(svc.rmdir("/up").unwrap_err(), FvrError::NotEmpty(_)));
    assert_eq!(dump_store(&tmp), before);
}

#[test]
fn test_lsdir_tags_dirs_and_files() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/d").unwrap();
    add_complete_file(&svc, "/f");
    add_pending_file(&svc, "/hidden");

    assert_eq!(
        svc.lsdir("/").unwrap(),
        vec![
            ListEntry::Directory("d".to_string()),
            ListEntry::File("f".to_string()),
        ]
    );
}

// ==================== Concurrency Tests ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mkdir_same_parent() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/shared").unwrap();
    let svc = Arc::new(svc);

    let mut handles = Vec::new();
    for i in 0..16 {
        let svc = svc.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            svc.mkdir(&format!("/shared/d{}", i))
        }));
    }
    for _ in 0..4 {
        let svc = svc.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            svc.mkdir("/shared/same")
        }));
    }

    let mut created = 0;
    let mut exists = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => created += 1,
            Err(FvrError::AlreadyExists(_)) => exists += 1,
            Err(e) => panic!("unexpected mkdir error: {}", e),
        }
    }
    assert_eq!(created, 17);
    assert_eq!(exists, 3);

    let listing = svc.lsdir("/shared").unwrap();
    let mut listed: Vec<&str> = names(&listing);
    listed.sort();
    let mut expected: Vec<String> = (0..16).map(|i| format!("d{}", i)).collect();
    expected.push("same".to_string());
    expected.sort();
    assert_eq!(listed, expected);
    assert!(listing.iter().all(|e| e.is_dir()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mkdir_rmdir() {
    let (svc, _tmp) = create_test_service();
    for i in 0..8 {
        svc.mkdir(&format!("/old{}", i)).unwrap();
    }
    let svc = Arc::new(svc);

    let mut handles = Vec::new();
    for i in 0..8 {
        let svc = svc.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            svc.rmdir(&format!("/old{}", i))?;
            svc.mkdir(&format!("/new{}", i))
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut listed: Vec<String> = svc
        .lsdir("/")
        .unwrap()
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    listed.sort();
    let mut expected: Vec<String> = (0..8).map(|i| format!("new{}", i)).collect();
    expected.sort();
    assert_eq!(listed, expected);
}

// ==================== Inconsistency Tests ====================

#[test]
fn test_lsdir_dangling_child_is_inconsistency() {
    let (svc, _tmp) = create_test_service();
    let root = FvrPath::root();
    svc.db()
        .transaction(|txn| txn.add_child(&root, "ghost", EntryKind::File))
        .unwrap();

    assert!(matches!(
        svc.lsdir("/").unwrap_err(),
        FvrError::StoreInconsistency(_)
    ));
    // not repaired
    assert_eq!(
        svc.db().read(|txn| txn.count_children(&root)).unwrap(),
        1
    );
}

#[test]
fn test_rmdir_unlisted_dir_is_inconsistency() {
    let (svc, _tmp) = create_test_service();
    svc.db()
        .put_directory(&DirectoryEntry::new_empty(p("/orphan")))
        .unwrap();

    assert!(matches!(
        svc.rmdir("/orphan").unwrap_err(),
        FvrError::StoreInconsistency(_)
    ));
    assert!(svc.db().get_directory(&p("/orphan")).unwrap().is_some());
}

// ==================== File Tests ====================

#[test]
fn test_remove_complete_file() {
    let (svc, _tmp) = create_test_service();
    svc.mkdir("/d").unwrap();
    add_complete_file(&svc, "/d/f");

    let removed = svc.remove_file("/d/f").unwrap();
    assert_eq!(removed.status, FileStatus::Complete);
    assert!(svc.lsdir("/d").unwrap().is_empty());
    assert!(svc.stat_file("/d/f").unwrap_err().is_not_found());
    svc.rmdir("/d").unwrap();
}

#[test]
fn test_remove_pending_file() {
    let (svc, _tmp) = create_test_service();
    add_pending_file(&svc, "/p");
    assert_eq!(svc.stat_file("/p").unwrap().status, FileStatus::Pending);
    svc.remove_file("/p").unwrap();
    assert!(svc.remove_file("/p").unwrap_err().is_not_found());
}

#[test]
fn test_register_requires_parent() {
    let (svc, _tmp) = create_test_service();
    add_pending_file(&svc, "/nodir/f");
    let path = p("/nodir/f");
    let err = svc
        .db()
        .transaction(|txn| register_complete_file(txn, &path, "sha256:x"))
        .unwrap_err();
    assert!(matches!(err, FvrError::ParentNotFound(_)));
    assert_eq!(svc.stat_file("/nodir/f").unwrap().status, FileStatus::Pending);
}

#[test]
fn test_stat_file() {
    let (svc, _tmp) = create_test_service();
    add_complete_file(&svc, "/s");
    let entry = svc.stat_file("/s/").unwrap();
    assert_eq!(entry.path.as_str(), "/s");
    assert_eq!(entry.content_hash.as_deref(), Some("sha256:file"));
    assert!(entry.all_chunks_stored());
}
