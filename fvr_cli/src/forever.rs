use chunk_store::create_backend;
use clap::Subcommand;
use fs_meta::{DirectoryService, FileEntry, FsMetaDB, ListEntry};
use fs_transfer::{CancelToken, TransferEngine};
use fvr_lib::{default_fvr_home, ForeverConfig, FvrError, FvrResult, DEFAULT_CONFIG_FILE};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the metadata store and the root directory
    Init,
    /// Create a directory (parent must exist)
    Mkdir { path: String },
    /// List a directory
    Lsdir {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Upload a local file, resuming an earlier partial upload
    Put { local: PathBuf, remote: String },
    /// Download a file
    Get { remote: String, local: PathBuf },
    /// Copy a file inside the store
    Cp { src: String, dst: String },
    /// Remove a file entry
    Rm { remote: String },
    /// Show a file entry and its chunks
    Stat { remote: String },
}

pub fn default_config_path() -> PathBuf {
    default_fvr_home().join(DEFAULT_CONFIG_FILE)
}

fn read_json_config<T: DeserializeOwned>(path: &Path) -> FvrResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FvrError::IoError(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str::<T>(&content)
        .map_err(|e| FvrError::InvalidParam(format!("parse {} failed: {}", path.display(), e)))
}

/// An explicit path must exist; a missing default file means defaults.
pub fn load_config(path: Option<&Path>) -> FvrResult<ForeverConfig> {
    let config: ForeverConfig = match path {
        Some(path) => read_json_config(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                read_json_config(&path)?
            } else {
                debug!("no config at {}, using defaults", path.display());
                ForeverConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config)
}

struct Forever {
    dirs: DirectoryService,
    engine: TransferEngine,
    root_created: bool,
}

fn open_store(config: &ForeverConfig) -> FvrResult<Forever> {
    if let Some(parent) = config.meta_db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            FvrError::IoError(format!("create {} failed: {}", parent.display(), e))
        })?;
    }
    let db = Arc::new(FsMetaDB::new(
        config.meta_db_path.to_string_lossy().to_string(),
    )?);
    let dirs = DirectoryService::new(db.clone());
    let root_created = dirs.ensure_root()?;
    if root_created {
        info!(
            "created metadata store at {}",
            config.meta_db_path.display()
        );
    }

    let backend = create_backend(&config.backend);
    debug!("using backend {}", backend.backend_name());
    let engine = TransferEngine::new(config, db, backend)?;
    Ok(Forever {
        dirs,
        engine,
        root_created,
    })
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after in-flight chunks");
            token.cancel();
        }
    });
    cancel
}

fn format_listing(entries: &[ListEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| match entry {
            ListEntry::Directory(name) => format!("{}/", name),
            ListEntry::File(name) => name.clone(),
        })
        .collect()
}

fn format_stat(entry: &FileEntry) -> Vec<String> {
    let mut lines = vec![
        format!("path: {}", entry.path),
        format!("status: {}", entry.status.to_str()),
        format!("size: {}", entry.size),
        format!(
            "content_hash: {}",
            entry.content_hash.as_deref().unwrap_or("-")
        ),
        format!(
            "chunks: {} ({} stored)",
            entry.chunks.len(),
            entry.stored_chunk_count()
        ),
    ];
    for chunk in entry.chunks.iter() {
        lines.push(format!(
            "  #{} offset={} length={} {} {} remote={}",
            chunk.index,
            chunk.offset,
            chunk.length,
            chunk.state.to_str(),
            chunk.hash,
            chunk.remote_id.as_deref().unwrap_or("-")
        ));
    }
    lines
}

/// Runs one command and returns what should go to stdout.
pub async fn run_command(config: &ForeverConfig, command: Command) -> FvrResult<Vec<String>> {
    let store = open_store(config)?;
    match command {
        Command::Init => {
            if store.root_created {
                Ok(vec![format!(
                    "initialized {}",
                    config.meta_db_path.display()
                )])
            } else {
                Ok(vec![format!(
                    "already initialized {}",
                    config.meta_db_path.display()
                )])
            }
        }
        Command::Mkdir { path } => {
            store.dirs.mkdir(&path)?;
            Ok(Vec::new())
        }
        Command::Lsdir { path } => Ok(format_listing(&store.dirs.lsdir(&path)?)),
        Command::Rmdir { path } => {
            store.dirs.rmdir(&path)?;
            Ok(Vec::new())
        }
        Command::Put { local, remote } => {
            let report = store
                .engine
                .put(&local, &remote, &cancel_on_ctrl_c())
                .await?;
            Ok(vec![report.to_string()])
        }
        Command::Get { remote, local } => {
            let report = store
                .engine
                .get(&remote, &local, &cancel_on_ctrl_c())
                .await?;
            Ok(vec![report.to_string()])
        }
        Command::Cp { src, dst } => {
            let report = store
                .engine
                .copy(&src, &dst, &cancel_on_ctrl_c())
                .await?;
            Ok(vec![report.to_string()])
        }
        Command::Rm { remote } => {
            store.dirs.remove_file(&remote)?;
            Ok(Vec::new())
        }
        Command::Stat { remote } => Ok(format_stat(&store.dirs.stat_file(&remote)?)),
    }
}
