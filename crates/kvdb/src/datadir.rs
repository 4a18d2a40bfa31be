//! On-disk layout of a node's data directory.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::{Result, StoreError};

const CHAINDATA: &str = "chaindata";
const CARMEN: &str = "carmen";
const ERRLOCK: &str = "errlock";
const UNFINISHED: &str = "unfinished";

/// A previous run stopped on a permanent error and left an `errlock` file.
#[derive(Debug, thiserror::Error)]
#[error(
    "node is locked by a previous permanent error, inspect the data directory and \
     remove `{path}` to start again: {message}"
)]
pub struct ErrlockError {
    pub path: PathBuf,
    pub message: String,
}

/// Paths under a data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Consensus and gossip tables.
    pub fn chaindata(&self) -> PathBuf {
        self.root.join(CHAINDATA)
    }

    /// Current world state.
    pub fn carmen_live(&self) -> PathBuf {
        self.root.join(CARMEN).join("live")
    }

    /// Historical world states keyed by block number.
    pub fn carmen_archive(&self) -> PathBuf {
        self.root.join(CARMEN).join("archive")
    }

    pub fn errlock(&self) -> PathBuf {
        self.root.join(ERRLOCK)
    }

    pub fn unfinished(&self) -> PathBuf {
        self.root.join(UNFINISHED)
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|source| io_error(&self.root, source))
    }

    /// Whether the directory holds no chain data yet.
    pub fn is_empty(&self) -> bool {
        !self.chaindata().exists()
    }

    /// Writes the poison-pill file. Later starts refuse to run until it is removed.
    pub fn write_errlock(&self, message: &str) -> Result<()> {
        self.create()?;
        let path = self.errlock();
        fs::write(&path, format!("{message}\n")).map_err(|source| io_error(&path, source))
    }

    /// Fails if an `errlock` file exists.
    pub fn check_errlock(&self) -> std::result::Result<(), ErrlockError> {
        let path = self.errlock();
        match fs::read_to_string(&path) {
            Ok(message) => Err(ErrlockError {
                path,
                message: message.trim_end().to_string(),
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(ErrlockError {
                path,
                message: format!("errlock file is unreadable: {error}"),
            }),
        }
    }

    /// Marks a genesis import in progress.
    pub fn mark_unfinished(&self) -> Result<()> {
        self.create()?;
        let path = self.unfinished();
        fs::write(&path, b"").map_err(|source| io_error(&path, source))
    }

    pub fn clear_unfinished(&self) -> Result<()> {
        let path = self.unfinished();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    pub fn is_unfinished(&self) -> bool {
        self.unfinished().exists()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
