use crate::pool::CatalogueItem;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported file type: {0:?} (expected .vpk, .zip, .7z or .rar)")]
    UnsupportedFormat(PathBuf),

    #[error("could not open archive {path:?}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("no .rar extraction tool configured; cannot open {0:?}")]
    MissingExtractionTool(PathBuf),

    #[error("I/O error while ingesting {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptArchive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("could not load settings from {path:?}: {reason}")]
    ConfigLoadFailure { path: PathBuf, reason: String },

    #[error("could not save settings to {path:?}: {reason}")]
    ConfigSaveFailure { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no mod at position {position} (list has {len})")]
    OutOfRange { position: usize, len: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("game folder not found; set it with `vpksmith set-game <dir>`")]
    GameFolderMissing,

    #[error(
        "permission denied writing {0:?}; close the game if it is running, or run with elevated permissions"
    )]
    PermissionDenied(PathBuf),

    #[error("cannot patch game config {path:?}: {reason}")]
    GameConfig { path: PathBuf, reason: String },

    #[error("failed to link {source_path:?} -> {dest:?}: {err}")]
    Link {
        source_path: PathBuf,
        dest: PathBuf,
        err: io::Error,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DeployError {
    /// Maps permission failures to the actionable variant; everything else stays I/O.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// A byte-identical package was found on disk that no registry entry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityWarning {
    pub existing: PathBuf,
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "duplicate of {:?} found on disk, but no mod in the list references it",
            self.existing
        )
    }
}

#[derive(Error, Debug)]
pub enum AcquireRejection {
    #[error("already downloading {0}")]
    AlreadyInFlight(CatalogueItem),

    #[error("too many ongoing downloads ({limit})")]
    TooManyInFlight { limit: usize },

    #[error("could not create download folder {path:?}: {source}")]
    TempDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
