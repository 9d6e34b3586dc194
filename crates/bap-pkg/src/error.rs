use bap_core::BapError;
use bap_db::DbError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PkgError {
    #[error("Package definition not found at {0:?}")]
    DefinitionNotFound(PathBuf),

    #[error("Corrupt archive {path:?}: {reason}")]
    ArchiveCorrupt { path: PathBuf, reason: String },

    #[error("Path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error("Invalid package name {0:?}")]
    InvalidName(String),

    #[error("Invalid package root URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("File conflict: {0:?} already exists")]
    FileConflict(PathBuf),

    #[error("Package {0} not found in any repository")]
    PackageNotFound(String),

    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Server did not report a content length for {0}")]
    LengthUnknown(String),

    #[error("Download of {0} was cancelled")]
    Cancelled(String),

    #[error("Malformed repository list at line {line}: {reason}")]
    MalformedRepoList { line: usize, reason: String },

    #[error("Another bap operation holds the lock {0:?}")]
    Locked(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] BapError),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, PkgError>;
