use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("not yet published upstream: {0}")]
    NotFound(String),

    #[error("network request failed: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("upstream rejected credentials: {0}")]
    Auth(String),

    #[error("corrupt or truncated artifact: {0}")]
    Corruption(String),

    #[error("harmonization failed: {0}")]
    Harmonization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no configured source covers {dataset} on {date}")]
    ConfigurationGap { dataset: String, date: NaiveDate },

    #[error("free disk space {available} bytes is below the {threshold} byte safety threshold")]
    DiskSpace { available: u64, threshold: u64 },

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("missing config file ocean-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid dataset configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid source id: {0}")]
    InvalidSourceId(String),

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("store at {0} is locked by another process")]
    StoreLocked(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Network,
    Timeout,
    Auth,
    Corruption,
    Validation,
    ConfigurationGap,
    DiskSpace,
    Resource,
    Config,
    Filesystem,
    Ledger,
    Locked,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Validation => "validation",
            ErrorKind::ConfigurationGap => "configuration_gap",
            ErrorKind::DiskSpace => "disk_space",
            ErrorKind::Resource => "resource",
            ErrorKind::Config => "config",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Ledger => "ledger",
            ErrorKind::Locked => "locked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Skip,
    Retry,
    FatalDataset,
    PermanentGap,
    FatalRun,
}

impl ErrorKind {
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorKind::NotFound => Disposition::Skip,
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Corruption
            | ErrorKind::Validation
            | ErrorKind::Filesystem => Disposition::Retry,
            ErrorKind::Auth | ErrorKind::Config => Disposition::FatalDataset,
            ErrorKind::ConfigurationGap => Disposition::PermanentGap,
            ErrorKind::DiskSpace | ErrorKind::Resource | ErrorKind::Ledger | ErrorKind::Locked => {
                Disposition::FatalRun
            }
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Network(_) => ErrorKind::Network,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Corruption(_) | SyncError::Harmonization(_) => ErrorKind::Corruption,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::ConfigurationGap { .. } => ErrorKind::ConfigurationGap,
            SyncError::DiskSpace { .. } => ErrorKind::DiskSpace,
            SyncError::Resource(_) => ErrorKind::Resource,
            SyncError::MissingConfig
            | SyncError::ConfigRead(_)
            | SyncError::ConfigParse(_)
            | SyncError::InvalidConfig(_)
            | SyncError::InvalidDatasetId(_)
            | SyncError::InvalidSourceId(_)
            | SyncError::UnknownDataset(_)
            | SyncError::InvalidDate(_) => ErrorKind::Config,
            SyncError::Filesystem(_) => ErrorKind::Filesystem,
            SyncError::Ledger(_) => ErrorKind::Ledger,
            SyncError::StoreLocked(_) => ErrorKind::Locked,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.kind().disposition()
    }
}
