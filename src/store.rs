use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::Serialize;
use tempfile::Builder;

use crate::config::RawFormat;
use crate::domain::{DatasetId, compact_date};
use crate::error::SyncError;

const LEDGER_FILE: &str = "ledger.json";
const LOCK_FILE: &str = ".ocean-sync.lock";
const TEMP_PREFIX: &str = ".ocean-sync-tmp";

static HARMONIZED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<dataset>[a-z0-9][a-z0-9_-]*)_harmonized_(?P<date>\d{8})\.json$").unwrap()
});

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn raw_dir(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root.join("raw").join(dataset.as_str())
    }

    pub fn processed_dir(&self, dataset: &DatasetId) -> Utf8PathBuf {
        self.root.join("processed").join(dataset.as_str())
    }

    pub fn raw_path(&self, dataset: &DatasetId, date: NaiveDate, format: RawFormat) -> Utf8PathBuf {
        self.raw_dir(dataset)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!(
                "{dataset}_{}.{}",
                compact_date(date),
                format.extension()
            ))
    }

    pub fn harmonized_path(&self, dataset: &DatasetId, date: NaiveDate) -> Utf8PathBuf {
        self.processed_dir(dataset)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{dataset}_harmonized_{}.json", compact_date(date)))
    }

    pub fn ensure_root(&self) -> Result<(), SyncError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    pub fn lock(&self) -> Result<StoreLock, SyncError> {
        self.ensure_root()?;
        let path = self.root.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(format!("open lock {path}: {err}")))?;
        match file.try_lock() {
            Ok(()) => Ok(StoreLock { _file: file }),
            Err(fs::TryLockError::WouldBlock) => {
                Err(SyncError::StoreLocked(self.root.as_std_path().to_path_buf()))
            }
            Err(fs::TryLockError::Error(err)) => Err(SyncError::Filesystem(err.to_string())),
        }
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .ok_or_else(|| SyncError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn scan_harmonized(
        &self,
        dataset: &DatasetId,
    ) -> Result<BTreeMap<NaiveDate, u64>, SyncError> {
        let root = self.processed_dir(dataset);
        let mut found = BTreeMap::new();
        if !root.as_std_path().exists() {
            return Ok(found);
        }
        for path in walk_dir(root.as_std_path())? {
            let Some(date) = harmonized_date(&path, dataset) else {
                continue;
            };
            let size = fs::metadata(&path)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?
                .len();
            if size > 0 {
                found.insert(date, size);
            }
        }
        Ok(found)
    }

    pub fn remove_temp_files(dir: &Utf8Path) -> Result<usize, SyncError> {
        if !dir.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for path in list_dir(dir.as_std_path())? {
            if path.is_file() && is_temp_file(&path) {
                remove_counted(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn remove_file(path: &Utf8Path) -> Result<(), SyncError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn cleanup(&self) -> Result<CleanupReport, SyncError> {
        let mut report = CleanupReport::default();
        let raw_root = self.root.join("raw");
        if raw_root.as_std_path().exists() {
            for path in walk_dir(raw_root.as_std_path())? {
                if path.is_file() {
                    report.bytes_freed += remove_counted(&path)?;
                    report.raw_removed += 1;
                }
            }
        }
        for sub in ["processed", ""] {
            let dir = self.root.join(sub);
            if !dir.as_std_path().exists() {
                continue;
            }
            let entries = if sub.is_empty() {
                list_dir(dir.as_std_path())?
            } else {
                walk_dir(dir.as_std_path())?
            };
            for path in entries {
                if path.is_file() && is_temp_file(&path) {
                    report.bytes_freed += remove_counted(&path)?;
                    report.temp_removed += 1;
                }
            }
        }
        for sub in ["raw", "processed"] {
            let dir = self.root.join(sub);
            if dir.as_std_path().exists() {
                report.dirs_removed += remove_empty_dirs(dir.as_std_path())?;
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub raw_removed: usize,
    pub temp_removed: usize,
    pub dirs_removed: usize,
    pub bytes_freed: u64,
}

#[derive(Debug)]
pub struct StoreLock {
    _file: fs::File,
}

pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64, SyncError>;
}

pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available_bytes(&self, path: &Path) -> Result<u64, SyncError> {
        fs4::available_space(path).map_err(|err| SyncError::Resource(err.to_string()))
    }
}

fn harmonized_date(path: &Path, dataset: &DatasetId) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let captures = HARMONIZED_NAME.captures(name)?;
    if &captures["dataset"] != dataset.as_str() {
        return None;
    }
    NaiveDate::parse_from_str(&captures["date"], "%Y%m%d").ok()
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(TEMP_PREFIX))
        .unwrap_or(false)
}

fn remove_counted(path: &Path) -> Result<u64, SyncError> {
    let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    fs::remove_file(path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    Ok(size)
}

fn remove_empty_dirs(root: &Path) -> Result<usize, SyncError> {
    let mut dirs: Vec<PathBuf> = walk_dir(root)?
        .into_iter()
        .filter(|path| path.is_dir())
        .collect();
    // Deepest first so parents empty out after their children.
    dirs.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
    let mut removed = 0;
    for dir in dirs {
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            fs::remove_dir(&dir).map_err(|err| SyncError::Filesystem(err.to_string()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn list_dir(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let entries = fs::read_dir(root).map_err(|err| SyncError::Filesystem(err.to_string()))?;
    entries
        .map(|entry| {
            entry
                .map(|entry| entry.path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))
        })
        .collect()
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, SyncError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
