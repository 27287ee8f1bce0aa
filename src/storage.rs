//! File-backed capture store
//!
//! Layout:
//!
//! ```text
//! <root>/
//!   app/billing/Invoice/total/        one directory per function identity
//!     17180000000000000001-4242.json  one file per call record
//!     17180000000000000002-4242.json
//!   side_effect_capture/...           replay buckets (see `replay`)
//! ```
//!
//! File names start with a zero-padded timestamp from a process-wide
//! monotonic clock, so lexical order is creation order. Records are written
//! to a temporary file in the same directory, synced, and renamed into place
//! without clobbering, so readers never see a partial record.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::identity::FunctionIdentity;
use crate::replay::SIDE_EFFECT_DIR;
use crate::value::{ArgValue, CallArgs, NamedArgs};

/// Version written into every record
pub const FORMAT_VERSION: u32 = 1;

const MAX_PERSIST_ATTEMPTS: usize = 16;

/// On-disk record encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Backend {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "json" => Some(Backend::Json),
            "msgpack" | "messagepack" | "mpk" => Some(Backend::MessagePack),
            _ => None,
        }
    }

    /// Parse a backend name, falling back to JSON
    pub fn parse_lenient(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            tracing::warn!("Unknown capture backend '{}', falling back to json", name);
            Backend::Json
        })
    }

    pub fn extension(self) -> &'static str {
        match self {
            Backend::Json => "json",
            Backend::MessagePack => "msgpack",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "json" => Some(Backend::Json),
            "msgpack" => Some(Backend::MessagePack),
            _ => None,
        }
    }

    pub fn encode(self, record: &CallRecord) -> Result<Vec<u8>> {
        match self {
            Backend::Json => {
                serde_json::to_vec_pretty(record).map_err(|e| CaptureError::Encode(e.to_string()))
            }
            Backend::MessagePack => {
                rmp_serde::to_vec_named(record).map_err(|e| CaptureError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<CallRecord> {
        match self {
            Backend::Json => {
                serde_json::from_slice(bytes).map_err(|e| CaptureError::Decode(e.to_string()))
            }
            Backend::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| CaptureError::Decode(e.to_string()))
            }
        }
    }
}

/// One persisted invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub format_version: u32,
    pub identity: FunctionIdentity,
    pub function_name: String,
    pub module_name: String,
    /// Monotonic creation time, nanoseconds since the Unix epoch
    pub timestamp_nanos: u64,
    pub recorded_at: DateTime<Utc>,
    pub argument_count: usize,
    pub named_arguments: NamedArgs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ArgValue>,
    /// File this record was loaded from
    #[serde(skip)]
    pub location: PathBuf,
}

impl CallRecord {
    pub fn new(identity: FunctionIdentity, named_arguments: NamedArgs, result: Option<ArgValue>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            function_name: identity.function_name().to_string(),
            module_name: identity.module_name(),
            identity,
            timestamp_nanos: 0,
            recorded_at: Utc::now(),
            argument_count: named_arguments.len(),
            named_arguments,
            result,
            location: PathBuf::new(),
        }
    }

    /// Decode one named argument for replay
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.named_arguments.get_as(name)
    }

    /// Decode the captured result
    pub fn result_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.result.as_ref().and_then(|r| r.decode().ok())
    }

    /// Raw call arguments rebuilt from the named mapping
    pub fn call_args(&self) -> CallArgs {
        CallArgs::from_named(&self.named_arguments)
    }
}

/// How many records to keep per function identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Keep the newest `n` records (at least one)
    Keep(usize),
    Unbounded,
}

impl Retention {
    pub fn keep(n: usize) -> Self {
        Retention::Keep(n.max(1))
    }

    fn limit(self) -> Option<usize> {
        match self {
            Retention::Keep(n) => Some(n.max(1)),
            Retention::Unbounded => None,
        }
    }
}

impl From<usize> for Retention {
    fn from(n: usize) -> Self {
        Retention::keep(n)
    }
}

/// Result of a save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// The new record, or the existing newest record when nothing was written
    pub location: PathBuf,
    pub created: bool,
    pub bytes_written: u64,
}

/// Per-function storage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FunctionStorageStats {
    pub record_count: usize,
    pub total_bytes: u64,
    pub latest_timestamp: Option<u64>,
}

/// Storage statistics for one root
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStats {
    pub root: PathBuf,
    pub function_count: usize,
    pub total_record_count: usize,
    pub total_bytes: u64,
    pub functions: BTreeMap<String, FunctionStorageStats>,
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Next record timestamp: wall clock nanos, strictly increasing per process
pub fn next_timestamp_nanos() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn record_file_name(nanos: u64, backend: Backend) -> String {
    format!("{:020}-{}.{}", nanos, std::process::id(), backend.extension())
}

/// Timestamp and backend encoded in a record file name
fn parse_record_file_name(name: &str) -> Option<(u64, Backend)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let backend = Backend::from_extension(ext)?;
    let (nanos, pid) = stem.split_once('-')?;
    if nanos.len() != 20 || pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((nanos.parse().ok()?, backend))
}

#[derive(Debug, Clone)]
struct RecordFile {
    path: PathBuf,
    timestamp: u64,
    backend: Backend,
}

/// Record files in a directory, oldest first
fn record_files(dir: &Path) -> Vec<RecordFile> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut files: Vec<RecordFile> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let (timestamp, backend) = parse_record_file_name(name.to_str()?)?;
            Some(RecordFile {
                path: entry.path(),
                timestamp,
                backend,
            })
        })
        .collect();
    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    files
}

/// Remove the oldest records beyond `retention`. Failures are logged only.
fn prune_dir(dir: &Path, retention: Retention) -> usize {
    let Some(keep) = retention.limit() else {
        return 0;
    };
    let files = record_files(dir);
    let excess = files.len().saturating_sub(keep);
    files[..excess]
        .iter()
        .filter(|file| match fs::remove_file(&file.path) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("Failed to prune {}: {}", file.path.display(), err);
                false
            }
        })
        .count()
}

/// Process-wide lock for one identity directory
fn directory_lock(dir: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}

/// Thread-safe capture store rooted at one directory
#[derive(Debug, Clone)]
pub struct CaptureStore {
    root: PathBuf,
    backend: Backend,
}

impl CaptureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: Backend::Json,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.capture_path(None)).with_backend(config.backend())
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Directory holding the records of one identity
    pub fn identity_dir(&self, identity: &FunctionIdentity) -> PathBuf {
        self.root.join(identity.relative_dir())
    }

    /// Persist one call.
    ///
    /// With `overwrite == false` and at least one existing record, nothing is
    /// written and the newest existing record is returned. Otherwise a new
    /// record is written and the oldest records beyond `retention` are pruned.
    pub fn save(
        &self,
        identity: &FunctionIdentity,
        named_arguments: NamedArgs,
        result: Option<ArgValue>,
        retention: Retention,
        overwrite: bool,
    ) -> Result<SaveOutcome> {
        let record = CallRecord::new(identity.clone(), named_arguments, result);
        self.save_in(&self.identity_dir(identity), record, retention, overwrite)
    }

    /// Persist a record into an explicit directory under this store
    pub(crate) fn save_in(
        &self,
        dir: &Path,
        mut record: CallRecord,
        retention: Retention,
        overwrite: bool,
    ) -> Result<SaveOutcome> {
        fs::create_dir_all(dir)?;
        let lock = directory_lock(dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if !overwrite {
            if let Some(existing) = record_files(dir).pop() {
                return Ok(SaveOutcome {
                    location: existing.path,
                    created: false,
                    bytes_written: 0,
                });
            }
        }

        let (location, bytes_written) = self.write_record(dir, &mut record)?;
        let pruned = prune_dir(dir, retention);
        if pruned > 0 {
            tracing::debug!("Pruned {} old records in {}", pruned, dir.display());
        }
        Ok(SaveOutcome {
            location,
            created: true,
            bytes_written,
        })
    }

    fn write_record(&self, dir: &Path, record: &mut CallRecord) -> Result<(PathBuf, u64)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let nanos = next_timestamp_nanos();
            record.timestamp_nanos = nanos;
            let bytes = self.backend.encode(record)?;
            let path = dir.join(record_file_name(nanos, self.backend));

            let mut tmp = NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok((path, bytes.len() as u64)),
                Err(err) if err.error.kind() == ErrorKind::AlreadyExists && attempt < MAX_PERSIST_ATTEMPTS => {
                    tracing::debug!("Record name {} taken, retrying", path.display());
                }
                Err(err) => {
                    return Err(CaptureError::Persist {
                        path,
                        source: err.error,
                    })
                }
            }
        }
    }

    /// Read one record. Missing, truncated, or undecodable files give `None`.
    pub fn load(&self, location: &Path) -> Option<CallRecord> {
        let backend = location
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Backend::from_extension)
            .unwrap_or(self.backend);
        self.load_with(location, backend)
    }

    fn load_with(&self, location: &Path, backend: Backend) -> Option<CallRecord> {
        let bytes = match fs::read(location) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::debug!("Failed to read {}: {}", location.display(), err);
                }
                return None;
            }
        };
        match backend.decode(&bytes) {
            Ok(mut record) => {
                record.location = location.to_path_buf();
                Some(record)
            }
            Err(err) => {
                tracing::debug!("Skipping unreadable record {}: {}", location.display(), err);
                None
            }
        }
    }

    /// Records of one identity, newest first
    pub fn list(&self, identity: &FunctionIdentity) -> Vec<CallRecord> {
        self.list_dir(&self.identity_dir(identity))
    }

    /// Records in an explicit directory, newest first
    pub fn list_dir(&self, dir: &Path) -> Vec<CallRecord> {
        record_files(dir)
            .into_iter()
            .rev()
            .filter_map(|file| self.load_with(&file.path, file.backend))
            .collect()
    }

    /// Number of record files for an identity, readable or not
    pub fn record_count(&self, identity: &FunctionIdentity) -> usize {
        record_files(&self.identity_dir(identity)).len()
    }

    /// Delete every record of an identity
    pub fn delete_all(&self, identity: &FunctionIdentity) -> Result<usize> {
        let dir = self.identity_dir(identity);
        let lock = directory_lock(&dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut deleted = 0;
        for file in record_files(&dir) {
            match fs::remove_file(&file.path) {
                Ok(()) => deleted += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(deleted)
    }

    /// Apply a retention limit to one identity
    pub fn prune(&self, identity: &FunctionIdentity, retention: Retention) -> usize {
        let dir = self.identity_dir(identity);
        let lock = directory_lock(&dir);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        prune_dir(&dir, retention)
    }

    /// Apply a retention limit to every identity under the root
    pub fn cleanup_all(&self, retention: Retention) -> usize {
        self.identity_dirs()
            .into_iter()
            .map(|(dir, _)| {
                let lock = directory_lock(&dir);
                let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                prune_dir(&dir, retention)
            })
            .sum()
    }

    /// Every identity with at least one record, side-effect buckets excluded
    pub fn list_identities(&self) -> Vec<FunctionIdentity> {
        let mut identities: Vec<FunctionIdentity> = self
            .identity_dirs()
            .into_iter()
            .filter_map(|(dir, files)| self.identity_of(&dir, &files))
            .collect();
        identities.sort();
        identities.dedup();
        identities
    }

    /// Statistics over every identity under the root
    pub fn stats(&self) -> StorageStats {
        let mut stats = StorageStats {
            root: self.root.clone(),
            ..StorageStats::default()
        };
        for (dir, files) in self.identity_dirs() {
            let Some(identity) = self.identity_of(&dir, &files) else {
                continue;
            };
            let total_bytes: u64 = files
                .iter()
                .filter_map(|f| fs::metadata(&f.path).ok())
                .map(|m| m.len())
                .sum();
            let entry = stats.functions.entry(identity.to_string()).or_default();
            entry.record_count += files.len();
            entry.total_bytes += total_bytes;
            entry.latest_timestamp = entry
                .latest_timestamp
                .max(files.iter().map(|f| f.timestamp).max());
            stats.total_record_count += files.len();
            stats.total_bytes += total_bytes;
        }
        stats.function_count = stats.functions.len();
        stats
    }

    fn identity_of(&self, dir: &Path, files: &[RecordFile]) -> Option<FunctionIdentity> {
        files
            .iter()
            .rev()
            .find_map(|f| self.load_with(&f.path, f.backend))
            .map(|record| record.identity)
            .or_else(|| FunctionIdentity::from_relative_dir(dir.strip_prefix(&self.root).ok()?))
    }

    /// Directories under the root that hold records
    fn identity_dirs(&self) -> Vec<(PathBuf, Vec<RecordFile>)> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == SIDE_EFFECT_DIR))
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let files = record_files(entry.path());
                (!files.is_empty()).then(|| (entry.into_path(), files))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ident() -> FunctionIdentity {
        FunctionIdentity::new("app::math", "add")
    }

    fn args(n: i64) -> NamedArgs {
        [("n", ArgValue::Int(n))].into_iter().collect()
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let a = next_timestamp_nanos();
        let b = next_timestamp_nanos();
        let c = next_timestamp_nanos();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_file_name_round_trip() {
        let name = record_file_name(42, Backend::MessagePack);
        assert!(name.starts_with("00000000000000000042-"));
        assert_eq!(parse_record_file_name(&name), Some((42, Backend::MessagePack)));
        assert_eq!(parse_record_file_name(".tmpAbC12"), None);
        assert_eq!(parse_record_file_name("notes.json"), None);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(Backend::parse("JSON"), Some(Backend::Json));
        assert_eq!(Backend::parse("msgpack"), Some(Backend::MessagePack));
        assert_eq!(Backend::parse("pickle"), None);
        assert_eq!(Backend::parse_lenient("pickle"), Backend::Json);
    }

    #[test]
    fn test_retention_clamps_to_one() {
        assert_eq!(Retention::from(0), Retention::Keep(1));
        assert_eq!(Retention::Keep(0).limit(), Some(1));
        assert_eq!(Retention::Unbounded.limit(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        let outcome = store
            .save(&ident(), args(1), Some(ArgValue::Int(2)), Retention::keep(5), true)
            .unwrap();
        assert!(outcome.created);
        assert!(outcome.bytes_written > 0);

        let record = store.load(&outcome.location).unwrap();
        assert_eq!(record.function_name, "add");
        assert_eq!(record.module_name, "app.math");
        assert_eq!(record.argument_count, 1);
        assert_eq!(record.arg::<i64>("n"), Some(1));
        assert_eq!(record.result_as::<i64>(), Some(2));
        assert_eq!(record.location, outcome.location);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        for n in 1..=5 {
            store.save(&ident(), args(n), None, Retention::keep(2), true).unwrap();
        }
        let values: Vec<i64> = store
            .list(&ident())
            .iter()
            .filter_map(|r| r.arg("n"))
            .collect();
        assert_eq!(values, vec![5, 4]);
    }

    #[test]
    fn test_temp_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        store.save(&ident(), args(1), None, Retention::keep(5), true).unwrap();
        fs::write(store.identity_dir(&ident()).join(".tmpXYZ"), b"{").unwrap();
        assert_eq!(store.record_count(&ident()), 1);
    }

    #[test]
    fn test_side_effect_tree_excluded_from_identities() {
        let dir = TempDir::new().unwrap();
        let store = CaptureStore::new(dir.path());
        store.save(&ident(), args(1), None, Retention::keep(5), true).unwrap();
        let bucket = dir.path().join(SIDE_EFFECT_DIR).join("t").join("m").join("c");
        let record = CallRecord::new(FunctionIdentity::new("t", "m"), args(2), None);
        store.save_in(&bucket, record, Retention::Unbounded, true).unwrap();

        assert_eq!(store.list_identities(), vec![ident()]);
        assert_eq!(store.stats().total_record_count, 1);
    }
}
