//! Read-side access to captured calls
//!
//! Every query tolerates a missing storage root or identity and reports it
//! as "no records".

use std::path::PathBuf;

use crate::config::CaptureConfig;
use crate::identity::FunctionIdentity;
use crate::storage::{Backend, CallRecord, CaptureStore, StorageStats};
use crate::value::NamedArgs;

/// Loads captured calls for replay in tests
#[derive(Debug, Clone)]
pub struct CaptureLoader {
    store: CaptureStore,
}

impl CaptureLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: CaptureStore::new(root),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            store: CaptureStore::from_config(config),
        }
    }

    pub fn from_store(store: CaptureStore) -> Self {
        Self { store }
    }

    /// Backend used for files whose extension is not recognized
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.store = self.store.with_backend(backend);
        self
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    /// Newest record
    pub fn latest(&self, identity: &FunctionIdentity) -> Option<CallRecord> {
        self.all(identity).into_iter().next()
    }

    /// Record by position, 0 being the newest
    pub fn by_index(&self, identity: &FunctionIdentity, index: usize) -> Option<CallRecord> {
        self.all(identity).into_iter().nth(index)
    }

    /// Every readable record, newest first
    pub fn all(&self, identity: &FunctionIdentity) -> Vec<CallRecord> {
        self.store.list(identity)
    }

    pub fn has(&self, identity: &FunctionIdentity) -> bool {
        self.count(identity) > 0
    }

    pub fn count(&self, identity: &FunctionIdentity) -> usize {
        self.all(identity).len()
    }

    pub fn latest_args(&self, identity: &FunctionIdentity) -> Option<NamedArgs> {
        self.latest(identity).map(|r| r.named_arguments)
    }

    pub fn args_by_index(&self, identity: &FunctionIdentity, index: usize) -> Option<NamedArgs> {
        self.by_index(identity, index).map(|r| r.named_arguments)
    }

    pub fn all_args(&self, identity: &FunctionIdentity) -> Vec<NamedArgs> {
        self.all(identity)
            .into_iter()
            .map(|r| r.named_arguments)
            .collect()
    }

    /// Identities with at least one record
    pub fn list_functions(&self) -> Vec<FunctionIdentity> {
        self.store.list_identities()
    }

    pub fn stats(&self) -> StorageStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Retention;
    use crate::value::ArgValue;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_reports_nothing() {
        let loader = CaptureLoader::new("/nonexistent/snapcall/root");
        let id = FunctionIdentity::new("m", "f");
        assert!(!loader.has(&id));
        assert_eq!(loader.count(&id), 0);
        assert!(loader.latest(&id).is_none());
        assert!(loader.by_index(&id, 3).is_none());
        assert!(loader.list_functions().is_empty());
        assert_eq!(loader.stats().total_record_count, 0);
    }

    #[test]
    fn test_index_out_of_range_is_absent() {
        let dir = TempDir::new().unwrap();
        let loader = CaptureLoader::new(dir.path());
        let id = FunctionIdentity::new("m", "f");
        let args: NamedArgs = [("x", ArgValue::Int(1))].into_iter().collect();
        loader
            .store()
            .save(&id, args, None, Retention::keep(3), true)
            .unwrap();
        assert!(loader.by_index(&id, 0).is_some());
        assert!(loader.by_index(&id, 1).is_none());
        assert_eq!(loader.latest_args(&id).unwrap().get_as::<i64>("x"), Some(1));
    }
}
