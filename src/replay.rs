//! Side-effect replay for test doubles
//!
//! A test double routes each call through [`SideEffectBridge::replay_or_call`]:
//! when a call with equal arguments was recorded before, the recorded real
//! result is returned; otherwise the real implementation runs and its result
//! is recorded for next time. In [`ReplayMode::Strict`] an unmatched call is
//! an error instead, so CI cannot silently record new fixtures.
//!
//! ```no_run
//! use snapcall::replay::{CallLog, RecordedCalls, SideEffectBridge};
//! use snapcall::{function_identity, CallArgs};
//!
//! trait Ops {
//!     fn plus(&self, a: i64, b: i64) -> i64;
//! }
//!
//! struct RealOps;
//! impl Ops for RealOps {
//!     fn plus(&self, a: i64, b: i64) -> i64 {
//!         a + b
//!     }
//! }
//!
//! struct ReplayOps<'a> {
//!     bridge: &'a SideEffectBridge,
//!     bucket: std::path::PathBuf,
//!     calls: RecordedCalls,
//! }
//!
//! impl Ops for ReplayOps<'_> {
//!     fn plus(&self, a: i64, b: i64) -> i64 {
//!         let args = CallArgs::new().arg(a).arg(b);
//!         self.calls.record(args.clone());
//!         self.bridge
//!             .replay_or_call(&self.bucket, args, || RealOps.plus(a, b))
//!             .unwrap()
//!     }
//! }
//!
//! let bridge = SideEffectBridge::new("captures");
//! let bucket = bridge.bucket_location(&function_identity!("test_plus"), "basic", "Ops::plus");
//! let ops = ReplayOps { bridge: &bridge, bucket: bucket.clone(), calls: RecordedCalls::new() };
//! assert_eq!(ops.plus(1, 2), 3);
//! bridge.assert_calls(&bucket, &ops.calls);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::config::CaptureConfig;
use crate::error::ReplayError;
use crate::identity::{decode_segment, encode_segment, FunctionIdentity, QUALNAME_MARKER};
use crate::signature::normalize;
use crate::storage::{CallRecord, CaptureStore, Retention};
use crate::value::{ArgValue, CallArgs};

/// Subtree of the storage root holding side-effect buckets
pub const SIDE_EFFECT_DIR: &str = "side_effect_capture";

/// What to do when a call has no recorded match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Call the real implementation and record its result
    #[default]
    Record,
    /// Fail the lookup
    Strict,
}

impl ReplayMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "record" | "capture" => Some(ReplayMode::Record),
            "strict" => Some(ReplayMode::Strict),
            _ => None,
        }
    }
}

/// Outcome of a non-failing lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(ArgValue),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<ArgValue> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
        }
    }
}

/// Calls observed by a test double
pub trait CallLog {
    fn calls(&self) -> Vec<CallArgs>;

    fn was_called_with(&self, args: &CallArgs) -> bool {
        self.calls().iter().any(|call| call == args)
    }
}

/// Thread-safe call log for hand-written test doubles
#[derive(Debug, Default)]
pub struct RecordedCalls {
    calls: Mutex<Vec<CallArgs>>,
}

impl RecordedCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, args: CallArgs) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(args);
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CallLog for RecordedCalls {
    fn calls(&self) -> Vec<CallArgs> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Cache-or-record layer over the capture store
#[derive(Debug, Clone)]
pub struct SideEffectBridge {
    store: CaptureStore,
    mode: ReplayMode,
}

impl SideEffectBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: CaptureStore::new(root),
            mode: ReplayMode::Record,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            store: CaptureStore::from_config(config),
            mode: config.replay_mode,
        }
    }

    pub fn with_mode(mut self, mode: ReplayMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    /// Bucket for one mocked member within one test case
    pub fn bucket_location(&self, test: &FunctionIdentity, case_label: &str, member: &str) -> PathBuf {
        self.store
            .root()
            .join(SIDE_EFFECT_DIR)
            .join(test.relative_dir())
            .join(FunctionIdentity::new("", member).relative_dir())
            .join(encode_segment(case_label.trim()))
    }

    /// First recorded call in `bucket` whose arguments equal `args`.
    ///
    /// A miss is an error in strict mode.
    pub fn lookup(&self, bucket: &Path, args: &CallArgs) -> Result<Lookup, ReplayError> {
        let hit = self
            .store
            .list_dir(bucket)
            .into_iter()
            .find(|record| record.call_args() == *args);
        match (hit, self.mode) {
            (Some(record), _) => Ok(Lookup::Hit(record.result.unwrap_or(ArgValue::Null))),
            (None, ReplayMode::Record) => Ok(Lookup::Miss),
            (None, ReplayMode::Strict) => Err(ReplayError::Lookup {
                bucket: bucket.to_path_buf(),
                args: args.clone(),
            }),
        }
    }

    /// Store one real call and its result in `bucket`
    pub fn record(&self, bucket: &Path, args: &CallArgs, result: ArgValue) -> Result<PathBuf, ReplayError> {
        let identity = bucket_identity(bucket);
        let record = CallRecord::new(identity, normalize(None, args), Some(result));
        let outcome = self
            .store
            .save_in(bucket, record, Retention::Unbounded, true)?;
        Ok(outcome.location)
    }

    /// Replay a recorded result, or run `real` and record what it returns.
    ///
    /// Recording failures are logged; the real result is still returned.
    pub fn replay_or_call<R, F>(&self, bucket: &Path, args: CallArgs, real: F) -> Result<R, ReplayError>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> R,
    {
        match self.lookup(bucket, &args)? {
            Lookup::Hit(value) => Ok(value.decode()?),
            Lookup::Miss => {
                let result = real();
                if let Err(err) = self.record(bucket, &args, ArgValue::capture(&result)) {
                    tracing::warn!("Failed to record side effect in {}: {}", bucket.display(), err);
                }
                Ok(result)
            }
        }
    }

    /// Every call recorded in `bucket`, newest first
    pub fn recorded_calls(&self, bucket: &Path) -> Vec<CallArgs> {
        self.store
            .list_dir(bucket)
            .iter()
            .map(CallRecord::call_args)
            .collect()
    }

    /// Check that every recorded call appears in `log` at least once
    pub fn verify_calls(&self, bucket: &Path, log: &dyn CallLog) -> Result<(), ReplayError> {
        let observed = log.calls();
        match self
            .recorded_calls(bucket)
            .into_iter()
            .find(|expected| !observed.contains(expected))
        {
            Some(call) => Err(ReplayError::MissingCall { call }),
            None => Ok(()),
        }
    }

    /// Like [`verify_calls`](Self::verify_calls), panicking on a missing call
    #[track_caller]
    pub fn assert_calls(&self, bucket: &Path, log: &dyn CallLog) {
        if let Err(err) = self.verify_calls(bucket, log) {
            panic!("side effect assertion failed: {}", err);
        }
    }
}

/// Identity stored in side-effect records
fn bucket_identity(bucket: &Path) -> FunctionIdentity {
    let mut segments: Vec<&str> = bucket
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if let Some(pos) = segments.iter().rposition(|s| *s == SIDE_EFFECT_DIR) {
        segments.drain(..=pos);
    }
    let case = segments
        .pop()
        .and_then(decode_segment)
        .unwrap_or_else(|| "default".to_string());
    let module = segments
        .into_iter()
        .filter(|s| *s != QUALNAME_MARKER)
        .filter_map(decode_segment)
        .collect();
    FunctionIdentity::from_segments(module, vec![case])
}
