//! Call capture wrapper
//!
//! A [`Capture`] wraps calls to one function. Arguments are snapshotted and
//! filtered before the call runs; the record (arguments plus result) is
//! saved after it returns. A call that panics, or a future dropped before
//! completion, still leaves an arguments-only record. Capture problems are
//! logged and counted, never returned to the caller.
//!
//! ```no_run
//! use snapcall::{function_identity, Capture, Signature};
//!
//! fn add(a: i64, b: i64) -> i64 {
//!     a + b
//! }
//!
//! let capture = Capture::new(function_identity!("add"))
//!     .with_signature(Signature::positional(["a", "b"]))
//!     .retention(3);
//! let sum = capture.invoke((2, 3), |(a, b)| add(a, b));
//! assert_eq!(sum, 5);
//! ```

use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{global_config, CaptureConfig};
use crate::filter::SensitivityFilter;
use crate::identity::FunctionIdentity;
use crate::metrics::CaptureMetrics;
use crate::signature::{normalize, Signature};
use crate::storage::{CaptureStore, Retention};
use crate::value::{ArgValue, CallArgs, NamedArgs};

/// Per-wrapper overrides; `None` falls back to the configuration
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub path: Option<PathBuf>,
    pub retention: Option<usize>,
    pub overwrite: Option<bool>,
    /// Extra sensitive argument patterns, added to the configured ones
    pub ignore_args: Vec<String>,
    pub enabled: Option<bool>,
    pub minimal: Option<bool>,
    /// Use this configuration instead of the global one
    pub config: Option<Arc<CaptureConfig>>,
    /// Skip recording the return value
    pub arguments_only: bool,
}

/// Conversion of a tuple of arguments into raw call arguments
pub trait IntoCallArgs {
    fn to_call_args(&self) -> CallArgs;
}

impl IntoCallArgs for CallArgs {
    fn to_call_args(&self) -> CallArgs {
        self.clone()
    }
}

impl IntoCallArgs for () {
    fn to_call_args(&self) -> CallArgs {
        CallArgs::new()
    }
}

macro_rules! impl_into_call_args {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Serialize),+> IntoCallArgs for ($($name,)+) {
            fn to_call_args(&self) -> CallArgs {
                CallArgs::new()$(.arg_value(ArgValue::capture(&self.$idx)))+
            }
        }
    };
}

impl_into_call_args!(A 0);
impl_into_call_args!(A 0, B 1);
impl_into_call_args!(A 0, B 1, C 2);
impl_into_call_args!(A 0, B 1, C 2, D 3);
impl_into_call_args!(A 0, B 1, C 2, D 3, E 4);
impl_into_call_args!(A 0, B 1, C 2, D 3, E 4, F 5);

/// Capture wrapper for one function
#[derive(Debug, Clone)]
pub struct Capture {
    identity: FunctionIdentity,
    signature: Option<Signature>,
    options: CaptureOptions,
    metrics: Option<Arc<CaptureMetrics>>,
}

/// Arguments snapshotted before the wrapped call
struct Pending {
    store: CaptureStore,
    named: NamedArgs,
    filter: SensitivityFilter,
    retention: Retention,
    overwrite: bool,
    capture_time: Duration,
}

/// Saves an arguments-only record if the wrapped call never completes
struct PendingGuard<'a> {
    capture: &'a Capture,
    pending: Option<Pending>,
}

impl PendingGuard<'_> {
    fn complete<R: Serialize>(mut self, result: &R) {
        if let Some(pending) = self.pending.take() {
            let result = self.capture.snapshot_result(&pending, result);
            self.capture.finish(pending, result);
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!(
                "Call to {} did not complete, saving arguments only",
                self.capture.identity
            );
            self.capture.finish(pending, None);
        }
    }
}

impl Capture {
    pub fn new(identity: FunctionIdentity) -> Self {
        Self {
            identity,
            signature: None,
            options: CaptureOptions::default(),
            metrics: None,
        }
    }

    /// Capture only the first call (`overwrite = false`, `retention = 1`)
    pub fn once(identity: FunctionIdentity) -> Self {
        Self::new(identity).overwrite(false).retention(1)
    }

    /// Record argument type names only
    pub fn minimal_only(identity: FunctionIdentity) -> Self {
        Self::new(identity).minimal(true)
    }

    /// A wrapper that never captures
    pub fn disabled(identity: FunctionIdentity) -> Self {
        Self::new(identity).enabled(false)
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.path = Some(path.into());
        self
    }

    pub fn retention(mut self, retention: usize) -> Self {
        self.options.retention = Some(retention);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.options.overwrite = Some(overwrite);
        self
    }

    pub fn ignore_args<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options
            .ignore_args
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options.enabled = Some(enabled);
        self
    }

    pub fn minimal(mut self, minimal: bool) -> Self {
        self.options.minimal = Some(minimal);
        self
    }

    pub fn config(mut self, config: CaptureConfig) -> Self {
        self.options.config = Some(Arc::new(config));
        self
    }

    pub fn arguments_only(mut self) -> Self {
        self.options.arguments_only = true;
        self
    }

    /// Report to these metrics instead of the process-wide instance
    pub fn metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &FunctionIdentity {
        &self.identity
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Configuration in effect for the next call
    pub fn effective_config(&self) -> Arc<CaptureConfig> {
        self.options.config.clone().unwrap_or_else(global_config)
    }

    /// Store the next call would write to
    pub fn store(&self) -> CaptureStore {
        let config = self.effective_config();
        CaptureStore::new(config.capture_path(self.options.path.as_deref()))
            .with_backend(config.backend())
    }

    fn metrics_handle(&self) -> Arc<CaptureMetrics> {
        self.metrics.clone().unwrap_or_else(CaptureMetrics::global)
    }

    /// Run `f`, capturing `args` and its result
    pub fn call<R, F>(&self, args: CallArgs, f: F) -> R
    where
        R: Serialize,
        F: FnOnce() -> R,
    {
        let guard = self.begin(&args);
        let result = f();
        guard.complete(&result);
        result
    }

    /// Await `future`, capturing `args` before and the result after
    pub async fn call_async<R, Fut>(&self, args: CallArgs, future: Fut) -> R
    where
        R: Serialize,
        Fut: Future<Output = R>,
    {
        let guard = self.begin(&args);
        let result = future.await;
        guard.complete(&result);
        result
    }

    /// Run `f` with a tuple of arguments, capturing them first
    pub fn invoke<A, R, F>(&self, args: A, f: F) -> R
    where
        A: IntoCallArgs,
        R: Serialize,
        F: FnOnce(A) -> R,
    {
        let guard = self.begin(&args.to_call_args());
        let result = f(args);
        guard.complete(&result);
        result
    }

    fn begin(&self, args: &CallArgs) -> PendingGuard<'_> {
        PendingGuard {
            capture: self,
            pending: self.prepare(args),
        }
    }

    /// Decide whether to capture and snapshot the arguments
    fn prepare(&self, args: &CallArgs) -> Option<Pending> {
        let started = Instant::now();
        let config = self.effective_config();

        if !self.options.enabled.unwrap_or(config.enabled) {
            return None;
        }
        let function = self.identity.function_name();
        let module = self.identity.module_name();
        if config.is_function_ignored(function, &module) {
            tracing::debug!("Capture of {} skipped by ignore list", self.identity);
            return None;
        }
        let key = self.identity.to_string();
        if self
            .metrics_handle()
            .should_throttle(&key, config.max_captures_per_function)
        {
            tracing::debug!("Capture of {} throttled", self.identity);
            return None;
        }

        let filter = if self.options.ignore_args.is_empty() {
            SensitivityFilter::new(&config)
        } else {
            let mut extended = (*config).clone();
            extended
                .ignore_args
                .extend(self.options.ignore_args.iter().cloned());
            SensitivityFilter::new(&extended)
        };
        let filter = match self.options.minimal {
            Some(minimal) => filter.with_minimal(minimal),
            None => filter,
        };

        let named = filter.filter_named(&normalize(self.signature.as_ref(), args));
        Some(Pending {
            store: CaptureStore::new(config.capture_path(self.options.path.as_deref()))
                .with_backend(config.backend()),
            named,
            filter,
            retention: Retention::keep(self.options.retention.unwrap_or(config.default_retention)),
            overwrite: self.options.overwrite.unwrap_or(config.default_overwrite),
            capture_time: started.elapsed(),
        })
    }

    fn snapshot_result<R: Serialize>(&self, pending: &Pending, result: &R) -> Option<ArgValue> {
        (!self.options.arguments_only).then(|| {
            let value = ArgValue::capture(result);
            if pending.filter.is_minimal() {
                ArgValue::Str(value.type_name().to_string())
            } else {
                pending.filter.filter_value(&value)
            }
        })
    }

    /// Persist a pending capture; every failure stops here
    fn finish(&self, pending: Pending, result: Option<ArgValue>) {
        let started = Instant::now();

        let metrics = self.metrics_handle();
        match pending.store.save(
            &self.identity,
            pending.named,
            result,
            pending.retention,
            pending.overwrite,
        ) {
            Ok(outcome) => {
                metrics.record_capture(
                    &self.identity.to_string(),
                    pending.capture_time + started.elapsed(),
                    outcome.bytes_written,
                );
            }
            Err(err) => {
                tracing::warn!("Argument capture failed for {}: {}", self.identity, err);
                metrics.record_failure();
            }
        }
    }
}
