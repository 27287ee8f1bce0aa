//! Snapcall - capture function arguments for replay and trace call trees for snapshots
//!
//! Two independent pipelines:
//!
//! - **Capture/replay**: [`Capture`] snapshots the arguments (and result) of
//!   a wrapped call, filters sensitive data, and stores a bounded number of
//!   records per function. [`CaptureLoader`] reads them back in tests, and
//!   [`SideEffectBridge`] lets test doubles replay recorded real outputs.
//! - **Tracing**: instrumented functions ([`traced!`]) report to a
//!   [`FunctionTracer`]; [`TraceRenderer`] turns the event log into a
//!   deterministic call tree for snapshot tests.
//!
//! ```
//! use snapcall::{function_identity, Capture, CallArgs, CaptureLoader, Signature};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let capture = Capture::new(function_identity!("add"))
//!     .with_signature(Signature::positional(["a", "b"]))
//!     .path(dir.path())
//!     .retention(3)
//!     .overwrite(true);
//!
//! let sum = capture.call(CallArgs::new().arg(2).arg(3), || 2 + 3);
//! assert_eq!(sum, 5);
//!
//! let loader = CaptureLoader::new(dir.path());
//! let args = loader.latest_args(capture.identity()).unwrap();
//! assert_eq!(args.get_as::<i64>("b"), Some(3));
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod loader;
pub mod metrics;
pub mod render;
pub mod replay;
pub mod signature;
pub mod snapshot;
pub mod storage;
pub mod tracer;
pub mod value;

pub use capture::{Capture, CaptureOptions, IntoCallArgs};
pub use config::{global_config, set_global_config, CaptureConfig, ConfigOverride};
pub use error::{CaptureError, ReplayError, Result};
pub use filter::SensitivityFilter;
pub use identity::FunctionIdentity;
pub use loader::CaptureLoader;
pub use metrics::{CaptureMetrics, MetricsSnapshot};
pub use render::{build_tree, TraceNode, TraceRenderer};
pub use replay::{CallLog, Lookup, RecordedCalls, ReplayMode, SideEffectBridge};
pub use signature::{normalize, Signature};
pub use snapshot::{trace_call, TraceSession, TracedSnapshot};
pub use storage::{Backend, CallRecord, CaptureStore, Retention, StorageStats};
pub use tracer::{CallEvent, EventKind, FrameFilter, FunctionTracer};
pub use value::{ArgValue, CallArgs, NamedArgs};
