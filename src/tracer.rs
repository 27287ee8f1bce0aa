//! Call tracing for snapshot tests
//!
//! Instrumented functions report their calls and returns through a
//! thread-local hook. [`FunctionTracer`] is a hook that turns those reports
//! into a flat event log annotated with call depth.
//!
//! ```
//! use snapcall::traced;
//! use snapcall::tracer::{EventKind, FunctionTracer};
//!
//! fn factorial(n: u64) -> u64 {
//!     traced!(factorial(n) => {
//!         if n <= 1 { 1 } else { n * factorial(n - 1) }
//!     })
//! }
//!
//! let tracer = FunctionTracer::new();
//! assert_eq!(tracer.trace(|| factorial(4)), 24);
//! let depths: Vec<usize> = tracer
//!     .get_trace()
//!     .iter()
//!     .filter(|e| e.kind == EventKind::Call)
//!     .map(|e| e.depth)
//!     .collect();
//! assert_eq!(depths, vec![0, 1, 2, 3]);
//! ```
//!
//! # Hook lifecycle
//!
//! Only one hook is active per thread. `start()` installs the tracer and
//! remembers the previous hook; `stop()` puts the previous hook back, so
//! tracers nest like scopes. Code running on other threads is not observed.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use crate::render::TraceRenderer;
use crate::value::{ArgValue, NamedArgs};

/// Static description of an instrumented function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: Cow<'static, str>,
    pub module: Cow<'static, str>,
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl FrameInfo {
    pub const fn new(function: &'static str, module: &'static str, file: &'static str, line: u32) -> Self {
        Self {
            function: Cow::Borrowed(function),
            module: Cow::Borrowed(module),
            file: Cow::Borrowed(file),
            line,
        }
    }

    /// Frame with runtime-built names
    pub fn dynamic(function: impl Into<String>, module: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: Cow::Owned(function.into()),
            module: Cow::Owned(module.into()),
            file: Cow::Owned(file.into()),
            line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Call,
    Return,
}

/// One observed call or return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub kind: EventKind,
    pub function_name: String,
    pub module: String,
    pub file: String,
    pub line: u32,
    /// 0 for the outermost traced call
    pub depth: usize,
    /// Microseconds since the session started
    pub timestamp_us: u64,
    /// Parameters at entry (call events only)
    #[serde(default, skip_serializing_if = "NamedArgs::is_empty")]
    pub arguments: NamedArgs,
    /// Returned value (return events only); `None` when the call unwound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<ArgValue>,
}

impl CallEvent {
    pub fn call(function_name: impl Into<String>, depth: usize, arguments: NamedArgs) -> Self {
        Self {
            kind: EventKind::Call,
            function_name: function_name.into(),
            module: String::new(),
            file: String::new(),
            line: 0,
            depth,
            timestamp_us: 0,
            arguments,
            return_value: None,
        }
    }

    pub fn ret(function_name: impl Into<String>, depth: usize, value: Option<ArgValue>) -> Self {
        Self {
            kind: EventKind::Return,
            return_value: value,
            ..Self::call(function_name, depth, NamedArgs::new())
        }
    }

    pub fn is_call(&self) -> bool {
        self.kind == EventKind::Call
    }
}

/// Receiver of call and return reports
pub trait TraceHook {
    /// A call began. Returning a token asks for the matching return.
    fn on_call(&self, frame: &FrameInfo, arguments: &dyn Fn() -> NamedArgs) -> Option<u64>;

    /// The call identified by `token` ended
    fn on_return(&self, token: u64, frame: &FrameInfo, value: Option<ArgValue>);
}

thread_local! {
    static ACTIVE_HOOK: RefCell<Option<Rc<dyn TraceHook>>> = RefCell::new(None);
}

/// Install `hook` for this thread, returning the previous one
pub fn set_hook(hook: Option<Rc<dyn TraceHook>>) -> Option<Rc<dyn TraceHook>> {
    ACTIVE_HOOK.with(|slot| slot.replace(hook))
}

pub fn current_hook() -> Option<Rc<dyn TraceHook>> {
    ACTIVE_HOOK.with(|slot| slot.borrow().clone())
}

/// Report a call to the active hook.
///
/// `arguments` is only evaluated when a hook wants the call.
pub fn enter(frame: FrameInfo, arguments: impl Fn() -> NamedArgs) -> CallScope {
    let hook = current_hook();
    let token = hook.as_ref().and_then(|h| h.on_call(&frame, &arguments));
    CallScope {
        hook: token.and(hook),
        token,
        frame,
    }
}

/// An open call. Dropping it without [`exit`](Self::exit) reports a return
/// with no value, which covers early returns and unwinding.
#[must_use = "dropping the scope reports the return immediately"]
pub struct CallScope {
    hook: Option<Rc<dyn TraceHook>>,
    token: Option<u64>,
    frame: FrameInfo,
}

impl CallScope {
    /// Report the return value and close the call
    pub fn exit<T: Serialize + ?Sized>(mut self, value: &T) {
        if let (Some(hook), Some(token)) = (self.hook.take(), self.token) {
            hook.on_return(token, &self.frame, Some(ArgValue::capture(value)));
        }
    }

    /// Report `value` and hand it back
    pub fn finish<T: Serialize>(self, value: T) -> T {
        self.exit(&value);
        value
    }

    pub fn is_observed(&self) -> bool {
        self.token.is_some()
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if let (Some(hook), Some(token)) = (self.hook.take(), self.token) {
            hook.on_return(token, &self.frame, None);
        }
    }
}

/// Instrument a function body.
///
/// `traced!(name(arg1, arg2) => { body })` reports a call to `name` with
/// the listed parameters, runs the body, and reports its value. `return`
/// inside the body leaves the body only.
#[macro_export]
macro_rules! traced {
    ($name:ident ( $($arg:ident),* $(,)? ) => $body:block) => {{
        let __snapcall_scope = $crate::tracer::enter(
            $crate::tracer::FrameInfo::new(stringify!($name), module_path!(), file!(), line!()),
            || {
                #[allow(unused_mut)]
                let mut __snapcall_args = $crate::value::NamedArgs::new();
                $(
                    __snapcall_args.insert(stringify!($arg), $crate::value::ArgValue::capture(&$arg));
                )*
                __snapcall_args
            },
        );
        #[allow(clippy::redundant_closure_call)]
        let __snapcall_result = (|| $body)();
        __snapcall_scope.finish(__snapcall_result)
    }};
}

const TRAIT_PLUMBING: &[&str] = &[
    "fmt",
    "drop",
    "clone",
    "eq",
    "ne",
    "hash",
    "partial_cmp",
    "cmp",
    "deref",
    "deref_mut",
];

const LIBRARY_PATH_MARKERS: &[&str] = &[
    "/.cargo/registry/",
    "/.cargo/git/",
    "/.rustup/",
    "/rustc/",
    "site-packages",
];

/// Decides which frames are worth recording
#[derive(Debug, Clone, Default)]
pub struct FrameFilter {
    /// When non-empty, only frames whose module or file contains one of
    /// these fragments are traced
    modules: Vec<String>,
}

impl FrameFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
        }
    }

    pub fn should_trace(&self, frame: &FrameInfo) -> bool {
        let name = frame.function.as_ref();
        if name.len() > 4 && name.starts_with("__") && name.ends_with("__") {
            return false;
        }
        if TRAIT_PLUMBING.contains(&name) {
            return false;
        }
        let file = frame.file.as_ref();
        if (file.contains('<') && file.contains('>'))
            || LIBRARY_PATH_MARKERS.iter().any(|m| file.contains(m))
        {
            return false;
        }
        if self.modules.is_empty() {
            return true;
        }
        self.modules
            .iter()
            .any(|m| frame.module.contains(m.as_str()) || file.contains(m.as_str()))
    }
}

struct TracerState {
    filter: FrameFilter,
    events: RefCell<Vec<CallEvent>>,
    /// Tokens of the open calls, outermost first
    stack: RefCell<Vec<u64>>,
    next_token: Cell<u64>,
    active: Cell<bool>,
    previous: RefCell<Option<Rc<dyn TraceHook>>>,
    started: Cell<Option<Instant>>,
}

impl TracerState {
    fn elapsed_us(&self) -> u64 {
        self.started
            .get()
            .map_or(0, |t| u64::try_from(t.elapsed().as_micros()).unwrap_or(u64::MAX))
    }
}

impl TraceHook for TracerState {
    fn on_call(&self, frame: &FrameInfo, arguments: &dyn Fn() -> NamedArgs) -> Option<u64> {
        if !self.active.get() || !self.filter.should_trace(frame) {
            return None;
        }
        // Evaluated before borrowing: capturing may run instrumented code
        let arguments = arguments();
        let token = self.next_token.get();
        self.next_token.set(token + 1);

        let mut stack = self.stack.borrow_mut();
        self.events.borrow_mut().push(CallEvent {
            kind: EventKind::Call,
            function_name: frame.function.to_string(),
            module: frame.module.to_string(),
            file: frame.file.to_string(),
            line: frame.line,
            depth: stack.len(),
            timestamp_us: self.elapsed_us(),
            arguments,
            return_value: None,
        });
        stack.push(token);
        Some(token)
    }

    fn on_return(&self, token: u64, frame: &FrameInfo, value: Option<ArgValue>) {
        if !self.active.get() {
            return;
        }
        let mut stack = self.stack.borrow_mut();
        // Unknown tokens belong to calls opened before a clear()
        let Some(depth) = stack.iter().rposition(|t| *t == token) else {
            return;
        };
        stack.truncate(depth);
        self.events.borrow_mut().push(CallEvent {
            kind: EventKind::Return,
            function_name: frame.function.to_string(),
            module: frame.module.to_string(),
            file: frame.file.to_string(),
            line: frame.line,
            depth,
            timestamp_us: self.elapsed_us(),
            arguments: NamedArgs::new(),
            return_value: value,
        });
    }
}

/// Records calls on the current thread while started.
///
/// Clones share one recording. Dropping the last clone of a started tracer
/// stops it, so the thread hook never outlives its owners.
#[derive(Clone)]
pub struct FunctionTracer {
    state: Rc<TracerState>,
    /// Counts user handles; the installed hook holds `state` only
    handles: Rc<()>,
}

impl Drop for FunctionTracer {
    fn drop(&mut self) {
        if Rc::strong_count(&self.handles) == 1 {
            self.stop();
        }
    }
}

impl Default for FunctionTracer {
    fn default() -> Self {
        Self::with_filter(FrameFilter::all())
    }
}

impl std::fmt::Debug for FunctionTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTracer")
            .field("filter", &self.state.filter)
            .field("tracing", &self.is_tracing())
            .field("events", &self.state.events.borrow().len())
            .finish()
    }
}

impl FunctionTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: FrameFilter) -> Self {
        Self {
            state: Rc::new(TracerState {
                filter,
                events: RefCell::new(Vec::new()),
                stack: RefCell::new(Vec::new()),
                next_token: Cell::new(0),
                active: Cell::new(false),
                previous: RefCell::new(None),
                started: Cell::new(None),
            }),
            handles: Rc::new(()),
        }
    }

    /// Trace only frames from these module or file fragments
    pub fn for_modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_filter(FrameFilter::modules(modules))
    }

    /// Install as this thread's hook and clear previous events.
    ///
    /// Starting an already started tracer does nothing.
    pub fn start(&self) {
        if self.state.active.get() {
            return;
        }
        self.clear();
        self.state.started.set(Some(Instant::now()));
        self.state.active.set(true);
        let hook: Rc<dyn TraceHook> = self.state.clone();
        let previous = set_hook(Some(hook));
        *self.state.previous.borrow_mut() = previous;
    }

    /// Stop recording and restore the hook that was active before `start`
    pub fn stop(&self) {
        if !self.state.active.get() {
            return;
        }
        self.state.active.set(false);
        let previous = self.state.previous.borrow_mut().take();
        if self.is_current_hook() {
            set_hook(previous);
        } else {
            tracing::debug!("Tracer stopped while another hook is installed; leaving it in place");
        }
    }

    fn is_current_hook(&self) -> bool {
        current_hook().is_some_and(|hook| {
            Rc::as_ptr(&hook).cast::<()>() == Rc::as_ptr(&self.state).cast::<()>()
        })
    }

    pub fn is_tracing(&self) -> bool {
        self.state.active.get()
    }

    /// Start now and stop when the guard drops
    pub fn session(&self) -> TracingGuard<'_> {
        self.start();
        TracingGuard { tracer: self }
    }

    /// Run `f` under a fresh session
    pub fn trace<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.session();
        f()
    }

    /// Copy of the recorded events
    pub fn get_trace(&self) -> Vec<CallEvent> {
        self.state.events.borrow().clone()
    }

    /// Drop recorded events without stopping
    pub fn clear(&self) {
        self.state.events.borrow_mut().clear();
        self.state.stack.borrow_mut().clear();
    }

    /// Render the recorded events as an indented call tree
    pub fn format_trace(&self, show_returns: bool) -> String {
        TraceRenderer {
            show_returns,
            include_result: show_returns,
            ..TraceRenderer::default()
        }
        .render(&self.get_trace())
    }
}

/// Stops its tracer when dropped
#[must_use = "tracing stops when the guard is dropped"]
pub struct TracingGuard<'a> {
    tracer: &'a FunctionTracer,
}

impl TracingGuard<'_> {
    pub fn tracer(&self) -> &FunctionTracer {
        self.tracer
    }
}

impl Drop for TracingGuard<'_> {
    fn drop(&mut self) {
        self.tracer.stop();
    }
}
