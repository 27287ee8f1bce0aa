//! Snapshot helpers built on the tracer and renderer

use serde::Serialize;

use crate::render::{build_tree, TraceNode, TraceRenderer, NO_TRACES};
use crate::tracer::{CallEvent, FrameFilter, FunctionTracer};

/// Collects one trace per executed closure for snapshot comparison
#[derive(Debug, Default)]
pub struct TracedSnapshot {
    tracer: FunctionTracer,
    traces: Vec<Vec<CallEvent>>,
    renderer: TraceRenderer,
}

impl TracedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracer(tracer: FunctionTracer) -> Self {
        Self {
            tracer,
            ..Self::default()
        }
    }

    /// Only trace frames from these module or file fragments
    pub fn for_modules<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_tracer(FunctionTracer::for_modules(modules))
    }

    pub fn with_renderer(mut self, renderer: TraceRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Run `f` under the tracer and keep its trace
    pub fn capture_trace<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let result = self.tracer.trace(f);
        self.traces.push(self.tracer.get_trace());
        result
    }

    /// Latest trace as snapshot text
    pub fn format_trace_snapshot(&self, include_result: bool) -> String {
        match self.traces.last() {
            Some(trace) => self.renderer_for(include_result).render(trace),
            None => NO_TRACES.to_string(),
        }
    }

    /// Every kept trace as numbered sections
    pub fn format_all_traces(&self, include_results: bool) -> String {
        self.renderer_for(include_results).render_all(&self.traces)
    }

    fn renderer_for(&self, include_result: bool) -> TraceRenderer {
        TraceRenderer {
            include_result,
            ..self.renderer
        }
    }

    /// Events of the latest trace
    pub fn get_trace(&self) -> Vec<CallEvent> {
        self.traces.last().cloned().unwrap_or_default()
    }

    /// Latest trace as a call tree
    pub fn tree(&self) -> Vec<TraceNode> {
        self.traces.last().map(|t| build_tree(t)).unwrap_or_default()
    }

    pub fn traces(&self) -> &[Vec<CallEvent>] {
        &self.traces
    }

    pub fn clear(&mut self) {
        self.traces.clear();
        self.tracer.clear();
    }
}

/// A trace kept by a [`TraceSession`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionTrace {
    pub label: String,
    pub context_name: String,
    pub events: Vec<CallEvent>,
    pub formatted: String,
}

/// Labelled traces of several related executions
#[derive(Debug)]
pub struct TraceSession {
    name: String,
    traces: Vec<SessionTrace>,
    current: Option<(String, FunctionTracer)>,
}

impl Default for TraceSession {
    fn default() -> Self {
        Self::new("TraceSession")
    }
}

impl TraceSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            traces: Vec::new(),
            current: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the tracer for the next context.
    ///
    /// The returned handle shares state with the session, so whatever it
    /// records is what [`save_current_trace`](Self::save_current_trace) keeps.
    pub fn start_context(&mut self, context_name: impl Into<String>, filter: FrameFilter) -> FunctionTracer {
        let tracer = FunctionTracer::with_filter(filter);
        self.current = Some((context_name.into(), tracer.clone()));
        tracer
    }

    /// Keep the current context's trace. Does nothing without a context.
    pub fn save_current_trace(&mut self, label: Option<&str>) {
        let Some((context_name, tracer)) = &self.current else {
            return;
        };
        let label = label.map_or_else(|| format!("trace_{}", self.traces.len()), str::to_string);
        self.traces.push(SessionTrace {
            label,
            context_name: context_name.clone(),
            events: tracer.get_trace(),
            formatted: tracer.format_trace(true),
        });
    }

    pub fn traces(&self) -> &[SessionTrace] {
        &self.traces
    }

    pub fn summary(&self) -> String {
        if self.traces.is_empty() {
            return format!("Session '{}': No traces collected", self.name);
        }
        let mut lines = vec![
            format!("=== Trace Session: {} ===", self.name),
            format!("Total traces: {}", self.traces.len()),
            String::new(),
        ];
        for (i, trace) in self.traces.iter().enumerate() {
            lines.push(format!("--- Trace {}: {} ---", i + 1, trace.label));
            lines.push(format!("Context: {}", trace.context_name));
            lines.push(trace.formatted.clone());
            lines.push(String::new());
        }
        lines.join("\n")
    }

    pub fn clear(&mut self) {
        self.traces.clear();
        self.current = None;
    }
}

/// Trace a single closure, returning its value and the rendered tree
pub fn trace_call<R>(f: impl FnOnce() -> R) -> (R, String) {
    let tracer = FunctionTracer::new();
    let result = tracer.trace(f);
    (result, tracer.format_trace(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::{enter, FrameInfo};
    use crate::value::NamedArgs;

    fn leaf() -> i32 {
        enter(FrameInfo::new("leaf", "snap", "src/snap.rs", 1), NamedArgs::new).finish(7)
    }

    #[test]
    fn test_no_traces() {
        let snap = TracedSnapshot::new();
        assert_eq!(snap.format_trace_snapshot(true), NO_TRACES);
        assert_eq!(snap.format_all_traces(true), NO_TRACES);
        assert!(snap.get_trace().is_empty());
    }

    #[test]
    fn test_capture_keeps_each_trace() {
        let mut snap = TracedSnapshot::new();
        assert_eq!(snap.capture_trace(leaf), 7);
        snap.capture_trace(leaf);
        assert_eq!(snap.traces().len(), 2);
        assert_eq!(
            snap.format_trace_snapshot(true),
            "Function: leaf()\n└─ Returns: 7\n\nFinal Result: 7"
        );
        snap.clear();
        assert!(snap.traces().is_empty());
    }

    #[test]
    fn test_session_summary() {
        let mut session = TraceSession::new("flow");
        assert_eq!(session.summary(), "Session 'flow': No traces collected");

        let tracer = session.start_context("step", FrameFilter::all());
        tracer.trace(leaf);
        session.save_current_trace(None);

        let summary = session.summary();
        assert!(summary.starts_with("=== Trace Session: flow ===\nTotal traces: 1\n\n"));
        assert!(summary.contains("--- Trace 1: trace_0 ---\nContext: step\nFunction: leaf()"));
    }

    #[test]
    fn test_trace_call() {
        let (value, text) = trace_call(leaf);
        assert_eq!(value, 7);
        assert!(text.starts_with("Function: leaf()"));
    }
}
