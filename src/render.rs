//! Call-tree rendering for snapshot baselines
//!
//! Output for a two-level trace:
//!
//! ```text
//! Function: outer(x=5)
//!   ├─ Function: inner(y=10)
//!   │  └─ Returns: 11
//! └─ Returns: 12
//!
//! Final Result: 12
//! ```
//!
//! Rendering is a pure function of the event sequence: map keys are sorted
//! and compaction thresholds are fixed, so the text is stable across runs.

use serde::Serialize;
use std::fmt::Write as _;

use crate::tracer::{CallEvent, EventKind};
use crate::value::{ArgValue, NamedArgs};

/// Containers with more items than this are summarized
pub const DEFAULT_MAX_INLINE_ITEMS: usize = 3;

pub const NO_CALLS: &str = "No function calls traced";
pub const NO_TRACES: &str = "No traces captured";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRenderer {
    /// Emit `Returns:` lines for nested calls
    pub show_returns: bool,
    /// Emit the outermost `Returns:` line and the `Final Result:` footer
    pub include_result: bool,
    pub max_inline_items: usize,
}

impl Default for TraceRenderer {
    fn default() -> Self {
        Self {
            show_returns: true,
            include_result: true,
            max_inline_items: DEFAULT_MAX_INLINE_ITEMS,
        }
    }
}

impl TraceRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_result(mut self) -> Self {
        self.include_result = false;
        self
    }

    /// Render one session's events as an indented tree
    pub fn render(&self, events: &[CallEvent]) -> String {
        if events.is_empty() {
            return NO_CALLS.to_string();
        }

        let mut lines = Vec::new();
        let mut open = 0usize;
        let mut final_result: Option<&ArgValue> = None;

        for event in events {
            let indent = "  ".repeat(event.depth);
            match event.kind {
                EventKind::Call => {
                    let symbol = if event.depth == 0 { "Function:" } else { "├─ Function:" };
                    lines.push(format!(
                        "{}{} {}({})",
                        indent,
                        symbol,
                        event.function_name,
                        self.format_args(&event.arguments)
                    ));
                    open += 1;
                }
                EventKind::Return => {
                    // Returns without an open call are dropped
                    if open == 0 {
                        continue;
                    }
                    open -= 1;
                    let value = self.format_return(event.return_value.as_ref());
                    if event.depth == 0 {
                        final_result = event.return_value.as_ref();
                        if self.include_result && self.show_returns {
                            lines.push(format!("{}└─ Returns: {}", indent, value));
                        }
                    } else if self.show_returns {
                        lines.push(format!("{}│  └─ Returns: {}", indent, value));
                    }
                }
            }
        }

        let mut text = lines.join("\n");
        if self.include_result {
            if let Some(result) = final_result.filter(|v| !v.is_null()) {
                let _ = write!(text, "\n\nFinal Result: {}", self.format_value(result));
            }
        }
        text
    }

    /// Render several sessions as numbered sections
    pub fn render_all(&self, traces: &[Vec<CallEvent>]) -> String {
        if traces.is_empty() {
            return NO_TRACES.to_string();
        }
        traces
            .iter()
            .enumerate()
            .flat_map(|(i, trace)| [format!("=== Trace {} ===", i + 1), self.render(trace)])
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// `name=value` pairs in parameter order
    pub fn format_args(&self, args: &NamedArgs) -> String {
        args.iter()
            .map(|(name, value)| format!("{}={}", name, self.format_value(value)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn format_return(&self, value: Option<&ArgValue>) -> String {
        value.map_or_else(|| "None".to_string(), |v| self.format_value(v))
    }

    /// Compact form of a single value
    pub fn format_value(&self, value: &ArgValue) -> String {
        match value {
            ArgValue::Null => "None".to_string(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::UInt(u) => u.to_string(),
            ArgValue::Float(x) => format!("{:?}", x),
            ArgValue::Str(s) => format!("'{}'", s),
            ArgValue::Bytes(b) => format!("<{} bytes>", b.len()),
            ArgValue::List(items) => self.format_seq(items, "[", "]"),
            ArgValue::Tuple(items) if items.len() == 1 => self.format_seq(items, "(", ",)"),
            ArgValue::Tuple(items) => self.format_seq(items, "(", ")"),
            ArgValue::Set(items) => {
                let mut sorted: Vec<String> = items.iter().map(|v| self.format_value(v)).collect();
                sorted.sort();
                self.wrap(sorted, "{", "}")
            }
            ArgValue::Map(entries) => {
                let mut sorted: Vec<&(String, ArgValue)> = entries.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                let parts = sorted
                    .into_iter()
                    .map(|(k, v)| format!("'{}': {}", k, self.format_value(v)))
                    .collect();
                self.wrap(parts, "{", "}")
            }
            ArgValue::Record { type_name, .. }
            | ArgValue::Variant { type_name, .. }
            | ArgValue::Opaque { type_name } => format!("<{}>", type_name),
        }
    }

    fn format_seq(&self, items: &[ArgValue], open: &str, close: &str) -> String {
        let parts = items.iter().map(|v| self.format_value(v)).collect();
        self.wrap(parts, open, close)
    }

    fn wrap(&self, parts: Vec<String>, open: &str, close: &str) -> String {
        if parts.len() > self.max_inline_items {
            return format!("<{} items>", parts.len());
        }
        format!("{}{}{}", open, parts.join(", "), close)
    }
}

/// One call with its nested calls
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub function_name: String,
    pub depth: usize,
    pub arguments: NamedArgs,
    /// `None` when the call never reported a value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<ArgValue>,
    /// False when the trace ended before the call returned
    pub returned: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    fn open(event: &CallEvent) -> Self {
        Self {
            function_name: event.function_name.clone(),
            depth: event.depth,
            arguments: event.arguments.clone(),
            return_value: None,
            returned: false,
            children: Vec::new(),
        }
    }

    /// Number of calls in this subtree, this one included
    pub fn call_count(&self) -> usize {
        1 + self.children.iter().map(TraceNode::call_count).sum::<usize>()
    }
}

/// Rebuild the nested call structure from a flat event log.
///
/// Each return closes the innermost open call at its depth; calls still open
/// when the log ends are kept with `returned == false`.
pub fn build_tree(events: &[CallEvent]) -> Vec<TraceNode> {
    let mut roots = Vec::new();
    let mut stack: Vec<TraceNode> = Vec::new();

    fn close(node: TraceNode, stack: &mut [TraceNode], roots: &mut Vec<TraceNode>) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => roots.push(node),
        }
    }

    for event in events {
        match event.kind {
            EventKind::Call => stack.push(TraceNode::open(event)),
            EventKind::Return => {
                if !stack.iter().any(|n| n.depth == event.depth) {
                    continue;
                }
                while let Some(mut node) = stack.pop() {
                    let matched = node.depth == event.depth;
                    if matched {
                        node.return_value = event.return_value.clone();
                        node.returned = true;
                    }
                    close(node, &mut stack, &mut roots);
                    if matched {
                        break;
                    }
                }
            }
        }
    }
    while let Some(node) = stack.pop() {
        close(node, &mut stack, &mut roots);
    }
    roots
}
