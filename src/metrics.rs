//! Capture overhead tracking and throttling
//!
//! Every capture reports its duration and size here. When capturing gets
//! expensive or keeps failing, [`CaptureMetrics::should_throttle`] tells the
//! wrapper to stop capturing for the rest of the process.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Average capture time above which captures are throttled
pub const SLOW_CAPTURE_THRESHOLD: Duration = Duration::from_millis(100);

/// Failure count above which captures are throttled
pub const MAX_FAILED_CAPTURES: u64 = 10;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_captures: u64,
    pub failed_captures: u64,
    pub total_capture_time: Duration,
    pub peak_capture_time: Duration,
    pub total_bytes_written: u64,
    pub captures_per_function: HashMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn average_capture_time(&self) -> Duration {
        if self.total_captures == 0 {
            return Duration::ZERO;
        }
        let avg_nanos = self.total_capture_time.as_nanos() / u128::from(self.total_captures);
        Duration::from_nanos(u64::try_from(avg_nanos).unwrap_or(u64::MAX))
    }

    /// Percentage of attempts that succeeded
    pub fn success_rate(&self) -> f64 {
        let attempts = self.total_captures + self.failed_captures;
        if attempts == 0 {
            return 100.0;
        }
        self.total_captures as f64 / attempts as f64 * 100.0
    }
}

/// Thread-safe capture counters
#[derive(Debug)]
pub struct CaptureMetrics {
    inner: Mutex<MetricsSnapshot>,
    started: Mutex<Instant>,
}

impl Default for CaptureMetrics {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
            started: Mutex::new(Instant::now()),
        }
    }
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance used by captures without their own metrics
    pub fn global() -> Arc<CaptureMetrics> {
        static GLOBAL: OnceLock<Arc<CaptureMetrics>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(CaptureMetrics::new())))
    }

    /// Record a successful capture of `function`
    pub fn record_capture(&self, function: &str, elapsed: Duration, bytes_written: u64) {
        let mut m = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        m.total_captures += 1;
        m.total_capture_time += elapsed;
        m.peak_capture_time = m.peak_capture_time.max(elapsed);
        m.total_bytes_written += bytes_written;
        *m.captures_per_function
            .entry(function.to_string())
            .or_default() += 1;
    }

    pub fn record_failure(&self) {
        let mut m = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        m.failed_captures += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = MetricsSnapshot::default();
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Whether further captures of `function` should be skipped
    pub fn should_throttle(&self, function: &str, max_per_function: usize) -> bool {
        let m = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if m.failed_captures > MAX_FAILED_CAPTURES {
            return true;
        }
        if m.average_capture_time() > SLOW_CAPTURE_THRESHOLD {
            return true;
        }
        let count = m.captures_per_function.get(function).copied().unwrap_or(0);
        count > max_per_function as u64
    }

    /// Human-readable report
    pub fn report(&self) -> String {
        let m = self.snapshot();
        let uptime = self
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        let avg_bytes = m.total_bytes_written / m.total_captures.max(1);

        let mut out = String::new();
        let _ = writeln!(out, "Snap Capture Performance Report");
        let _ = writeln!(out, "{}", "=".repeat(31));
        let _ = writeln!(out, "Uptime: {:.2} seconds", uptime.as_secs_f64());
        let _ = writeln!(out, "Total Captures: {}", m.total_captures);
        let _ = writeln!(out, "Failed Captures: {}", m.failed_captures);
        let _ = writeln!(out, "Success Rate: {:.1}%", m.success_rate());
        let _ = writeln!(out);
        let _ = writeln!(out, "Timing Metrics:");
        let _ = writeln!(
            out,
            "  Average Capture Time: {:.2}ms",
            m.average_capture_time().as_secs_f64() * 1000.0
        );
        let _ = writeln!(
            out,
            "  Peak Capture Time: {:.2}ms",
            m.peak_capture_time.as_secs_f64() * 1000.0
        );
        let _ = writeln!(out, "  Total Capture Time: {:.2}s", m.total_capture_time.as_secs_f64());
        let _ = writeln!(out);
        let _ = writeln!(out, "Data Metrics:");
        let _ = writeln!(out, "  Total Bytes Written: {} bytes", m.total_bytes_written);
        let _ = writeln!(out, "  Average Bytes per Capture: {} bytes", avg_bytes);
        let _ = writeln!(out);
        let _ = writeln!(out, "Top Functions by Capture Count:");
        for (function, count) in top_functions(&m, 10) {
            let _ = writeln!(out, "  {}: {} captures", function, count);
        }
        out
    }

    /// Print per-function capture counts to stderr
    pub fn print_summary(&self) {
        let m = self.snapshot();
        if m.captures_per_function.is_empty() {
            eprintln!("\nNo captures recorded.");
            return;
        }

        eprintln!("\n╔════════════════════════════════════════════════════════════════════════════════╗");
        eprintln!("║  Capture Summary (sorted by capture count)                                    ║");
        eprintln!("╚════════════════════════════════════════════════════════════════════════════════╝");
        eprintln!();
        eprintln!("{:<60} {:>10}", "Function", "Captures");
        eprintln!("{}", "─".repeat(71));
        for (function, count) in top_functions(&m, usize::MAX) {
            eprintln!("{:<60} {:>10}", function, count);
        }
        eprintln!("{}", "─".repeat(71));
        eprintln!(
            "{} captures, {} failed, avg {:.3}ms, peak {:.3}ms",
            m.total_captures,
            m.failed_captures,
            m.average_capture_time().as_secs_f64() * 1000.0,
            m.peak_capture_time.as_secs_f64() * 1000.0
        );
    }
}

/// Functions by capture count, descending, ties by name
fn top_functions(m: &MetricsSnapshot, limit: usize) -> Vec<(&str, u64)> {
    let mut sorted: Vec<(&str, u64)> = m
        .captures_per_function
        .iter()
        .map(|(name, count)| (name.as_str(), *count))
        .collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    sorted.truncate(limit);
    sorted
}
