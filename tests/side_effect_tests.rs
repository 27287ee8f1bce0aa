//! Integration tests for side-effect replay
//!
//! A test double for `Ops` routes every call through the bridge: the first
//! run records real results, later runs replay them without touching the
//! real implementation.

use snapcall::replay::{CallLog, RecordedCalls, ReplayMode, SideEffectBridge};
use snapcall::{function_identity, CallArgs, ReplayError};
use std::cell::Cell;
use std::path::PathBuf;
use tempfile::TempDir;

trait Ops {
    fn plus(&self, a: i64, b: i64) -> i64;
    fn greet(&self, name: &str, excited: bool) -> String;
}

struct CountingOps {
    calls: Cell<usize>,
}

impl CountingOps {
    fn new() -> Self {
        Self { calls: Cell::new(0) }
    }
}

impl Ops for CountingOps {
    fn plus(&self, a: i64, b: i64) -> i64 {
        self.calls.set(self.calls.get() + 1);
        a + b
    }

    fn greet(&self, name: &str, excited: bool) -> String {
        self.calls.set(self.calls.get() + 1);
        if excited {
            format!("Hello, {}!", name)
        } else {
            format!("Hello, {}", name)
        }
    }
}

struct ReplayOps<'a> {
    bridge: &'a SideEffectBridge,
    real: &'a CountingOps,
    plus_bucket: PathBuf,
    greet_bucket: PathBuf,
    log: RecordedCalls,
}

impl<'a> ReplayOps<'a> {
    fn new(bridge: &'a SideEffectBridge, real: &'a CountingOps, case: &str) -> Self {
        let test = function_identity!("test_ops");
        Self {
            bridge,
            real,
            plus_bucket: bridge.bucket_location(&test, case, "Ops::plus"),
            greet_bucket: bridge.bucket_location(&test, case, "Ops::greet"),
            log: RecordedCalls::new(),
        }
    }
}

impl Ops for ReplayOps<'_> {
    fn plus(&self, a: i64, b: i64) -> i64 {
        let args = CallArgs::new().arg(a).arg(b);
        self.log.record(args.clone());
        self.bridge
            .replay_or_call(&self.plus_bucket, args, || self.real.plus(a, b))
            .unwrap()
    }

    fn greet(&self, name: &str, excited: bool) -> String {
        let args = CallArgs::new().arg(name).kwarg("excited", excited);
        self.log.record(args.clone());
        self.bridge
            .replay_or_call(&self.greet_bucket, args, || self.real.greet(name, excited))
            .unwrap()
    }
}

#[test]
fn test_second_run_replays_without_real_calls() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());

    let real = CountingOps::new();
    let first = ReplayOps::new(&bridge, &real, "basic");
    assert_eq!(first.plus(1, 2), 3);
    assert_eq!(first.greet("amy", true), "Hello, amy!");
    assert_eq!(real.calls.get(), 2);

    let real_again = CountingOps::new();
    let second = ReplayOps::new(&bridge, &real_again, "basic");
    assert_eq!(second.plus(1, 2), 3);
    assert_eq!(second.greet("amy", true), "Hello, amy!");
    assert_eq!(real_again.calls.get(), 0);

    bridge.assert_calls(&second.plus_bucket, &second.log);
}

#[test]
fn test_different_arguments_are_recorded_separately() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    let ops = ReplayOps::new(&bridge, &real, "many");

    assert_eq!(ops.plus(1, 2), 3);
    assert_eq!(ops.plus(2, 2), 4);
    assert_eq!(ops.plus(1, 2), 3);
    assert_eq!(real.calls.get(), 2);
    assert_eq!(bridge.recorded_calls(&ops.plus_bucket).len(), 2);
}

#[test]
fn test_keyword_arguments_match_exactly() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    let ops = ReplayOps::new(&bridge, &real, "kw");

    assert_eq!(ops.greet("bo", false), "Hello, bo");
    assert_eq!(ops.greet("bo", true), "Hello, bo!");
    assert_eq!(real.calls.get(), 2);

    let recorded = bridge.recorded_calls(&ops.greet_bucket);
    assert!(recorded.contains(&CallArgs::new().arg("bo").kwarg("excited", true)));
}

#[test]
fn test_cases_are_isolated() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();

    ReplayOps::new(&bridge, &real, "case_a").plus(5, 5);
    ReplayOps::new(&bridge, &real, "case_b").plus(5, 5);
    assert_eq!(real.calls.get(), 2);
}

#[test]
fn test_strict_mode_rejects_unrecorded_call() {
    let dir = TempDir::new().unwrap();
    let recorder = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    ReplayOps::new(&recorder, &real, "strict").plus(1, 1);

    let strict = SideEffectBridge::new(dir.path()).with_mode(ReplayMode::Strict);
    let bucket = strict.bucket_location(&function_identity!("test_ops"), "strict", "Ops::plus");

    let hit: i64 = strict
        .replay_or_call(&bucket, CallArgs::new().arg(1).arg(1), || unreachable!())
        .unwrap();
    assert_eq!(hit, 2);

    let err = strict
        .replay_or_call(&bucket, CallArgs::new().arg(9).arg(9), || 18)
        .unwrap_err();
    assert!(matches!(err, ReplayError::Lookup { .. }));
}

#[test]
fn test_verify_reports_missing_call() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    let recorded = ReplayOps::new(&bridge, &real, "verify");
    recorded.plus(3, 4);
    recorded.plus(5, 6);

    let partial = RecordedCalls::new();
    partial.record(CallArgs::new().arg(3).arg(4));
    let err = bridge.verify_calls(&recorded.plus_bucket, &partial).unwrap_err();
    assert!(matches!(err, ReplayError::MissingCall { .. }));

    partial.record(CallArgs::new().arg(5).arg(6));
    assert!(bridge.verify_calls(&recorded.plus_bucket, &partial).is_ok());
    assert!(partial.was_called_with(&CallArgs::new().arg(5).arg(6)));
}

#[test]
#[should_panic(expected = "side effect assertion failed")]
fn test_assert_calls_panics_on_missing_call() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    let recorded = ReplayOps::new(&bridge, &real, "assert");
    recorded.plus(1, 1);

    bridge.assert_calls(&recorded.plus_bucket, &RecordedCalls::new());
}

#[test]
fn test_side_effect_records_are_not_listed_as_functions() {
    let dir = TempDir::new().unwrap();
    let bridge = SideEffectBridge::new(dir.path());
    let real = CountingOps::new();
    ReplayOps::new(&bridge, &real, "hidden").plus(1, 2);

    assert!(bridge.store().list_identities().is_empty());
}
