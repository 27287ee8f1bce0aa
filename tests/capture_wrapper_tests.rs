//! Integration tests for the capture wrapper
//!
//! Tests that touch the process-wide configuration run under `#[serial]`.

use serde::{Deserialize, Serialize};
use serial_test::serial;
use snapcall::{
    function_identity, ArgValue, CallArgs, Capture, CaptureConfig, CaptureLoader, CaptureMetrics,
    ConfigOverride, FunctionIdentity, Signature,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Credentials {
    user: String,
    api_key: String,
}

fn isolated(identity: FunctionIdentity, dir: &TempDir) -> Capture {
    Capture::new(identity)
        .config(CaptureConfig::default())
        .path(dir.path())
        .metrics(Arc::new(CaptureMetrics::new()))
}

#[test]
fn test_keyword_call_is_normalized_to_declaration_order() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("scale"), &dir)
        .with_signature(Signature::new().param("value").param_with_default("factor", 2))
        .overwrite(true);

    let out = capture.call(CallArgs::new().kwarg("factor", 3).kwarg("value", 7), || 21);
    assert_eq!(out, 21);

    let args = CaptureLoader::new(dir.path())
        .latest_args(capture.identity())
        .unwrap();
    let names: Vec<&str> = args.keys().collect();
    assert_eq!(names, vec!["value", "factor"]);
    assert_eq!(args.get_as::<i64>("factor"), Some(3));
}

#[test]
fn test_replay_reproduces_original_result() {
    fn f(a: i64, b: &str, c: i64) -> (i64, String, i64) {
        (a, b.to_string(), c)
    }

    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("f"), &dir)
        .with_signature(
            Signature::new()
                .param("a")
                .param_with_default("b", 2)
                .param_with_default("c", 3),
        );
    let original = capture.call(CallArgs::new().kwarg("a", 1).kwarg("b", "x"), || f(1, "x", 3));

    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    let replayed = f(
        record.arg("a").unwrap(),
        &record.arg::<String>("b").unwrap(),
        record.arg("c").unwrap(),
    );
    assert_eq!(replayed, original);
    assert_eq!(record.result_as::<(i64, String, i64)>(), Some(original));
}

#[test]
fn test_defaults_are_applied() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("scale_default"), &dir)
        .with_signature(Signature::new().param("value").param_with_default("factor", 2));

    capture.call(CallArgs::new().arg(5), || 10);
    let args = CaptureLoader::new(dir.path())
        .latest_args(capture.identity())
        .unwrap();
    assert_eq!(args.get_as::<i64>("factor"), Some(2));
}

#[test]
fn test_bad_call_still_captures_with_fallback_labels() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("pair"), &dir)
        .with_signature(Signature::positional(["a", "b"]));

    capture.call(CallArgs::new().arg(1).arg(2).arg(3), || ());
    let args = CaptureLoader::new(dir.path())
        .latest_args(capture.identity())
        .unwrap();
    let names: Vec<&str> = args.keys().collect();
    assert_eq!(names, vec!["a", "b", "*args[2]"]);
}

#[test]
fn test_sensitive_values_are_filtered() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("login"), &dir)
        .with_signature(Signature::positional(["creds", "password", "note"]));

    let creds = Credentials {
        user: "amy".into(),
        api_key: "k-123".into(),
    };
    capture.invoke(
        (creds.clone(), "hunter2", "my password is hunter2"),
        |_| true,
    );

    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    assert_eq!(record.arg::<String>("password").as_deref(), Some("<FILTERED:PASSWORD>"));
    assert_eq!(
        record.arg::<String>("note").as_deref(),
        Some("<FILTERED:SENSITIVE_STRING>")
    );
    match record.named_arguments.get("creds") {
        Some(ArgValue::Record { fields, .. }) => {
            assert_eq!(fields[0], ("user".to_string(), ArgValue::Str("amy".into())));
            assert_eq!(
                fields[1],
                ("api_key".to_string(), ArgValue::Str("<FILTERED:API_KEY>".into()))
            );
        }
        other => panic!("expected a record, got {:?}", other),
    }
}

#[test]
fn test_panicking_call_keeps_arguments() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("explode"), &dir)
        .with_signature(Signature::positional(["n"]));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        capture.call(CallArgs::new().arg(1), || -> i32 { panic!("boom") })
    }));
    assert!(outcome.is_err());

    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    assert_eq!(record.arg::<i64>("n"), Some(1));
    assert!(record.result.is_none());
}

#[tokio::test]
async fn test_cancelled_future_keeps_arguments() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("stall"), &dir)
        .with_signature(Signature::positional(["id"]));

    let outcome = tokio::time::timeout(
        Duration::from_millis(10),
        capture.call_async(CallArgs::new().arg(41), std::future::pending::<i64>()),
    )
    .await;
    assert!(outcome.is_err());

    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    assert_eq!(record.arg::<i64>("id"), Some(41));
    assert!(record.result.is_none());
}

#[test]
fn test_minimal_mode_records_type_names() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("shape"), &dir)
        .with_signature(Signature::positional(["items", "label", "token"]))
        .minimal(true);

    capture.invoke((vec![1, 2, 3], "x", "abc"), |_| 3.5);
    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    assert_eq!(record.arg::<String>("items").as_deref(), Some("list"));
    assert_eq!(record.arg::<String>("label").as_deref(), Some("str"));
    assert_eq!(record.arg::<String>("token").as_deref(), Some("<FILTERED:TOKEN>"));
    assert_eq!(record.result_as::<String>().as_deref(), Some("float"));
}

#[test]
fn test_unserializable_argument_is_recorded_opaque() {
    struct Handle;
    impl Serialize for Handle {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("not serializable"))
        }
    }

    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("open"), &dir)
        .with_signature(Signature::positional(["handle"]));
    capture.call(CallArgs::new().arg(Handle), || ());

    let args = CaptureLoader::new(dir.path())
        .latest_args(capture.identity())
        .unwrap();
    assert!(matches!(args.get("handle"), Some(ArgValue::Opaque { .. })));
}

#[test]
fn test_per_function_limit_throttles() {
    let dir = TempDir::new().unwrap();
    let metrics = Arc::new(CaptureMetrics::new());
    let config = CaptureConfig {
        max_captures_per_function: 2,
        ..CaptureConfig::default()
    };
    let capture = Capture::new(function_identity!("hot"))
        .config(config)
        .path(dir.path())
        .retention(100)
        .overwrite(true)
        .metrics(Arc::clone(&metrics));

    for n in 0..6 {
        capture.invoke((n,), |(n,)| n);
    }
    assert_eq!(metrics.snapshot().total_captures, 3);
    assert_eq!(CaptureLoader::new(dir.path()).count(capture.identity()), 3);
}

#[tokio::test]
async fn test_async_call_captures_after_await() {
    let dir = TempDir::new().unwrap();
    let capture = isolated(function_identity!("fetch"), &dir)
        .with_signature(Signature::positional(["id"]));

    let value = capture
        .call_async(CallArgs::new().arg(42), async { format!("item-{}", 42) })
        .await;
    assert_eq!(value, "item-42");

    let record = CaptureLoader::new(dir.path())
        .latest(capture.identity())
        .unwrap();
    assert_eq!(record.arg::<i64>("id"), Some(42));
    assert_eq!(record.result_as::<String>().as_deref(), Some("item-42"));
}

#[test]
#[serial]
fn test_global_override_disables_existing_wrapper() {
    let dir = TempDir::new().unwrap();
    let capture = Capture::new(function_identity!("toggled"))
        .path(dir.path())
        .metrics(Arc::new(CaptureMetrics::new()));

    {
        let _guard = ConfigOverride::modify(|c| c.enabled = false);
        capture.call(CallArgs::new().arg(1), || ());
        assert!(!CaptureLoader::new(dir.path()).has(capture.identity()));
    }

    let _guard = ConfigOverride::modify(|c| c.enabled = true);
    capture.call(CallArgs::new().arg(2), || ());
    assert!(CaptureLoader::new(dir.path()).has(capture.identity()));
}

#[test]
#[serial]
fn test_global_ignore_functions() {
    let dir = TempDir::new().unwrap();
    let _guard = ConfigOverride::modify(|c| {
        c.enabled = true;
        c.ignore_functions = vec!["debug_*".to_string()];
    });

    let ignored = Capture::new(FunctionIdentity::new("app", "debug_dump"))
        .path(dir.path())
        .metrics(Arc::new(CaptureMetrics::new()));
    let kept = Capture::new(FunctionIdentity::new("app", "dump"))
        .path(dir.path())
        .metrics(Arc::new(CaptureMetrics::new()));

    ignored.call(CallArgs::new(), || ());
    kept.call(CallArgs::new(), || ());

    let loader = CaptureLoader::new(dir.path());
    assert!(!loader.has(ignored.identity()));
    assert!(loader.has(kept.identity()));
}

#[test]
#[serial]
fn test_production_mode_implies_minimal() {
    let dir = TempDir::new().unwrap();
    let _guard = ConfigOverride::modify(|c| {
        c.enabled = true;
        c.production_mode = true;
    });
    let capture = Capture::new(function_identity!("prod"))
        .with_signature(Signature::positional(["n"]))
        .path(dir.path())
        .metrics(Arc::new(CaptureMetrics::new()));

    capture.call(CallArgs::new().arg(10), || 20);
    let args = CaptureLoader::new(dir.path())
        .latest_args(capture.identity())
        .unwrap();
    assert_eq!(args.get_as::<String>("n").as_deref(), Some("int"));
}
