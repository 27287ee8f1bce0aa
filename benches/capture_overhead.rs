//! Capture and tracing overhead benchmark
//!
//! Measures the per-call cost added by the capture wrapper and the tracer:
//!
//! 1. Sensitivity filtering of a nested argument mapping
//! 2. Argument normalization against a signature
//! 3. A full save (encode, atomic write, prune)
//! 4. A traced call with and without an active tracer
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench capture_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use snapcall::signature::normalize;
use snapcall::{
    traced, ArgValue, Backend, CallArgs, CaptureConfig, CaptureStore, FunctionIdentity,
    FunctionTracer, NamedArgs, Retention, SensitivityFilter, Signature,
};

fn sample_args() -> NamedArgs {
    [
        ("user", ArgValue::Str("amy".into())),
        (
            "payload",
            ArgValue::map([
                ("api_key", ArgValue::Str("abcdef123456".into())),
                ("items", ArgValue::List((0..16).map(ArgValue::from).collect())),
                ("note", ArgValue::Str("remember the session cookie".into())),
            ]),
        ),
        ("password", ArgValue::Str("hunter2".into())),
    ]
    .into_iter()
    .collect()
}

fn bench_filter(c: &mut Criterion) {
    let filter = SensitivityFilter::new(&CaptureConfig::default());
    let args = sample_args();
    c.bench_function("filter_named", |b| {
        b.iter(|| filter.filter_named(black_box(&args)))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let signature = Signature::new()
        .param("a")
        .param("b")
        .param_with_default("scale", 1)
        .var_kwargs("options");
    let call = CallArgs::new().arg(1).arg(2).kwarg("verbose", true);
    c.bench_function("normalize", |b| {
        b.iter(|| normalize(black_box(Some(&signature)), black_box(&call)))
    });
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("save");
    for backend in [Backend::Json, Backend::MessagePack] {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CaptureStore::new(dir.path()).with_backend(backend);
        let id = FunctionIdentity::new("bench", "save");
        let args = sample_args();
        group.bench_with_input(BenchmarkId::from_parameter(backend.extension()), &args, |b, args| {
            b.iter(|| {
                store
                    .save(&id, args.clone(), Some(ArgValue::Int(1)), Retention::keep(5), true)
                    .expect("save")
            })
        });
    }
    group.finish();
}

fn fib(n: u64) -> u64 {
    traced!(fib(n) => {
        if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
    })
}

fn bench_traced_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("traced_call");
    group.bench_function("no_tracer", |b| b.iter(|| fib(black_box(10))));
    let tracer = FunctionTracer::new();
    group.bench_function("active_tracer", |b| {
        b.iter(|| tracer.trace(|| fib(black_box(10))))
    });
    group.finish();
}

criterion_group!(benches, bench_filter, bench_normalize, bench_save, bench_traced_call);
criterion_main!(benches);
