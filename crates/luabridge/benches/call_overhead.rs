//! Benchmarks for crossing the bridge in both directions.
//!
//! Targets:
//! - Host calling a script closure through a handle (protected call + traceback handler)
//! - Script calling a bound host function (argument validation + extraction)
//! - Handle churn: reference then release a value

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use luabridge::{Param, Runtime, Value};

fn bench_host_to_script(c: &mut Criterion) {
    let rt = Runtime::new().expect("open runtime");
    let cx = rt.context().expect("context");
    let add = cx
        .exec("return function(a, b) return a + b end")
        .expect("load closure")
        .into_iter()
        .next()
        .and_then(Value::into_ref)
        .expect("closure ref");

    let mut group = c.benchmark_group("call_overhead/host_to_script");
    group.bench_function("add_two_integers", |b| {
        b.iter(|| {
            let out = cx
                .call(add.handle(), &[Value::Integer(20), Value::Integer(22)])
                .expect("call");
            black_box(out);
        });
    });
    group.finish();
}

fn bench_script_to_host(c: &mut Criterion) {
    let rt = Runtime::new().expect("open runtime");
    let cx = rt.context().expect("context");
    cx.register_function(
        "add",
        vec![Param::integer(), Param::integer()],
        |_, mut args| Ok(vec![Value::Integer(args.integer()? + args.integer()?)]),
    )
    .expect("register add");
    let loop_chunk = cx
        .load(
            "local add = host.add local s = 0 for i = 1, 1000 do s = add(s, i) end return s",
            "=bench",
        )
        .expect("compile loop");

    let mut group = c.benchmark_group("call_overhead/script_to_host");
    group.bench_function("1000_bound_calls", |b| {
        b.iter(|| {
            let out = cx.call_value(&loop_chunk, &[]).expect("run loop");
            black_box(out);
        });
    });
    group.finish();
}

fn bench_reference_churn(c: &mut Criterion) {
    let rt = Runtime::new().expect("open runtime");
    let cx = rt.context().expect("context");

    c.bench_function("call_overhead/reference_release", |b| {
        b.iter_batched(
            || cx.stack(),
            |mut stack| {
                stack.push_string("pinned").expect("push");
                let handle = stack.reference().expect("reference");
                cx.unref(black_box(handle)).expect("unref");
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_host_to_script,
    bench_script_to_host,
    bench_reference_churn
);
criterion_main!(benches);
