use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use hostlua_core::{Context, SharedTable, Table, Value, VmOptions, VmState};

fn sample_table(size: i64) -> Table {
    let mut table = Table::new();
    for i in 1..=size {
        table.push(Value::from(i)).unwrap();
    }
    table.set(Value::from("name"), Value::from("bench")).unwrap();
    table
}

fn bench_to_raw(c: &mut Criterion) {
    let state = VmState::new(VmOptions::default()).unwrap();
    let mut group = c.benchmark_group("to_raw");

    group.bench_function("integer", |b| {
        let value = Value::from(42);
        b.iter(|| black_box(&value).to_raw(&state).unwrap());
    });

    group.bench_function("text", |b| {
        let value = Value::from("a moderately sized string value");
        b.iter(|| black_box(&value).to_raw(&state).unwrap());
    });

    // A native table binds to one VM table on first use, so each iteration needs a fresh one.
    for size in [8i64, 64, 512] {
        group.bench_with_input(BenchmarkId::new("native_table", size), &size, |b, &size| {
            b.iter_batched(
                || Value::from(sample_table(size)),
                |value| value.to_raw(&state).unwrap(),
                BatchSize::SmallInput,
            );
        });
    }

    let bound = Value::from(sample_table(64));
    bound.to_raw(&state).unwrap();
    group.bench_function("bound_table", |b| {
        b.iter(|| black_box(&bound).to_raw(&state).unwrap());
    });

    group.finish();
}

fn bench_clone_in(c: &mut Criterion) {
    let source = VmState::new(VmOptions::default()).unwrap();
    let target = VmState::new(VmOptions::default()).unwrap();
    let ctx = Context::main(&source);
    let mut group = c.benchmark_group("clone_in");

    for size in [8i64, 64, 512] {
        let vm_table = ctx
            .call(
                &ctx.create_function("make", move |ctx| {
                    ctx.return_values([Value::from(sample_table(size))])
                })
                .unwrap(),
                [],
            )
            .unwrap();
        group.bench_with_input(BenchmarkId::new("vm_table", size), &vm_table, |b, value| {
            b.iter(|| black_box(value).clone_in(&target).unwrap());
        });
    }

    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let state = VmState::new(VmOptions::default()).unwrap();
    let ctx = Context::main(&state);
    let add = ctx
        .create_function("add", |ctx| {
            let a = ctx.argument(1).as_integer().unwrap_or(0);
            let b = ctx.argument(2).as_integer().unwrap_or(0);
            ctx.return_values([Value::from(a + b)])
        })
        .unwrap();

    c.bench_function("call_native", |b| {
        b.iter(|| {
            ctx.call(&add, [Value::from(black_box(1)), Value::from(2)])
                .unwrap()
        });
    });

    ctx.set_global("add", &add).unwrap();
    let script = ctx
        .load("local s = 0 for i = 1, 100 do s = add(s, i) end return s", "loop")
        .unwrap();
    c.bench_function("script_calls_native", |b| {
        b.iter(|| ctx.call(&script, []).unwrap());
    });

    c.bench_function("pcall_native", |b| {
        b.iter(|| {
            ctx.pcall(&add, [Value::from(black_box(1)), Value::from(2)])
                .unwrap()
        });
    });
}

fn bench_shared_table(c: &mut Criterion) {
    let shared = SharedTable::from(sample_table(256));
    let key = Value::from(128);

    c.bench_function("shared_table_get", |b| {
        b.iter(|| shared.get(black_box(&key)));
    });

    c.bench_function("shared_table_pairs", |b| {
        b.iter(|| shared.pairs().count());
    });
}

criterion_group!(
    benches,
    bench_to_raw,
    bench_clone_in,
    bench_calls,
    bench_shared_table
);
criterion_main!(benches);
