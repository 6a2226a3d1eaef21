use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_runtime::api::MULTRET;
use ember_runtime::State;

const FIBONACCI: &str = r#"
local function fib(n)
    if n < 2 then
        return n
    end
    return fib(n - 1) + fib(n - 2)
end
return fib(24)
"#;

const TABLE_HEAVY: &str = r#"
local t = {}
for i = 1, 500 do
    t[i] = { value = i, squared = i * i, label = "item" .. i }
end
local sum = 0
for i, entry in ipairs(t) do
    sum = sum + entry.squared
end
return sum
"#;

const UPVALUE_COUNTER: &str = r#"
local function make()
    local x = 0
    return function() x = x + 1; return x end
end
local inc = make()
for i = 1, 10000 do
    inc()
end
return inc()
"#;

fn bench_run(c: &mut Criterion, name: &str, source: &str) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let state = State::open();
            state
                .load(black_box(source), "bench")
                .expect("benchmark source should compile");
            state.call(0, MULTRET).expect("benchmark source should run");
            black_box(state.top());
        });
    });
}

fn fibonacci(c: &mut Criterion) {
    bench_run(c, "run_fibonacci", FIBONACCI);
}

fn table_heavy(c: &mut Criterion) {
    bench_run(c, "run_table_heavy", TABLE_HEAVY);
}

fn upvalue_counter(c: &mut Criterion) {
    bench_run(c, "run_upvalue_counter", UPVALUE_COUNTER);
}

criterion_group!(benches, fibonacci, table_heavy, upvalue_counter);
criterion_main!(benches);
