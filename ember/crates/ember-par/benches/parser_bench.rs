use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_gc::{GcConfig, Heap};
use ember_par::compile;
use ember_util::Handler;
use ember_value::StringPool;

const FIBONACCI: &str = r#"
local function fib(n)
    if n < 2 then
        return n
    end
    return fib(n - 1) + fib(n - 2)
end
return fib(20)
"#;

const TABLE_HEAVY: &str = r#"
local t = {}
for i = 1, 200 do
    t[i] = { value = i, squared = i * i, label = "item" .. i }
end
local sum = 0
for i, entry in ipairs(t) do
    sum = sum + entry.squared
end
return sum
"#;

fn bench_compile(c: &mut Criterion, name: &str, source: &str) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let heap = Heap::new(GcConfig::default());
            let strings = StringPool::new();
            let handler = Handler::new();
            let proto = compile(black_box(source), "bench", &heap, &strings, &handler)
                .expect("benchmark source should compile");
            black_box(proto);
        });
    });
}

fn fibonacci(c: &mut Criterion) {
    bench_compile(c, "compile_fibonacci", FIBONACCI);
}

fn table_heavy(c: &mut Criterion) {
    bench_compile(c, "compile_table_heavy", TABLE_HEAVY);
}

criterion_group!(benches, fibonacci, table_heavy);
criterion_main!(benches);
