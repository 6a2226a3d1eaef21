//! Lexer benchmarks.
//!
//! Run with `cargo bench --package ember-lex`.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ember_lex::Lexer;
use ember_util::Handler;

fn create_handler() -> Handler {
    Handler::new()
}

fn lexer_token_count(source: &str) -> usize {
    let handler = create_handler();
    let lexer = Lexer::new(source, &handler);
    // Lexer implements Iterator, so we can use it directly.
    lexer.count()
}

fn bench_lexer_keywords(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer");

    let source = "local x = 42\nfunction main() local y = x + 1 return y end";
    group.throughput(Throughput::Bytes(source.len() as u64));

    group.bench_function("simple_local", |b| {
        b.iter(|| lexer_token_count(black_box("local x = 42")))
    });

    group.bench_function("function_with_body", |b| {
        b.iter(|| lexer_token_count(black_box(source)))
    });

    group.finish();
}

fn bench_lexer_complex(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_complex");

    let source = r#"
        function fibonacci(n)
            if n <= 1 then
                return n
            end
            return fibonacci(n - 1) + fibonacci(n - 2)
        end

        local Point = {}
        Point.__index = Point

        function Point.new(x, y)
            local self = setmetatable({}, Point)
            self.x = x
            self.y = y
            return self
        end

        function Point:draw()
            print("Point at (" .. self.x .. ", " .. self.y .. ")")
        end

        local colors = { "red", "green", "blue" }
        for i, name in ipairs(colors) do
            print(i, name)
        end
    "#;

    group.throughput(Throughput::Bytes(source.len() as u64));

    group.bench_function("complex_source", |b| {
        b.iter(|| lexer_token_count(black_box(source)))
    });

    group.finish();
}

fn bench_lexer_strings(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_strings");

    group.bench_function("short_string", |b| {
        b.iter(|| lexer_token_count(black_box("local s = \"hello\"")))
    });

    group.bench_function("long_bracket_string", |b| {
        let source = "local s = [[This is a longer string that contains some text for benchmarking purposes.]]";
        b.iter(|| lexer_token_count(black_box(source)))
    });

    group.finish();
}

fn bench_lexer_numbers(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_numbers");

    group.bench_function("integer", |b| {
        b.iter(|| lexer_token_count(black_box("local x = 123456")))
    });

    group.bench_function("float", |b| {
        b.iter(|| lexer_token_count(black_box("local x = 3.14159")))
    });

    group.bench_function("hex", |b| {
        b.iter(|| lexer_token_count(black_box("local x = 0xDEADBEEF")))
    });

    group.finish();
}

fn bench_lexer_identifiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_identifiers");

    group.bench_function("short_ident", |b| {
        b.iter(|| lexer_token_count(black_box("local x = 42")))
    });

    group.bench_function("long_ident", |b| {
        b.iter(|| lexer_token_count(black_box("local very_long_variable_name = 42")))
    });

    group.bench_function("many_ident", |b| {
        b.iter(|| {
            lexer_token_count(black_box(
                "local a = 1 local b = 2 local c = 3 local d = 4 local e = 5",
            ))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lexer_keywords,
    bench_lexer_complex,
    bench_lexer_strings,
    bench_lexer_numbers,
    bench_lexer_identifiers
);
criterion_main!(benches);
