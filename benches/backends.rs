use criterion::{Criterion, black_box, criterion_group, criterion_main};

use monkey::backend::{Backend, InterpreterBackend, VmBackend};
use monkey::compiler::Compiler;
use monkey::lexer::Lexer;
use monkey::parser::{self, Parser};

const FIB: &str = "
    let fibb = fn(x) {
        if (x == 0) { x } else {
            if (x == 1) { x } else { fibb(x - 1) + fibb(x - 2) }
        }
    };
    fibb(15)
";

const MAP: &str = "
    let map = fn(arr, f) {
        let iter = fn(arr, acc) {
            if (len(arr) == 0) { acc } else { iter(rest(arr), push(acc, f(first(arr)))) }
        };
        iter(arr, [])
    };
    map([1, 2, 3, 4, 5, 6, 7, 8], fn([a, b]) { a + b } | fn(g) { fn(x) { g([x, x]) } })
";

fn bench_backends(c: &mut Criterion) {
    let program = parser::parse(FIB).expect("parse fib");

    c.bench_function("frontend_tokenize_parse", |b| {
        b.iter(|| {
            let mut parser = Parser::new(Lexer::new(black_box(FIB)));
            let program = parser.parse_program();
            assert!(parser.errors().is_empty());
            black_box(program);
        })
    });

    c.bench_function("compile_only", |b| {
        b.iter(|| {
            let mut compiler = Compiler::new();
            compiler.compile(black_box(&program)).expect("compile");
            black_box(compiler.bytecode());
        })
    });

    for (name, source) in [("fib", FIB), ("map_pipeline", MAP)] {
        c.bench_function(&format!("interpreter_{name}"), |b| {
            let prepared = InterpreterBackend
                .prepare(&parser::parse(source).expect("parse"))
                .expect("prepare");
            b.iter(|| {
                let evaluation = prepared.run().expect("run");
                black_box(evaluation);
            })
        });

        c.bench_function(&format!("vm_{name}"), |b| {
            let prepared = VmBackend
                .prepare(&parser::parse(source).expect("parse"))
                .expect("prepare");
            b.iter(|| {
                let evaluation = prepared.run().expect("run");
                black_box(evaluation);
            })
        });
    }
}

criterion_group!(benches, bench_backends);
criterion_main!(benches);
