//! Compilation throughput benchmark.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ingot::{compile, CompileConfig, Expr, FuncDef, ImportMap, Module, Signature, ValueType, X86_64};

/// A module of `n` small arithmetic functions calling their neighbor.
fn synthetic_module(n: usize) -> Module {
    let mut functions = Vec::with_capacity(n);
    for i in 0..n {
        let body = if i + 1 < n {
            vec![Expr::Binary {
                op: ingot::BinaryOp::Add,
                ty: ValueType::I32,
                lhs: Box::new(Expr::Call {
                    func: i + 1,
                    args: vec![Expr::GetLocal(0)],
                }),
                rhs: Box::new(Expr::i32_const(i as i32)),
            }]
        } else {
            vec![Expr::Binary {
                op: ingot::BinaryOp::Mul,
                ty: ValueType::I32,
                lhs: Box::new(Expr::GetLocal(0)),
                rhs: Box::new(Expr::GetLocal(0)),
            }]
        };
        functions.push(FuncDef {
            name: None,
            sig: 0,
            locals: vec![ValueType::I32],
            body,
        });
    }

    Module {
        signatures: vec![Signature::new(vec![ValueType::I32], ValueType::I32)],
        functions,
        ..Default::default()
    }
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for n in [10usize, 100] {
        let module = synthetic_module(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &module, |b, module| {
            b.iter(|| {
                let compiled = compile::<X86_64>(
                    black_box(module),
                    &ImportMap::new(),
                    &CompileConfig::default(),
                    None,
                )
                .unwrap();
                black_box(compiled.text.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
