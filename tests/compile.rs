//! End-to-end compilation tests.
//!
//! These drive the public API over small modules and assert on the
//! produced text, read-only data and object maps.

use std::collections::HashMap;

use ingot::codegen::objmap::{CallSiteMap, FuncMap};
use ingot::codegen::program::TABLE_ADDR;
use ingot::{
    compile, AArch64, CompileConfig, Compiled, Event, Expr, FuncDef, ImportMap, Module, Signature,
    ValueType, X86_64,
};

fn sig(params: Vec<ValueType>, result: ValueType) -> Signature {
    Signature::new(params, result)
}

fn func(sig: usize, locals: Vec<ValueType>, body: Vec<Expr>) -> FuncDef {
    FuncDef {
        name: None,
        sig,
        locals,
        body,
    }
}

fn compile_x86(module: &Module) -> Compiled {
    compile::<X86_64>(module, &ImportMap::new(), &CompileConfig::default(), None)
        .expect("compilation failed")
}

/// The function body after the retired stack-check prologue: skip the
/// NOP slide at the entry address.
fn body_bytes<'a>(compiled: &'a Compiled, func_index: usize) -> &'a [u8] {
    let addr = FuncMap::addrs(&compiled.func_map)[func_index] as usize;
    let mut body = &compiled.text[addr..];
    while body[0] == 0x90 {
        body = &body[1..];
    }
    body
}

#[test]
fn test_const_function() {
    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        functions: vec![func(0, vec![], vec![Expr::i32_const(42)])],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    let addrs = FuncMap::addrs(&compiled.func_map);
    assert_eq!(addrs.len(), 1);
    assert_ne!(addrs[0], 0);
    assert_eq!(addrs[0] % 16, 0);

    // mov eax, 42; ret
    let body = body_bytes(&compiled, 0);
    assert_eq!(&body[..7], &[0xc7, 0xc0, 42, 0, 0, 0, 0xc3]);

    // no rodata beyond the initial commons (empty table)
    assert_eq!(compiled.rodata.len(), TABLE_ADDR as usize);
}

#[test]
fn test_get_set_local() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![
                Expr::SetLocal(0, Box::new(Expr::i32_const(7))),
                Expr::GetLocal(0),
            ],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // the immediate is cached, so the body is a single move and return;
    // nothing touches the machine stack
    let body = body_bytes(&compiled, 0);
    assert_eq!(&body[..7], &[0xc7, 0xc0, 7, 0, 0, 0, 0xc3]);
}

#[test]
fn test_param_passthrough() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(0, vec![], vec![Expr::GetLocal(0)])],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // one move from the parameter slot above the link word, then return
    let body = body_bytes(&compiled, 0);
    assert_eq!(&body[..5], &[0x8b, 0x44, 0x24, 0x08, 0xc3]);
}

#[test]
fn test_forward_branch_skips_dead_code() {
    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Block {
                ty: ValueType::I32,
                name: None,
                body: vec![
                    Expr::Br {
                        depth: 0,
                        value: Some(Box::new(Expr::i32_const(5))),
                    },
                    Expr::i32_const(9),
                ],
            }],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    let body = body_bytes(&compiled, 0);
    // the branch value reaches the result register...
    assert_eq!(&body[..6], &[0xc7, 0xc0, 5, 0, 0, 0]);
    // ...and the unreachable constant is never emitted
    let nine = [0xc7u8, 0xc0, 9, 0, 0, 0];
    assert!(!compiled.text.windows(6).any(|w| w == nine));
}

#[test]
fn test_branch_out_of_non_tail_block() {
    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![
                Expr::Drop(Box::new(Expr::Block {
                    ty: ValueType::Void,
                    name: None,
                    body: vec![
                        Expr::Br {
                            depth: 0,
                            value: None,
                        },
                        Expr::Unreachable,
                    ],
                })),
                Expr::i32_const(3),
            ],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // an unconditional jmp rel32 carries the branch to the block end
    let body = body_bytes(&compiled, 0);
    assert_eq!(body[0], 0xe9);
    // the jump lands just past the dead-end guard byte behind it
    let disp = i32::from_le_bytes(body[1..5].try_into().unwrap());
    assert_eq!(disp, 1);
    assert_eq!(body[5], 0xcc);
    // ...on the trailing constant
    assert_eq!(&body[6..12], &[0xc7, 0xc0, 3, 0, 0, 0]);
}

#[test]
fn test_indirect_call_dispatch() {
    let module = Module {
        signatures: vec![Signature::with_index(
            vec![ValueType::I32],
            ValueType::I32,
            3,
        )],
        functions: vec![
            func(0, vec![], vec![Expr::GetLocal(0)]),
            func(
                0,
                vec![],
                vec![Expr::CallIndirect {
                    sig: 0,
                    index: Box::new(Expr::GetLocal(0)),
                    args: vec![Expr::i32_const(1)],
                }],
            ),
        ],
        table: vec![0],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // the packed table entry holds (signature index, entry address)
    let entry = u64::from_le_bytes(
        compiled.rodata[TABLE_ADDR as usize..TABLE_ADDR as usize + 8]
            .try_into()
            .unwrap(),
    );
    assert_eq!(entry >> 32, 3);
    assert_eq!(
        (entry & 0xffff_ffff) as u32,
        FuncMap::addrs(&compiled.func_map)[0]
    );

    // the dispatch ends in a call through the scratch register
    assert!(compiled.text.windows(2).any(|w| w == [0xff, 0xd2]));

    // the call site records one pushed argument plus the link word
    let sites = CallSiteMap::sites(&compiled.call_map);
    assert!(sites.iter().any(|&(_, depth)| depth == 16));
}

#[test]
fn test_branch_table_entry_sizes() {
    // all targets at one stack depth: 4-byte entries
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::Void)],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Block {
                ty: ValueType::Void,
                name: None,
                body: vec![Expr::Block {
                    ty: ValueType::Void,
                    name: None,
                    body: vec![Expr::BrTable {
                        targets: vec![0, 1],
                        default: 1,
                        value: None,
                        cond: Box::new(Expr::GetLocal(0)),
                    }],
                }],
            }],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // two 4-byte entries behind the (empty) function table
    assert_eq!(compiled.rodata.len(), TABLE_ADDR as usize + 8);
    for chunk in compiled.rodata[TABLE_ADDR as usize..].chunks_exact(4) {
        let addr = u32::from_le_bytes(chunk.try_into().unwrap());
        assert_ne!(addr, 0);
        assert!((addr as usize) < compiled.text.len());
    }
}

#[test]
fn test_branch_table_mixed_offsets() {
    // one target sits under a pushed call argument, so the entries
    // carry per-target stack deltas and widen to 8 bytes
    let module = Module {
        signatures: vec![
            sig(vec![ValueType::I32, ValueType::I32], ValueType::I32),
            sig(vec![ValueType::I32], ValueType::I32),
        ],
        functions: vec![
            func(0, vec![], vec![Expr::GetLocal(0)]),
            func(
                1,
                vec![],
                vec![Expr::Call {
                    func: 0,
                    args: vec![
                        Expr::i32_const(1),
                        Expr::Block {
                            ty: ValueType::I32,
                            name: None,
                            body: vec![
                                Expr::BrTable {
                                    targets: vec![0, 1],
                                    default: 0,
                                    value: Some(Box::new(Expr::i32_const(7))),
                                    cond: Box::new(Expr::GetLocal(0)),
                                },
                                Expr::i32_const(9),
                            ],
                        },
                    ],
                }],
            ),
        ],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // two 8-byte entries
    assert_eq!(compiled.rodata.len(), TABLE_ADDR as usize + 16);
    for chunk in compiled.rodata[TABLE_ADDR as usize..].chunks_exact(8) {
        let entry = u64::from_le_bytes(chunk.try_into().unwrap());
        assert_ne!(entry & 0xffff_ffff, 0);
    }
}

#[test]
fn test_incremental_start() {
    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        functions: vec![
            func(0, vec![], vec![Expr::i32_const(1)]),
            func(0, vec![], vec![Expr::i32_const(2)]),
            func(0, vec![], vec![Expr::i32_const(3)]),
        ],
        table: vec![1, 2],
        start: Some(0),
        ..Default::default()
    };

    let mut events = Vec::new();
    let mut handler = |e: Event| events.push(e);
    let config = CompileConfig {
        init_func_count: Some(1),
        ..Default::default()
    };
    let compiled = compile::<X86_64>(&module, &ImportMap::new(), &config, Some(&mut handler))
        .expect("compilation failed");

    assert_eq!(events, vec![Event::Init, Event::FunctionBarrier]);

    // all functions end up with addresses
    let addrs = FuncMap::addrs(&compiled.func_map);
    assert_eq!(addrs.len(), 3);
    assert!(addrs.iter().all(|&a| a != 0));

    // table entries of the late functions were patched in
    for (slot, &func_index) in module.table.iter().enumerate() {
        let offset = TABLE_ADDR as usize + slot * 8;
        let entry = u64::from_le_bytes(compiled.rodata[offset..offset + 8].try_into().unwrap());
        assert_eq!((entry & 0xffff_ffff) as u32, addrs[func_index as usize]);
    }

    // the virtual resume call site comes first in the call-site map
    let sites = CallSiteMap::sites(&compiled.call_map);
    assert_eq!(sites[0].1, 16);
}

#[test]
fn test_compilation_is_deterministic() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(
            0,
            vec![ValueType::I32],
            vec![
                Expr::SetLocal(
                    1,
                    Box::new(Expr::Binary {
                        op: ingot::BinaryOp::Add,
                        ty: ValueType::I32,
                        lhs: Box::new(Expr::GetLocal(0)),
                        rhs: Box::new(Expr::i32_const(10)),
                    }),
                ),
                Expr::GetLocal(1),
            ],
        )],
        ..Default::default()
    };

    let a = compile_x86(&module);
    let b = compile_x86(&module);
    assert_eq!(a.text, b.text);
    assert_eq!(a.rodata, b.rodata);
    assert_eq!(a.func_map, b.func_map);
    assert_eq!(a.call_map, b.call_map);
}

#[test]
fn test_multiply_by_zero_folds() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Binary {
                op: ingot::BinaryOp::Mul,
                ty: ValueType::I32,
                lhs: Box::new(Expr::GetLocal(0)),
                rhs: Box::new(Expr::i32_const(0)),
            }],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // no imul anywhere; the result register is just zeroed
    assert!(!compiled.text.windows(2).any(|w| w == [0x0f, 0xaf]));
    let body = body_bytes(&compiled, 0);
    assert_eq!(&body[..3], &[0x33, 0xc0, 0xc3]); // xor eax, eax; ret
}

#[test]
fn test_add_zero_folds() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Binary {
                op: ingot::BinaryOp::Add,
                ty: ValueType::I32,
                lhs: Box::new(Expr::GetLocal(0)),
                rhs: Box::new(Expr::i32_const(0)),
            }],
        )],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    // the addition disappears; only the parameter load remains
    let body = body_bytes(&compiled, 0);
    assert_eq!(&body[..5], &[0x8b, 0x44, 0x24, 0x08, 0xc3]);
}

#[test]
fn test_eqz_folds() {
    for (value, expect) in [(0i32, 1u8), (17, 0)] {
        let module = Module {
            signatures: vec![sig(vec![], ValueType::I32)],
            functions: vec![func(
                0,
                vec![],
                vec![Expr::Unary {
                    op: ingot::UnaryOp::Eqz,
                    ty: ValueType::I32,
                    arg: Box::new(Expr::i32_const(value)),
                }],
            )],
            ..Default::default()
        };
        let compiled = compile_x86(&module);
        let body = body_bytes(&compiled, 0);
        if expect == 1 {
            assert_eq!(&body[..7], &[0xc7, 0xc0, 1, 0, 0, 0, 0xc3]);
        } else {
            assert_eq!(&body[..3], &[0x33, 0xc0, 0xc3]);
        }
    }
}

#[test]
fn test_direct_call_records_site() {
    let module = Module {
        signatures: vec![
            sig(vec![ValueType::I32], ValueType::I32),
            sig(vec![], ValueType::I32),
        ],
        functions: vec![
            func(0, vec![], vec![Expr::GetLocal(0)]),
            func(
                1,
                vec![],
                vec![Expr::Call {
                    func: 0,
                    args: vec![Expr::i32_const(5)],
                }],
            ),
        ],
        ..Default::default()
    };
    let compiled = compile_x86(&module);

    let addrs = FuncMap::addrs(&compiled.func_map);
    let main_addr = addrs[1];

    // some call site inside the caller runs with one argument plus the
    // link word on the stack
    let sites = CallSiteMap::sites(&compiled.call_map);
    assert!(sites
        .iter()
        .any(|&(ret, depth)| ret > main_addr && depth == 16));
}

#[test]
fn test_import_trampoline() {
    let mut imports: ImportMap = HashMap::new();
    imports.insert(
        "env".into(),
        HashMap::from([(
            "clock".into(),
            ingot::ImportImpl {
                address: 0x7fff_1234_5678,
                params: vec![],
                result: ValueType::I32,
                variadic: false,
            },
        )]),
    );

    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        imports: vec![ingot::Import {
            namespace: "env".into(),
            name: "clock".into(),
            sig: 0,
        }],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Call {
                func: 0,
                args: vec![],
            }],
        )],
        ..Default::default()
    };
    let compiled = compile::<X86_64>(&module, &imports, &CompileConfig::default(), None)
        .expect("compilation failed");

    let addrs = FuncMap::addrs(&compiled.func_map);
    assert_eq!(addrs.len(), 2);

    // the trampoline ends in an absolute jump through the result register
    let tramp = &compiled.text[addrs[0] as usize..];
    assert!(tramp.windows(2).any(|w| w == [0xff, 0xe0]));
}

#[test]
fn test_missing_import_is_an_error() {
    let module = Module {
        signatures: vec![sig(vec![], ValueType::I32)],
        imports: vec![ingot::Import {
            namespace: "env".into(),
            name: "clock".into(),
            sig: 0,
        }],
        ..Default::default()
    };
    let err = compile::<X86_64>(&module, &ImportMap::new(), &CompileConfig::default(), None)
        .unwrap_err();
    assert!(err.to_string().contains("env.clock"));
}

#[test]
fn test_argument_count_mismatch_is_an_error() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![
            func(0, vec![], vec![Expr::GetLocal(0)]),
            func(
                0,
                vec![],
                vec![Expr::Call {
                    func: 0,
                    args: vec![],
                }],
            ),
        ],
        ..Default::default()
    };
    let err = compile::<X86_64>(&module, &ImportMap::new(), &CompileConfig::default(), None)
        .unwrap_err();
    assert!(err.to_string().contains("argument count mismatch"));
}

#[test]
fn test_aarch64_comparison_with_spilled_operand() {
    // the comparison's first operand is a temporary that must survive
    // the call on the right-hand side: it gets pushed to the machine
    // stack and reloaded before the compare
    let module = Module {
        signatures: vec![
            sig(vec![ValueType::I32], ValueType::I32),
            sig(vec![], ValueType::I32),
        ],
        functions: vec![
            func(1, vec![], vec![Expr::i32_const(7)]),
            func(
                0,
                vec![],
                vec![Expr::Binary {
                    op: ingot::BinaryOp::LtS,
                    ty: ValueType::I32,
                    lhs: Box::new(Expr::Binary {
                        op: ingot::BinaryOp::Add,
                        ty: ValueType::I32,
                        lhs: Box::new(Expr::GetLocal(0)),
                        rhs: Box::new(Expr::GetLocal(0)),
                    }),
                    rhs: Box::new(Expr::Call {
                        func: 0,
                        args: vec![],
                    }),
                }],
            ),
        ],
        ..Default::default()
    };
    let compiled =
        compile::<AArch64>(&module, &ImportMap::new(), &CompileConfig::default(), None)
            .expect("compilation failed");

    let addrs = FuncMap::addrs(&compiled.func_map);
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().all(|&a| a != 0));

    let words: Vec<u32> = compiled
        .text
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .collect();
    // the temporary is saved across the call: str x2, [x28, #-8]!
    assert!(words.contains(&0xf81f_8f82));
    // ...and reloaded for the compare: ldr x1, [x28], #8
    assert!(words.contains(&0xf840_8781));
    // cmp w1, w0 against the call result
    assert!(words.contains(&0x6b00_003f));
    // the comparison lands in the result register: cset w0, lt
    assert!(words.contains(&0x1a9f_a7e0));
}

#[test]
fn test_aarch64_smoke() {
    let module = Module {
        signatures: vec![sig(vec![ValueType::I32], ValueType::I32)],
        functions: vec![func(
            0,
            vec![],
            vec![Expr::Binary {
                op: ingot::BinaryOp::Add,
                ty: ValueType::I32,
                lhs: Box::new(Expr::GetLocal(0)),
                rhs: Box::new(Expr::i32_const(1)),
            }],
        )],
        ..Default::default()
    };
    let compiled =
        compile::<AArch64>(&module, &ImportMap::new(), &CompileConfig::default(), None)
            .expect("compilation failed");

    let addrs = FuncMap::addrs(&compiled.func_map);
    assert_eq!(addrs.len(), 1);
    assert_ne!(addrs[0], 0);
    assert_eq!(compiled.text.len() % 4, 0);

    // the NoFunction stub at address zero loads trap id zero
    let first = u32::from_le_bytes(compiled.text[..4].try_into().unwrap());
    assert_eq!(first, 0x5280_0000); // movz w0, #0

    let again =
        compile::<AArch64>(&module, &ImportMap::new(), &CompileConfig::default(), None)
            .expect("compilation failed");
    assert_eq!(compiled.text, again.text);
}
