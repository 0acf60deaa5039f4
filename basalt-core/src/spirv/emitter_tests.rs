use rspirv::spirv as spv;

use crate::intrinsics as intrin;
use crate::ir::{self, make_const, ForKind, Stmt, Type};
use crate::spirv::emitter::{emit_module, Kernel, KernelArg};
use crate::spirv::module::{encode_header, parse_header, CompiledModule, DescriptorSet};

struct RawInst {
    opcode: u32,
    operands: Vec<u32>,
}

/// Split an encoded SPIR-V body (after the 5-word module header) back into
/// raw instructions.
fn decode(body: &[u32]) -> Vec<RawInst> {
    assert_eq!(body[0], spv::MAGIC_NUMBER);
    let mut insts = Vec::new();
    let mut pos = 5;
    while pos < body.len() {
        let wc = (body[pos] >> 16) as usize;
        assert!(wc > 0 && pos + wc <= body.len());
        insts.push(RawInst {
            opcode: body[pos] & 0xffff,
            operands: body[pos + 1..pos + wc].to_vec(),
        });
        pos += wc;
    }
    insts
}

fn decode_string(operands: &[u32]) -> String {
    let mut bytes = Vec::new();
    for w in operands {
        bytes.extend_from_slice(&w.to_le_bytes());
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap();
    String::from_utf8(bytes[..end].to_vec()).unwrap()
}

fn gpu_1d_body(kernel: &str, block_extent: i128, thread_extent: i128, inner: Stmt) -> Stmt {
    let i32t = Type::int(32, 1);
    Stmt::For {
        name: format!("{}.s0.__block_id_x", kernel),
        min: make_const(i32t, 0),
        extent: make_const(i32t, block_extent),
        kind: ForKind::GpuBlock,
        body: Box::new(Stmt::For {
            name: format!("{}.s0.__thread_id_x", kernel),
            min: make_const(i32t, 0),
            extent: make_const(i32t, thread_extent),
            kind: ForKind::GpuThread,
            body: Box::new(inner),
        }),
    }
}

fn add_one_kernel() -> Kernel {
    // f(x) = x[i] + 1 over u8, blocks=(4,1,1), threads=(64,1,1).
    let i32t = Type::int(32, 1);
    let u8t = Type::uint(8, 1);
    let index = ir::add(
        ir::mul(
            ir::var(i32t, "f.s0.__block_id_x"),
            make_const(i32t, 64),
        ),
        ir::var(i32t, "f.s0.__thread_id_x"),
    );
    let value = ir::add(ir::load(u8t, "x", index.clone()), make_const(u8t, 1));
    let store = Stmt::Store {
        name: "x".to_string(),
        value,
        index,
        predicate: None,
    };
    Kernel {
        name: "f".to_string(),
        args: vec![KernelArg::buffer("x", u8t)],
        body: gpu_1d_body("f", 4, 64, store),
    }
}

#[test]
fn test_add_one_kernel_header_and_body() {
    let module = emit_module(&[add_one_kernel()]).unwrap();

    // One entry point named "f" with no uniform buffer and one storage
    // buffer.
    let sets = module.parse_header().unwrap();
    assert_eq!(
        sets,
        vec![DescriptorSet {
            entry_point_name: "f".to_string(),
            uniform_buffer_count: 0,
            storage_buffer_count: 1,
        }]
    );

    let insts = decode(&module.body);

    // 8-bit buffer elements require the 8-bit storage extension.
    let extensions: Vec<String> = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::Extension as u32)
        .map(|i| decode_string(&i.operands))
        .collect();
    assert!(extensions.contains(&"SPV_KHR_8bit_storage".to_string()));

    // Execution mode LocalSize 64 1 1, declared exactly once.
    let modes: Vec<&RawInst> = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::ExecutionMode as u32)
        .collect();
    assert_eq!(modes.len(), 1);
    assert_eq!(modes[0].operands[1], spv::ExecutionMode::LocalSize as u32);
    assert_eq!(&modes[0].operands[2..], &[64, 1, 1]);

    // The entry point is GLCompute and named "f".
    let entries: Vec<&RawInst> = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::EntryPoint as u32)
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operands[0], spv::ExecutionModel::GLCompute as u32);
    assert_eq!(decode_string(&entries[0].operands[2..3]), "f");
}

#[test]
fn test_if_then_else_expression_is_a_four_block_phi() {
    // An if/then/else used as a value: if, then, else, merge blocks with a
    // two-input phi at the merge.
    let i32t = Type::int(32, 1);
    let cond = ir::lt(ir::var(i32t, "t"), make_const(i32t, 10));
    let value = intrin::if_then_else(cond, make_const(i32t, 1), make_const(i32t, 2));
    let store = Stmt::Store {
        name: "out".to_string(),
        value,
        index: make_const(i32t, 0),
        predicate: None,
    };
    let kernel = Kernel {
        name: "sel".to_string(),
        args: vec![
            KernelArg::buffer("out", i32t),
            KernelArg::scalar("t", i32t),
        ],
        body: store,
    };
    let module = emit_module(&[kernel]).unwrap();
    let insts = decode(&module.body);

    let labels = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::Label as u32)
        .count();
    assert_eq!(labels, 4);

    let phis: Vec<&RawInst> = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::Phi as u32)
        .collect();
    assert_eq!(phis.len(), 1);
    // type, result, then two (value, parent) pairs.
    assert_eq!(phis[0].operands.len(), 6);

    // The scalar argument occupies a uniform buffer binding.
    let sets = module.parse_header().unwrap();
    assert_eq!(sets[0].uniform_buffer_count, 1);
    assert_eq!(sets[0].storage_buffer_count, 1);
}

#[test]
fn test_serial_loop_block_structure() {
    // for i in [0, n): out[i] = i, as a five-block structured loop.
    let i32t = Type::int(32, 1);
    let body = Stmt::Store {
        name: "out".to_string(),
        value: ir::var(i32t, "i"),
        index: ir::var(i32t, "i"),
        predicate: None,
    };
    let kernel = Kernel {
        name: "iota".to_string(),
        args: vec![KernelArg::buffer("out", i32t)],
        body: Stmt::For {
            name: "i".to_string(),
            min: make_const(i32t, 0),
            extent: make_const(i32t, 16),
            kind: ForKind::Serial,
            body: Box::new(body),
        },
    };
    let module = emit_module(&[kernel]).unwrap();
    let insts = decode(&module.body);

    // entry, header, top, body, continue, merge.
    let labels = insts
        .iter()
        .filter(|i| i.opcode == spv::Op::Label as u32)
        .count();
    assert_eq!(labels, 6);
    assert_eq!(
        insts
            .iter()
            .filter(|i| i.opcode == spv::Op::LoopMerge as u32)
            .count(),
        1
    );
    assert_eq!(
        insts
            .iter()
            .filter(|i| i.opcode == spv::Op::BranchConditional as u32)
            .count(),
        1
    );
}

#[test]
fn test_conflicting_workgroup_sizes_fail() {
    let i32t = Type::int(32, 1);
    let u8t = Type::uint(8, 1);
    let store = |name: &str| Stmt::Store {
        name: "x".to_string(),
        value: make_const(u8t, 0),
        index: ir::var(i32t, name.to_string()),
        predicate: None,
    };
    let loop_of = |extent: i128, name: &str| Stmt::For {
        name: name.to_string(),
        min: make_const(i32t, 0),
        extent: make_const(i32t, extent),
        kind: ForKind::GpuThread,
        body: Box::new(store(name)),
    };
    let kernel = Kernel {
        name: "bad".to_string(),
        args: vec![KernelArg::buffer("x", u8t)],
        body: Stmt::Block(vec![
            loop_of(64, "bad.s0.__thread_id_x"),
            loop_of(32, "bad.s1.__thread_id_x"),
        ]),
    };
    let err = emit_module(&[kernel]).unwrap_err();
    assert!(err.to_string().contains("workgroup"), "unexpected error: {}", err);
}

#[test]
fn test_unknown_gpu_loop_name_is_rejected() {
    let i32t = Type::int(32, 1);
    let kernel = Kernel {
        name: "odd".to_string(),
        args: vec![KernelArg::buffer("x", i32t)],
        body: Stmt::For {
            name: "odd.s0.__warp_id_q".to_string(),
            min: make_const(i32t, 0),
            extent: make_const(i32t, 8),
            kind: ForKind::GpuThread,
            body: Box::new(Stmt::Evaluate(make_const(i32t, 0))),
        },
    };
    assert!(emit_module(&[kernel]).is_err());
}

#[test]
fn test_unsupported_constructs_are_rejected_by_name() {
    let i32t = Type::int(32, 1);
    let nop = || Box::new(Stmt::Evaluate(make_const(i32t, 0)));
    let kernel = Kernel {
        name: "forked".to_string(),
        args: vec![KernelArg::buffer("x", i32t)],
        body: Stmt::Fork(nop(), nop()),
    };
    let err = emit_module(&[kernel]).unwrap_err();
    assert!(err.to_string().contains("Fork"), "unexpected error: {}", err);
}

#[test]
fn test_header_round_trip() {
    let sets = vec![
        DescriptorSet {
            entry_point_name: "blur_x".to_string(),
            uniform_buffer_count: 1,
            storage_buffer_count: 3,
        },
        DescriptorSet {
            entry_point_name: "blur_y".to_string(),
            uniform_buffer_count: 0,
            storage_buffer_count: 2,
        },
    ];
    let header = encode_header(&sets);
    assert_eq!(header[0] as usize, header.len());
    assert_eq!(parse_header(&header).unwrap(), sets);
}

#[test]
fn test_module_byte_round_trip() {
    let module = emit_module(&[add_one_kernel()]).unwrap();
    let bytes = module.to_bytes();
    let reparsed = CompiledModule::from_bytes(&bytes).unwrap();
    assert_eq!(reparsed.header, module.header);
    assert_eq!(reparsed.body, module.body);
    assert_eq!(reparsed.parse_header().unwrap(), module.parse_header().unwrap());
}

#[test]
fn test_two_kernels_two_descriptor_sets() {
    let module = emit_module(&[add_one_kernel(), {
        let mut k = add_one_kernel();
        k.name = "g".to_string();
        k.body = gpu_1d_body(
            "f", // loop names still resolve by suffix
            2,
            64,
            Stmt::Store {
                name: "x".to_string(),
                value: make_const(Type::uint(8, 1), 7),
                index: ir::var(Type::int(32, 1), "f.s0.__thread_id_x"),
                predicate: None,
            },
        );
        k
    }])
    .unwrap();
    let sets = module.parse_header().unwrap();
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[0].entry_point_name, "f");
    assert_eq!(sets[1].entry_point_name, "g");
}
