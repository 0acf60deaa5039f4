use rspirv::spirv as spv;

use crate::ir::Type;
use crate::spirv::{ConstData, Instruction, SpvBuilder, SpvKind};

#[test]
fn test_ids_are_unique_and_kinded() {
    let mut b = SpvBuilder::new();
    let mut seen = std::collections::HashSet::new();
    for kind in [
        SpvKind::Type,
        SpvKind::Constant,
        SpvKind::Result,
        SpvKind::Label,
        SpvKind::AccessChain,
    ] {
        for _ in 0..10 {
            let id = b.reserve_id(kind);
            assert!(seen.insert(id), "id {} handed out twice", id);
            assert_eq!(b.kind_of(id), Some(kind));
        }
    }
}

#[test]
fn test_type_declarations_deduplicate() {
    let mut b = SpvBuilder::new();
    let t1 = b.declare_type(Type::int(32, 1));
    let t2 = b.declare_type(Type::int(32, 1));
    assert_eq!(t1, t2);

    // Signedness and width are part of the key.
    assert_ne!(b.declare_type(Type::uint(32, 1)), t1);
    assert_ne!(b.declare_type(Type::int(16, 1)), t1);

    // Vector types dedup through their element.
    let v1 = b.declare_type(Type::int(32, 4));
    let v2 = b.declare_type(Type::int(32, 4));
    assert_eq!(v1, v2);

    let p1 = b.declare_pointer_type(t1, spv::StorageClass::Function);
    let p2 = b.declare_pointer_type(t1, spv::StorageClass::Function);
    assert_eq!(p1, p2);
    assert_ne!(b.declare_pointer_type(t1, spv::StorageClass::Uniform), p1);

    let f1 = b.declare_function_type(t1, vec![t1, v1]);
    let f2 = b.declare_function_type(t1, vec![t1, v1]);
    assert_eq!(f1, f2);
}

#[test]
fn test_struct_name_is_part_of_the_key() {
    let mut b = SpvBuilder::new();
    let t = b.declare_type(Type::uint(32, 1));
    let s1 = b.declare_struct("args_a", vec![t]);
    let s2 = b.declare_struct("args_a", vec![t]);
    let s3 = b.declare_struct("args_b", vec![t]);
    assert_eq!(s1, s2);
    assert_ne!(s1, s3);
}

#[test]
fn test_constants_deduplicate_by_bit_pattern() {
    let mut b = SpvBuilder::new();
    let c1 = b.declare_constant(Type::int(32, 1), ConstData::Int(42));
    let c2 = b.declare_constant(Type::int(32, 1), ConstData::Int(42));
    assert_eq!(c1, c2);
    assert_ne!(b.declare_constant(Type::int(32, 1), ConstData::Int(43)), c1);
    // Same bits, different type: different constant.
    assert_ne!(b.declare_constant(Type::uint(32, 1), ConstData::UInt(42)), c1);

    let t = b.declare_constant(Type::bool(1), ConstData::Bool(true));
    let t2 = b.declare_constant(Type::bool(1), ConstData::Bool(true));
    let f = b.declare_constant(Type::bool(1), ConstData::Bool(false));
    assert_eq!(t, t2);
    assert_ne!(t, f);
}

#[test]
fn test_unterminated_tail_block_branches_to_new_block() {
    let mut b = SpvBuilder::new();
    let void = b.declare_void_type();
    let fn_ty = b.declare_function_type(void, vec![]);
    b.create_function(void, fn_ty, spv::FunctionControl::NONE);

    let next = b.reserve_block_label();
    b.add_block(next);
    b.append(Instruction::new(spv::Op::Return));
    b.end_function();

    let func = &b.functions()[0];
    assert_eq!(func.blocks.len(), 2);
    let entry_tail = func.blocks[0].instructions.last().unwrap();
    assert_eq!(entry_tail.op, spv::Op::Branch);
    assert!(func.blocks.iter().all(|blk| blk.is_terminated()));
}

#[test]
#[should_panic(expected = "after a terminator")]
fn test_append_after_terminator_is_rejected() {
    let mut b = SpvBuilder::new();
    let void = b.declare_void_type();
    let fn_ty = b.declare_function_type(void, vec![]);
    b.create_function(void, fn_ty, spv::FunctionControl::NONE);
    b.append(Instruction::new(spv::Op::Return));
    b.append(Instruction::new(spv::Op::Return));
}

#[test]
fn test_local_variables_live_in_entry_block() {
    let mut b = SpvBuilder::new();
    let void = b.declare_void_type();
    let fn_ty = b.declare_function_type(void, vec![]);
    b.create_function(void, fn_ty, spv::FunctionControl::NONE);
    let i32_ty = b.declare_type(Type::int(32, 1));
    let ptr = b.declare_pointer_type(i32_ty, spv::StorageClass::Function);

    let second = b.reserve_block_label();
    b.add_block(second);
    // Declared while a later block is active, but still hoisted.
    b.declare_local_variable("tmp", ptr, None);
    b.append(Instruction::new(spv::Op::Return));
    b.end_function();

    let func = &b.functions()[0];
    assert_eq!(func.blocks[0].variables.len(), 1);
    assert!(func.blocks[1].variables.is_empty());
}

#[test]
fn test_finalize_infers_storage_extensions() {
    let mut b = SpvBuilder::new();
    b.declare_type(Type::uint(8, 1));
    b.declare_type(Type::int(16, 1));
    assert!(b.has_capability(spv::Capability::Int8));
    assert!(b.has_capability(spv::Capability::Int16));
    b.finalize();
    assert!(b.has_extension("SPV_KHR_8bit_storage"));
    assert!(b.has_extension("SPV_KHR_16bit_storage"));
}

#[test]
fn test_binding_count_is_highest_id_plus_one() {
    let mut b = SpvBuilder::new();
    let last = {
        b.declare_type(Type::int(32, 1));
        b.declare_constant(Type::int(32, 1), ConstData::Int(7))
    };
    b.finalize();
    assert_eq!(b.binding_count(), last + 1);
}

/// Walk an encoded module checking that instruction word counts tile the
/// stream exactly: wc == 1 + has_type + has_result + operand words.
#[test]
fn test_encoding_word_counts_tile_the_stream() {
    let mut b = SpvBuilder::new();
    let void = b.declare_void_type();
    let fn_ty = b.declare_function_type(void, vec![]);
    let func = b.create_function(void, fn_ty, spv::FunctionControl::NONE);
    b.declare_constant(Type::int(32, 1), ConstData::Int(-5));
    b.declare_constant(Type::uint(64, 1), ConstData::UInt(u64::MAX));
    b.append(Instruction::new(spv::Op::Return));
    b.end_function();
    b.add_entry_point("tile", func, spv::ExecutionModel::GLCompute, &[]);
    b.add_execution_mode_local_size(func, [8, 8, 1]);
    b.finalize();

    let words = b.encode();
    assert_eq!(words[0], spv::MAGIC_NUMBER);
    assert_eq!(words[3], b.binding_count());
    assert_eq!(words[4], 0);

    let mut pos = 5;
    let mut opcodes = Vec::new();
    while pos < words.len() {
        let wc = (words[pos] >> 16) as usize;
        let opcode = words[pos] & 0xffff;
        assert!(wc > 0, "zero word count at {}", pos);
        assert!(pos + wc <= words.len(), "instruction overruns the stream");
        opcodes.push(opcode);
        pos += wc;
    }
    assert_eq!(pos, words.len());
    // The fixed prologue is present and ordered.
    assert_eq!(opcodes[0], spv::Op::Capability as u32);
    assert!(opcodes.contains(&(spv::Op::MemoryModel as u32)));
    assert!(opcodes.contains(&(spv::Op::EntryPoint as u32)));
}

#[test]
fn test_string_operand_padding() {
    // A literal string occupies ceil((len + 1) / 4) words.
    for (s, expect_words) in [("abc", 1), ("abcd", 2), ("f", 1), ("sevench", 2)] {
        let inst = Instruction::new(spv::Op::Extension).str(s);
        assert_eq!(inst.word_count(), 1 + expect_words);
        let mut words = Vec::new();
        inst.encode(&mut words);
        assert_eq!(words.len() as u32, inst.word_count());
        // Trailing byte of the last word is the null terminator or padding.
        let last = words.last().unwrap();
        assert_eq!(last >> 24, 0);
    }
}

#[test]
fn test_workgroup_size_declared_once() {
    let mut b = SpvBuilder::new();
    let void = b.declare_void_type();
    let fn_ty = b.declare_function_type(void, vec![]);
    let func = b.create_function(void, fn_ty, spv::FunctionControl::NONE);
    b.append(Instruction::new(spv::Op::Return));
    b.end_function();
    b.add_execution_mode_local_size(func, [64, 1, 1]);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        b.add_execution_mode_local_size(func, [32, 1, 1]);
    }));
    assert!(result.is_err());
}
