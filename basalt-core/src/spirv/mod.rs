//! SPIR-V module construction.
//!
//! `SpvBuilder` is a data-only service: it never walks the IR, it only
//! assembles module state and encodes it. Ids come from a single monotone
//! counter and each id records the kind it was allocated as. Types,
//! pointer types, function types, structs and constants are interned, so
//! declaring the same thing twice returns the same id. Blocks are kept
//! well-formed structurally: exactly one terminator per block, variable
//! declarations only in a function's entry block, and an implicit branch
//! stitches an unterminated tail block to a newly added one.

pub mod emitter;
pub mod module;

#[cfg(test)]
mod builder_tests;
#[cfg(test)]
mod emitter_tests;

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use rspirv::spirv as spv;

use crate::ir::{Type, TypeCode};

pub type SpvId = u32;

/// SPIR-V binary version emitted by the builder (1.2: the last version
/// where the BufferBlock binding model is current).
const SPV_VERSION: u32 = 0x0001_0200;

/// Generator magic for this compiler (unregistered).
const SPV_GENERATOR: u32 = 0x0BA5_0001;

/// What an id was allocated as. Fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpvKind {
    Module,
    Type,
    Constant,
    Variable,
    Function,
    Block,
    Label,
    Result,
    AccessChain,
    Import,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Id(SpvId),
    Imm(u32),
    Str(String),
}

impl Operand {
    fn word_count(&self) -> u32 {
        match self {
            Operand::Id(_) | Operand::Imm(_) => 1,
            // Null-terminated, zero-padded to a word boundary.
            Operand::Str(s) => (s.len() as u32 + 1).div_ceil(4),
        }
    }

    fn encode(&self, binary: &mut Vec<u32>) {
        match self {
            Operand::Id(id) => binary.push(*id),
            Operand::Imm(v) => binary.push(*v),
            Operand::Str(s) => {
                let bytes = s.as_bytes();
                let words = (bytes.len() + 1).div_ceil(4);
                for w in 0..words {
                    let mut word = 0u32;
                    for b in 0..4 {
                        let i = w * 4 + b;
                        if i < bytes.len() {
                            word |= (bytes[i] as u32) << (b * 8);
                        }
                    }
                    binary.push(word);
                }
            }
        }
    }
}

/// One SPIR-V instruction: opcode, optional type id, optional result id,
/// then operands and immediates in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: spv::Op,
    pub type_id: Option<SpvId>,
    pub result_id: Option<SpvId>,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(op: spv::Op) -> Instruction {
        Instruction {
            op,
            type_id: None,
            result_id: None,
            operands: Vec::new(),
        }
    }

    pub fn with_type(mut self, type_id: SpvId) -> Instruction {
        self.type_id = Some(type_id);
        self
    }

    pub fn with_result(mut self, result_id: SpvId) -> Instruction {
        self.result_id = Some(result_id);
        self
    }

    pub fn id(mut self, id: SpvId) -> Instruction {
        self.operands.push(Operand::Id(id));
        self
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = SpvId>) -> Instruction {
        self.operands.extend(ids.into_iter().map(Operand::Id));
        self
    }

    pub fn imm(mut self, v: u32) -> Instruction {
        self.operands.push(Operand::Imm(v));
        self
    }

    pub fn str(mut self, s: impl Into<String>) -> Instruction {
        self.operands.push(Operand::Str(s.into()));
        self
    }

    pub fn word_count(&self) -> u32 {
        1 + self.type_id.is_some() as u32
            + self.result_id.is_some() as u32
            + self.operands.iter().map(Operand::word_count).sum::<u32>()
    }

    pub fn encode(&self, binary: &mut Vec<u32>) {
        binary.push((self.word_count() << 16) | self.op as u32);
        if let Some(t) = self.type_id {
            binary.push(t);
        }
        if let Some(r) = self.result_id {
            binary.push(r);
        }
        for operand in &self.operands {
            operand.encode(binary);
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            spv::Op::Branch
                | spv::Op::BranchConditional
                | spv::Op::Switch
                | spv::Op::Kill
                | spv::Op::Return
                | spv::Op::ReturnValue
                | spv::Op::Unreachable
        )
    }
}

/// A basic block: a label, variable declarations (entry block only), then
/// instructions ending in exactly one terminator.
#[derive(Debug)]
pub struct SpvBlock {
    pub label_id: SpvId,
    pub variables: Vec<Instruction>,
    pub instructions: Vec<Instruction>,
}

impl SpvBlock {
    fn new(label_id: SpvId) -> SpvBlock {
        SpvBlock {
            label_id,
            variables: Vec::new(),
            instructions: Vec::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.instructions.last().is_some_and(Instruction::is_terminator)
    }

    fn encode(&self, binary: &mut Vec<u32>) {
        Instruction::new(spv::Op::Label)
            .with_result(self.label_id)
            .encode(binary);
        for v in &self.variables {
            v.encode(binary);
        }
        for inst in &self.instructions {
            inst.encode(binary);
        }
    }
}

#[derive(Debug)]
pub struct SpvFunction {
    pub declaration: Instruction,
    pub parameters: Vec<Instruction>,
    pub blocks: Vec<SpvBlock>,
}

impl SpvFunction {
    fn encode(&self, binary: &mut Vec<u32>) {
        self.declaration.encode(binary);
        for p in &self.parameters {
            p.encode(binary);
        }
        for b in &self.blocks {
            b.encode(binary);
        }
        Instruction::new(spv::Op::FunctionEnd).encode(binary);
    }
}

// =============================================================================
// Intern table keys
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKey {
    Void,
    Bool,
    Int { bits: u8, signed: bool },
    Float { bits: u8 },
    Vector { elem: SpvId, lanes: u16 },
    Array { elem: SpvId, size_id: SpvId },
    RuntimeArray { elem: SpvId },
    Struct { name: String, members: Vec<SpvId> },
    Pointer { base: SpvId, storage_class: u32 },
    Function { ret: SpvId, params: Vec<SpvId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Scalar { type_id: SpvId, words: Vec<u32> },
    BoolTrue { type_id: SpvId },
    BoolFalse { type_id: SpvId },
    Null { type_id: SpvId },
    Composite { type_id: SpvId, elems: Vec<SpvId> },
}

/// Scalar constant payload accepted by `declare_constant`.
#[derive(Debug, Clone, Copy)]
pub enum ConstData {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

// =============================================================================
// Builder
// =============================================================================

pub struct SpvBuilder {
    next_id: SpvId,
    kinds: HashMap<SpvId, SpvKind>,
    module_id: SpvId,

    capabilities: IndexSet<spv::Capability>,
    extensions: IndexSet<String>,
    imports: IndexMap<String, SpvId>,
    entry_points: Vec<Instruction>,
    execution_modes: Vec<Instruction>,
    debug_strings: Vec<Instruction>,
    debug_names: Vec<Instruction>,
    annotations: Vec<Instruction>,
    /// Types, constants and global variables, in dependency order.
    declarations: Vec<Instruction>,
    functions: Vec<SpvFunction>,

    type_map: HashMap<TypeKey, SpvId>,
    constant_map: HashMap<ConstKey, SpvId>,

    active_block: Option<usize>,
    binding_count: SpvId,
    finalized: bool,
}

impl SpvBuilder {
    pub fn new() -> SpvBuilder {
        let mut b = SpvBuilder {
            next_id: 1,
            kinds: HashMap::new(),
            module_id: 0,
            capabilities: IndexSet::new(),
            extensions: IndexSet::new(),
            imports: IndexMap::new(),
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug_strings: Vec::new(),
            debug_names: Vec::new(),
            annotations: Vec::new(),
            declarations: Vec::new(),
            functions: Vec::new(),
            type_map: HashMap::new(),
            constant_map: HashMap::new(),
            active_block: None,
            binding_count: 0,
            finalized: false,
        };
        b.module_id = b.reserve_id(SpvKind::Module);
        b.require_capability(spv::Capability::Shader);
        b
    }

    // ---------------------------------------------------------------------
    // Ids
    // ---------------------------------------------------------------------

    /// Allocate a fresh id of the given kind. Each id is allocated exactly
    /// once and its kind never changes.
    pub fn reserve_id(&mut self, kind: SpvKind) -> SpvId {
        assert!(!self.finalized, "BUG: id reserved after finalize");
        let id = self.next_id;
        self.next_id += 1;
        let prev = self.kinds.insert(id, kind);
        assert!(prev.is_none(), "BUG: id {} allocated twice", id);
        id
    }

    pub fn kind_of(&self, id: SpvId) -> Option<SpvKind> {
        self.kinds.get(&id).copied()
    }

    pub fn current_bound(&self) -> SpvId {
        self.next_id
    }

    // ---------------------------------------------------------------------
    // Capabilities, extensions, imports
    // ---------------------------------------------------------------------

    pub fn require_capability(&mut self, cap: spv::Capability) {
        self.capabilities.insert(cap);
    }

    pub fn has_capability(&self, cap: spv::Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn require_extension(&mut self, name: &str) {
        self.extensions.insert(name.to_string());
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    /// Import an extended instruction set, once.
    pub fn import_instruction_set(&mut self, name: &str) -> SpvId {
        if let Some(&id) = self.imports.get(name) {
            return id;
        }
        let id = self.reserve_id(SpvKind::Import);
        self.imports.insert(name.to_string(), id);
        id
    }

    // ---------------------------------------------------------------------
    // Types
    // ---------------------------------------------------------------------

    fn intern_type(&mut self, key: TypeKey, build: impl FnOnce(SpvId) -> Instruction) -> SpvId {
        if let Some(&id) = self.type_map.get(&key) {
            return id;
        }
        let id = self.reserve_id(SpvKind::Type);
        let inst = build(id);
        self.declarations.push(inst);
        self.type_map.insert(key, id);
        id
    }

    pub fn declare_void_type(&mut self) -> SpvId {
        self.intern_type(TypeKey::Void, |id| {
            Instruction::new(spv::Op::TypeVoid).with_result(id)
        })
    }

    /// Declare (or fetch) the SPIR-V type for an IR scalar/vector type.
    /// Narrow and wide integer/float widths pull in the matching capability.
    pub fn declare_type(&mut self, ty: Type) -> SpvId {
        if ty.is_vector() {
            let elem = self.declare_type(ty.element_of());
            return self.intern_type(
                TypeKey::Vector {
                    elem,
                    lanes: ty.lanes,
                },
                |id| {
                    Instruction::new(spv::Op::TypeVector)
                        .with_result(id)
                        .id(elem)
                        .imm(ty.lanes as u32)
                },
            );
        }
        match ty.code {
            TypeCode::Bool => self.intern_type(TypeKey::Bool, |id| {
                Instruction::new(spv::Op::TypeBool).with_result(id)
            }),
            TypeCode::Int | TypeCode::UInt => {
                match ty.bits {
                    8 => self.require_capability(spv::Capability::Int8),
                    16 => self.require_capability(spv::Capability::Int16),
                    64 => self.require_capability(spv::Capability::Int64),
                    32 => {}
                    _ => panic!("BUG: unsupported integer width {}", ty),
                }
                let signed = ty.is_int();
                self.intern_type(TypeKey::Int { bits: ty.bits, signed }, |id| {
                    Instruction::new(spv::Op::TypeInt)
                        .with_result(id)
                        .imm(ty.bits as u32)
                        .imm(signed as u32)
                })
            }
            TypeCode::Float => {
                match ty.bits {
                    16 => self.require_capability(spv::Capability::Float16),
                    64 => self.require_capability(spv::Capability::Float64),
                    32 => {}
                    _ => panic!("BUG: unsupported float width {}", ty),
                }
                self.intern_type(TypeKey::Float { bits: ty.bits }, |id| {
                    Instruction::new(spv::Op::TypeFloat)
                        .with_result(id)
                        .imm(ty.bits as u32)
                })
            }
            TypeCode::Handle => panic!("BUG: handle types have no device representation"),
        }
    }

    /// A fixed-size array. The size becomes an interned u32 constant, so
    /// arrays are deduplicated through `(element, size-constant)`.
    pub fn declare_array_type(&mut self, elem: SpvId, size: u32) -> SpvId {
        let size_id = self.declare_constant(Type::uint(32, 1), ConstData::UInt(size as u64));
        self.intern_type(TypeKey::Array { elem, size_id }, |id| {
            Instruction::new(spv::Op::TypeArray)
                .with_result(id)
                .id(elem)
                .id(size_id)
        })
    }

    pub fn declare_runtime_array_type(&mut self, elem: SpvId) -> SpvId {
        self.intern_type(TypeKey::RuntimeArray { elem }, |id| {
            Instruction::new(spv::Op::TypeRuntimeArray)
                .with_result(id)
                .id(elem)
        })
    }

    /// Structs dedup on the member sequence *and* the symbolic name: the
    /// same members under a different name are a different struct.
    pub fn declare_struct(&mut self, name: &str, members: Vec<SpvId>) -> SpvId {
        let key = TypeKey::Struct {
            name: name.to_string(),
            members: members.clone(),
        };
        if let Some(&id) = self.type_map.get(&key) {
            return id;
        }
        let id = self.intern_type(key, |id| {
            Instruction::new(spv::Op::TypeStruct).with_result(id).ids(members)
        });
        self.add_symbol(id, name);
        id
    }

    /// Pointers key on `(base type, storage class)`; the base must already
    /// be declared, which the id argument guarantees.
    pub fn declare_pointer_type(&mut self, base: SpvId, storage_class: spv::StorageClass) -> SpvId {
        self.intern_type(
            TypeKey::Pointer {
                base,
                storage_class: storage_class as u32,
            },
            |id| {
                Instruction::new(spv::Op::TypePointer)
                    .with_result(id)
                    .imm(storage_class as u32)
                    .id(base)
            },
        )
    }

    pub fn declare_function_type(&mut self, ret: SpvId, params: Vec<SpvId>) -> SpvId {
        let key = TypeKey::Function {
            ret,
            params: params.clone(),
        };
        self.intern_type(key, |id| {
            Instruction::new(spv::Op::TypeFunction)
                .with_result(id)
                .id(ret)
                .ids(params)
        })
    }

    // ---------------------------------------------------------------------
    // Constants
    // ---------------------------------------------------------------------

    /// Scalar constants are interned on `(type, raw bit pattern)`; booleans
    /// become OpConstantTrue/False rather than a byte pattern.
    pub fn declare_constant(&mut self, ty: Type, value: ConstData) -> SpvId {
        assert!(ty.is_scalar(), "BUG: scalar constant of vector type {}", ty);
        let type_id = self.declare_type(ty);
        if ty.is_bool() {
            let truthy = match value {
                ConstData::Bool(b) => b,
                ConstData::Int(v) => v != 0,
                ConstData::UInt(v) => v != 0,
                ConstData::Float(_) => panic!("BUG: float payload for bool constant"),
            };
            let key = if truthy {
                ConstKey::BoolTrue { type_id }
            } else {
                ConstKey::BoolFalse { type_id }
            };
            if let Some(&id) = self.constant_map.get(&key) {
                return id;
            }
            let id = self.reserve_id(SpvKind::Constant);
            let op = if truthy {
                spv::Op::ConstantTrue
            } else {
                spv::Op::ConstantFalse
            };
            self.declarations
                .push(Instruction::new(op).with_type(type_id).with_result(id));
            self.constant_map.insert(key, id);
            return id;
        }

        let words = Self::constant_words(ty, value);
        let key = ConstKey::Scalar {
            type_id,
            words: words.clone(),
        };
        if let Some(&id) = self.constant_map.get(&key) {
            return id;
        }
        let id = self.reserve_id(SpvKind::Constant);
        let mut inst = Instruction::new(spv::Op::Constant)
            .with_type(type_id)
            .with_result(id);
        for w in words {
            inst = inst.imm(w);
        }
        self.declarations.push(inst);
        self.constant_map.insert(key, id);
        id
    }

    fn constant_words(ty: Type, value: ConstData) -> Vec<u32> {
        let raw: u64 = match (ty.code, value) {
            (TypeCode::Int, ConstData::Int(v)) => v as u64,
            (TypeCode::UInt, ConstData::UInt(v)) => v,
            (TypeCode::Int, ConstData::UInt(v)) => v,
            (TypeCode::UInt, ConstData::Int(v)) => v as u64,
            (TypeCode::Float, ConstData::Float(v)) => {
                if ty.bits == 32 {
                    (v as f32).to_bits() as u64
                } else {
                    v.to_bits()
                }
            }
            _ => panic!("BUG: constant payload does not match type {}", ty),
        };
        let masked = if ty.bits < 64 {
            raw & ((1u64 << ty.bits) - 1)
        } else {
            raw
        };
        if ty.bits > 32 {
            vec![masked as u32, (masked >> 32) as u32]
        } else {
            vec![masked as u32]
        }
    }

    pub fn declare_null_constant(&mut self, type_id: SpvId) -> SpvId {
        let key = ConstKey::Null { type_id };
        if let Some(&id) = self.constant_map.get(&key) {
            return id;
        }
        let id = self.reserve_id(SpvKind::Constant);
        self.declarations.push(
            Instruction::new(spv::Op::ConstantNull)
                .with_type(type_id)
                .with_result(id),
        );
        self.constant_map.insert(key, id);
        id
    }

    /// A composite (vector) constant built from already-declared scalars.
    pub fn declare_composite_constant(&mut self, type_id: SpvId, elems: Vec<SpvId>) -> SpvId {
        let key = ConstKey::Composite {
            type_id,
            elems: elems.clone(),
        };
        if let Some(&id) = self.constant_map.get(&key) {
            return id;
        }
        let id = self.reserve_id(SpvKind::Constant);
        self.declarations.push(
            Instruction::new(spv::Op::ConstantComposite)
                .with_type(type_id)
                .with_result(id)
                .ids(elems),
        );
        self.constant_map.insert(key, id);
        id
    }

    // ---------------------------------------------------------------------
    // Debug info and annotations
    // ---------------------------------------------------------------------

    pub fn add_debug_string(&mut self, s: &str) -> SpvId {
        let id = self.reserve_id(SpvKind::Result);
        self.debug_strings
            .push(Instruction::new(spv::Op::String).with_result(id).str(s));
        id
    }

    pub fn add_symbol(&mut self, target: SpvId, name: &str) {
        self.debug_names
            .push(Instruction::new(spv::Op::Name).id(target).str(name));
    }

    pub fn add_annotation(
        &mut self,
        target: SpvId,
        decoration: spv::Decoration,
        literals: &[u32],
    ) {
        let mut inst = Instruction::new(spv::Op::Decorate)
            .id(target)
            .imm(decoration as u32);
        for &l in literals {
            inst = inst.imm(l);
        }
        self.annotations.push(inst);
    }

    pub fn add_struct_annotation(
        &mut self,
        struct_id: SpvId,
        member: u32,
        decoration: spv::Decoration,
        literals: &[u32],
    ) {
        let mut inst = Instruction::new(spv::Op::MemberDecorate)
            .id(struct_id)
            .imm(member)
            .imm(decoration as u32);
        for &l in literals {
            inst = inst.imm(l);
        }
        self.annotations.push(inst);
    }

    // ---------------------------------------------------------------------
    // Globals, functions, blocks
    // ---------------------------------------------------------------------

    pub fn declare_global_variable(
        &mut self,
        name: &str,
        ptr_type_id: SpvId,
        storage_class: spv::StorageClass,
        initializer: Option<SpvId>,
    ) -> SpvId {
        let id = self.reserve_id(SpvKind::Variable);
        let mut inst = Instruction::new(spv::Op::Variable)
            .with_type(ptr_type_id)
            .with_result(id)
            .imm(storage_class as u32);
        if let Some(init) = initializer {
            inst = inst.id(init);
        }
        self.declarations.push(inst);
        self.add_symbol(id, name);
        id
    }

    /// Start a function. The entry block is created along with it and is
    /// the only block allowed to hold variable declarations.
    pub fn create_function(
        &mut self,
        return_type_id: SpvId,
        function_type_id: SpvId,
        control: spv::FunctionControl,
    ) -> SpvId {
        let func_id = self.reserve_id(SpvKind::Function);
        let declaration = Instruction::new(spv::Op::Function)
            .with_type(return_type_id)
            .with_result(func_id)
            .imm(control.bits())
            .id(function_type_id);
        let entry_label = self.reserve_id(SpvKind::Label);
        self.functions.push(SpvFunction {
            declaration,
            parameters: Vec::new(),
            blocks: vec![SpvBlock::new(entry_label)],
        });
        self.active_block = Some(0);
        func_id
    }

    pub fn add_function_parameter(&mut self, type_id: SpvId) -> SpvId {
        let id = self.reserve_id(SpvKind::Result);
        let func = self.current_function_mut();
        assert!(
            func.blocks[0].variables.is_empty() && func.blocks[0].instructions.is_empty(),
            "BUG: parameters must precede the function body"
        );
        func.parameters.push(
            Instruction::new(spv::Op::FunctionParameter)
                .with_type(type_id)
                .with_result(id),
        );
        id
    }

    fn current_function_mut(&mut self) -> &mut SpvFunction {
        self.functions.last_mut().expect("BUG: no function under construction")
    }

    /// A function-local variable, hoisted into the entry block.
    pub fn declare_local_variable(
        &mut self,
        name: &str,
        ptr_type_id: SpvId,
        initializer: Option<SpvId>,
    ) -> SpvId {
        let id = self.reserve_id(SpvKind::Variable);
        let mut inst = Instruction::new(spv::Op::Variable)
            .with_type(ptr_type_id)
            .with_result(id)
            .imm(spv::StorageClass::Function as u32);
        if let Some(init) = initializer {
            inst = inst.id(init);
        }
        self.current_function_mut().blocks[0].variables.push(inst);
        self.add_symbol(id, name);
        id
    }

    /// Append a block with a pre-reserved label and make it current. If the
    /// previous tail block is not terminated, it branches to the new block.
    pub fn add_block(&mut self, label_id: SpvId) {
        assert_eq!(
            self.kind_of(label_id),
            Some(SpvKind::Label),
            "BUG: block label {} has the wrong id kind",
            label_id
        );
        let func = self.functions.last_mut().expect("BUG: block outside a function");
        if let Some(tail) = func.blocks.last_mut() {
            if !tail.is_terminated() {
                tail.instructions
                    .push(Instruction::new(spv::Op::Branch).id(label_id));
            }
        }
        func.blocks.push(SpvBlock::new(label_id));
        self.active_block = Some(func.blocks.len() - 1);
    }

    pub fn reserve_block_label(&mut self) -> SpvId {
        self.reserve_id(SpvKind::Label)
    }

    /// Append an instruction to the current block. Nothing may follow a
    /// terminator.
    pub fn append(&mut self, inst: Instruction) {
        let idx = self.active_block.expect("BUG: append with no active block");
        let func = self.current_function_mut();
        let block = &mut func.blocks[idx];
        assert!(
            !block.is_terminated(),
            "BUG: instruction {:?} appended after a terminator",
            inst.op
        );
        block.instructions.push(inst);
    }

    pub fn current_block_terminated(&self) -> bool {
        let Some(idx) = self.active_block else {
            return true;
        };
        self.functions
            .last()
            .map(|f| f.blocks[idx].is_terminated())
            .unwrap_or(true)
    }

    /// The label of the block instructions currently append to.
    pub fn current_block_label(&self) -> SpvId {
        let idx = self.active_block.expect("BUG: no active block");
        self.functions.last().expect("BUG: no function under construction").blocks[idx].label_id
    }

    /// Select an existing block of the current function as append target.
    pub fn select_block(&mut self, label_id: SpvId) {
        let func = self.functions.last().expect("BUG: no function under construction");
        let idx = func
            .blocks
            .iter()
            .position(|b| b.label_id == label_id)
            .unwrap_or_else(|| panic!("BUG: unknown block label {}", label_id));
        self.active_block = Some(idx);
    }

    pub fn end_function(&mut self) {
        let func = self.functions.last().expect("BUG: end_function with no function");
        assert!(
            func.blocks.iter().all(SpvBlock::is_terminated),
            "BUG: function ended with an unterminated block"
        );
        self.active_block = None;
    }

    pub fn functions(&self) -> &[SpvFunction] {
        &self.functions
    }

    // ---------------------------------------------------------------------
    // Entry points and execution modes
    // ---------------------------------------------------------------------

    /// Record an entry point and the exact set of interface variables it
    /// references.
    pub fn add_entry_point(
        &mut self,
        name: &str,
        func_id: SpvId,
        model: spv::ExecutionModel,
        interface: &[SpvId],
    ) {
        self.entry_points.push(
            Instruction::new(spv::Op::EntryPoint)
                .imm(model as u32)
                .id(func_id)
                .str(name)
                .ids(interface.iter().copied()),
        );
    }

    /// Workgroup size: declared exactly once per entry point.
    pub fn add_execution_mode_local_size(&mut self, func_id: SpvId, size: [u32; 3]) {
        assert!(
            !self
                .execution_modes
                .iter()
                .any(|m| m.operands.first() == Some(&Operand::Id(func_id))),
            "BUG: workgroup size declared twice for function {}",
            func_id
        );
        self.execution_modes.push(
            Instruction::new(spv::Op::ExecutionMode)
                .id(func_id)
                .imm(spv::ExecutionMode::LocalSize as u32)
                .imm(size[0])
                .imm(size[1])
                .imm(size[2]),
        );
    }

    // ---------------------------------------------------------------------
    // Finalize and encode
    // ---------------------------------------------------------------------

    /// Infer storage extensions from requested capabilities, fix the id
    /// bound, and freeze the builder.
    pub fn finalize(&mut self) {
        assert!(!self.finalized, "BUG: finalize called twice");
        if self.has_capability(spv::Capability::Int8) {
            self.require_extension("SPV_KHR_8bit_storage");
            self.require_capability(spv::Capability::StorageBuffer8BitAccess);
        }
        if self.has_capability(spv::Capability::Int16) {
            self.require_extension("SPV_KHR_16bit_storage");
            self.require_capability(spv::Capability::StorageBuffer16BitAccess);
        }
        self.binding_count = self.next_id;
        self.finalized = true;
    }

    pub fn binding_count(&self) -> SpvId {
        self.binding_count
    }

    /// Encode the finalized module to words, once.
    pub fn encode(&self) -> Vec<u32> {
        assert!(self.finalized, "BUG: encode before finalize");
        let mut binary = Vec::new();
        binary.push(spv::MAGIC_NUMBER);
        binary.push(SPV_VERSION);
        binary.push(SPV_GENERATOR);
        binary.push(self.binding_count);
        binary.push(0); // reserved schema

        for &cap in &self.capabilities {
            Instruction::new(spv::Op::Capability)
                .imm(cap as u32)
                .encode(&mut binary);
        }
        for ext in &self.extensions {
            Instruction::new(spv::Op::Extension)
                .str(ext.clone())
                .encode(&mut binary);
        }
        for (name, &id) in &self.imports {
            Instruction::new(spv::Op::ExtInstImport)
                .with_result(id)
                .str(name.clone())
                .encode(&mut binary);
        }
        Instruction::new(spv::Op::MemoryModel)
            .imm(spv::AddressingModel::Logical as u32)
            .imm(spv::MemoryModel::GLSL450 as u32)
            .encode(&mut binary);
        for inst in self
            .entry_points
            .iter()
            .chain(&self.execution_modes)
            .chain(&self.debug_strings)
            .chain(&self.debug_names)
            .chain(&self.annotations)
            .chain(&self.declarations)
        {
            inst.encode(&mut binary);
        }
        for func in &self.functions {
            func.encode(&mut binary);
        }
        binary
    }
}

impl Default for SpvBuilder {
    fn default() -> Self {
        Self::new()
    }
}
