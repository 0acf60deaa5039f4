//! Shader emission: walk kernel IR and drive the SPIR-V builder.
//!
//! Each kernel becomes one GLCompute entry point. Scalar arguments are
//! packed into a single uniform struct with explicit offsets; every device
//! buffer becomes a runtime array wrapped in a BufferBlock struct. GPU
//! loops read the matching built-in invocation id; serial loops become a
//! five-block structured loop. Higher-order arithmetic intrinsics that
//! reach the emitter are resolved through the reference lowering.

use std::collections::HashMap;

use log::debug;
use rspirv::spirv as spv;

use crate::error::Result;
use crate::intrinsics::{self as intrin, lower, Intrinsic};
use crate::ir::{
    self, CallOp, Expr, ExprKind, ForKind, MemoryScope, Stmt, Type, TypeCode,
};
use crate::spirv::module::{CompiledModule, DescriptorSet};
use crate::spirv::{ConstData, Instruction, SpvBuilder, SpvId, SpvKind};
use crate::{bail_spirv, bail_type, bail_unsupported, err_spirv};

/// How a kernel argument is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A device buffer of elements of the argument type.
    Buffer,
    /// A scalar passed through the packed uniform block.
    Scalar,
}

#[derive(Debug, Clone)]
pub struct KernelArg {
    pub name: String,
    pub ty: Type,
    pub kind: ArgKind,
}

impl KernelArg {
    pub fn buffer(name: impl Into<String>, ty: Type) -> KernelArg {
        KernelArg {
            name: name.into(),
            ty,
            kind: ArgKind::Buffer,
        }
    }

    pub fn scalar(name: impl Into<String>, ty: Type) -> KernelArg {
        KernelArg {
            name: name.into(),
            ty,
            kind: ArgKind::Scalar,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Kernel {
    pub name: String,
    pub args: Vec<KernelArg>,
    pub body: Stmt,
}

/// Compile a set of kernels into one module with one entry point each.
pub fn emit_module(kernels: &[Kernel]) -> Result<CompiledModule> {
    let mut emitter = Emitter::new();
    for (index, kernel) in kernels.iter().enumerate() {
        emitter.compile_kernel(index as u32, kernel)?;
    }
    emitter.builder.finalize();
    let body = emitter.builder.encode();
    Ok(CompiledModule::new(&emitter.descriptor_sets, body))
}

// =============================================================================
// GPU loop variables
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SimtBuiltin {
    LocalInvocationId,
    WorkgroupId,
}

impl SimtBuiltin {
    fn spv_builtin(self) -> spv::BuiltIn {
        match self {
            SimtBuiltin::LocalInvocationId => spv::BuiltIn::LocalInvocationId,
            SimtBuiltin::WorkgroupId => spv::BuiltIn::WorkgroupId,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SimtBuiltin::LocalInvocationId => "LocalInvocationId",
            SimtBuiltin::WorkgroupId => "WorkgroupId",
        }
    }
}

/// Map a GPU loop variable name to its built-in and dimension. Loop names
/// are host-visible input: anything unrecognized is a compile error.
fn simt_intrinsic(name: &str) -> Result<(SimtBuiltin, u32)> {
    let table = [
        (".__thread_id_x", SimtBuiltin::LocalInvocationId, 0),
        (".__thread_id_y", SimtBuiltin::LocalInvocationId, 1),
        (".__thread_id_z", SimtBuiltin::LocalInvocationId, 2),
        (".__block_id_x", SimtBuiltin::WorkgroupId, 0),
        (".__block_id_y", SimtBuiltin::WorkgroupId, 1),
        (".__block_id_z", SimtBuiltin::WorkgroupId, 2),
    ];
    for (suffix, builtin, dim) in table {
        if name.ends_with(suffix) {
            return Ok((builtin, dim));
        }
    }
    if name.ends_with("id_w") {
        bail_spirv!("gpu blocks and threads are limited to 3 dimensions: {}", name);
    }
    bail_spirv!("unrecognized gpu loop variable: {}", name)
}

/// Which dimension of the workgroup a thread loop fixes, if any.
fn thread_loop_workgroup_index(name: &str) -> Option<usize> {
    [".__thread_id_x", ".__thread_id_y", ".__thread_id_z"]
        .iter()
        .position(|s| name.ends_with(s))
}

// =============================================================================
// Emitter state
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct SymbolBinding {
    id: SpvId,
    storage_class: spv::StorageClass,
}

/// Extra facts about an addressable buffer or allocation.
#[derive(Debug, Clone, Copy)]
struct BufferInfo {
    elem_ty: Type,
    elem_type_id: SpvId,
    /// Buffer blocks wrap the runtime array in a struct, so element access
    /// chains start with a leading zero index.
    struct_wrapped: bool,
}

struct Emitter {
    builder: SpvBuilder,
    symbol_table: HashMap<String, Vec<SymbolBinding>>,
    buffers: HashMap<String, Vec<BufferInfo>>,
    descriptor_sets: Vec<DescriptorSet>,
    glsl_import: Option<SpvId>,

    // Per-kernel state.
    workgroup_size: [u32; 3],
    builtin_values: HashMap<SimtBuiltin, SpvId>,
    interface: Vec<SpvId>,
}

impl Emitter {
    fn new() -> Emitter {
        Emitter {
            builder: SpvBuilder::new(),
            symbol_table: HashMap::new(),
            buffers: HashMap::new(),
            descriptor_sets: Vec::new(),
            glsl_import: None,
            workgroup_size: [0; 3],
            builtin_values: HashMap::new(),
            interface: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Symbols
    // ---------------------------------------------------------------------

    fn push_symbol(&mut self, name: &str, binding: SymbolBinding) {
        self.symbol_table.entry(name.to_string()).or_default().push(binding);
    }

    fn pop_symbol(&mut self, name: &str) {
        if let Some(stack) = self.symbol_table.get_mut(name) {
            stack.pop();
        }
    }

    fn lookup(&self, name: &str) -> Result<SymbolBinding> {
        self.symbol_table
            .get(name)
            .and_then(|s| s.last())
            .copied()
            .ok_or_else(|| err_spirv!("unknown symbol: {}", name))
    }

    fn buffer_info(&self, name: &str) -> Result<BufferInfo> {
        self.buffers
            .get(name)
            .and_then(|s| s.last())
            .copied()
            .ok_or_else(|| err_spirv!("unknown buffer: {}", name))
    }

    // ---------------------------------------------------------------------
    // Kernel compilation
    // ---------------------------------------------------------------------

    fn compile_kernel(&mut self, entry_point_index: u32, kernel: &Kernel) -> Result<()> {
        debug!("compiling kernel {} ({})", kernel.name, entry_point_index);
        self.workgroup_size = [0; 3];
        self.builtin_values.clear();
        self.interface.clear();

        let body = scalarize_predicated_ops(&kernel.body);
        reject_unsupported(&body)?;

        let void_type = self.builder.declare_void_type();
        let fn_type = self.builder.declare_function_type(void_type, vec![]);
        let func_id = self
            .builder
            .create_function(void_type, fn_type, spv::FunctionControl::NONE);
        self.builder.add_symbol(func_id, &kernel.name);

        // Only built-ins the kernel actually reads join the interface.
        let builtins = find_used_builtins(&body)?;
        for builtin in builtins {
            let u32x3 = self.builder.declare_type(Type::uint(32, 3));
            let ptr = self.builder.declare_pointer_type(u32x3, spv::StorageClass::Input);
            let var = self.builder.declare_global_variable(
                builtin.name(),
                ptr,
                spv::StorageClass::Input,
                None,
            );
            self.builder.add_annotation(
                var,
                spv::Decoration::BuiltIn,
                &[builtin.spv_builtin() as u32],
            );
            self.interface.push(var);
            // Load once at function entry.
            let value = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::Load)
                    .with_type(u32x3)
                    .with_result(value)
                    .id(var),
            );
            self.builtin_values.insert(builtin, value);
        }

        let descriptor_set = self.declare_device_args(entry_point_index, kernel)?;

        self.emit_stmt(&body)?;
        if !self.builder.current_block_terminated() {
            self.builder.append(Instruction::new(spv::Op::Return));
        }
        self.builder.end_function();

        self.builder.add_entry_point(
            &kernel.name,
            func_id,
            spv::ExecutionModel::GLCompute,
            &self.interface,
        );
        self.declare_workgroup_size(func_id);
        self.descriptor_sets.push(descriptor_set);

        // Bindings are per entry point; drop them before the next kernel.
        for arg in &kernel.args {
            self.pop_symbol(&arg.name);
            if arg.kind == ArgKind::Buffer {
                if let Some(stack) = self.buffers.get_mut(&arg.name) {
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    fn declare_workgroup_size(&mut self, func_id: SpvId) {
        let size = self.workgroup_size.map(|d| d.max(1));
        self.builder.add_execution_mode_local_size(func_id, size);
    }

    /// Bind kernel arguments: one packed uniform block for scalars, one
    /// BufferBlock runtime array per device buffer.
    fn declare_device_args(
        &mut self,
        entry_point_index: u32,
        kernel: &Kernel,
    ) -> Result<DescriptorSet> {
        let mut descriptor_set = DescriptorSet {
            entry_point_name: kernel.name.clone(),
            uniform_buffer_count: 0,
            storage_buffer_count: 0,
        };

        // Narrow buffer elements need the matching storage extension.
        for arg in &kernel.args {
            if arg.kind == ArgKind::Buffer && arg.ty.is_int_or_uint() {
                match arg.ty.bits {
                    8 => self.builder.require_extension("SPV_KHR_8bit_storage"),
                    16 => self.builder.require_extension("SPV_KHR_16bit_storage"),
                    _ => {}
                }
            }
        }

        let scalar_args: Vec<&KernelArg> =
            kernel.args.iter().filter(|a| a.kind == ArgKind::Scalar).collect();
        let mut binding_counter = 0u32;

        if !scalar_args.is_empty() {
            let members: Vec<SpvId> = scalar_args
                .iter()
                .map(|a| self.builder.declare_type(a.ty))
                .collect();
            let struct_name = format!("_struct{}_args", kernel.name);
            let param_struct = self.builder.declare_struct(&struct_name, members);

            let mut offset = 0u32;
            for (index, arg) in scalar_args.iter().enumerate() {
                self.builder.add_struct_annotation(
                    param_struct,
                    index as u32,
                    spv::Decoration::Offset,
                    &[offset],
                );
                offset += arg.ty.bytes();
            }
            self.builder.add_annotation(param_struct, spv::Decoration::Block, &[]);

            let ptr = self
                .builder
                .declare_pointer_type(param_struct, spv::StorageClass::Uniform);
            let var_name = format!("_var{}_args", kernel.name);
            let param_pack =
                self.builder
                    .declare_global_variable(&var_name, ptr, spv::StorageClass::Uniform, None);
            self.builder.add_annotation(
                param_pack,
                spv::Decoration::DescriptorSet,
                &[entry_point_index],
            );
            self.builder
                .add_annotation(param_pack, spv::Decoration::Binding, &[binding_counter]);
            descriptor_set.uniform_buffer_count += 1;
            binding_counter += 1;

            // Load each scalar once at entry and bind it by name.
            for (index, arg) in scalar_args.iter().enumerate() {
                let arg_type = self.builder.declare_type(arg.ty);
                let index_id = self
                    .builder
                    .declare_constant(Type::uint(32, 1), ConstData::UInt(index as u64));
                let member_ptr_type = self
                    .builder
                    .declare_pointer_type(arg_type, spv::StorageClass::Uniform);
                let chain = self.builder.reserve_id(SpvKind::AccessChain);
                self.builder.append(
                    Instruction::new(spv::Op::AccessChain)
                        .with_type(member_ptr_type)
                        .with_result(chain)
                        .id(param_pack)
                        .id(index_id),
                );
                let value = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::Load)
                        .with_type(arg_type)
                        .with_result(value)
                        .id(chain),
                );
                self.push_symbol(
                    &arg.name,
                    SymbolBinding {
                        id: value,
                        storage_class: spv::StorageClass::Uniform,
                    },
                );
            }
        }

        for arg in &kernel.args {
            if arg.kind != ArgKind::Buffer {
                continue;
            }
            let elem_type_id = self.builder.declare_type(arg.ty);
            let runtime_array = self.builder.declare_runtime_array_type(elem_type_id);
            self.builder.add_annotation(
                runtime_array,
                spv::Decoration::ArrayStride,
                &[arg.ty.bytes()],
            );
            let struct_name = format!("_struct{}_b{}", kernel.name, binding_counter);
            let block_struct = self.builder.declare_struct(&struct_name, vec![runtime_array]);
            self.builder
                .add_annotation(block_struct, spv::Decoration::BufferBlock, &[]);
            self.builder
                .add_struct_annotation(block_struct, 0, spv::Decoration::Offset, &[0]);

            let ptr = self
                .builder
                .declare_pointer_type(block_struct, spv::StorageClass::Uniform);
            let var = self.builder.declare_global_variable(
                &arg.name,
                ptr,
                spv::StorageClass::Uniform,
                None,
            );
            self.builder.add_annotation(
                var,
                spv::Decoration::DescriptorSet,
                &[entry_point_index],
            );
            self.builder
                .add_annotation(var, spv::Decoration::Binding, &[binding_counter]);
            binding_counter += 1;
            descriptor_set.storage_buffer_count += 1;

            self.push_symbol(
                &arg.name,
                SymbolBinding {
                    id: var,
                    storage_class: spv::StorageClass::Uniform,
                },
            );
            self.buffers.entry(arg.name.clone()).or_default().push(BufferInfo {
                elem_ty: arg.ty,
                elem_type_id,
                struct_wrapped: true,
            });
        }

        Ok(descriptor_set)
    }

    // ---------------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------------

    fn emit_stmt(&mut self, s: &Stmt) -> Result<()> {
        match s {
            Stmt::Block(stmts) => {
                for stmt in stmts {
                    self.emit_stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::LetStmt { name, value, body } => {
                let id = self.emit_expr(value)?;
                self.push_symbol(
                    name,
                    SymbolBinding {
                        id,
                        storage_class: spv::StorageClass::Function,
                    },
                );
                let r = self.emit_stmt(body);
                self.pop_symbol(name);
                r
            }
            Stmt::Evaluate(e) => {
                self.emit_expr(e)?;
                Ok(())
            }
            // Assertions are checked on the host; a compute shader cannot
            // trap, so nothing is emitted.
            Stmt::AssertStmt { .. } => Ok(()),
            Stmt::Store {
                name,
                value,
                index,
                predicate,
            } => {
                if predicate.is_some() {
                    bail_spirv!("predicated store of {} must be scalarized first", name);
                }
                self.emit_store(name, value, index)
            }
            Stmt::For {
                name,
                min,
                extent,
                kind,
                body,
            } => match kind {
                ForKind::GpuBlock | ForKind::GpuThread => {
                    self.emit_gpu_loop(name, min, extent, body)
                }
                ForKind::Serial => self.emit_serial_loop(name, min, extent, body),
            },
            Stmt::IfThenElse {
                condition,
                then_case,
                else_case,
            } => self.emit_if_stmt(condition, then_case, else_case.as_deref()),
            Stmt::Allocate {
                name,
                ty,
                extents,
                memory,
                body,
            } => self.emit_allocate(name, *ty, extents, *memory, body),
            // The enclosing Allocate owns the binding; shader storage has
            // no explicit free.
            Stmt::Free { .. } => Ok(()),
            Stmt::Fork(..) => bail_unsupported!("Fork cannot be expressed in a compute shader"),
            Stmt::Acquire { .. } => {
                bail_unsupported!("Acquire cannot be expressed in a compute shader")
            }
            Stmt::Prefetch { .. } => {
                bail_unsupported!("Prefetch cannot be expressed in a compute shader")
            }
        }
    }

    fn emit_gpu_loop(&mut self, name: &str, min: &Expr, extent: &Expr, body: &Stmt) -> Result<()> {
        if min.as_const_int() != Some(0) {
            bail_spirv!("gpu loop {} must start at zero", name);
        }
        let (builtin, dim) = simt_intrinsic(name)?;

        // Validate and record the workgroup extent for thread loops.
        if let Some(idx) = thread_loop_workgroup_index(name) {
            let Some(size) = extent.as_const_int() else {
                bail_spirv!("workgroup size must be statically known: {}", name);
            };
            let size = size as u32;
            if self.workgroup_size[idx] != 0 && self.workgroup_size[idx] != size {
                bail_spirv!(
                    "conflicting workgroup sizes in dimension {}: {} vs {}",
                    idx,
                    self.workgroup_size[idx],
                    size
                );
            }
            self.workgroup_size[idx] = size;
        }

        let &loaded = self
            .builtin_values
            .get(&builtin)
            .ok_or_else(|| err_spirv!("gpu built-in {} was not preloaded", builtin.name()))?;
        let u32_type = self.builder.declare_type(Type::uint(32, 1));
        let i32_type = self.builder.declare_type(Type::int(32, 1));
        let unsigned = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::CompositeExtract)
                .with_type(u32_type)
                .with_result(unsigned)
                .id(loaded)
                .imm(dim),
        );
        let signed = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::Bitcast)
                .with_type(i32_type)
                .with_result(signed)
                .id(unsigned),
        );
        self.push_symbol(
            name,
            SymbolBinding {
                id: signed,
                storage_class: spv::StorageClass::Input,
            },
        );
        let r = self.emit_stmt(body);
        self.pop_symbol(name);
        r
    }

    /// entry -> header -> top (cond) -> body -> continue -> header, with a
    /// merge block on the exit edge.
    fn emit_serial_loop(
        &mut self,
        name: &str,
        min: &Expr,
        extent: &Expr,
        body: &Stmt,
    ) -> Result<()> {
        let index_ty = min.ty;
        let index_type_id = self.builder.declare_type(index_ty);
        let min_id = self.emit_expr(min)?;
        let extent_id = self.emit_expr(extent)?;

        let max_id = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::IAdd)
                .with_type(index_type_id)
                .with_result(max_id)
                .id(min_id)
                .id(extent_id),
        );

        let index_ptr_type = self
            .builder
            .declare_pointer_type(index_type_id, spv::StorageClass::Function);
        let loop_var =
            self.builder
                .declare_local_variable(&format!("{}_idx", name), index_ptr_type, Some(min_id));

        let header = self.builder.reserve_block_label();
        let top = self.builder.reserve_block_label();
        let body_label = self.builder.reserve_block_label();
        let continue_label = self.builder.reserve_block_label();
        let merge = self.builder.reserve_block_label();

        self.builder.add_block(header);
        self.builder.append(
            Instruction::new(spv::Op::LoopMerge)
                .id(merge)
                .id(continue_label)
                .imm(spv::LoopControl::NONE.bits()),
        );
        self.builder.append(Instruction::new(spv::Op::Branch).id(top));

        self.builder.add_block(top);
        let current = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::Load)
                .with_type(index_type_id)
                .with_result(current)
                .id(loop_var),
        );
        let bool_type = self.builder.declare_type(Type::bool(1));
        let test = self.builder.reserve_id(SpvKind::Result);
        let cmp_op = if index_ty.is_uint() {
            spv::Op::ULessThan
        } else {
            spv::Op::SLessThan
        };
        self.builder.append(
            Instruction::new(cmp_op)
                .with_type(bool_type)
                .with_result(test)
                .id(current)
                .id(max_id),
        );
        self.builder.append(
            Instruction::new(spv::Op::BranchConditional)
                .id(test)
                .id(body_label)
                .id(merge),
        );

        self.builder.add_block(body_label);
        self.push_symbol(
            name,
            SymbolBinding {
                id: current,
                storage_class: spv::StorageClass::Function,
            },
        );
        let r = self.emit_stmt(body);
        self.pop_symbol(name);
        r?;
        self.builder
            .append(Instruction::new(spv::Op::Branch).id(continue_label));

        self.builder.add_block(continue_label);
        let one = self.const_int_of(index_ty, 1);
        let next = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::IAdd)
                .with_type(index_type_id)
                .with_result(next)
                .id(current)
                .id(one),
        );
        self.builder.append(
            Instruction::new(spv::Op::Store).id(loop_var).id(next),
        );
        self.builder.append(Instruction::new(spv::Op::Branch).id(header));

        self.builder.add_block(merge);
        Ok(())
    }

    fn emit_if_stmt(
        &mut self,
        condition: &Expr,
        then_case: &Stmt,
        else_case: Option<&Stmt>,
    ) -> Result<()> {
        let cond = self.emit_expr(condition)?;
        let then_label = self.builder.reserve_block_label();
        let merge = self.builder.reserve_block_label();
        let else_label = if else_case.is_some() {
            self.builder.reserve_block_label()
        } else {
            merge
        };

        self.builder.append(
            Instruction::new(spv::Op::SelectionMerge)
                .id(merge)
                .imm(spv::SelectionControl::NONE.bits()),
        );
        self.builder.append(
            Instruction::new(spv::Op::BranchConditional)
                .id(cond)
                .id(then_label)
                .id(else_label),
        );

        self.builder.add_block(then_label);
        self.emit_stmt(then_case)?;
        if !self.builder.current_block_terminated() {
            self.builder.append(Instruction::new(spv::Op::Branch).id(merge));
        }
        if let Some(else_case) = else_case {
            self.builder.add_block(else_label);
            self.emit_stmt(else_case)?;
            if !self.builder.current_block_terminated() {
                self.builder.append(Instruction::new(spv::Op::Branch).id(merge));
            }
        }
        self.builder.add_block(merge);
        Ok(())
    }

    fn emit_allocate(
        &mut self,
        name: &str,
        ty: Type,
        extents: &[Expr],
        memory: MemoryScope,
        body: &Stmt,
    ) -> Result<()> {
        let mut total: u32 = 1;
        for e in extents {
            let Some(v) = e.as_const_int() else {
                bail_spirv!("allocation {} must have a statically-known size", name);
            };
            total = total
                .checked_mul(v as u32)
                .ok_or_else(|| err_spirv!("allocation {} overflows", name))?;
        }
        let elem_type_id = self.builder.declare_type(ty);
        let array_type = self.builder.declare_array_type(elem_type_id, total);
        let (storage_class, var) = match memory {
            MemoryScope::Stack => {
                let ptr = self
                    .builder
                    .declare_pointer_type(array_type, spv::StorageClass::Function);
                let var = self.builder.declare_local_variable(name, ptr, None);
                (spv::StorageClass::Function, var)
            }
            MemoryScope::Shared => {
                let ptr = self
                    .builder
                    .declare_pointer_type(array_type, spv::StorageClass::Workgroup);
                let var = self.builder.declare_global_variable(
                    name,
                    ptr,
                    spv::StorageClass::Workgroup,
                    None,
                );
                self.interface.push(var);
                (spv::StorageClass::Workgroup, var)
            }
        };
        self.push_symbol(
            name,
            SymbolBinding {
                id: var,
                storage_class,
            },
        );
        self.buffers.entry(name.to_string()).or_default().push(BufferInfo {
            elem_ty: ty,
            elem_type_id,
            struct_wrapped: false,
        });
        let r = self.emit_stmt(body);
        self.pop_symbol(name);
        if let Some(stack) = self.buffers.get_mut(name) {
            stack.pop();
        }
        r
    }

    // ---------------------------------------------------------------------
    // Loads and stores
    // ---------------------------------------------------------------------

    /// A pointer to one element of a named buffer or allocation. Buffer
    /// blocks index through the wrapping struct; workgroup and stack arrays
    /// index directly.
    fn elem_pointer(&mut self, name: &str, index_id: SpvId) -> Result<SpvId> {
        let binding = self.lookup(name)?;
        let info = self.buffer_info(name)?;
        let elem_ptr_type = self
            .builder
            .declare_pointer_type(info.elem_type_id, binding.storage_class);
        let chain = self.builder.reserve_id(SpvKind::AccessChain);
        let mut inst = Instruction::new(spv::Op::AccessChain)
            .with_type(elem_ptr_type)
            .with_result(chain)
            .id(binding.id);
        if info.struct_wrapped {
            let zero = self
                .builder
                .declare_constant(Type::uint(32, 1), ConstData::UInt(0));
            inst = inst.id(zero);
        }
        self.builder.append(inst.id(index_id));
        Ok(chain)
    }

    /// A stride-1 ramp over a vector-element buffer collapses to one whole-
    /// vector access at `base / lanes`.
    fn dense_ramp_base(&mut self, name: &str, index: &Expr) -> Result<Option<SpvId>> {
        let info = self.buffer_info(name)?;
        let ExprKind::Ramp { base, stride, lanes } = index.kind() else {
            return Ok(None);
        };
        if stride.as_const_int() != Some(1) || !info.elem_ty.is_vector() {
            return Ok(None);
        }
        if info.elem_ty.lanes != *lanes {
            return Ok(None);
        }
        let base_id = self.emit_expr(base)?;
        let lanes_id = self.const_int_of(base.ty, *lanes as i128);
        let base_type = self.builder.declare_type(base.ty);
        let div_op = if base.ty.is_uint() {
            spv::Op::UDiv
        } else {
            spv::Op::SDiv
        };
        let elem_index = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(div_op)
                .with_type(base_type)
                .with_result(elem_index)
                .id(base_id)
                .id(lanes_id),
        );
        Ok(Some(elem_index))
    }

    fn emit_load(&mut self, ty: Type, name: &str, index: &Expr) -> Result<SpvId> {
        let info = self.buffer_info(name)?;
        if ty.is_scalar() || info.elem_ty.is_vector() {
            // Whole-element load: scalar, or a dense vector access.
            let index_id = if ty.is_scalar() {
                self.emit_expr(index)?
            } else {
                match self.dense_ramp_base(name, index)? {
                    Some(id) => id,
                    None => return self.emit_gathered_load(ty, name, index),
                }
            };
            let type_id = self.builder.declare_type(info.elem_ty);
            let ptr = self.elem_pointer(name, index_id)?;
            let value = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::Load)
                    .with_type(type_id)
                    .with_result(value)
                    .id(ptr),
            );
            Ok(value)
        } else {
            self.emit_gathered_load(ty, name, index)
        }
    }

    /// Gather lane by lane through a scalar access chain per lane.
    fn emit_gathered_load(&mut self, ty: Type, name: &str, index: &Expr) -> Result<SpvId> {
        let info = self.buffer_info(name)?;
        let index_vec = self.emit_expr(index)?;
        let lane_index_type = self.builder.declare_type(index.ty.element_of());
        let elem_type_id = info.elem_type_id;
        let mut lanes = Vec::with_capacity(ty.lanes as usize);
        for lane in 0..ty.lanes {
            let lane_index = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::CompositeExtract)
                    .with_type(lane_index_type)
                    .with_result(lane_index)
                    .id(index_vec)
                    .imm(lane as u32),
            );
            let ptr = self.elem_pointer(name, lane_index)?;
            let value = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::Load)
                    .with_type(elem_type_id)
                    .with_result(value)
                    .id(ptr),
            );
            lanes.push(value);
        }
        let vec_type = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::CompositeConstruct)
                .with_type(vec_type)
                .with_result(result)
                .ids(lanes),
        );
        Ok(result)
    }

    fn emit_store(&mut self, name: &str, value: &Expr, index: &Expr) -> Result<()> {
        let info = self.buffer_info(name)?;
        let value_id = self.emit_expr(value)?;
        if value.ty.is_scalar() || info.elem_ty.is_vector() {
            let index_id = if value.ty.is_scalar() {
                self.emit_expr(index)?
            } else {
                match self.dense_ramp_base(name, index)? {
                    Some(id) => id,
                    None => return self.emit_scattered_store(name, value_id, value.ty, index),
                }
            };
            let ptr = self.elem_pointer(name, index_id)?;
            self.builder
                .append(Instruction::new(spv::Op::Store).id(ptr).id(value_id));
            Ok(())
        } else {
            self.emit_scattered_store(name, value_id, value.ty, index)
        }
    }

    fn emit_scattered_store(
        &mut self,
        name: &str,
        value_id: SpvId,
        value_ty: Type,
        index: &Expr,
    ) -> Result<()> {
        let elem_type_id = self.buffer_info(name)?.elem_type_id;
        let index_vec = self.emit_expr(index)?;
        let lane_index_type = self.builder.declare_type(index.ty.element_of());
        for lane in 0..value_ty.lanes {
            let lane_index = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::CompositeExtract)
                    .with_type(lane_index_type)
                    .with_result(lane_index)
                    .id(index_vec)
                    .imm(lane as u32),
            );
            let lane_value = self.builder.reserve_id(SpvKind::Result);
            self.builder.append(
                Instruction::new(spv::Op::CompositeExtract)
                    .with_type(elem_type_id)
                    .with_result(lane_value)
                    .id(value_id)
                    .imm(lane as u32),
            );
            let ptr = self.elem_pointer(name, lane_index)?;
            self.builder
                .append(Instruction::new(spv::Op::Store).id(ptr).id(lane_value));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn const_int_of(&mut self, ty: Type, v: i128) -> SpvId {
        let data = if ty.is_uint() {
            ConstData::UInt(v as u64)
        } else {
            ConstData::Int(v as i64)
        };
        self.builder.declare_constant(ty.element_of(), data)
    }

    fn emit_expr(&mut self, e: &Expr) -> Result<SpvId> {
        match e.kind() {
            ExprKind::IntImm(v) => match e.ty.bits {
                8 | 16 | 32 | 64 => Ok(self.builder.declare_constant(e.ty, ConstData::Int(*v))),
                _ => bail_type!("unsupported integer immediate width: {}", e.ty),
            },
            ExprKind::UIntImm(v) => {
                if e.ty.is_bool() {
                    return Ok(self.builder.declare_constant(e.ty, ConstData::Bool(*v != 0)));
                }
                match e.ty.bits {
                    8 | 16 | 32 | 64 => {
                        Ok(self.builder.declare_constant(e.ty, ConstData::UInt(*v)))
                    }
                    _ => bail_type!("unsupported integer immediate width: {}", e.ty),
                }
            }
            ExprKind::FloatImm(v) => match e.ty.bits {
                32 | 64 => Ok(self
                    .builder
                    .declare_constant(e.ty, ConstData::Float(v.value()))),
                _ => bail_type!("unsupported float immediate width: {}", e.ty),
            },
            ExprKind::StringImm(s) => bail_spirv!("string {:?} has no device representation", s),
            ExprKind::Var(name) => Ok(self.lookup(name)?.id),
            ExprKind::Cast(value) => self.emit_cast(e.ty, value),
            ExprKind::Reinterpret(value) => {
                let src = self.emit_expr(value)?;
                let type_id = self.builder.declare_type(e.ty);
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::Bitcast)
                        .with_type(type_id)
                        .with_result(result)
                        .id(src),
                );
                Ok(result)
            }
            ExprKind::Add(a, b) => self.emit_binop(e.ty, a, b, Self::arith_op(e.ty, "add")?),
            ExprKind::Sub(a, b) => self.emit_binop(e.ty, a, b, Self::arith_op(e.ty, "sub")?),
            ExprKind::Mul(a, b) => self.emit_binop(e.ty, a, b, Self::arith_op(e.ty, "mul")?),
            ExprKind::Div(a, b) => {
                if e.ty.is_float() {
                    self.emit_binop(e.ty, a, b, spv::Op::FDiv)
                } else {
                    // Shared euclidean lowering, then re-emit.
                    let lowered = lower::lower_int_uint_div(a, b);
                    self.emit_expr(&lowered)
                }
            }
            ExprKind::Mod(a, b) => {
                if e.ty.is_float() {
                    self.emit_binop(e.ty, a, b, spv::Op::FMod)
                } else {
                    let lowered = lower::lower_int_uint_mod(a, b);
                    self.emit_expr(&lowered)
                }
            }
            ExprKind::Min(a, b) => self.emit_min_max(e.ty, a, b, true),
            ExprKind::Max(a, b) => self.emit_min_max(e.ty, a, b, false),
            ExprKind::Eq(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Eq),
            ExprKind::Ne(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Ne),
            ExprKind::Lt(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Lt),
            ExprKind::Le(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Le),
            ExprKind::Gt(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Gt),
            ExprKind::Ge(a, b) => self.emit_compare(a, b, e.ty, CmpKind::Ge),
            ExprKind::And(a, b) => self.emit_binop(e.ty, a, b, spv::Op::LogicalAnd),
            ExprKind::Or(a, b) => self.emit_binop(e.ty, a, b, spv::Op::LogicalOr),
            ExprKind::Not(a) => {
                let src = self.emit_expr(a)?;
                let type_id = self.builder.declare_type(e.ty);
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::LogicalNot)
                        .with_type(type_id)
                        .with_result(result)
                        .id(src),
                );
                Ok(result)
            }
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => {
                let c = self.emit_expr(condition)?;
                let t = self.emit_expr(true_value)?;
                let f = self.emit_expr(false_value)?;
                let type_id = self.builder.declare_type(e.ty);
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::Select)
                        .with_type(type_id)
                        .with_result(result)
                        .id(c)
                        .id(t)
                        .id(f),
                );
                Ok(result)
            }
            ExprKind::Load {
                name,
                index,
                predicate,
            } => {
                if predicate.is_some() {
                    bail_spirv!("predicated load of {} must be scalarized first", name);
                }
                self.emit_load(e.ty, name, index)
            }
            ExprKind::Ramp { base, stride, lanes } => {
                let base_type = self.builder.declare_type(base.ty);
                let base_id = self.emit_expr(base)?;
                let stride_id = self.emit_expr(stride)?;
                let add_op = if base.ty.is_float() {
                    spv::Op::FAdd
                } else {
                    spv::Op::IAdd
                };
                let mut prev = base_id;
                let mut lanes_ids = vec![base_id];
                for _ in 1..*lanes {
                    let next = self.builder.reserve_id(SpvKind::Result);
                    self.builder.append(
                        Instruction::new(add_op)
                            .with_type(base_type)
                            .with_result(next)
                            .id(prev)
                            .id(stride_id),
                    );
                    lanes_ids.push(next);
                    prev = next;
                }
                let vec_type = self.builder.declare_type(e.ty);
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::CompositeConstruct)
                        .with_type(vec_type)
                        .with_result(result)
                        .ids(lanes_ids),
                );
                Ok(result)
            }
            ExprKind::Broadcast { value, lanes } => {
                let v = self.emit_expr(value)?;
                let vec_type = self.builder.declare_type(e.ty);
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::CompositeConstruct)
                        .with_type(vec_type)
                        .with_result(result)
                        .ids(std::iter::repeat(v).take(*lanes as usize)),
                );
                Ok(result)
            }
            ExprKind::Shuffle { vectors, indices } => self.emit_shuffle(e.ty, vectors, indices),
            ExprKind::Let { name, value, body } => {
                let id = self.emit_expr(value)?;
                self.push_symbol(
                    name,
                    SymbolBinding {
                        id,
                        storage_class: spv::StorageClass::Function,
                    },
                );
                let r = self.emit_expr(body);
                self.pop_symbol(name);
                r
            }
            ExprKind::Call { op, args } => self.emit_call(e, op, args),
            ExprKind::VectorReduce { .. } => {
                bail_unsupported!("VectorReduce cannot be expressed in a compute shader")
            }
        }
    }

    fn arith_op(ty: Type, which: &str) -> Result<spv::Op> {
        let op = match (ty.code, which) {
            (TypeCode::Float, "add") => spv::Op::FAdd,
            (TypeCode::Float, "sub") => spv::Op::FSub,
            (TypeCode::Float, "mul") => spv::Op::FMul,
            (TypeCode::Int | TypeCode::UInt, "add") => spv::Op::IAdd,
            (TypeCode::Int | TypeCode::UInt, "sub") => spv::Op::ISub,
            (TypeCode::Int | TypeCode::UInt, "mul") => spv::Op::IMul,
            _ => bail_type!("no {} for type {}", which, ty),
        };
        Ok(op)
    }

    fn emit_binop(&mut self, ty: Type, a: &Expr, b: &Expr, op: spv::Op) -> Result<SpvId> {
        let a_id = self.emit_expr(a)?;
        let b_id = self.emit_expr(b)?;
        let type_id = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(op)
                .with_type(type_id)
                .with_result(result)
                .id(a_id)
                .id(b_id),
        );
        Ok(result)
    }

    /// min/max evaluate each operand exactly once, then select.
    fn emit_min_max(&mut self, ty: Type, a: &Expr, b: &Expr, is_min: bool) -> Result<SpvId> {
        let a_id = self.emit_expr(a)?;
        let b_id = self.emit_expr(b)?;
        let bool_type = self.builder.declare_type(Type::bool(ty.lanes));
        let lt_op = match ty.code {
            TypeCode::Float => spv::Op::FOrdLessThan,
            TypeCode::Int => spv::Op::SLessThan,
            TypeCode::UInt => spv::Op::ULessThan,
            _ => bail_type!("no ordering for type {}", ty),
        };
        let test = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(lt_op)
                .with_type(bool_type)
                .with_result(test)
                .id(a_id)
                .id(b_id),
        );
        let type_id = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        let (t, f) = if is_min { (a_id, b_id) } else { (b_id, a_id) };
        self.builder.append(
            Instruction::new(spv::Op::Select)
                .with_type(type_id)
                .with_result(result)
                .id(test)
                .id(t)
                .id(f),
        );
        Ok(result)
    }

    fn emit_compare(&mut self, a: &Expr, b: &Expr, out_ty: Type, kind: CmpKind) -> Result<SpvId> {
        let op = match (a.ty.code, kind) {
            (TypeCode::Float, CmpKind::Eq) => spv::Op::FOrdEqual,
            (TypeCode::Float, CmpKind::Ne) => spv::Op::FOrdNotEqual,
            (TypeCode::Float, CmpKind::Lt) => spv::Op::FOrdLessThan,
            (TypeCode::Float, CmpKind::Le) => spv::Op::FOrdLessThanEqual,
            (TypeCode::Float, CmpKind::Gt) => spv::Op::FOrdGreaterThan,
            (TypeCode::Float, CmpKind::Ge) => spv::Op::FOrdGreaterThanEqual,
            (TypeCode::Int | TypeCode::UInt, CmpKind::Eq) => spv::Op::IEqual,
            (TypeCode::Int | TypeCode::UInt, CmpKind::Ne) => spv::Op::INotEqual,
            (TypeCode::Int, CmpKind::Lt) => spv::Op::SLessThan,
            (TypeCode::Int, CmpKind::Le) => spv::Op::SLessThanEqual,
            (TypeCode::Int, CmpKind::Gt) => spv::Op::SGreaterThan,
            (TypeCode::Int, CmpKind::Ge) => spv::Op::SGreaterThanEqual,
            (TypeCode::UInt, CmpKind::Lt) => spv::Op::ULessThan,
            (TypeCode::UInt, CmpKind::Le) => spv::Op::ULessThanEqual,
            (TypeCode::UInt, CmpKind::Gt) => spv::Op::UGreaterThan,
            (TypeCode::UInt, CmpKind::Ge) => spv::Op::UGreaterThanEqual,
            (TypeCode::Bool, CmpKind::Eq) => spv::Op::LogicalEqual,
            (TypeCode::Bool, CmpKind::Ne) => spv::Op::LogicalNotEqual,
            _ => bail_type!("no comparison for type {}", a.ty),
        };
        self.emit_binop(out_ty, a, b, op)
    }

    fn emit_cast(&mut self, to: Type, value: &Expr) -> Result<SpvId> {
        let from = value.ty;
        let src = self.emit_expr(value)?;
        let op = match (from.code, to.code) {
            (TypeCode::Float, TypeCode::Float) => spv::Op::FConvert,
            (TypeCode::Float, TypeCode::UInt) => spv::Op::ConvertFToU,
            (TypeCode::Float, TypeCode::Int) => spv::Op::ConvertFToS,
            (TypeCode::UInt, TypeCode::Float) => spv::Op::ConvertUToF,
            (TypeCode::Int, TypeCode::Float) => spv::Op::ConvertSToF,
            (TypeCode::Int | TypeCode::UInt, TypeCode::Int | TypeCode::UInt) => {
                if from.bits == to.bits {
                    spv::Op::Bitcast
                } else if from.is_uint() {
                    spv::Op::UConvert
                } else {
                    spv::Op::SConvert
                }
            }
            _ => bail_type!("no conversion from {} to {}", from, to),
        };
        // Cross-signedness width changes convert in the source signedness,
        // then reinterpret at the target width.
        let needs_bitcast = op != spv::Op::Bitcast
            && from.is_int_or_uint()
            && to.is_int_or_uint()
            && from.code != to.code;
        let convert_ty = if needs_bitcast {
            to.with_code(from.code)
        } else {
            to
        };
        let type_id = self.builder.declare_type(convert_ty);
        let converted = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(op)
                .with_type(type_id)
                .with_result(converted)
                .id(src),
        );
        if !needs_bitcast {
            return Ok(converted);
        }
        let final_type = self.builder.declare_type(to);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::Bitcast)
                .with_type(final_type)
                .with_result(result)
                .id(converted),
        );
        Ok(result)
    }

    fn emit_shuffle(&mut self, ty: Type, vectors: &[Expr], indices: &[u32]) -> Result<SpvId> {
        let ids: Vec<SpvId> = vectors
            .iter()
            .map(|v| self.emit_expr(v))
            .collect::<Result<_>>()?;
        if vectors.len() <= 2 && vectors[0].ty.is_vector() {
            // Two-source lane select maps directly onto OpVectorShuffle.
            let a = ids[0];
            let b = if ids.len() == 2 { ids[1] } else { ids[0] };
            if indices.len() == 1 {
                let elem_type = self.builder.declare_type(ty.element_of());
                let result = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::CompositeExtract)
                        .with_type(elem_type)
                        .with_result(result)
                        .id(a)
                        .imm(indices[0]),
                );
                return Ok(result);
            }
            let type_id = self.builder.declare_type(ty);
            let result = self.builder.reserve_id(SpvKind::Result);
            let mut inst = Instruction::new(spv::Op::VectorShuffle)
                .with_type(type_id)
                .with_result(result)
                .id(a)
                .id(b);
            for &i in indices {
                inst = inst.imm(i);
            }
            self.builder.append(inst);
            return Ok(result);
        }
        // General concatenation of scalar/vector pieces.
        let elem_type = self.builder.declare_type(ty.element_of());
        let mut pieces = Vec::with_capacity(indices.len());
        let lane_starts: Vec<u32> = vectors
            .iter()
            .scan(0u32, |acc, v| {
                let start = *acc;
                *acc += v.ty.lanes as u32;
                Some(start)
            })
            .collect();
        for &index in indices {
            let (vec_i, lane) = vectors
                .iter()
                .enumerate()
                .find_map(|(i, v)| {
                    let start = lane_starts[i];
                    (index >= start && index < start + v.ty.lanes as u32)
                        .then(|| (i, index - start))
                })
                .ok_or_else(|| err_spirv!("shuffle index {} out of range", index))?;
            if vectors[vec_i].ty.is_scalar() {
                pieces.push(ids[vec_i]);
            } else {
                let piece = self.builder.reserve_id(SpvKind::Result);
                self.builder.append(
                    Instruction::new(spv::Op::CompositeExtract)
                        .with_type(elem_type)
                        .with_result(piece)
                        .id(ids[vec_i])
                        .imm(lane),
                );
                pieces.push(piece);
            }
        }
        if ty.is_scalar() {
            return Ok(pieces[0]);
        }
        let type_id = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::CompositeConstruct)
                .with_type(type_id)
                .with_result(result)
                .ids(pieces),
        );
        Ok(result)
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    fn emit_call(&mut self, e: &Expr, op: &CallOp, args: &[Expr]) -> Result<SpvId> {
        match op {
            CallOp::Extern(name) => self.emit_extern_call(e, name, args),
            CallOp::Intrin(i) => match i {
                Intrinsic::GpuThreadBarrier => self.emit_barrier(&args[0]),
                Intrinsic::BitwiseAnd => self.emit_binop(e.ty, &args[0], &args[1], spv::Op::BitwiseAnd),
                Intrinsic::BitwiseOr => self.emit_binop(e.ty, &args[0], &args[1], spv::Op::BitwiseOr),
                Intrinsic::BitwiseXor => self.emit_binop(e.ty, &args[0], &args[1], spv::Op::BitwiseXor),
                Intrinsic::BitwiseNot => {
                    let src = self.emit_expr(&args[0])?;
                    let type_id = self.builder.declare_type(e.ty);
                    let result = self.builder.reserve_id(SpvKind::Result);
                    self.builder.append(
                        Instruction::new(spv::Op::Not)
                            .with_type(type_id)
                            .with_result(result)
                            .id(src),
                    );
                    Ok(result)
                }
                Intrinsic::ShiftLeft => {
                    self.emit_binop(e.ty, &args[0], &args[1], spv::Op::ShiftLeftLogical)
                }
                Intrinsic::ShiftRight => {
                    let op = if e.ty.is_uint() {
                        spv::Op::ShiftRightLogical
                    } else {
                        spv::Op::ShiftRightArithmetic
                    };
                    self.emit_binop(e.ty, &args[0], &args[1], op)
                }
                Intrinsic::DivRoundToZero => {
                    let op = match e.ty.code {
                        TypeCode::Float => spv::Op::FDiv,
                        TypeCode::Int => spv::Op::SDiv,
                        TypeCode::UInt => spv::Op::UDiv,
                        _ => bail_type!("div_round_to_zero of unhandled type {}", e.ty),
                    };
                    self.emit_binop(e.ty, &args[0], &args[1], op)
                }
                Intrinsic::ModRoundToZero => {
                    let op = match e.ty.code {
                        TypeCode::Float => spv::Op::FMod,
                        TypeCode::Int => spv::Op::SRem,
                        TypeCode::UInt => spv::Op::UMod,
                        _ => bail_type!("mod_round_to_zero of unhandled type {}", e.ty),
                    };
                    self.emit_binop(e.ty, &args[0], &args[1], op)
                }
                Intrinsic::Abs => {
                    if e.ty.is_float() {
                        self.emit_glsl_call(e.ty, spv::GLOp::FAbs, args)
                    } else {
                        // The result type is unsigned; compute in the signed
                        // type then reinterpret.
                        let signed_ty = args[0].ty;
                        let abs = self.emit_glsl_call(signed_ty, spv::GLOp::SAbs, args)?;
                        let type_id = self.builder.declare_type(e.ty);
                        let result = self.builder.reserve_id(SpvKind::Result);
                        self.builder.append(
                            Instruction::new(spv::Op::Bitcast)
                                .with_type(type_id)
                                .with_result(result)
                                .id(abs),
                        );
                        Ok(result)
                    }
                }
                Intrinsic::Round => self.emit_glsl_call(e.ty, spv::GLOp::RoundEven, args),
                Intrinsic::IsNan => {
                    let src = self.emit_expr(&args[0])?;
                    let type_id = self.builder.declare_type(e.ty);
                    let result = self.builder.reserve_id(SpvKind::Result);
                    self.builder.append(
                        Instruction::new(spv::Op::IsNan)
                            .with_type(type_id)
                            .with_result(result)
                            .id(src),
                    );
                    Ok(result)
                }
                Intrinsic::IsInf => {
                    let src = self.emit_expr(&args[0])?;
                    let type_id = self.builder.declare_type(e.ty);
                    let result = self.builder.reserve_id(SpvKind::Result);
                    self.builder.append(
                        Instruction::new(spv::Op::IsInf)
                            .with_type(type_id)
                            .with_result(result)
                            .id(src),
                    );
                    Ok(result)
                }
                Intrinsic::Absd => {
                    // |a - b| as a reinterpreted select, matching the
                    // recognizer's inverse.
                    let a = &args[0];
                    let b = &args[1];
                    let diff = ir::cast(
                        e.ty,
                        ir::select(
                            ir::lt(a.clone(), b.clone()),
                            ir::sub(b.clone(), a.clone()),
                            ir::sub(a.clone(), b.clone()),
                        ),
                    );
                    self.emit_expr(&diff)
                }
                Intrinsic::IfThenElse => self.emit_if_then_else_expr(e.ty, args),
                Intrinsic::WideningAdd
                | Intrinsic::WideningSub
                | Intrinsic::WideningMul
                | Intrinsic::WidenRightAdd
                | Intrinsic::WidenRightSub
                | Intrinsic::WidenRightMul
                | Intrinsic::WideningShiftLeft
                | Intrinsic::WideningShiftRight
                | Intrinsic::RoundingShiftLeft
                | Intrinsic::RoundingShiftRight
                | Intrinsic::SaturatingAdd
                | Intrinsic::SaturatingSub
                | Intrinsic::SaturatingCast
                | Intrinsic::HalvingAdd
                | Intrinsic::HalvingSub
                | Intrinsic::RoundingHalvingAdd
                | Intrinsic::MulShiftRight
                | Intrinsic::RoundingMulShiftRight
                | Intrinsic::SortedAvg => {
                    // No direct opcode on this target: go through the
                    // reference lowering.
                    let lowered = lower::lower_intrinsic_reference(e)
                        .ok_or_else(|| err_spirv!("no lowering for {}", i.name()))?;
                    self.emit_expr(&lowered)
                }
            },
        }
    }

    /// The expression form of if/then/else: a selection-merge diamond with
    /// a two-input phi at the merge block.
    fn emit_if_then_else_expr(&mut self, ty: Type, args: &[Expr]) -> Result<SpvId> {
        let cond = &args[0];
        if cond.ty.is_vector() {
            bail_spirv!("vector conditions must be scalarized before emission");
        }
        let cond_id = self.emit_expr(cond)?;
        let then_label = self.builder.reserve_block_label();
        let else_label = self.builder.reserve_block_label();
        let merge = self.builder.reserve_block_label();

        self.builder.append(
            Instruction::new(spv::Op::SelectionMerge)
                .id(merge)
                .imm(spv::SelectionControl::NONE.bits()),
        );
        self.builder.append(
            Instruction::new(spv::Op::BranchConditional)
                .id(cond_id)
                .id(then_label)
                .id(else_label),
        );

        self.builder.add_block(then_label);
        let then_value = self.emit_expr(&args[1])?;
        let then_pred = self.builder.current_block_label();
        self.builder.append(Instruction::new(spv::Op::Branch).id(merge));

        self.builder.add_block(else_label);
        let else_value = self.emit_expr(&args[2])?;
        let else_pred = self.builder.current_block_label();
        self.builder.append(Instruction::new(spv::Op::Branch).id(merge));

        self.builder.add_block(merge);
        let type_id = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::Phi)
                .with_type(type_id)
                .with_result(result)
                .id(then_value)
                .id(then_pred)
                .id(else_value)
                .id(else_pred),
        );
        Ok(result)
    }

    fn emit_barrier(&mut self, mask: &Expr) -> Result<SpvId> {
        let Some(fence) = mask.as_const_int() else {
            bail_spirv!("gpu_thread_barrier fence mask must be a constant");
        };
        let u32_1 = Type::uint(32, 1);
        let device = self
            .builder
            .declare_constant(u32_1, ConstData::UInt(spv::Scope::Device as u64));
        let workgroup = self
            .builder
            .declare_constant(u32_1, ConstData::UInt(spv::Scope::Workgroup as u64));

        let has_device = fence & intrin::fence::DEVICE as i128 != 0;
        let has_shared = fence & intrin::fence::SHARED as i128 != 0;
        if has_device && !has_shared {
            let semantics = spv::MemorySemantics::ACQUIRE_RELEASE
                | spv::MemorySemantics::WORKGROUP_MEMORY;
            let sem = self
                .builder
                .declare_constant(u32_1, ConstData::UInt(semantics.bits() as u64));
            self.builder.append(
                Instruction::new(spv::Op::ControlBarrier)
                    .id(device)
                    .id(device)
                    .id(sem),
            );
        } else if has_device {
            let semantics = spv::MemorySemantics::SEQUENTIALLY_CONSISTENT
                | spv::MemorySemantics::UNIFORM_MEMORY
                | spv::MemorySemantics::SUBGROUP_MEMORY
                | spv::MemorySemantics::WORKGROUP_MEMORY
                | spv::MemorySemantics::CROSS_WORKGROUP_MEMORY
                | spv::MemorySemantics::ATOMIC_COUNTER_MEMORY
                | spv::MemorySemantics::IMAGE_MEMORY;
            let sem = self
                .builder
                .declare_constant(u32_1, ConstData::UInt(semantics.bits() as u64));
            self.builder.append(
                Instruction::new(spv::Op::ControlBarrier)
                    .id(device)
                    .id(device)
                    .id(sem),
            );
        } else if has_shared {
            let semantics = spv::MemorySemantics::ACQUIRE_RELEASE
                | spv::MemorySemantics::WORKGROUP_MEMORY;
            let sem = self
                .builder
                .declare_constant(u32_1, ConstData::UInt(semantics.bits() as u64));
            self.builder.append(
                Instruction::new(spv::Op::MemoryBarrier).id(workgroup).id(sem),
            );
        } else {
            let sem = self
                .builder
                .declare_constant(u32_1, ConstData::UInt(spv::MemorySemantics::NONE.bits() as u64));
            self.builder.append(
                Instruction::new(spv::Op::ControlBarrier)
                    .id(device)
                    .id(device)
                    .id(sem),
            );
        }
        Ok(self.builder.declare_constant(Type::int(32, 1), ConstData::Int(0)))
    }

    fn emit_extern_call(&mut self, e: &Expr, name: &str, args: &[Expr]) -> Result<SpvId> {
        if let Some(glsl_op) = glsl_builtin(name) {
            return self.emit_glsl_call(e.ty, glsl_op, args);
        }
        bail_unsupported!("extern function {} has no device implementation", name)
    }

    fn emit_glsl_call(&mut self, ty: Type, glsl_op: spv::GLOp, args: &[Expr]) -> Result<SpvId> {
        // Imported lazily on first use.
        let import = match self.glsl_import {
            Some(id) => id,
            None => {
                let id = self.builder.import_instruction_set("GLSL.std.450");
                self.glsl_import = Some(id);
                id
            }
        };
        let arg_ids: Vec<SpvId> = args
            .iter()
            .map(|a| self.emit_expr(a))
            .collect::<Result<_>>()?;
        let type_id = self.builder.declare_type(ty);
        let result = self.builder.reserve_id(SpvKind::Result);
        self.builder.append(
            Instruction::new(spv::Op::ExtInst)
                .with_type(type_id)
                .with_result(result)
                .id(import)
                .imm(glsl_op as u32)
                .ids(arg_ids),
        );
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy)]
enum CmpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Extended-instruction mapping for the math externs the front end emits.
fn glsl_builtin(name: &str) -> Option<spv::GLOp> {
    let stem = name
        .strip_suffix("_f32")
        .or_else(|| name.strip_suffix("_f16"))?;
    let op = match stem {
        "acos" => spv::GLOp::Acos,
        "acosh" => spv::GLOp::Acosh,
        "asin" => spv::GLOp::Asin,
        "asinh" => spv::GLOp::Asinh,
        "atan" => spv::GLOp::Atan,
        "atan2" => spv::GLOp::Atan2,
        "atanh" => spv::GLOp::Atanh,
        "ceil" => spv::GLOp::Ceil,
        "cos" => spv::GLOp::Cos,
        "cosh" => spv::GLOp::Cosh,
        "exp" => spv::GLOp::Exp,
        "fast_inverse_sqrt" => spv::GLOp::InverseSqrt,
        "floor" => spv::GLOp::Floor,
        "log" => spv::GLOp::Log,
        "pow" => spv::GLOp::Pow,
        "sin" => spv::GLOp::Sin,
        "sinh" => spv::GLOp::Sinh,
        "sqrt" => spv::GLOp::Sqrt,
        "tan" => spv::GLOp::Tan,
        "tanh" => spv::GLOp::Tanh,
        "trunc" => spv::GLOp::Trunc,
        _ => return None,
    };
    Some(op)
}

// =============================================================================
// Pre-passes
// =============================================================================

/// Which built-in invocation ids the kernel actually references.
fn find_used_builtins(s: &Stmt) -> Result<Vec<SimtBuiltin>> {
    let mut used = Vec::new();
    fn walk(s: &Stmt, used: &mut Vec<SimtBuiltin>) -> Result<()> {
        if let Stmt::For { name, kind, body, .. } = s {
            if matches!(kind, ForKind::GpuBlock | ForKind::GpuThread) {
                let (builtin, _) = simt_intrinsic(name)?;
                if !used.contains(&builtin) {
                    used.push(builtin);
                }
            }
            return walk(body, used);
        }
        let mut result = Ok(());
        ir::mutate_stmt_children(
            s,
            &mut |e| e.clone(),
            &mut |c| {
                if result.is_ok() {
                    result = walk(c, used);
                }
                c.clone()
            },
        );
        result
    }
    walk(s, &mut used)?;
    Ok(used)
}

/// Split predicated vector loads/stores into per-lane conditional scalar
/// accesses; the emitter itself rejects predication outright.
fn scalarize_predicated_ops(s: &Stmt) -> Stmt {
    fn lane(e: &Expr, i: u16) -> Expr {
        if e.ty.is_scalar() {
            return e.clone();
        }
        Expr::new(
            e.ty.element_of(),
            ExprKind::Shuffle {
                vectors: vec![e.clone()],
                indices: vec![i as u32],
            },
        )
    }

    fn rewrite_expr(e: &Expr) -> Expr {
        let e = ir::mutate_children(e, &mut rewrite_expr);
        if let ExprKind::Load {
            name,
            index,
            predicate: Some(p),
        } = e.kind()
        {
            if e.ty.is_vector() {
                let lanes = e.ty.lanes;
                let elem = e.ty.element_of();
                let pieces: Vec<Expr> = (0..lanes)
                    .map(|i| {
                        intrin::if_then_else(
                            lane(p, i),
                            ir::load(elem, name.clone(), lane(index, i)),
                            ir::make_zero(elem),
                        )
                    })
                    .collect();
                return Expr::new(
                    e.ty,
                    ExprKind::Shuffle {
                        vectors: pieces,
                        indices: (0..lanes as u32).collect(),
                    },
                );
            }
        }
        e
    }

    fn rewrite_stmt(s: &Stmt) -> Stmt {
        let s = ir::mutate_stmt_children(s, &mut rewrite_expr, &mut rewrite_stmt);
        if let Stmt::Store {
            name,
            value,
            index,
            predicate: Some(p),
        } = &s
        {
            if value.ty.is_vector() {
                let stores: Vec<Stmt> = (0..value.ty.lanes)
                    .map(|i| Stmt::IfThenElse {
                        condition: lane(p, i),
                        then_case: Box::new(Stmt::Store {
                            name: name.clone(),
                            value: lane(value, i),
                            index: lane(index, i),
                            predicate: None,
                        }),
                        else_case: None,
                    })
                    .collect();
                return Stmt::Block(stores);
            }
            // A scalar predicated access is just a conditional.
            return Stmt::IfThenElse {
                condition: p.clone(),
                then_case: Box::new(Stmt::Store {
                    name: name.clone(),
                    value: value.clone(),
                    index: index.clone(),
                    predicate: None,
                }),
                else_case: None,
            };
        }
        s
    }

    rewrite_stmt(s)
}

/// Surface the constructs this target can never express, by name, before
/// emission begins.
fn reject_unsupported(s: &Stmt) -> Result<()> {
    fn check_expr(e: &Expr) -> Result<()> {
        let mut bad = None;
        ir::visit_expr(e, &mut |c| {
            if matches!(c.kind(), ExprKind::VectorReduce { .. }) && bad.is_none() {
                bad = Some("VectorReduce");
            }
        });
        match bad {
            Some(name) => bail_unsupported!("{} cannot be expressed in a compute shader", name),
            None => Ok(()),
        }
    }
    fn walk(s: &Stmt) -> Result<()> {
        match s {
            Stmt::Fork(..) => bail_unsupported!("Fork cannot be expressed in a compute shader"),
            Stmt::Acquire { .. } => {
                bail_unsupported!("Acquire cannot be expressed in a compute shader")
            }
            Stmt::Prefetch { .. } => {
                bail_unsupported!("Prefetch cannot be expressed in a compute shader")
            }
            _ => {}
        }
        let result = std::cell::RefCell::new(Ok(()));
        ir::mutate_stmt_children(
            s,
            &mut |e| {
                if result.borrow().is_ok() {
                    *result.borrow_mut() = check_expr(e);
                }
                e.clone()
            },
            &mut |c| {
                if result.borrow().is_ok() {
                    *result.borrow_mut() = walk(c);
                }
                c.clone()
            },
        );
        result.into_inner()
    }
    walk(s)
}
