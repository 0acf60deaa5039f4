//! Built-in demonstration kernels.
//!
//! Each kernel is written as plain widening arithmetic; the intrinsic
//! recognizer lifts the idioms (saturating adds, rounding averages) before
//! emission, the same way a real schedule would arrive here.

use basalt_core::ir::{self, make_const, ForKind, Stmt, Type};
use basalt_core::spirv::emitter::{Kernel, KernelArg};
use basalt_core::{find_intrinsics_stmt, intrinsics as intrin};

const LANES: u16 = 4;
const THREADS_X: i128 = 64;

fn u8xl() -> Type {
    Type::uint(8, LANES)
}

fn u16xl() -> Type {
    Type::uint(16, LANES)
}

fn i32t() -> Type {
    Type::int(32, 1)
}

/// blocks*threads lanes-wide iteration: binds `idx` to the first element
/// index this thread owns.
fn gpu_loop(kernel: &str, inner: impl FnOnce(ir::Expr) -> Stmt) -> Stmt {
    let block = ir::var(i32t(), format!("{}.s0.__block_id_x", kernel));
    let thread = ir::var(i32t(), format!("{}.s0.__thread_id_x", kernel));
    let flat = ir::add(
        ir::mul(block, make_const(i32t(), THREADS_X)),
        thread,
    );
    let base = ir::mul(flat, make_const(i32t(), LANES as i128));
    let body = inner(base);
    Stmt::For {
        name: format!("{}.s0.__block_id_x", kernel),
        min: make_const(i32t(), 0),
        extent: ir::var(i32t(), "num_blocks"),
        kind: ForKind::GpuBlock,
        body: Box::new(Stmt::For {
            name: format!("{}.s0.__thread_id_x", kernel),
            min: make_const(i32t(), 0),
            extent: make_const(i32t(), THREADS_X),
            kind: ForKind::GpuThread,
            body: Box::new(body),
        }),
    }
}

fn vload(name: &str, base: ir::Expr) -> ir::Expr {
    ir::load(
        u8xl(),
        name,
        ir::ramp(base, make_const(i32t(), 1), LANES),
    )
}

fn vstore(name: &str, base: ir::Expr, value: ir::Expr) -> Stmt {
    Stmt::Store {
        name: name.to_string(),
        value,
        index: ir::ramp(base, make_const(i32t(), 1), LANES),
        predicate: None,
    }
}

fn widen8(e: ir::Expr) -> ir::Expr {
    ir::cast(u16xl(), e)
}

/// out = min(in + bias, 255), written wide and narrowed back.
pub fn brighten() -> Kernel {
    let body = gpu_loop("brighten", |base| {
        let src = widen8(vload("src", base.clone()));
        let bias = widen8(ir::broadcast(ir::var(Type::uint(8, 1), "bias"), LANES));
        let sum = ir::min(ir::add(src, bias), make_const(u16xl(), 255));
        vstore("dst", base, ir::cast(u8xl(), sum))
    });
    Kernel {
        name: "brighten".to_string(),
        args: vec![
            KernelArg::buffer("src", Type::uint(8, 1)),
            KernelArg::buffer("dst", Type::uint(8, 1)),
            KernelArg::scalar("bias", Type::uint(8, 1)),
        ],
        body: find_intrinsics_stmt(&body),
    }
}

/// Horizontal 1-2-1 blur with round-to-nearest: (a + 2b + c + 2) >> 2.
pub fn blur3() -> Kernel {
    let body = gpu_loop("blur3", |base| {
        let left = widen8(vload("src", ir::sub(base.clone(), make_const(i32t(), 1))));
        let mid = widen8(vload("src", base.clone()));
        let right = widen8(vload("src", ir::add(base.clone(), make_const(i32t(), 1))));
        let sum = ir::add(
            ir::add(left, ir::mul(mid, make_const(u16xl(), 2))),
            ir::add(right, make_const(u16xl(), 2)),
        );
        let avg = intrin::shift_right(sum, make_const(u16xl(), 2));
        vstore("dst", base, ir::cast(u8xl(), avg))
    });
    Kernel {
        name: "blur3".to_string(),
        args: vec![
            KernelArg::buffer("src", Type::uint(8, 1)),
            KernelArg::buffer("dst", Type::uint(8, 1)),
        ],
        body: find_intrinsics_stmt(&body),
    }
}

/// dst = clamp(a + b, 0, 255) over two planes.
pub fn add_planes() -> Kernel {
    let body = gpu_loop("add_planes", |base| {
        let a = widen8(vload("a", base.clone()));
        let b = widen8(vload("b", base.clone()));
        let sum = ir::min(ir::add(a, b), make_const(u16xl(), 255));
        vstore("dst", base, ir::cast(u8xl(), sum))
    });
    Kernel {
        name: "add_planes".to_string(),
        args: vec![
            KernelArg::buffer("a", Type::uint(8, 1)),
            KernelArg::buffer("b", Type::uint(8, 1)),
            KernelArg::buffer("dst", Type::uint(8, 1)),
        ],
        body: find_intrinsics_stmt(&body),
    }
}

/// dst = |a - b| per element.
pub fn absdiff() -> Kernel {
    let body = gpu_loop("absdiff", |base| {
        let a = vload("a", base.clone());
        let b = vload("b", base.clone());
        let diff = intrin::abs(intrin::widening_sub(a, b));
        vstore("dst", base, ir::cast(u8xl(), diff))
    });
    Kernel {
        name: "absdiff".to_string(),
        args: vec![
            KernelArg::buffer("a", Type::uint(8, 1)),
            KernelArg::buffer("b", Type::uint(8, 1)),
            KernelArg::buffer("dst", Type::uint(8, 1)),
        ],
        body: find_intrinsics_stmt(&body),
    }
}

pub fn by_name(name: &str) -> Option<Kernel> {
    match name {
        "brighten" => Some(brighten()),
        "blur3" => Some(blur3()),
        "add_planes" => Some(add_planes()),
        "absdiff" => Some(absdiff()),
        _ => None,
    }
}

pub const KERNEL_NAMES: &[&str] = &["brighten", "blur3", "add_planes", "absdiff"];
