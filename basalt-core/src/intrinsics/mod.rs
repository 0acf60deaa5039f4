//! Named arithmetic intrinsics and their typed constructors.
//!
//! Intrinsics only ever appear in the IR as `Call` nodes with one of the
//! opcodes below. Each constructor fixes the arity and the result type, so
//! a well-formed call cannot be built with the wrong shape. The recognizer
//! (`find`) lifts ordinary arithmetic into these calls; the lowerer
//! (`lower`) expands them back to reference arithmetic, bit-exactly.

pub mod find;
pub mod lower;

#[cfg(test)]
mod find_tests;
#[cfg(test)]
mod lower_tests;

use crate::ir::{call, CallOp, Expr, Type, TypeCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    WideningAdd,
    WideningSub,
    WideningMul,
    WidenRightAdd,
    WidenRightSub,
    WidenRightMul,
    WideningShiftLeft,
    WideningShiftRight,
    RoundingShiftLeft,
    RoundingShiftRight,
    SaturatingAdd,
    SaturatingSub,
    SaturatingCast,
    HalvingAdd,
    HalvingSub,
    RoundingHalvingAdd,
    MulShiftRight,
    RoundingMulShiftRight,
    Absd,
    SortedAvg,
    ShiftLeft,
    ShiftRight,
    DivRoundToZero,
    ModRoundToZero,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    Abs,
    Round,
    IsNan,
    IsInf,
    IfThenElse,
    GpuThreadBarrier,
}

impl Intrinsic {
    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::WideningAdd => "widening_add",
            Intrinsic::WideningSub => "widening_sub",
            Intrinsic::WideningMul => "widening_mul",
            Intrinsic::WidenRightAdd => "widen_right_add",
            Intrinsic::WidenRightSub => "widen_right_sub",
            Intrinsic::WidenRightMul => "widen_right_mul",
            Intrinsic::WideningShiftLeft => "widening_shift_left",
            Intrinsic::WideningShiftRight => "widening_shift_right",
            Intrinsic::RoundingShiftLeft => "rounding_shift_left",
            Intrinsic::RoundingShiftRight => "rounding_shift_right",
            Intrinsic::SaturatingAdd => "saturating_add",
            Intrinsic::SaturatingSub => "saturating_sub",
            Intrinsic::SaturatingCast => "saturating_cast",
            Intrinsic::HalvingAdd => "halving_add",
            Intrinsic::HalvingSub => "halving_sub",
            Intrinsic::RoundingHalvingAdd => "rounding_halving_add",
            Intrinsic::MulShiftRight => "mul_shift_right",
            Intrinsic::RoundingMulShiftRight => "rounding_mul_shift_right",
            Intrinsic::Absd => "absd",
            Intrinsic::SortedAvg => "sorted_avg",
            Intrinsic::ShiftLeft => "shift_left",
            Intrinsic::ShiftRight => "shift_right",
            Intrinsic::DivRoundToZero => "div_round_to_zero",
            Intrinsic::ModRoundToZero => "mod_round_to_zero",
            Intrinsic::BitwiseAnd => "bitwise_and",
            Intrinsic::BitwiseOr => "bitwise_or",
            Intrinsic::BitwiseXor => "bitwise_xor",
            Intrinsic::BitwiseNot => "bitwise_not",
            Intrinsic::Abs => "abs",
            Intrinsic::Round => "round",
            Intrinsic::IsNan => "is_nan",
            Intrinsic::IsInf => "is_inf",
            Intrinsic::IfThenElse => "if_then_else",
            Intrinsic::GpuThreadBarrier => "gpu_thread_barrier",
        }
    }

    pub fn is_pure(&self) -> bool {
        !matches!(self, Intrinsic::GpuThreadBarrier)
    }
}

fn intrin(ty: Type, op: Intrinsic, args: Vec<Expr>) -> Expr {
    call(ty, CallOp::Intrin(op), args)
}

fn same_type_pair(name: &str, a: &Expr, b: &Expr) {
    assert_eq!(
        a.ty, b.ty,
        "BUG: {} operands must have the same type: {} vs {}",
        name, a.ty, b.ty
    );
}

/// Widen to the next bit width with an explicit cast.
pub fn widen(a: Expr) -> Expr {
    let ty = a.ty.widen();
    crate::ir::cast(ty, a)
}

/// Narrow to the previous bit width with an explicit cast.
pub fn narrow(a: Expr) -> Expr {
    let ty = a.ty.narrow();
    crate::ir::cast(ty, a)
}

pub fn widening_add(a: Expr, b: Expr) -> Expr {
    same_type_pair("widening_add", &a, &b);
    let ty = a.ty.widen();
    intrin(ty, Intrinsic::WideningAdd, vec![a, b])
}

pub fn widening_sub(a: Expr, b: Expr) -> Expr {
    same_type_pair("widening_sub", &a, &b);
    let mut ty = a.ty.widen();
    // A subtract of unsigned values widens into the signed type.
    if ty.is_uint() {
        ty = ty.with_code(TypeCode::Int);
    }
    intrin(ty, Intrinsic::WideningSub, vec![a, b])
}

pub fn widening_mul(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.bits, b.ty.bits);
    assert_eq!(a.ty.lanes, b.ty.lanes);
    // Mixed signedness multiplies produce a signed result.
    let mut ty = a.ty.widen();
    if a.ty.code != b.ty.code {
        ty = ty.with_code(TypeCode::Int);
    }
    intrin(ty, Intrinsic::WideningMul, vec![a, b])
}

pub fn widen_right_add(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty, b.ty.widen().with_code(a.ty.code));
    let ty = a.ty;
    intrin(ty, Intrinsic::WidenRightAdd, vec![a, b])
}

pub fn widen_right_sub(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty, b.ty.widen().with_code(a.ty.code));
    let ty = a.ty;
    intrin(ty, Intrinsic::WidenRightSub, vec![a, b])
}

pub fn widen_right_mul(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty, b.ty.widen().with_code(a.ty.code));
    let ty = a.ty;
    intrin(ty, Intrinsic::WidenRightMul, vec![a, b])
}

pub fn widening_shift_left(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty.widen();
    intrin(ty, Intrinsic::WideningShiftLeft, vec![a, b])
}

pub fn widening_shift_right(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty.widen();
    intrin(ty, Intrinsic::WideningShiftRight, vec![a, b])
}

pub fn rounding_shift_left(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty;
    intrin(ty, Intrinsic::RoundingShiftLeft, vec![a, b])
}

pub fn rounding_shift_right(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty;
    intrin(ty, Intrinsic::RoundingShiftRight, vec![a, b])
}

pub fn saturating_add(a: Expr, b: Expr) -> Expr {
    same_type_pair("saturating_add", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::SaturatingAdd, vec![a, b])
}

pub fn saturating_sub(a: Expr, b: Expr) -> Expr {
    same_type_pair("saturating_sub", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::SaturatingSub, vec![a, b])
}

pub fn saturating_cast(ty: Type, a: Expr) -> Expr {
    assert_eq!(ty.lanes, a.ty.lanes);
    intrin(ty, Intrinsic::SaturatingCast, vec![a])
}

/// Saturating cast to the next-narrower type.
pub fn saturating_narrow(a: Expr) -> Expr {
    let ty = a.ty.narrow();
    saturating_cast(ty, a)
}

pub fn halving_add(a: Expr, b: Expr) -> Expr {
    same_type_pair("halving_add", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::HalvingAdd, vec![a, b])
}

pub fn halving_sub(a: Expr, b: Expr) -> Expr {
    same_type_pair("halving_sub", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::HalvingSub, vec![a, b])
}

pub fn rounding_halving_add(a: Expr, b: Expr) -> Expr {
    same_type_pair("rounding_halving_add", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::RoundingHalvingAdd, vec![a, b])
}

pub fn mul_shift_right(a: Expr, b: Expr, q: Expr) -> Expr {
    same_type_pair("mul_shift_right", &a, &b);
    assert!(q.ty.is_uint(), "BUG: mul_shift_right shift must be unsigned");
    let ty = a.ty;
    intrin(ty, Intrinsic::MulShiftRight, vec![a, b, q])
}

pub fn rounding_mul_shift_right(a: Expr, b: Expr, q: Expr) -> Expr {
    same_type_pair("rounding_mul_shift_right", &a, &b);
    assert!(
        q.ty.is_uint(),
        "BUG: rounding_mul_shift_right shift must be unsigned"
    );
    let ty = a.ty;
    intrin(ty, Intrinsic::RoundingMulShiftRight, vec![a, b, q])
}

/// `|a - b|` in the unsigned type of the same width.
pub fn absd(a: Expr, b: Expr) -> Expr {
    same_type_pair("absd", &a, &b);
    let ty = if a.ty.is_float() {
        a.ty
    } else {
        a.ty.with_code(TypeCode::UInt)
    };
    intrin(ty, Intrinsic::Absd, vec![a, b])
}

/// Overflow-free average of a pre-sorted pair (`a <= b`).
pub fn sorted_avg(a: Expr, b: Expr) -> Expr {
    same_type_pair("sorted_avg", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::SortedAvg, vec![a, b])
}

pub fn shift_left(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty;
    intrin(ty, Intrinsic::ShiftLeft, vec![a, b])
}

pub fn shift_right(a: Expr, b: Expr) -> Expr {
    assert_eq!(a.ty.lanes, b.ty.lanes);
    let ty = a.ty;
    intrin(ty, Intrinsic::ShiftRight, vec![a, b])
}

pub fn bitwise_and(a: Expr, b: Expr) -> Expr {
    same_type_pair("bitwise_and", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::BitwiseAnd, vec![a, b])
}

pub fn bitwise_or(a: Expr, b: Expr) -> Expr {
    same_type_pair("bitwise_or", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::BitwiseOr, vec![a, b])
}

pub fn bitwise_xor(a: Expr, b: Expr) -> Expr {
    same_type_pair("bitwise_xor", &a, &b);
    let ty = a.ty;
    intrin(ty, Intrinsic::BitwiseXor, vec![a, b])
}

pub fn bitwise_not(a: Expr) -> Expr {
    let ty = a.ty;
    intrin(ty, Intrinsic::BitwiseNot, vec![a])
}

pub fn abs(a: Expr) -> Expr {
    let ty = if a.ty.is_int() {
        a.ty.with_code(TypeCode::UInt)
    } else {
        a.ty
    };
    intrin(ty, Intrinsic::Abs, vec![a])
}

pub fn if_then_else(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
    assert!(condition.ty.is_bool());
    assert_eq!(true_value.ty, false_value.ty);
    let ty = true_value.ty;
    intrin(
        ty,
        Intrinsic::IfThenElse,
        vec![condition, true_value, false_value],
    )
}

/// Memory-fence kinds for `gpu_thread_barrier`, combinable as a bit mask.
pub mod fence {
    pub const NONE: i64 = 0;
    pub const DEVICE: i64 = 1;
    pub const SHARED: i64 = 2;
}

pub fn gpu_thread_barrier(mask: Expr) -> Expr {
    intrin(Type::int(32, 1), Intrinsic::GpuThreadBarrier, vec![mask])
}
