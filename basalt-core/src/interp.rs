//! Bit-exact evaluation of constant scalar expressions.
//!
//! Used by the simplifier for constant folding and by the test suite to
//! check that intrinsics and their lowerings agree on every input. Integer
//! arithmetic wraps modulo the type width (two's complement for signed
//! types); intrinsics are evaluated against their reference definitions in
//! 128-bit arithmetic and then wrapped or saturated as each one specifies.

use std::collections::HashMap;

use crate::error::Result;
use crate::intrinsics::Intrinsic;
use crate::ir::{CallOp, Expr, ExprKind, Type, TypeCode};
use crate::{bail_type, err_type};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn to_i128(self) -> i128 {
        match self {
            Value::Int(v) => v as i128,
            Value::UInt(v) => v as i128,
            Value::Bool(b) => b as i128,
            Value::Float(_) => panic!("BUG: integer view of float value"),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Value::Float(v) => v,
            Value::Int(v) => v as f64,
            Value::UInt(v) => v as f64,
            Value::Bool(b) => b as u8 as f64,
        }
    }

    pub fn to_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            _ => panic!("BUG: bool view of non-bool value"),
        }
    }
}

/// Wrap `v` into the representable range of `ty` (two's complement).
pub fn wrap(ty: Type, v: i128) -> Value {
    match ty.code {
        TypeCode::Int => {
            let masked = (v as u128 & mask(ty.bits)) as i128;
            let sign_bit = 1i128 << (ty.bits - 1);
            let signed = if masked & sign_bit != 0 {
                masked - (1i128 << ty.bits)
            } else {
                masked
            };
            Value::Int(signed as i64)
        }
        TypeCode::UInt => Value::UInt((v as u128 & mask(ty.bits)) as u64),
        TypeCode::Bool => Value::Bool(v & 1 != 0),
        TypeCode::Float => Value::Float(round_float(ty, v as f64)),
        TypeCode::Handle => panic!("BUG: wrap to handle type"),
    }
}

/// Clamp `v` to the representable range of `ty`.
pub fn saturate(ty: Type, v: i128) -> Value {
    let clamped = v.clamp(ty.min_value(), ty.max_value());
    wrap(ty, clamped)
}

fn mask(bits: u8) -> u128 {
    if bits >= 128 {
        u128::MAX
    } else {
        (1u128 << bits) - 1
    }
}

fn round_float(ty: Type, v: f64) -> f64 {
    if ty.bits == 32 {
        v as f32 as f64
    } else {
        v
    }
}

/// Division rounding toward negative infinity; zero divisor yields zero.
fn div_floor(a: i128, b: i128) -> i128 {
    if b == 0 {
        return 0;
    }
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Remainder matching `div_floor`; takes the sign of the divisor.
fn mod_floor(a: i128, b: i128) -> i128 {
    if b == 0 {
        return 0;
    }
    a - div_floor(a, b) * b
}

fn shift(a: i128, by: i128, left: bool) -> i128 {
    // A negative count shifts in the opposite direction.
    let (by, left) = if by < 0 { (-by, !left) } else { (by, left) };
    if by >= 128 {
        return if left { 0 } else if a < 0 { -1 } else { 0 };
    }
    if left {
        a.wrapping_shl(by as u32)
    } else {
        a >> by
    }
}

pub type Env = HashMap<String, Value>;

/// Evaluate a scalar (or uniformly-broadcast) expression.
pub fn eval_scalar(e: &Expr, env: &Env) -> Result<Value> {
    let ty = e.ty.element_of();
    let v = match e.kind() {
        ExprKind::IntImm(v) => Value::Int(*v),
        ExprKind::UIntImm(v) => {
            if ty.is_bool() {
                Value::Bool(*v != 0)
            } else {
                Value::UInt(*v)
            }
        }
        ExprKind::FloatImm(v) => Value::Float(round_float(ty, v.value())),
        ExprKind::StringImm(s) => bail_type!("cannot evaluate string immediate {:?}", s),
        ExprKind::Var(name) => *env
            .get(name)
            .ok_or_else(|| err_type!("unbound variable in constant context: {}", name))?,
        ExprKind::Broadcast { value, .. } => eval_scalar(value, env)?,
        ExprKind::Cast(v) => {
            let inner = eval_scalar(v, env)?;
            eval_cast(ty, v.ty.element_of(), inner)
        }
        ExprKind::Reinterpret(v) => {
            let inner = eval_scalar(v, env)?;
            eval_reinterpret(ty, v.ty.element_of(), inner)
        }
        ExprKind::Add(a, b) => eval_arith(ty, a, b, env, |x, y| x + y, |x, y| x + y)?,
        ExprKind::Sub(a, b) => eval_arith(ty, a, b, env, |x, y| x - y, |x, y| x - y)?,
        ExprKind::Mul(a, b) => eval_arith(ty, a, b, env, |x, y| x * y, |x, y| x * y)?,
        ExprKind::Div(a, b) => {
            if ty.is_float() {
                let x = eval_scalar(a, env)?.to_f64();
                let y = eval_scalar(b, env)?.to_f64();
                Value::Float(round_float(ty, x / y))
            } else {
                let x = eval_scalar(a, env)?.to_i128();
                let y = eval_scalar(b, env)?.to_i128();
                wrap(ty, div_floor(x, y))
            }
        }
        ExprKind::Mod(a, b) => {
            if ty.is_float() {
                let x = eval_scalar(a, env)?.to_f64();
                let y = eval_scalar(b, env)?.to_f64();
                Value::Float(round_float(ty, x - (x / y).floor() * y))
            } else {
                let x = eval_scalar(a, env)?.to_i128();
                let y = eval_scalar(b, env)?.to_i128();
                wrap(ty, mod_floor(x, y))
            }
        }
        ExprKind::Min(a, b) => eval_arith(ty, a, b, env, |x, y| x.min(y), f64::min)?,
        ExprKind::Max(a, b) => eval_arith(ty, a, b, env, |x, y| x.max(y), f64::max)?,
        ExprKind::Eq(a, b) => eval_cmp(a, b, env, |o| o.is_eq(), |x, y| x == y)?,
        ExprKind::Ne(a, b) => eval_cmp(a, b, env, |o| o.is_ne(), |x, y| x != y)?,
        ExprKind::Lt(a, b) => eval_cmp(a, b, env, |o| o.is_lt(), |x, y| x < y)?,
        ExprKind::Le(a, b) => eval_cmp(a, b, env, |o| o.is_le(), |x, y| x <= y)?,
        ExprKind::Gt(a, b) => eval_cmp(a, b, env, |o| o.is_gt(), |x, y| x > y)?,
        ExprKind::Ge(a, b) => eval_cmp(a, b, env, |o| o.is_ge(), |x, y| x >= y)?,
        ExprKind::And(a, b) => {
            Value::Bool(eval_scalar(a, env)?.to_bool() && eval_scalar(b, env)?.to_bool())
        }
        ExprKind::Or(a, b) => {
            Value::Bool(eval_scalar(a, env)?.to_bool() || eval_scalar(b, env)?.to_bool())
        }
        ExprKind::Not(a) => Value::Bool(!eval_scalar(a, env)?.to_bool()),
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => {
            if eval_scalar(condition, env)?.to_bool() {
                eval_scalar(true_value, env)?
            } else {
                eval_scalar(false_value, env)?
            }
        }
        ExprKind::Let { name, value, body } => {
            let bound = eval_scalar(value, env)?;
            let mut inner = env.clone();
            inner.insert(name.clone(), bound);
            eval_scalar(body, &inner)?
        }
        ExprKind::Call {
            op: CallOp::Intrin(i),
            args,
        } => eval_intrinsic(ty, *i, args, env)?,
        _ => bail_type!("cannot evaluate non-constant expression: {}", e),
    };
    Ok(v)
}

fn eval_arith(
    ty: Type,
    a: &Expr,
    b: &Expr,
    env: &Env,
    fi: impl Fn(i128, i128) -> i128,
    ff: impl Fn(f64, f64) -> f64,
) -> Result<Value> {
    if ty.is_float() {
        let x = eval_scalar(a, env)?.to_f64();
        let y = eval_scalar(b, env)?.to_f64();
        Ok(Value::Float(round_float(ty, ff(x, y))))
    } else {
        let x = eval_scalar(a, env)?.to_i128();
        let y = eval_scalar(b, env)?.to_i128();
        Ok(wrap(ty, fi(x, y)))
    }
}

fn eval_cmp(
    a: &Expr,
    b: &Expr,
    env: &Env,
    fi: impl Fn(std::cmp::Ordering) -> bool,
    ff: impl Fn(f64, f64) -> bool,
) -> Result<Value> {
    if a.ty.is_float() {
        let x = eval_scalar(a, env)?.to_f64();
        let y = eval_scalar(b, env)?.to_f64();
        Ok(Value::Bool(ff(x, y)))
    } else {
        let x = eval_scalar(a, env)?.to_i128();
        let y = eval_scalar(b, env)?.to_i128();
        Ok(Value::Bool(fi(x.cmp(&y))))
    }
}

fn eval_cast(to: Type, from: Type, v: Value) -> Value {
    match (to.code, from.code) {
        (TypeCode::Float, _) => Value::Float(round_float(to, v.to_f64())),
        (_, TypeCode::Float) => {
            // Float to int truncates toward zero; out-of-range is clamped,
            // which matches how the device converts.
            let f = v.to_f64().trunc();
            let i = if f.is_nan() {
                0
            } else {
                f.clamp(to.min_value() as f64, to.max_value() as f64) as i128
            };
            wrap(to, i)
        }
        _ => wrap(to, v.to_i128()),
    }
}

fn eval_reinterpret(to: Type, from: Type, v: Value) -> Value {
    assert_eq!(to.bits, from.bits, "BUG: reinterpret width mismatch");
    if to.is_float() || from.is_float() {
        match (to.code, from.code) {
            (TypeCode::Float, _) if to.bits == 32 => {
                Value::Float(f32::from_bits(v.to_i128() as u32) as f64)
            }
            (TypeCode::Float, _) => Value::Float(f64::from_bits(v.to_i128() as u64)),
            (_, TypeCode::Float) if from.bits == 32 => {
                wrap(to, (v.to_f64() as f32).to_bits() as i128)
            }
            (_, TypeCode::Float) => wrap(to, v.to_f64().to_bits() as i128),
            _ => unreachable!(),
        }
    } else {
        wrap(to, v.to_i128())
    }
}

fn eval_intrinsic(ty: Type, op: Intrinsic, args: &[Expr], env: &Env) -> Result<Value> {
    let int_args = |n: usize| -> Result<Vec<i128>> {
        assert_eq!(args.len(), n, "BUG: {} expects {} args", op.name(), n);
        args.iter().map(|a| Ok(eval_scalar(a, env)?.to_i128())).collect()
    };
    let v = match op {
        Intrinsic::WideningAdd => {
            let a = int_args(2)?;
            wrap(ty, a[0] + a[1])
        }
        Intrinsic::WideningSub => {
            let a = int_args(2)?;
            wrap(ty, a[0] - a[1])
        }
        Intrinsic::WideningMul => {
            let a = int_args(2)?;
            wrap(ty, a[0] * a[1])
        }
        Intrinsic::WidenRightAdd => {
            let a = int_args(2)?;
            wrap(ty, a[0] + a[1])
        }
        Intrinsic::WidenRightSub => {
            let a = int_args(2)?;
            wrap(ty, a[0] - a[1])
        }
        Intrinsic::WidenRightMul => {
            let a = int_args(2)?;
            wrap(ty, a[0] * a[1])
        }
        Intrinsic::WideningShiftLeft => {
            let a = int_args(2)?;
            wrap(ty, shift(a[0], a[1], true))
        }
        Intrinsic::WideningShiftRight => {
            let a = int_args(2)?;
            wrap(ty, shift(a[0], a[1], false))
        }
        Intrinsic::ShiftLeft => {
            let a = int_args(2)?;
            wrap(ty, shift(a[0], a[1], true))
        }
        Intrinsic::DivRoundToZero => {
            let a = int_args(2)?;
            wrap(ty, if a[1] == 0 { 0 } else { a[0] / a[1] })
        }
        Intrinsic::ModRoundToZero => {
            let a = int_args(2)?;
            wrap(ty, if a[1] == 0 { 0 } else { a[0] % a[1] })
        }
        Intrinsic::ShiftRight => {
            let a = int_args(2)?;
            wrap(ty, shift(a[0], a[1], false))
        }
        Intrinsic::RoundingShiftRight => {
            let a = int_args(2)?;
            let round = if a[1] > 0 { 1i128 << (a[1] - 1) } else { 0 };
            saturate(ty, shift(a[0] + round, a[1], false))
        }
        Intrinsic::RoundingShiftLeft => {
            let a = int_args(2)?;
            let round = if a[1] < 0 { 1i128 << (-a[1] - 1) } else { 0 };
            saturate(ty, shift(a[0] + round, a[1], true))
        }
        Intrinsic::SaturatingAdd => {
            let a = int_args(2)?;
            saturate(ty, a[0] + a[1])
        }
        Intrinsic::SaturatingSub => {
            let a = int_args(2)?;
            saturate(ty, a[0] - a[1])
        }
        Intrinsic::SaturatingCast => {
            assert_eq!(args.len(), 1);
            let v = eval_scalar(&args[0], env)?;
            if args[0].ty.is_float() && ty.is_float() {
                // Pin infinities to the target's finite range.
                Value::Float(round_float(ty, v.to_f64().clamp(f64::MIN, f64::MAX)))
            } else if args[0].ty.is_float() {
                let f = v.to_f64();
                let i = if f.is_nan() {
                    0
                } else {
                    f.trunc().clamp(ty.min_value() as f64, ty.max_value() as f64) as i128
                };
                wrap(ty, i)
            } else {
                saturate(ty, v.to_i128())
            }
        }
        Intrinsic::HalvingAdd => {
            let a = int_args(2)?;
            wrap(ty, div_floor(a[0] + a[1], 2))
        }
        Intrinsic::HalvingSub => {
            let a = int_args(2)?;
            wrap(ty, div_floor(a[0] - a[1], 2))
        }
        Intrinsic::RoundingHalvingAdd => {
            let a = int_args(2)?;
            wrap(ty, div_floor(a[0] + a[1] + 1, 2))
        }
        Intrinsic::MulShiftRight => {
            let a = int_args(3)?;
            saturate(ty, shift(a[0] * a[1], a[2], false))
        }
        Intrinsic::RoundingMulShiftRight => {
            let a = int_args(3)?;
            let round = if a[2] > 0 { 1i128 << (a[2] - 1) } else { 0 };
            saturate(ty, shift(a[0] * a[1] + round, a[2], false))
        }
        Intrinsic::Absd => {
            if ty.is_float() {
                let x = eval_scalar(&args[0], env)?.to_f64();
                let y = eval_scalar(&args[1], env)?.to_f64();
                Value::Float(round_float(ty, (x - y).abs()))
            } else {
                let a = int_args(2)?;
                wrap(ty, (a[0] - a[1]).abs())
            }
        }
        Intrinsic::SortedAvg => {
            let a = int_args(2)?;
            wrap(ty, a[0] + div_floor(a[1] - a[0], 2))
        }
        Intrinsic::BitwiseAnd => {
            let a = int_args(2)?;
            wrap(ty, bits_of(args[0].ty, a[0]) as i128 & bits_of(args[1].ty, a[1]) as i128)
        }
        Intrinsic::BitwiseOr => {
            let a = int_args(2)?;
            wrap(ty, (bits_of(args[0].ty, a[0]) | bits_of(args[1].ty, a[1])) as i128)
        }
        Intrinsic::BitwiseXor => {
            let a = int_args(2)?;
            wrap(ty, (bits_of(args[0].ty, a[0]) ^ bits_of(args[1].ty, a[1])) as i128)
        }
        Intrinsic::BitwiseNot => {
            let a = int_args(1)?;
            wrap(ty, !a[0])
        }
        Intrinsic::Abs => {
            if ty.is_float() {
                let x = eval_scalar(&args[0], env)?.to_f64();
                Value::Float(round_float(ty, x.abs()))
            } else {
                let a = int_args(1)?;
                wrap(ty, a[0].abs())
            }
        }
        Intrinsic::IfThenElse => {
            if eval_scalar(&args[0], env)?.to_bool() {
                eval_scalar(&args[1], env)?
            } else {
                eval_scalar(&args[2], env)?
            }
        }
        _ => bail_type!("cannot evaluate intrinsic {} in a constant context", op.name()),
    };
    Ok(v)
}

fn bits_of(ty: Type, v: i128) -> u128 {
    v as u128 & mask(ty.bits)
}
