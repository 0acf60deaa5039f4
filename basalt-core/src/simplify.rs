//! Local simplification: constant folding and the small set of identities
//! the intrinsic recognizer depends on.
//!
//! This is deliberately not a full algebraic simplifier. It folds constant
//! subtrees through the interpreter, collapses redundant casts, and strips
//! arithmetic identities; `can_prove` answers only what folding plus the
//! constant-interval query can settle, and answers `false` otherwise.

use crate::bounds::BoundsCache;
use crate::interp::{eval_scalar, Env, Value};
use crate::ir::{
    self, broadcast, make_const, mutate_children, Expr, ExprKind, Type, TypeCode,
};

/// Fold constants bottom-up and strip trivial identities.
pub fn simplify(e: &Expr) -> Expr {
    let e = mutate_children(e, &mut |c| simplify(c));

    // Whole-node folding: any constant subtree collapses to an immediate.
    if is_foldable(&e) && !matches!(e.kind(), ExprKind::IntImm(_) | ExprKind::UIntImm(_) | ExprKind::FloatImm(_) | ExprKind::Broadcast { .. }) {
        if let Ok(v) = eval_scalar(&e, &Env::new()) {
            if let Some(folded) = value_to_expr(e.ty, v) {
                return folded;
            }
        }
    }

    match e.kind() {
        ExprKind::Add(a, b) => {
            if is_zero(b) {
                a.clone()
            } else if is_zero(a) {
                b.clone()
            } else {
                e.clone()
            }
        }
        ExprKind::Sub(a, b) => {
            if is_zero(b) {
                a.clone()
            } else {
                e.clone()
            }
        }
        ExprKind::Mul(a, b) => {
            if is_one(b) {
                a.clone()
            } else if is_one(a) {
                b.clone()
            } else if is_zero(a) || is_zero(b) {
                ir::make_zero(e.ty)
            } else {
                e.clone()
            }
        }
        ExprKind::Cast(v) => {
            if v.ty == e.ty {
                v.clone()
            } else if let ExprKind::Cast(inner) = v.kind() {
                // The intermediate cast is redundant when it loses nothing.
                if v.ty.can_represent(inner.ty) || v.ty.can_represent(e.ty) {
                    simplify(&ir::cast(e.ty, inner.clone()))
                } else {
                    e.clone()
                }
            } else {
                e.clone()
            }
        }
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => match condition.as_uint_imm() {
            Some(0) => false_value.clone(),
            Some(_) => true_value.clone(),
            None => {
                if true_value == false_value && ir::is_pure_deep(true_value) {
                    true_value.clone()
                } else {
                    e.clone()
                }
            }
        },
        ExprKind::Eq(a, b) if a == b && ir::is_pure_deep(a) => ir::make_one(e.ty),
        ExprKind::Le(a, b) if a == b && ir::is_pure_deep(a) => ir::make_one(e.ty),
        ExprKind::Ge(a, b) if a == b && ir::is_pure_deep(a) => ir::make_one(e.ty),
        ExprKind::Ne(a, b) if a == b && ir::is_pure_deep(a) => ir::make_zero(e.ty),
        ExprKind::Lt(a, b) if a == b && ir::is_pure_deep(a) => ir::make_zero(e.ty),
        ExprKind::Gt(a, b) if a == b && ir::is_pure_deep(a) => ir::make_zero(e.ty),
        _ => e.clone(),
    }
}

fn is_foldable(e: &Expr) -> bool {
    let mut all_const = true;
    ir::visit_expr(e, &mut |c| {
        all_const &= !matches!(
            c.kind(),
            ExprKind::Var(_)
                | ExprKind::Load { .. }
                | ExprKind::StringImm(_)
                | ExprKind::Shuffle { .. }
                | ExprKind::VectorReduce { .. }
                | ExprKind::Ramp { .. }
                | ExprKind::Let { .. }
        );
        if let ExprKind::Call { op, .. } = c.kind() {
            all_const &= matches!(op, ir::CallOp::Intrin(i) if i.is_pure());
        }
    });
    all_const
}

fn value_to_expr(ty: Type, v: Value) -> Option<Expr> {
    let scalar = match (ty.code, v) {
        (TypeCode::Int, Value::Int(i)) => ir::int_imm(ty.element_of(), i),
        (TypeCode::UInt, Value::UInt(u)) => ir::uint_imm(ty.element_of(), u),
        (TypeCode::Bool, Value::Bool(b)) => ir::uint_imm(ty.element_of(), b as u64),
        (TypeCode::Float, Value::Float(f)) => ir::float_imm(ty.element_of(), f),
        _ => return None,
    };
    Some(if ty.is_vector() {
        broadcast(scalar, ty.lanes)
    } else {
        scalar
    })
}

fn is_zero(e: &Expr) -> bool {
    e.as_const_int() == Some(0)
}

fn is_one(e: &Expr) -> bool {
    e.as_const_int() == Some(1)
}

/// Prove a boolean expression holds for all values of its free variables.
/// Conservative: `false` means "could not prove", not "false".
pub fn can_prove_with(cache: &mut BoundsCache, e: &Expr) -> bool {
    assert!(e.ty.is_bool(), "BUG: can_prove of non-bool {}", e);
    let s = simplify(e);
    if let Some(v) = s.as_uint_imm() {
        return v != 0;
    }
    match s.kind() {
        ExprKind::Eq(a, b) => a == b && ir::is_pure_deep(a),
        ExprKind::Le(a, b) => interval_le(cache, a, b),
        ExprKind::Lt(a, b) => interval_lt(cache, a, b),
        ExprKind::Ge(a, b) => interval_le(cache, b, a),
        ExprKind::Gt(a, b) => interval_lt(cache, b, a),
        ExprKind::And(a, b) => can_prove_with(cache, a) && can_prove_with(cache, b),
        _ => false,
    }
}

/// `can_prove` with a throwaway bounds cache.
pub fn can_prove(e: &Expr) -> bool {
    can_prove_with(&mut BoundsCache::new(), e)
}

fn interval_le(cache: &mut BoundsCache, a: &Expr, b: &Expr) -> bool {
    if a.ty.is_float() {
        return false;
    }
    match (cache.interval(a).max, cache.interval(b).min) {
        (Some(amax), Some(bmin)) => amax <= bmin,
        _ => false,
    }
}

fn interval_lt(cache: &mut BoundsCache, a: &Expr, b: &Expr) -> bool {
    if a.ty.is_float() {
        return false;
    }
    match (cache.interval(a).max, cache.interval(b).min) {
        (Some(amax), Some(bmin)) => amax < bmin,
        _ => false,
    }
}

/// An expression of type `ty` with the same value as `e`, if the conversion
/// can be shown lossless; `None` otherwise.
pub fn lossless_cast(cache: &mut BoundsCache, ty: Type, e: &Expr) -> Option<Expr> {
    if e.ty == ty {
        return Some(e.clone());
    }
    if ty.lanes != e.ty.lanes {
        return None;
    }
    match e.kind() {
        ExprKind::IntImm(v) => ty
            .element_of()
            .can_represent_value(*v as i128)
            .then(|| make_const(ty, *v as i128)),
        ExprKind::UIntImm(v) => ty
            .element_of()
            .can_represent_value(*v as i128)
            .then(|| make_const(ty, *v as i128)),
        ExprKind::Broadcast { value, lanes } => {
            lossless_cast(cache, ty.element_of(), value).map(|v| broadcast(v, *lanes))
        }
        ExprKind::Cast(inner) if e.ty.can_represent(inner.ty) => {
            // The outer cast added nothing; retarget the inner value.
            lossless_cast(cache, ty, inner)
        }
        _ => {
            if ty.can_represent(e.ty) {
                return Some(ir::cast(ty, e.clone()));
            }
            if ty.is_int_or_uint() && e.ty.is_int_or_uint() {
                let i = cache.interval(e);
                if let (Some(lo), Some(hi)) = (i.min, i.max) {
                    if ty.element_of().can_represent_value(lo)
                        && ty.element_of().can_represent_value(hi)
                    {
                        return Some(ir::cast(ty, e.clone()));
                    }
                }
            }
            None
        }
    }
}

/// The negation of `e` in the same type, if provably free of overflow.
pub fn lossless_negate(e: &Expr) -> Option<Expr> {
    match e.kind() {
        ExprKind::IntImm(v) => {
            let neg = -(*v as i128);
            e.ty.element_of()
                .can_represent_value(neg)
                .then(|| make_const(e.ty.element_of(), neg))
        }
        ExprKind::Broadcast { value, lanes } => {
            lossless_negate(value).map(|v| broadcast(v, *lanes))
        }
        ExprKind::Mul(a, b) => {
            if b.is_const() {
                lossless_negate(b).map(|nb| ir::mul(a.clone(), nb))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The exponent if `e` is a constant positive power of two.
pub fn is_const_power_of_two(e: &Expr) -> Option<u8> {
    let v = e.as_const_int()?;
    (v > 0 && (v & (v - 1)) == 0).then(|| v.trailing_zeros() as u8)
}
