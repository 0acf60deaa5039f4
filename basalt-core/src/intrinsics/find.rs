//! Intrinsic recognition: lift ordinary arithmetic into named intrinsics.
//!
//! A bottom-up rewrite over the expression tree. Only vector expressions of
//! at least 8-bit elements are considered; everything else passes through
//! untouched. Rule order is significant and the first matching rule wins.
//! No rewrite changes the static type of an expression; every committed
//! rewrite is checked for type equivalence before recursing on the result.

use std::collections::HashMap;

use crate::bounds::BoundsCache;
use crate::intrinsics::{
    self as intrin, halving_add, halving_sub, mul_shift_right, rounding_halving_add,
    rounding_mul_shift_right, rounding_shift_left, rounding_shift_right, saturating_add,
    saturating_cast, saturating_sub, shift_left, shift_right, widen_right_add, widen_right_mul,
    widen_right_sub, widening_add, widening_mul, widening_shift_left, widening_shift_right,
    widening_sub, Intrinsic,
};
use crate::ir::{
    self, cast, make_const, make_zero, mutate_children, mutate_stmt_children, reinterpret,
    CallOp, Expr, ExprKind, Stmt, Type, TypeCode,
};
use crate::simplify::{
    can_prove_with, is_const_power_of_two, lossless_cast, lossless_negate, simplify,
};

/// Intrinsic recognition only applies to non-boolean vectors of at least
/// 8-bit elements.
fn find_intrinsics_for_type(t: Type) -> bool {
    t.is_vector() && t.bits >= 8
}

/// Overflow is undefined for floats and for signed integers of at least
/// 32 bits; those admit rewrites that would change wrap-around behavior in
/// modular types.
fn no_overflow_int(t: Type) -> bool {
    t.is_int() && t.bits >= 32
}

pub(crate) fn no_overflow(t: Type) -> bool {
    t.is_float() || no_overflow_int(t)
}

/// The headroom probe for removing a round constant from a modular-type
/// add searches this deep relative to the element width. Tunable; `bits/2`
/// levels minus one matches how far a widening op can be from the root
/// while still guaranteeing slack for one more add.
const SAFE_ADD_PROBE_DIVISOR: u8 = 2;

fn safe_add_probe_depth(t: Type) -> i32 {
    (t.bits / SAFE_ADD_PROBE_DIVISOR) as i32 - 1
}

/// True if adding one more term to `e` cannot overflow: a widening add or
/// subtract within the probe depth guarantees headroom.
fn is_safe_for_add(e: &Expr, max_depth: i32) -> bool {
    if max_depth <= 0 {
        return false;
    }
    let next = max_depth - 1;
    match e.kind() {
        ExprKind::Add(a, b) | ExprKind::Sub(a, b) => {
            is_safe_for_add(a, next) || is_safe_for_add(b, next)
        }
        ExprKind::Cast(v) => {
            if e.ty.bits > v.ty.bits {
                true
            } else if e.ty.bits == v.ty.bits {
                is_safe_for_add(v, next)
            } else {
                false
            }
        }
        ExprKind::Reinterpret(v) if e.ty.bits == v.ty.bits => is_safe_for_add(v, next),
        _ => e
            .as_intrinsic(&[
                Intrinsic::WideningAdd,
                Intrinsic::WideningSub,
                Intrinsic::WidenRightAdd,
                Intrinsic::WidenRightSub,
            ])
            .is_some(),
    }
}

/// `is_safe_for_add` at the default probe depth for the expression's type.
pub(crate) fn is_safe_for_add_root(e: &Expr) -> bool {
    is_safe_for_add(e, safe_add_probe_depth(e.ty))
}

/// Find and remove an addition of exactly `round` from `e`. This is not the
/// same as subtracting `round`: the term must be syntactically present.
fn find_and_subtract(e: &Expr, round: i128) -> Option<Expr> {
    match e.kind() {
        ExprKind::Add(a, b) => {
            if let Some(a2) = find_and_subtract(a, round) {
                return Some(ir::add(a2, b.clone()));
            }
            if let Some(b2) = find_and_subtract(b, round) {
                return Some(ir::add(a.clone(), b2));
            }
            None
        }
        ExprKind::Sub(a, b) => {
            // The negative side of a subtract cannot host the round term.
            find_and_subtract(a, round).map(|a2| ir::sub(a2, b.clone()))
        }
        _ => (e.as_const_int() == Some(round)).then(|| make_zero(e.ty)),
    }
}

fn as_call<'a>(e: &'a Expr, which: Intrinsic) -> Option<&'a [Expr]> {
    e.as_intrinsic(&[which]).map(|(_, args)| args)
}

fn as_call2<'a>(e: &'a Expr, which: Intrinsic) -> Option<(&'a Expr, &'a Expr)> {
    as_call(e, which).map(|a| (&a[0], &a[1]))
}

fn rake_rules_enabled() -> bool {
    std::env::var("HL_ENABLE_RAKE_RULES").as_deref() == Ok("1")
}

fn intrinsics_disabled() -> bool {
    std::env::var("HL_DISABLE_INTRINISICS").as_deref() == Ok("1")
}

// =============================================================================
// The recognizer
// =============================================================================

struct FindIntrinsics {
    bounds: BoundsCache,
}

impl FindIntrinsics {
    fn new() -> Self {
        FindIntrinsics {
            bounds: BoundsCache::new(),
        }
    }

    /// Check a rewrite preserved the static type, then keep rewriting on the
    /// result. A rewrite that changes the type is a bug, not an error value.
    fn commit(&mut self, want: Type, result: Expr) -> Expr {
        assert_eq!(
            result.ty, want,
            "BUG: rewrite changed type to {} (wanted {}): {}",
            result.ty, want, result
        );
        self.mutate(&result)
    }

    fn lossless_cast(&mut self, ty: Type, e: &Expr) -> Option<Expr> {
        lossless_cast(&mut self.bounds, ty, e)
    }

    fn lossless_narrow(&mut self, e: &Expr) -> Option<Expr> {
        if e.ty.bits < 16 {
            return None;
        }
        self.lossless_cast(e.ty.narrow(), e)
    }

    /// Remove a widening cast even if it changes the sign of the result.
    fn strip_widening_cast(&mut self, e: &Expr) -> Option<Expr> {
        if e.ty.bits < 16 {
            return None;
        }
        self.lossless_narrow(e)
            .or_else(|| self.lossless_cast(e.ty.narrow().with_code(TypeCode::UInt), e))
    }

    fn can_prove(&mut self, e: &Expr) -> bool {
        can_prove_with(&mut self.bounds, e)
    }

    fn mutate(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Add(..) => self.visit_add(e),
            ExprKind::Sub(..) => self.visit_sub(e),
            ExprKind::Mul(..) => self.visit_mul(e),
            ExprKind::Div(..) => self.visit_div(e),
            ExprKind::Min(..) | ExprKind::Max(..) => self.visit_min_or_max(e),
            ExprKind::Cast(..) => self.visit_cast(e),
            ExprKind::Reinterpret(..) => self.visit_reinterpret(e),
            ExprKind::Call { .. } => self.visit_call(e),
            ExprKind::Let { .. } => self.visit_let(e),
            _ => mutate_children(e, &mut |c| self.mutate(c)),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        let self_ptr: *mut Self = self;
        mutate_stmt_children(
            s,
            &mut |e| unsafe { (*self_ptr).mutate(e) },
            &mut |c| unsafe { (*self_ptr).mutate_stmt(c) },
        )
    }

    fn visit_add(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let (a, b) = match e.kind() {
            ExprKind::Add(a, b) => (self.mutate(a), self.mutate(b)),
            _ => unreachable!(),
        };

        // Try widening both from the same signedness as the result, and
        // from uint.
        if ty.bits >= 16 {
            for code in [ty.code, TypeCode::UInt] {
                let narrow = ty.narrow().with_code(code);
                let narrow_a = self.lossless_cast(narrow, &a);
                let narrow_b = self.lossless_cast(narrow, &b);
                if let (Some(na), Some(nb)) = (narrow_a, narrow_b) {
                    let mut result = widening_add(na, nb);
                    if result.ty != ty {
                        result = cast(ty, result);
                    }
                    return self.commit(ty, result);
                }
            }
        }

        if ty.is_int_or_uint() && ty.bits > 8 {
            for code in [ty.code, TypeCode::UInt, TypeCode::Int] {
                let narrow = ty.narrow().with_code(code);
                let narrow_a = if matches!(a.kind(), ExprKind::VectorReduce { .. }) {
                    None
                } else {
                    self.lossless_cast(narrow, &a)
                };
                let narrow_b = if matches!(b.kind(), ExprKind::VectorReduce { .. }) {
                    None
                } else {
                    self.lossless_cast(narrow, &b)
                };
                assert!(
                    narrow_a.is_none() || narrow_b.is_none(),
                    "BUG: missed a widening_add: {} + {}",
                    a,
                    b
                );
                let (wide, nx) = if let Some(na) = narrow_a {
                    (&b, na)
                } else if let Some(nb) = narrow_b {
                    (&a, nb)
                } else {
                    continue;
                };
                let result = if wide.ty.code != nx.ty.code {
                    let t = wide.ty.with_code(code);
                    let inner = widen_right_add(reinterpret(t, wide.clone()), nx);
                    assert_ne!(inner.ty, ty);
                    reinterpret(ty, inner)
                } else {
                    widen_right_add(wide.clone(), nx)
                };
                return self.commit(ty, result);
            }
        }

        if rake_rules_enabled() {
            if let Some(r) = self.rake_add_rules(ty, &a, &b) {
                return self.commit(ty, r);
            }
        }

        ir::add(a, b)
    }

    fn rake_add_rules(&mut self, ty: Type, a: &Expr, b: &Expr) -> Option<Expr> {
        // widen_right_add(x, y) + widen_right_add(z, w) -> (x + z) + widening_add(y, w)
        if let (Some((x, y)), Some((z, w))) = (
            as_call2(a, Intrinsic::WidenRightAdd),
            as_call2(b, Intrinsic::WidenRightAdd),
        ) {
            if y.ty == w.ty {
                return Some(ir::add(
                    ir::add(x.clone(), z.clone()),
                    widening_add(y.clone(), w.clone()),
                ));
            }
        }
        // reinterpret(t, x) + reinterpret(t, y) -> reinterpret(t, x + y)
        if let (ExprKind::Reinterpret(x), ExprKind::Reinterpret(y)) = (a.kind(), b.kind()) {
            if x.ty == y.ty {
                return Some(reinterpret(ty, ir::add(x.clone(), y.clone())));
            }
        }
        // widening_shift_left(x, c0) + widening_shift_left(y, c0)
        //   -> shift_left(widening_add(x, y), c0)
        let wsl_pair = |p: &Expr, q: &Expr| -> Option<Expr> {
            let (x, c0) = as_call2(p, Intrinsic::WideningShiftLeft)?;
            let (y, c1) = as_call2(q, Intrinsic::WideningShiftLeft)?;
            if c0.as_const_int().is_some() && c0 == c1 && x.ty == y.ty {
                let shift = cast(x.ty.widen().with_code(c0.ty.code), c0.clone());
                Some(shift_left(widening_add(x.clone(), y.clone()), shift))
            } else {
                None
            }
        };
        if let Some(r) = wsl_pair(a, b) {
            return Some(r);
        }
        // One of the two shifts may be buried one add deeper.
        for (p, o) in [(a, b), (b, a)] {
            if let ExprKind::Add(u, v) = o.kind() {
                for (q, z) in [(u, v), (v, u)] {
                    if let Some(r) = wsl_pair(p, q) {
                        return Some(ir::add(z.clone(), r));
                    }
                }
            }
        }
        // widening_mul(x, y) + widening_mul(z, y) -> widen_right_mul(widening_add(x, z), y)
        if let (Some((x, y)), Some((z, w))) = (
            as_call2(a, Intrinsic::WideningMul),
            as_call2(b, Intrinsic::WideningMul),
        ) {
            if y == w && x.ty == z.ty && x.ty == y.ty {
                return Some(widen_right_mul(widening_add(x.clone(), z.clone()), y.clone()));
            }
        }
        None
    }

    fn visit_sub(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let (a, b) = match e.kind() {
            ExprKind::Sub(a, b) => (self.mutate(a), self.mutate(b)),
            _ => unreachable!(),
        };

        if ty.bits >= 16 {
            for code in [ty.code, TypeCode::UInt] {
                let narrow = ty.narrow().with_code(code);
                let narrow_a = self.lossless_cast(narrow, &a);
                let narrow_b = self.lossless_cast(narrow, &b);
                if let (Some(na), Some(nb)) = (narrow_a, narrow_b) {
                    // Prefer adding a negated constant over widening_sub, so
                    // negative-constant folding never manufactures a subtract.
                    let mut result = match lossless_negate(&nb) {
                        Some(neg_nb) => widening_add(na, neg_nb),
                        None => widening_sub(na, nb),
                    };
                    if result.ty != ty {
                        result = cast(ty, result);
                    }
                    return self.commit(ty, result);
                }
            }
        }

        if let Some(negative_b) = lossless_negate(&b) {
            return self.commit(ty, ir::add(a, negative_b));
        }

        // After the negate check, so that path can become a widen_right_add.
        if ty.is_int_or_uint() && ty.bits > 8 {
            for code in [ty.code, TypeCode::UInt, TypeCode::Int] {
                let narrow = ty.narrow().with_code(code);
                if let Some(nb) = self.lossless_cast(narrow, &b) {
                    let result = if a.ty.code != nb.ty.code {
                        let t = a.ty.with_code(code);
                        let inner = widen_right_sub(reinterpret(t, a.clone()), nb);
                        assert_ne!(inner.ty, ty);
                        reinterpret(ty, inner)
                    } else {
                        widen_right_sub(a.clone(), nb)
                    };
                    return self.commit(ty, result);
                }
            }
        }

        if rake_rules_enabled() {
            if let (ExprKind::Reinterpret(x), ExprKind::Reinterpret(y)) = (a.kind(), b.kind()) {
                if x.ty == y.ty {
                    return self.commit(ty, reinterpret(ty, ir::sub(x.clone(), y.clone())));
                }
            }
        }

        ir::sub(a, b)
    }

    fn visit_mul(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let (orig_a, orig_b) = match e.kind() {
            ExprKind::Mul(a, b) => (a, b),
            _ => unreachable!(),
        };

        // Distribute constants through add/sub before anything introduces
        // widening intrinsics, so widening is found over the distributed
        // children.
        if orig_b.as_const_int().is_some() {
            match orig_a.kind() {
                ExprKind::Add(aa, ab) => {
                    let result = ir::add(
                        simplify(&ir::mul(aa.clone(), orig_b.clone())),
                        simplify(&ir::mul(ab.clone(), orig_b.clone())),
                    );
                    return self.commit(ty, result);
                }
                ExprKind::Sub(aa, ab) => {
                    let result = ir::sub(
                        simplify(&ir::mul(aa.clone(), orig_b.clone())),
                        simplify(&ir::mul(ab.clone(), orig_b.clone())),
                    );
                    return self.commit(ty, result);
                }
                _ => {}
            }
        }

        let a = self.mutate(orig_a);
        let b = self.mutate(orig_b);

        if ty.is_int_or_uint() {
            let shift_ty = ty.with_code(TypeCode::UInt);
            if let Some(pow2) = is_const_power_of_two(&a) {
                let result = shift_left(b.clone(), make_const(shift_ty, pow2 as i128));
                return self.commit(ty, result);
            }
            if let Some(pow2) = is_const_power_of_two(&b) {
                let result = shift_left(a.clone(), make_const(shift_ty, pow2 as i128));
                return self.commit(ty, result);
            }
        }

        // Sign codes may disagree between the two narrowed halves.
        let narrow_a = self.strip_widening_cast(&a);
        let narrow_b = self.strip_widening_cast(&b);
        if let (Some(na), Some(nb)) = (&narrow_a, &narrow_b) {
            if na.ty.is_int_or_uint() == nb.ty.is_int_or_uint()
                || na.ty.is_float() == nb.ty.is_float()
            {
                // Normalize: a signed payload goes on the right.
                let mut result = if na.ty.is_int() && nb.ty.is_uint() {
                    widening_mul(nb.clone(), na.clone())
                } else {
                    widening_mul(na.clone(), nb.clone())
                };
                if result.ty != ty {
                    result = cast(ty, result);
                }
                return self.commit(ty, result);
            }
        }

        if ty.is_int_or_uint() && ty.bits > 8 {
            for code in [ty.code, TypeCode::UInt, TypeCode::Int] {
                let narrow = ty.narrow().with_code(code);
                let narrow_a = self.lossless_cast(narrow, &a);
                let narrow_b = self.lossless_cast(narrow, &b);
                assert!(
                    narrow_a.is_none() || narrow_b.is_none(),
                    "BUG: missed a widening_mul: {} * {}",
                    a,
                    b
                );
                let (wide, nx) = if let Some(na) = narrow_a {
                    (&b, na)
                } else if let Some(nb) = narrow_b {
                    (&a, nb)
                } else {
                    continue;
                };
                let result = if wide.ty.code != nx.ty.code {
                    let t = wide.ty.with_code(code);
                    let inner = widen_right_mul(reinterpret(t, wide.clone()), nx);
                    assert_ne!(inner.ty, ty);
                    reinterpret(ty, inner)
                } else {
                    widen_right_mul(wide.clone(), nx)
                };
                return self.commit(ty, result);
            }
        }

        if rake_rules_enabled() {
            if let (ExprKind::Reinterpret(x), ExprKind::Reinterpret(y)) = (a.kind(), b.kind()) {
                if x.ty == y.ty {
                    return self.commit(ty, reinterpret(ty, ir::mul(x.clone(), y.clone())));
                }
            }
        }

        ir::mul(a, b)
    }

    fn visit_div(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let (a, b) = match e.kind() {
            ExprKind::Div(a, b) => (self.mutate(a), self.mutate(b)),
            _ => unreachable!(),
        };
        if ty.is_int_or_uint() {
            if let Some(shift_amount) = is_const_power_of_two(&b) {
                let shift_ty = ty.with_code(TypeCode::UInt);
                let result = shift_right(a, make_const(shift_ty, shift_amount as i128));
                return self.commit(ty, result);
            }
        }
        ir::div(a, b)
    }

    // No Mod rules: nothing looks for bitwise-and against modulo.

    fn visit_min_or_max(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let (a, b, is_min) = match e.kind() {
            ExprKind::Min(a, b) => (self.mutate(a), self.mutate(b), true),
            ExprKind::Max(a, b) => (self.mutate(a), self.mutate(b), false),
            _ => unreachable!(),
        };

        // A widening cast can be moved outside the min/max.
        if let ExprKind::Cast(av) = a.kind() {
            if a.ty.can_represent(av.ty) {
                if let Some(cast_b) = self.lossless_cast(av.ty, &b) {
                    let inner = if is_min {
                        ir::min(av.clone(), cast_b)
                    } else {
                        ir::max(av.clone(), cast_b)
                    };
                    return self.commit(ty, cast(ty, inner));
                }
            }
        }

        if is_min {
            ir::min(a, b)
        } else {
            ir::max(a, b)
        }
    }

    fn visit_reinterpret(&mut self, e: &Expr) -> Expr {
        let value = match e.kind() {
            ExprKind::Reinterpret(v) => self.mutate(v),
            _ => unreachable!(),
        };
        if e.ty == value.ty {
            return value;
        }
        if let ExprKind::Reinterpret(inner) = value.kind() {
            // Fold double-reinterprets.
            let inner = inner.clone();
            return self.mutate(&reinterpret(e.ty, inner));
        }
        reinterpret(e.ty, value)
    }

    fn visit_let(&mut self, e: &Expr) -> Expr {
        let (name, value, body) = match e.kind() {
            ExprKind::Let { name, value, body } => (name.clone(), value, body),
            _ => unreachable!(),
        };
        let new_value = self.mutate(value);
        if e.ty.is_vector() && e.ty.is_int_or_uint() {
            let interval = self.bounds.interval(&new_value);
            self.bounds.push_binding(&name, interval);
            let new_body = self.mutate(body);
            self.bounds.pop_binding(&name);
            ir::let_expr(name, new_value, new_body)
        } else {
            let new_body = self.mutate(body);
            ir::let_expr(name, new_value, new_body)
        }
    }

    // -------------------------------------------------------------------------
    // Cast rules
    // -------------------------------------------------------------------------

    fn visit_cast(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let mut value = match e.kind() {
            ExprKind::Cast(v) => self.mutate(v),
            _ => unreachable!(),
        };

        // Normalize same-width int-to-int casts to reinterpret.
        if ty.is_int_or_uint() && value.ty.is_int_or_uint() && ty.bits == value.ty.bits {
            return self.mutate(&reinterpret(ty, value));
        }

        // This mutator can generate redundant casts; collapse them here
        // rather than through the simplifier, which would undo rewrites.
        let stripped = match value.kind() {
            ExprKind::Cast(inner)
                if value.ty.can_represent(inner.ty) || value.ty.can_represent(ty) =>
            {
                Some(inner.clone())
            }
            _ => None,
        };
        if let Some(inner) = stripped {
            value = inner;
        }

        if ty.is_int_or_uint() {
            if let Some(result) = self.cast_rules(ty, &value) {
                return self.commit(ty, result);
            }
            if let Some(result) = self.narrow_widened_rounding_shift(ty, &value) {
                return self.commit(ty, result);
            }
        }

        if value.ty == ty {
            value
        } else {
            cast(ty, value)
        }
    }

    /// The saturating / averaging / multiply-keep-high-bits rule bank for
    /// `cast(ty, value)`. First match wins.
    fn cast_rules(&mut self, ty: Type, value: &Expr) -> Option<Expr> {
        let bits = ty.bits;
        let upper = ty.max_value();
        let lower = ty.min_value();
        let unsigned_ty = ty.with_code(TypeCode::UInt);
        let is_x_same_int = |x: &Expr| ty.is_int() && x.ty.is_int() && x.ty.bits == bits;
        let is_x_same_uint = |x: &Expr| ty.is_uint() && x.ty.is_uint() && x.ty.bits == bits;
        let is_x_same_int_or_uint = |x: &Expr| is_x_same_int(x) || is_x_same_uint(x);
        let x_y_same_sign = |x: &Expr, y: &Expr| {
            (x.ty.is_int() && y.ty.is_int()) || (x.ty.is_uint() && y.ty.is_uint())
        };
        let is_y_narrow_uint =
            |y: &Expr| ty.is_uint() && y.ty.is_uint() && y.ty.bits == bits / 2;
        let shift_cast = |z: &Expr| cast(unsigned_ty, z.clone());

        // Saturating patterns.
        if let ExprKind::Max(m, lo) = value.kind() {
            if lo.as_const_int() == Some(lower) {
                if let ExprKind::Min(v, up) = m.kind() {
                    if up.as_const_int() == Some(upper) {
                        if let Some((x, y)) = as_call2(v, Intrinsic::WideningAdd) {
                            if is_x_same_int_or_uint(x) {
                                return Some(saturating_add(x.clone(), y.clone()));
                            }
                        }
                        if let Some((x, y)) = as_call2(v, Intrinsic::WideningSub) {
                            if is_x_same_int_or_uint(x) {
                                return Some(saturating_sub(x.clone(), y.clone()));
                            }
                        }
                        // Multiply-keep-high-bits, fully clamped.
                        if let Some((inner, z)) = as_call2(v, Intrinsic::ShiftRight) {
                            if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                                if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint()
                                {
                                    return Some(mul_shift_right(
                                        x.clone(),
                                        y.clone(),
                                        shift_cast(z),
                                    ));
                                }
                            }
                        }
                        if let Some((inner, z)) = as_call2(v, Intrinsic::RoundingShiftRight) {
                            if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                                if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint()
                                {
                                    return Some(rounding_mul_shift_right(
                                        x.clone(),
                                        y.clone(),
                                        shift_cast(z),
                                    ));
                                }
                            }
                        }
                        // Saturating narrow.
                        return Some(saturating_cast(ty, v.clone()));
                    }
                }
            }
            // max(widening_sub(x, y), lo) for uint saturates at zero alone.
            if ty.is_uint() && lo.as_const_int() == Some(lower) {
                if let Some((x, y)) = as_call2(m, Intrinsic::WideningSub) {
                    if is_x_same_uint(x) {
                        return Some(saturating_sub(x.clone(), y.clone()));
                    }
                }
            }
        }

        if let ExprKind::Min(v, up) = value.kind() {
            if up.as_const_int() == Some(upper) {
                // min(cast(wide_signed, widening_add(x, y)), up) for uint.
                if let ExprKind::Cast(inner) = v.kind() {
                    if v.ty == ty.widen().with_code(TypeCode::Int) {
                        if let Some((x, y)) = as_call2(inner, Intrinsic::WideningAdd) {
                            if is_x_same_uint(x) {
                                return Some(saturating_add(x.clone(), y.clone()));
                            }
                        }
                    }
                }
                if ty.is_uint() {
                    if let Some((x, y)) = as_call2(v, Intrinsic::WideningAdd) {
                        if is_x_same_uint(x) {
                            return Some(saturating_add(x.clone(), y.clone()));
                        }
                    }
                }
                // One-sided multiply-keep-high-bits (uint path).
                if let Some((inner, z)) = as_call2(v, Intrinsic::ShiftRight) {
                    if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                        if is_x_same_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint() {
                            return Some(mul_shift_right(x.clone(), y.clone(), shift_cast(z)));
                        }
                        // For signed, the full upper half only needs the top clamp.
                        if is_x_same_int(x)
                            && x_y_same_sign(x, y)
                            && z.as_const_int().is_some_and(|c| c >= (bits as i128) - 1)
                        {
                            return Some(mul_shift_right(x.clone(), y.clone(), shift_cast(z)));
                        }
                    }
                }
                if let Some((inner, z)) = as_call2(v, Intrinsic::RoundingShiftRight) {
                    if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                        if is_x_same_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint() {
                            return Some(rounding_mul_shift_right(
                                x.clone(),
                                y.clone(),
                                shift_cast(z),
                            ));
                        }
                        if is_x_same_int(x)
                            && x_y_same_sign(x, y)
                            && z.as_const_int().is_some_and(|c| c >= (bits as i128) - 1)
                        {
                            return Some(rounding_mul_shift_right(
                                x.clone(),
                                y.clone(),
                                shift_cast(z),
                            ));
                        }
                    }
                }
                // Saturating narrow with only the upper bound (uint input).
                if v.ty.is_uint() {
                    return Some(saturating_cast(ty, v.clone()));
                }
            }
        }

        // Averaging patterns. Prefer rounding_halving_add when unsigned.
        if let Some((inner, shift)) = as_call2(value, Intrinsic::ShiftRight) {
            let shift_amt = shift.as_const_int();
            if let Some((x, y)) = as_call2(inner, Intrinsic::WideningAdd) {
                let c0 = y.as_const_int();
                if shift_amt == Some(1) {
                    if let Some(c0) = c0 {
                        if c0 > 0 && is_x_same_uint(x) {
                            return Some(rounding_halving_add(
                                x.clone(),
                                make_const(x.ty, c0 - 1),
                            ));
                        }
                    }
                    if is_x_same_int_or_uint(x) && x.ty == y.ty {
                        return Some(halving_add(x.clone(), y.clone()));
                    }
                }
                if let (Some(c0), Some(c1)) = (c0, shift_amt) {
                    if c1 > 0 && c0 == (1i128 << (c1 - 1)) && is_x_same_int_or_uint(x) {
                        return Some(rounding_shift_right(x.clone(), make_const(ty, c1)));
                    }
                    if c0 > 0 && c1 > 0 && is_x_same_uint(x) {
                        return Some(shift_right(
                            rounding_halving_add(x.clone(), make_const(x.ty, c0 - 1)),
                            make_const(ty, c1 - 1),
                        ));
                    }
                }
                if let Some(c0) = shift_amt {
                    if c0 > 0 && is_x_same_int_or_uint(x) && x.ty == y.ty {
                        return Some(shift_right(
                            halving_add(x.clone(), y.clone()),
                            make_const(ty, c0 - 1),
                        ));
                    }
                }
            }
            if shift_amt == Some(1) {
                if let Some((x, y)) = as_call2(inner, Intrinsic::WideningSub) {
                    if is_x_same_int_or_uint(x) && x.ty == y.ty {
                        return Some(halving_sub(x.clone(), y.clone()));
                    }
                }
                // The sub may carry an extra widening cast before the shift.
                if let ExprKind::Cast(c) = inner.kind() {
                    if inner.ty == ty.widen() {
                        if let Some((x, y)) = as_call2(c, Intrinsic::WideningSub) {
                            if is_x_same_int_or_uint(x) && x.ty == y.ty {
                                return Some(halving_sub(x.clone(), y.clone()));
                            }
                        }
                    }
                }
            }
            // Multiply-keep-high-bits without clamping: the shift must cover
            // the full narrow width (or half of it when one side is narrow).
            if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                if let Some(c0) = shift_amt {
                    if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && c0 >= bits as i128 {
                        return Some(mul_shift_right(
                            x.clone(),
                            y.clone(),
                            make_const(unsigned_ty, c0),
                        ));
                    }
                    for (p, q) in [(x, y), (y, x)] {
                        if let ExprKind::Cast(qv) = q.kind() {
                            if q.ty == p.ty
                                && is_x_same_int_or_uint(p)
                                && is_y_narrow_uint(qv)
                                && c0 >= (bits / 2) as i128
                            {
                                return Some(mul_shift_right(
                                    p.clone(),
                                    q.clone(),
                                    make_const(unsigned_ty, c0),
                                ));
                            }
                        }
                    }
                }
            }
        }

        if let Some((x, y)) = as_call2(value, Intrinsic::HalvingAdd) {
            // halving_add(widening_add(x, y), 1) -> rounding_halving_add(x, y)
            if y.as_const_int() == Some(1) {
                if let Some((a, b)) = as_call2(x, Intrinsic::WideningAdd) {
                    if is_x_same_int_or_uint(a) && a.ty == b.ty {
                        return Some(rounding_halving_add(a.clone(), b.clone()));
                    }
                }
            }
            if let Some((a, b)) = as_call2(x, Intrinsic::WideningAdd) {
                if b.as_const_int() == Some(1) && is_x_same_int_or_uint(a) {
                    if let Some(ny) = self.lossless_cast(a.ty, y) {
                        return Some(rounding_halving_add(a.clone(), ny));
                    }
                }
            }
        }

        if let Some((inner, shift)) = as_call2(value, Intrinsic::RoundingShiftRight) {
            if shift.as_const_int() == Some(1) {
                if let Some((x, y)) = as_call2(inner, Intrinsic::WideningAdd) {
                    if is_x_same_int_or_uint(x) && x.ty == y.ty {
                        return Some(rounding_halving_add(x.clone(), y.clone()));
                    }
                }
            }
            if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                if let Some(c0) = shift.as_const_int() {
                    if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && c0 >= bits as i128 {
                        return Some(rounding_mul_shift_right(
                            x.clone(),
                            y.clone(),
                            make_const(unsigned_ty, c0),
                        ));
                    }
                    for (p, q) in [(x, y), (y, x)] {
                        if let ExprKind::Cast(qv) = q.kind() {
                            if q.ty == p.ty
                                && is_x_same_int_or_uint(p)
                                && is_y_narrow_uint(qv)
                                && c0 >= (bits / 2) as i128
                            {
                                return Some(rounding_mul_shift_right(
                                    p.clone(),
                                    q.clone(),
                                    make_const(unsigned_ty, c0),
                                ));
                            }
                        }
                    }
                }
            }
        }

        None
    }

    /// When the cast argument is a widened rounding shift, the widening may
    /// be unnecessary. With saturation present, only provably-right shifts
    /// (or provably-left for the left variant) can drop it.
    fn narrow_widened_rounding_shift(&mut self, ty: Type, value: &Expr) -> Option<Expr> {
        let is_wide = |x: &Expr| {
            (ty.is_int() && x.ty.is_int() || ty.is_uint() && x.ty.is_uint())
                && x.ty.bits == ty.bits * 2
        };
        let (shift_op, x, y, saturated) = if let ExprKind::Max(m, lo) = value.kind() {
            let (ExprKind::Min(v, up), Some(lo_c)) = (m.kind(), lo.as_const_int()) else {
                return None;
            };
            if lo_c != ty.min_value() || up.as_const_int() != Some(ty.max_value()) {
                return None;
            }
            let (x, y) = as_call2(v, Intrinsic::RoundingShiftRight)?;
            (Intrinsic::RoundingShiftRight, x, y, true)
        } else if let Some((x, y)) = as_call2(value, Intrinsic::RoundingShiftRight) {
            (Intrinsic::RoundingShiftRight, x, y, false)
        } else if let Some((x, y)) = as_call2(value, Intrinsic::RoundingShiftLeft) {
            (Intrinsic::RoundingShiftLeft, x, y, false)
        } else {
            return None;
        };
        if !is_wide(x) {
            return None;
        }
        let a = self.lossless_cast(ty, x)?;
        let b = self.lossless_cast(ty.with_code(y.ty.code), y)?;
        let ok = if !saturated {
            true
        } else if shift_op == Intrinsic::RoundingShiftRight {
            self.can_prove(&ir::ge(b.clone(), make_zero(b.ty)))
        } else {
            self.can_prove(&ir::le(b.clone(), make_zero(b.ty)))
        };
        if !ok {
            return None;
        }
        Some(if shift_op == Intrinsic::RoundingShiftRight {
            rounding_shift_right(a, b)
        } else {
            rounding_shift_left(a, b)
        })
    }

    // -------------------------------------------------------------------------
    // Call rules
    // -------------------------------------------------------------------------

    fn visit_call(&mut self, e: &Expr) -> Expr {
        let ty = e.ty;
        if !find_intrinsics_for_type(ty) {
            return mutate_children(e, &mut |c| self.mutate(c));
        }
        let mutated = mutate_children(e, &mut |c| self.mutate(c));
        let ExprKind::Call {
            op: CallOp::Intrin(op),
            args,
        } = mutated.kind()
        else {
            return mutated;
        };
        let op = *op;
        let bits = ty.bits;

        // abs(widening_sub(x, y)) -> cast(absd(x, y))
        if op == Intrinsic::Abs {
            if let Some((x, y)) = as_call2(&args[0], Intrinsic::WideningSub) {
                if x.ty == y.ty {
                    return self.commit(ty, cast(ty, intrin::absd(x.clone(), y.clone())));
                }
            }
        }

        let is_x_same_int = |x: &Expr| ty.is_int() && x.ty.is_int() && x.ty.bits == bits;
        let is_x_same_uint = |x: &Expr| ty.is_uint() && x.ty.is_uint() && x.ty.bits == bits;
        let is_x_same_int_or_uint = |x: &Expr| is_x_same_int(x) || is_x_same_uint(x);
        let x_y_same_sign = |x: &Expr, y: &Expr| {
            x.ty.is_int() == y.ty.is_int() || (x.ty.is_uint() && y.ty.is_uint())
        };
        let unsigned_ty = ty.with_code(TypeCode::UInt);

        // Widen-right folding: stacked widen-right ops collapse into one
        // outer op plus a widening op on the narrow halves.
        if op == Intrinsic::WidenRightAdd {
            if let Some((x, y)) = as_call2(&args[0], Intrinsic::WidenRightAdd) {
                if is_x_same_int_or_uint(x) && y.ty == args[1].ty {
                    let result = ir::add(x.clone(), widening_add(y.clone(), args[1].clone()));
                    return self.commit(ty, result);
                }
            }
            if let Some((x, y)) = as_call2(&args[0], Intrinsic::WidenRightSub) {
                if y.ty == args[1].ty {
                    if is_x_same_int(x) {
                        let result =
                            ir::add(x.clone(), widening_sub(args[1].clone(), y.clone()));
                        return self.commit(ty, result);
                    }
                    if is_x_same_uint(x) {
                        let result = ir::add(
                            x.clone(),
                            cast(ty, widening_sub(args[1].clone(), y.clone())),
                        );
                        return self.commit(ty, result);
                    }
                }
            }
        }
        if op == Intrinsic::WidenRightSub {
            if let Some((x, y)) = as_call2(&args[0], Intrinsic::WidenRightSub) {
                if is_x_same_int_or_uint(x) && y.ty == args[1].ty {
                    let result = ir::sub(x.clone(), widening_add(y.clone(), args[1].clone()));
                    return self.commit(ty, result);
                }
            }
            if let Some((x, y)) = as_call2(&args[0], Intrinsic::WidenRightAdd) {
                if y.ty == args[1].ty {
                    if is_x_same_int(x) {
                        let result =
                            ir::add(x.clone(), widening_sub(y.clone(), args[1].clone()));
                        return self.commit(ty, result);
                    }
                    if is_x_same_uint(x) {
                        let result = ir::add(
                            x.clone(),
                            cast(ty, widening_sub(y.clone(), args[1].clone())),
                        );
                        return self.commit(ty, result);
                    }
                }
            }
        }

        // Saturating patterns reached through an explicit saturating_cast.
        if op == Intrinsic::SaturatingCast {
            let arg = &args[0];
            if let Some((x, y)) = as_call2(arg, Intrinsic::WideningAdd) {
                if is_x_same_int_or_uint(x) && x.ty == y.ty {
                    return self.commit(ty, saturating_add(x.clone(), y.clone()));
                }
            }
            if let Some((x, y)) = as_call2(arg, Intrinsic::WideningSub) {
                if is_x_same_int_or_uint(x) && x.ty == y.ty {
                    return self.commit(ty, saturating_sub(x.clone(), y.clone()));
                }
            }
            if let Some((inner, z)) = as_call2(arg, Intrinsic::ShiftRight) {
                if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                    if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint() {
                        let result =
                            mul_shift_right(x.clone(), y.clone(), cast(unsigned_ty, z.clone()));
                        return self.commit(ty, result);
                    }
                }
            }
            if let Some((inner, z)) = as_call2(arg, Intrinsic::RoundingShiftRight) {
                if let Some((x, y)) = as_call2(inner, Intrinsic::WideningMul) {
                    if is_x_same_int_or_uint(x) && x_y_same_sign(x, y) && z.ty.is_uint() {
                        let result = rounding_mul_shift_right(
                            x.clone(),
                            y.clone(),
                            cast(unsigned_ty, z.clone()),
                        );
                        return self.commit(ty, result);
                    }
                }
            }
            // A saturating narrow of a widened rounding shift only needs the
            // wide type when the shift direction is unprovable.
            for (which, right) in [
                (Intrinsic::RoundingShiftRight, true),
                (Intrinsic::RoundingShiftLeft, false),
            ] {
                if let Some((x, y)) = as_call2(arg, which) {
                    let wide_same = (ty.is_int() && x.ty.is_int()
                        || ty.is_uint() && x.ty.is_uint())
                        && x.ty.bits == bits * 2;
                    if wide_same {
                        let na = self.lossless_cast(ty, x);
                        let nb = self.lossless_cast(ty.with_code(y.ty.code), y);
                        if let (Some(na), Some(nb)) = (na, nb) {
                            let zero = make_zero(nb.ty);
                            let provable = if right {
                                self.can_prove(&ir::ge(nb.clone(), zero))
                            } else {
                                self.can_prove(&ir::le(nb.clone(), zero))
                            };
                            if provable {
                                let result = if right {
                                    rounding_shift_right(na, nb)
                                } else {
                                    rounding_shift_left(na, nb)
                                };
                                return self.commit(ty, result);
                            }
                        }
                    }
                }
            }
            // Unnecessary widening before a saturating narrow.
            if let ExprKind::Cast(x) = arg.kind() {
                let is_x_wider_int_or_uint = (ty.is_int() && x.ty.is_int()
                    || ty.is_uint() && x.ty.is_uint())
                    && x.ty.bits == bits * 2;
                let opposite = if ty.is_int() {
                    TypeCode::UInt
                } else {
                    TypeCode::Int
                };
                let is_x_wider_opposite = x.ty.code == opposite && x.ty.bits == bits * 2;
                if bits <= 32 && arg.ty == ty.widen() && is_x_same_int_or_uint(x) {
                    return self.commit(ty, x.clone());
                }
                if bits <= 16 {
                    if arg.ty == ty.widen().widen() && is_x_wider_int_or_uint {
                        return self.commit(ty, saturating_cast(ty, x.clone()));
                    }
                    if arg.ty == ty.widen().widen().with_code(opposite) && is_x_wider_opposite {
                        return self.commit(ty, saturating_cast(ty, x.clone()));
                    }
                }
            }
        }

        // Overflow-free averaging idioms.
        if no_overflow(ty) {
            if op == Intrinsic::HalvingAdd {
                if let ExprKind::Add(x, y) = args[0].kind() {
                    if args[1].as_const_int() == Some(1) {
                        return self.commit(ty, rounding_halving_add(x.clone(), y.clone()));
                    }
                }
                if let ExprKind::Add(x, y) = args[1].kind() {
                    if y.as_const_int() == Some(1) {
                        return self
                            .commit(ty, rounding_halving_add(args[0].clone(), x.clone()));
                    }
                }
                if let ExprKind::Add(x, y) = args[0].kind() {
                    if y.as_const_int() == Some(1) {
                        return self
                            .commit(ty, rounding_halving_add(x.clone(), args[1].clone()));
                    }
                }
                if args[1].as_const_int() == Some(1) {
                    let result = rounding_shift_right(args[0].clone(), ir::make_one(ty));
                    return self.commit(ty, result);
                }
            }
            if op == Intrinsic::ShiftRight && args[1].as_const_int() == Some(1) {
                if let ExprKind::Add(x, y) = args[0].kind() {
                    return self.commit(ty, halving_add(x.clone(), y.clone()));
                }
                if let ExprKind::Sub(x, y) = args[0].kind() {
                    return self.commit(ty, halving_sub(x.clone(), y.clone()));
                }
            }
            if op == Intrinsic::RoundingShiftRight && args[1].as_const_int() == Some(1) {
                if let ExprKind::Add(x, y) = args[0].kind() {
                    return self.commit(ty, rounding_halving_add(x.clone(), y.clone()));
                }
            }
        }

        // Move widening casts inside widening arithmetic outside it,
        // e.g. widening_mul(widen(u8), widen(i8)) -> widen(widening_mul(u8, i8)).
        if op == Intrinsic::WideningMul {
            let narrow_a = self.strip_widening_cast(&args[0]);
            let narrow_b = self.strip_widening_cast(&args[1]);
            if let (Some(na), Some(nb)) = (narrow_a, narrow_b) {
                return self.commit(ty, cast(ty, widening_mul(na, nb)));
            }
        } else if (op == Intrinsic::WideningAdd || op == Intrinsic::WideningSub) && bits >= 32 {
            for code in [ty.code, TypeCode::UInt] {
                let narrow_t = ty.narrow().narrow().with_code(code);
                let narrow_a = self.lossless_cast(narrow_t, &args[0]);
                let narrow_b = self.lossless_cast(narrow_t, &args[1]);
                if let (Some(na), Some(nb)) = (narrow_a, narrow_b) {
                    let inner = if op == Intrinsic::WideningAdd {
                        widening_add(na, nb)
                    } else {
                        widening_sub(na, nb)
                    };
                    return self.commit(ty, cast(ty, inner));
                }
            }
        }

        if op == Intrinsic::ShiftLeft || op == Intrinsic::ShiftRight {
            // Try to turn this into a widening shift.
            let a_narrow = self.lossless_narrow(&args[0]);
            let b_narrow = self.lossless_narrow(&args[1]);
            if let (Some(na), Some(nb)) = (a_narrow, b_narrow) {
                let mut result = if op == Intrinsic::ShiftLeft {
                    widening_shift_left(na, nb)
                } else {
                    widening_shift_right(na, nb)
                };
                if result.ty != ty {
                    result = cast(ty, result);
                }
                return self.commit(ty, result);
            }

            if rake_rules_enabled() && ty.is_int() && bits >= 16 {
                let uint_ty = ty.narrow().with_code(TypeCode::UInt);
                let a_narrow = self.lossless_cast(uint_ty, &args[0]);
                let b_narrow = self.lossless_cast(uint_ty, &args[1]);
                if let (Some(na), Some(nb)) = (a_narrow, b_narrow) {
                    let mut result = if op == Intrinsic::ShiftLeft {
                        widening_shift_left(na, nb)
                    } else {
                        widening_shift_right(na, nb)
                    };
                    if result.ty != ty {
                        result = cast(ty, result);
                    }
                    return self.commit(ty, result);
                }
            }

            // Try to turn this into a rounding shift.
            if let Some(rs) = self.to_rounding_shift(op, &args[0], &args[1]) {
                return self.commit(ty, rs);
            }
        }

        if op == Intrinsic::RoundingShiftLeft || op == Intrinsic::RoundingShiftRight {
            // Narrow both sides when the shift direction is provable.
            let a_narrow = self.lossless_narrow(&args[0]);
            let b_narrow = self.lossless_narrow(&args[1]);
            if let (Some(na), Some(nb)) = (a_narrow, b_narrow) {
                let zero = make_zero(nb.ty);
                let result = if op == Intrinsic::RoundingShiftRight
                    && self.can_prove(&ir::gt(nb.clone(), zero.clone()))
                {
                    Some(rounding_shift_right(na, nb))
                } else if op == Intrinsic::RoundingShiftLeft
                    && self.can_prove(&ir::lt(nb.clone(), zero))
                {
                    Some(rounding_shift_left(na, nb))
                } else {
                    None
                };
                if let Some(mut result) = result {
                    if result.ty != ty {
                        result = cast(ty, result);
                    }
                    return self.commit(ty, result);
                }
            }
        }

        mutated
    }

    /// Recognize a plain shift as a rounding shift by finding and removing
    /// an addition of the round constant, proving headroom exists for the
    /// removal in modular types.
    fn to_rounding_shift(&mut self, op: Intrinsic, a: &Expr, b: &Expr) -> Option<Expr> {
        let b_const = b.as_const_int()?;
        let rounding_shift = |x: Expr, y: Expr| {
            if op == Intrinsic::ShiftRight {
                rounding_shift_right(x, y)
            } else {
                rounding_shift_left(x, y)
            }
        };
        // The rounding offset for the shift we have.
        let round = if op == Intrinsic::ShiftRight {
            if b_const > 0 {
                1i128 << (b_const - 1)
            } else {
                0
            }
        } else if b_const < 0 {
            1i128 << (-b_const - 1)
        } else {
            0
        };
        if round == 0 {
            return None;
        }

        // A widening add absorbing the round constant is always safe.
        if let Some((x, y)) = as_call2(a, Intrinsic::WideningAdd) {
            if x.as_const_int() == Some(round) {
                return Some(rounding_shift(cast(a.ty, y.clone()), b.clone()));
            }
            if y.as_const_int() == Some(round) {
                return Some(rounding_shift(cast(a.ty, x.clone()), b.clone()));
            }
        }
        if let Some((x, y)) = as_call2(a, Intrinsic::WidenRightAdd) {
            if y.as_const_int() == Some(round) {
                return Some(rounding_shift(cast(a.ty, x.clone()), b.clone()));
            }
        }
        // A reinterpret wrapping a widen_right_add shows up when signedness
        // flipped on the way in; unwrap both layers.
        if let ExprKind::Reinterpret(inner) = a.kind() {
            if a.ty.bits == inner.ty.bits {
                if let Some((x, y)) = as_call2(inner, Intrinsic::WidenRightAdd) {
                    if y.as_const_int() == Some(round) {
                        let ExprKind::Reinterpret(x_inner) = x.kind() else {
                            panic!("BUG: expected a reinterpret under widen_right_add: {}", x);
                        };
                        let shifted = rounding_shift(x_inner.clone(), b.clone());
                        return Some(reinterpret(a.ty, shifted));
                    }
                }
            }
        }

        // Otherwise search the add tree for the literal round term. Removing
        // it is only sound if the type has no defined overflow, or a widening
        // op inside guarantees headroom.
        let a_less_round = find_and_subtract(a, round)?;
        if no_overflow(a.ty) || is_safe_for_add(&a_less_round, safe_add_probe_depth(a.ty)) {
            return Some(rounding_shift(simplify(&a_less_round), b.clone()));
        }
        None
    }
}

// =============================================================================
// Widening-let substitution
// =============================================================================

/// Substitute let values whose vector type is wider than everything they
/// reference, so recognition patterns can reach across binders. Each let in
/// a chain is wider than the ones it refers to, so this cannot explode.
/// Impure subexpressions are left behind as fresh bindings.
struct SubstituteInWideningLets {
    replacements: HashMap<String, Vec<Expr>>,
    next_tmp: u32,
}

impl SubstituteInWideningLets {
    fn new() -> Self {
        SubstituteInWideningLets {
            replacements: HashMap::new(),
            next_tmp: 0,
        }
    }

    fn widens(e: &Expr) -> bool {
        let bits = e.ty.bits;
        let mut all_narrower = true;
        ir::visit_expr(e, &mut |c| match c.kind() {
            ExprKind::Var(_) | ExprKind::Load { .. } => all_narrower &= c.ty.bits < bits,
            ExprKind::Call { op, .. } => {
                let pure_intrin = matches!(op, CallOp::Intrin(i) if i.is_pure());
                if !pure_intrin {
                    all_narrower &= c.ty.bits < bits;
                }
            }
            _ => {}
        });
        all_narrower
    }

    fn fresh_name(&mut self) -> String {
        let n = self.next_tmp;
        self.next_tmp += 1;
        format!("t{}", n)
    }

    /// Pull impure subexpressions out of `e`, recording them as pending
    /// bindings, so the rest can be substituted freely.
    fn leave_behind_impure(&mut self, e: &Expr, frames: &mut Vec<(String, Expr)>) -> Expr {
        let liftable = match e.kind() {
            ExprKind::Load { .. } => true,
            ExprKind::Call { op, .. } => {
                !matches!(op, CallOp::Intrin(i) if i.is_pure())
            }
            _ => false,
        };
        if liftable {
            let name = self.fresh_name();
            frames.push((name.clone(), e.clone()));
            ir::var(e.ty, name)
        } else {
            mutate_children(e, &mut |c| self.leave_behind_impure(c, frames))
        }
    }

    fn mutate(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Var(name) => {
                if let Some(r) = self.replacements.get(name).and_then(|s| s.last()) {
                    r.clone()
                } else {
                    e.clone()
                }
            }
            ExprKind::Let { name, value, body } => {
                let mut frames = Vec::new();
                let mut value = self.mutate(value);
                let mut should_replace =
                    find_intrinsics_for_type(value.ty) && Self::widens(&value);
                if should_replace {
                    value = self.leave_behind_impure(&value, &mut frames);
                    // Mutate what was left behind in case it refers to lets
                    // already being substituted.
                    for (_, sub) in frames.iter_mut() {
                        *sub = self.mutate(sub);
                    }
                    // Check it wasn't lifted entirely.
                    should_replace = !matches!(value.kind(), ExprKind::Var(_));
                }
                if should_replace {
                    self.replacements
                        .entry(name.clone())
                        .or_default()
                        .push(value.clone());
                }
                let body = self.mutate(body);
                if should_replace {
                    self.replacements.get_mut(name).unwrap().pop();
                }
                let mut result = if should_replace {
                    body
                } else {
                    ir::let_expr(name.clone(), value, body)
                };
                for (frame_name, frame_value) in frames.into_iter().rev() {
                    result = ir::let_expr(frame_name, frame_value, result);
                }
                result
            }
            _ => mutate_children(e, &mut |c| self.mutate(c)),
        }
    }

    fn mutate_stmt(&mut self, s: &Stmt) -> Stmt {
        match s {
            Stmt::LetStmt { name, value, body } => {
                let mut frames = Vec::new();
                let mut value = self.mutate(value);
                let mut should_replace =
                    find_intrinsics_for_type(value.ty) && Self::widens(&value);
                if should_replace {
                    value = self.leave_behind_impure(&value, &mut frames);
                    for (_, sub) in frames.iter_mut() {
                        *sub = self.mutate(sub);
                    }
                    should_replace = !matches!(value.kind(), ExprKind::Var(_));
                }
                if should_replace {
                    self.replacements
                        .entry(name.clone())
                        .or_default()
                        .push(value.clone());
                }
                let body = self.mutate_stmt(body);
                if should_replace {
                    self.replacements.get_mut(name).unwrap().pop();
                }
                let mut result = if should_replace {
                    body
                } else {
                    Stmt::LetStmt {
                        name: name.clone(),
                        value,
                        body: Box::new(body),
                    }
                };
                for (frame_name, frame_value) in frames.into_iter().rev() {
                    result = Stmt::LetStmt {
                        name: frame_name,
                        value: frame_value,
                        body: Box::new(result),
                    };
                }
                result
            }
            _ => {
                let self_ptr: *mut Self = self;
                mutate_stmt_children(
                    s,
                    &mut |e| unsafe { (*self_ptr).mutate(e) },
                    &mut |c| unsafe { (*self_ptr).mutate_stmt(c) },
                )
            }
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Recognize intrinsic idioms in an expression. With
/// `HL_DISABLE_INTRINISICS=1` the recognizer is skipped and intrinsics are
/// lowered to target-style saturating ops instead.
pub fn find_intrinsics(e: &Expr) -> Expr {
    if intrinsics_disabled() {
        return super::lower::lower_intrinsics(&super::lower::lower_for_llvm(e));
    }
    let e = SubstituteInWideningLets::new().mutate(e);
    FindIntrinsics::new().mutate(&e)
}

/// Statement-level entry point for intrinsic recognition.
pub fn find_intrinsics_stmt(s: &Stmt) -> Stmt {
    if intrinsics_disabled() {
        return super::lower::lower_intrinsics_stmt(&super::lower::lower_for_llvm_stmt(s));
    }
    let s = SubstituteInWideningLets::new().mutate_stmt(s);
    FindIntrinsics::new().mutate_stmt(&s)
}
