//! Intrinsic lowering: expand named intrinsics back to reference arithmetic.
//!
//! Two flavours exist for most ops. `lower_intrinsic` is the efficient
//! path; `lower_intrinsic_reference` goes through the widened type even
//! when wasteful and is what the shader emitter uses when the target has
//! no direct opcode. Both are bit-exact: for every intrinsic and every
//! well-typed input, evaluating the lowering gives the same result as the
//! intrinsic's own definition.

use crate::intrinsics::{
    self as intrin, bitwise_and, bitwise_not, bitwise_xor, halving_add, mul_shift_right, narrow,
    rounding_halving_add, rounding_mul_shift_right, rounding_shift_right, saturating_add,
    saturating_narrow, shift_left, shift_right, widen, widening_add, widening_mul, widening_sub,
    Intrinsic,
};
use crate::ir::{
    self, cast, clamp, let_expr, make_const, make_one, make_zero, max, min, mutate_children,
    mutate_stmt_children, select, var, CallOp, Expr, ExprKind, Stmt, Type, TypeCode,
};
use crate::simplify::{is_const_power_of_two, lossless_cast, simplify};

use super::find::is_safe_for_add_root;

pub fn lower_widen_right_add(a: &Expr, b: &Expr) -> Expr {
    ir::add(a.clone(), coerced_widen(b, a.ty))
}

pub fn lower_widen_right_mul(a: &Expr, b: &Expr) -> Expr {
    ir::mul(a.clone(), coerced_widen(b, a.ty))
}

pub fn lower_widen_right_sub(a: &Expr, b: &Expr) -> Expr {
    ir::sub(a.clone(), coerced_widen(b, a.ty))
}

fn coerced_widen(b: &Expr, ty: Type) -> Expr {
    cast(ty, b.clone())
}

pub fn lower_widening_add(a: &Expr, b: &Expr) -> Expr {
    ir::add(widen(a.clone()), widen(b.clone()))
}

pub fn lower_widening_mul(a: &Expr, b: &Expr) -> Expr {
    // The result type already accounts for mixed signedness.
    let wide = intrin::widening_mul(a.clone(), b.clone()).ty;
    ir::mul(cast(wide, a.clone()), cast(wide, b.clone()))
}

pub fn lower_widening_sub(a: &Expr, b: &Expr) -> Expr {
    let mut wide = a.ty.widen();
    if wide.is_uint() {
        wide = wide.with_code(TypeCode::Int);
    }
    ir::sub(cast(wide, a.clone()), cast(wide, b.clone()))
}

pub fn lower_widening_shift_left(a: &Expr, b: &Expr) -> Expr {
    shift_left(widen(a.clone()), widen_shift_amount(b, a.ty.widen()))
}

pub fn lower_widening_shift_right(a: &Expr, b: &Expr) -> Expr {
    shift_right(widen(a.clone()), widen_shift_amount(b, a.ty.widen()))
}

fn widen_shift_amount(b: &Expr, wide: Type) -> Expr {
    cast(wide.with_code(b.ty.code), b.clone())
}

pub fn lower_rounding_shift_left(a: &Expr, b: &Expr) -> Expr {
    // Shift left, then add one if bits were dropped (b < 0) and the most
    // significant dropped bit was a one.
    let b = cast(a.ty.with_code(b.ty.code), b.clone());
    let b_negative = select(
        ir::lt(b.clone(), make_zero(b.ty)),
        make_one(a.ty),
        make_zero(a.ty),
    );
    let shifted = shift_left(a.clone(), b.clone());
    let above = shift_left(a.clone(), ir::add(b.clone(), make_one(b.ty)));
    simplify(&ir::add(shifted, bitwise_and(b_negative, above)))
}

pub fn lower_rounding_shift_right(a: &Expr, b: &Expr) -> Expr {
    if let Some(bv) = b.as_const_int() {
        if bv > 0 {
            if a.ty.is_uint() {
                // Handle the rounding with an averaging op: the rounding
                // average is the one x86 actually has.
                let shift = make_const(b.ty, bv - 1);
                let round = make_const(a.ty, (1i128 << (bv - 1)) - 1);
                return shift_right(rounding_halving_add(a.clone(), round), shift);
            } else if is_safe_for_add_root(a) {
                let round = make_const(a.ty, 1i128 << (bv - 1));
                return shift_right(ir::add(a.clone(), round), b.clone());
            }
        }
    }
    // Shift right, then add one if bits were dropped (b > 0) and the most
    // significant dropped bit was a one.
    let b = cast(a.ty.with_code(b.ty.code), b.clone());
    let b_positive = select(
        ir::gt(b.clone(), make_zero(b.ty)),
        make_one(a.ty),
        make_zero(a.ty),
    );
    let shifted = shift_right(a.clone(), b.clone());
    let above = shift_right(a.clone(), ir::sub(b.clone(), make_one(b.ty)));
    simplify(&ir::add(shifted, bitwise_and(b_positive, above)))
}

pub fn lower_saturating_add(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: saturating_add type mismatch");
    // Without widening arithmetic, which may require unsupported types.
    let zero = make_zero(a.ty);
    let lo = ir::sub(a.ty.min_expr(), min(b.clone(), zero.clone()));
    let hi = ir::sub(a.ty.max_expr(), max(b.clone(), zero));
    ir::add(simplify(&clamp(a.clone(), lo, hi)), b.clone())
}

pub fn lower_saturating_sub(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: saturating_sub type mismatch");
    let zero = make_zero(a.ty);
    let lo = ir::add(a.ty.min_expr(), max(b.clone(), zero.clone()));
    let hi = ir::add(a.ty.max_expr(), min(b.clone(), zero));
    ir::sub(simplify(&clamp(a.clone(), lo, hi)), b.clone())
}

fn float_limit_expr(ty: Type, positive: bool) -> Expr {
    let magnitude = match ty.bits {
        32 => f32::MAX as f64,
        _ => f64::MAX,
    };
    let scalar = ir::float_imm(
        ty.element_of(),
        if positive { magnitude } else { -magnitude },
    );
    if ty.is_vector() {
        ir::broadcast(scalar, ty.lanes)
    } else {
        scalar
    }
}

pub fn lower_saturating_cast(ty: Type, a: &Expr) -> Expr {
    if ty.is_float() && a.ty.is_float() {
        // Guarantee infinities are pinned to the target's range.
        if ty.bits < a.ty.bits {
            let lo = float_limit_expr(a.ty.with_bits(ty.bits), false);
            let hi = float_limit_expr(a.ty.with_bits(ty.bits), true);
            let lo = cast(a.ty, lo);
            let hi = cast(a.ty, hi);
            return cast(ty, clamp(a.clone(), lo, hi));
        }
        let lo = float_limit_expr(ty, false);
        let hi = float_limit_expr(ty, true);
        return clamp(cast(ty, a.clone()), lo, hi);
    }
    if a.ty == ty {
        return a.clone();
    }
    if a.ty.is_float() && !ty.is_float() && ty.bits >= a.ty.bits {
        // Limits of a wide integer type are not exactly representable in a
        // float of the same width. Min values always are, so clamp the
        // bottom with max; saturate the top with a select against the first
        // representable value at or above the limit.
        let t_min = make_const(a.ty, ty.min_value());
        let t_max_in_a = make_const(a.ty, ty.max_value());
        let e = max(a.clone(), t_min);
        return select(
            ir::ge(e.clone(), t_max_in_a),
            ty.max_expr(),
            cast(ty, e),
        );
    }
    let mut cache = crate::bounds::BoundsCache::new();
    let min_bound = if !a.ty.is_uint() {
        lossless_cast(
            &mut cache,
            a.ty.element_of(),
            &make_const(ty.element_of(), ty.min_value()),
        )
        .map(|e| spread_to(a.ty, e))
    } else {
        None
    };
    let max_bound = lossless_cast(
        &mut cache,
        a.ty.element_of(),
        &make_const(ty.element_of(), ty.max_value()),
    )
    .map(|e| spread_to(a.ty, e));
    let e = match (min_bound, max_bound) {
        (Some(lo), Some(hi)) => clamp(a.clone(), lo, hi),
        (Some(lo), None) => max(a.clone(), lo),
        (None, Some(hi)) => min(a.clone(), hi),
        (None, None) => a.clone(),
    };
    cast(ty, e)
}

fn spread_to(ty: Type, e: Expr) -> Expr {
    if ty.is_vector() && e.ty.is_scalar() {
        ir::broadcast(e, ty.lanes)
    } else {
        e
    }
}

pub fn lower_halving_add(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: halving_add type mismatch");
    // Average of integers without overflow: (a & b) + ((a ^ b) >> 1).
    let anded = bitwise_and(a.clone(), b.clone());
    let xored = bitwise_xor(a.clone(), b.clone());
    ir::add(anded, shift_right(xored, make_one(a.ty)))
}

pub fn lower_halving_sub(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: halving_sub type mismatch");
    let e = rounding_halving_add(a.clone(), bitwise_not(b.clone()));
    if a.ty.is_uint() {
        // (x - y)/2 = rounding_halving_add(x, ~y) - 2^(bits-1), and the
        // subtract becomes an add under two's-complement wrap-around.
        let half = make_const(e.ty, 1i128 << (a.ty.bits - 1));
        ir::add(e, half)
    } else {
        // Signed negation is flip-and-increment, so the increment folds
        // into the rounding.
        e
    }
}

pub fn lower_rounding_halving_add(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: rounding_halving_add type mismatch");
    let low_bit = bitwise_and(
        bitwise_xor(a.clone(), b.clone()),
        make_one(a.ty),
    );
    ir::add(halving_add(a.clone(), b.clone()), low_bit)
}

pub fn lower_sorted_avg(a: &Expr, b: &Expr) -> Expr {
    // b >= a, so this cannot overflow.
    ir::add(
        a.clone(),
        shift_right(ir::sub(b.clone(), a.clone()), make_one(a.ty)),
    )
}

pub fn lower_absd(result_ty: Type, a: &Expr, b: &Expr) -> Expr {
    let a_var = var(a.ty, "absd_a");
    let b_var = var(b.ty, "absd_b");
    let body = cast(
        result_ty,
        select(
            ir::lt(a_var.clone(), b_var.clone()),
            ir::sub(b_var.clone(), a_var.clone()),
            ir::sub(a_var, b_var),
        ),
    );
    let_expr("absd_a", a.clone(), let_expr("absd_b", b.clone(), body))
}

pub fn lower_mul_shift_right(a: &Expr, b: &Expr, q: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: mul_shift_right type mismatch");
    let bits = a.ty.bits as i128;
    let full_q = if a.ty.is_int() { bits - 1 } else { bits };
    let qv = q.as_const_int();

    if let Some(qv) = qv {
        if qv < full_q {
            // Try to rewrite to a "full precision" multiply by scaling one
            // constant operand. Only when not already full precision, which
            // avoids an infinite lowering loop.
            let missing_q = full_q - qv;
            for (konst, other, swap) in [(b, a, false), (a, b, true)] {
                if let Some(kv) = konst.as_const_int() {
                    let scaled = kv << missing_q;
                    if konst.ty.element_of().can_represent_value(scaled)
                        && (scaled >> missing_q) == kv
                    {
                        let new_konst = make_const(konst.ty, scaled);
                        let new_q = make_const(q.ty, full_q);
                        return if swap {
                            mul_shift_right(new_konst, other.clone(), new_q)
                        } else {
                            mul_shift_right(other.clone(), new_konst, new_q)
                        };
                    }
                }
            }
        }
        if qv > bits {
            // Exact upper-half multiply followed by the residual shift.
            let result = mul_shift_right(a.clone(), b.clone(), make_const(q.ty, bits));
            return shift_right(result, make_const(q.ty.with_lanes(a.ty.lanes), qv - bits));
        }
    }

    // If all else fails: widen, shift, and narrow.
    let wide_q = cast(a.ty.widen().with_code(TypeCode::UInt), q.clone());
    let result = shift_right(widening_mul(a.clone(), b.clone()), wide_q);
    if qv.is_some_and(|v| v >= bits) {
        narrow(result)
    } else {
        saturating_narrow(result)
    }
}

/// 32-bit signed rounding multiply-keep-high-bits without 64-bit math:
/// split each operand at 16 bits, form the three widened partial products,
/// fold the rounding through a halving add, and finish saturating.
pub fn emulate_signed_rounding_mul_shift_right_31(a: &Expr, b: &Expr) -> Expr {
    let lanes = a.ty.lanes;
    let int16 = Type::int(16, lanes);
    let uint16 = Type::uint(16, lanes);
    let int32 = Type::int(32, lanes);
    let sixteen = make_const(a.ty, 16);

    let a_hi = cast(int16, shift_right(a.clone(), sixteen.clone()));
    let b_hi = cast(int16, shift_right(b.clone(), sixteen));
    let a_lo = cast(uint16, a.clone());
    let b_lo = cast(uint16, b.clone());

    // a*b = ((a_hi * b_hi) << 32) + ((a_hi * b_lo + b_hi * a_lo) << 16) + a_lo * b_lo
    let ab_hi = widening_mul(a_hi.clone(), b_hi.clone());
    let ab_mid0 = widening_mul(a_hi, b_lo.clone());
    let ab_mid1 = widening_mul(b_hi, a_lo.clone());
    let ab_lo_shifted = mul_shift_right(a_lo, b_lo, make_const(Type::uint(16, lanes), 16));

    assert_eq!(ab_hi.ty, int32);
    assert_eq!(ab_mid0.ty, int32);
    assert_eq!(ab_mid1.ty, int32);
    assert_eq!(ab_lo_shifted.ty, uint16);

    // (a*b + (1 << 30)) >> 31
    //   = (ab_hi << 1) + (avg(ab_mid0 + (1 << 14), ab_mid1 + (ab_lo*b_lo >> 16)) >> 14)
    let lo = shift_right(
        halving_add(
            ir::add(ab_mid0, make_const(int32, 1 << 14)),
            ir::add(ab_mid1, cast(int32, ab_lo_shifted)),
        ),
        make_const(int32, 14),
    );
    assert_eq!(lo.ty, int32);

    saturating_add(ab_hi.clone(), ir::add(ab_hi, lo))
}

pub fn lower_rounding_mul_shift_right(a: &Expr, b: &Expr, q: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: rounding_mul_shift_right type mismatch");
    let bits = a.ty.bits as i128;
    let qv = q.as_const_int();

    if qv == Some(31) && a.ty.element_of() == Type::int(32, 1) {
        return emulate_signed_rounding_mul_shift_right_31(a, b);
    }

    let full_q = if a.ty.is_int() { bits - 1 } else { bits };
    if let Some(qv) = qv {
        if qv < full_q {
            let missing_q = full_q - qv;
            for (konst, other, swap) in [(b, a, false), (a, b, true)] {
                if let Some(kv) = konst.as_const_int() {
                    let scaled = kv << missing_q;
                    if konst.ty.element_of().can_represent_value(scaled)
                        && (scaled >> missing_q) == kv
                    {
                        let new_konst = make_const(konst.ty, scaled);
                        let new_q = make_const(q.ty, full_q);
                        return if swap {
                            rounding_mul_shift_right(new_konst, other.clone(), new_q)
                        } else {
                            rounding_mul_shift_right(other.clone(), new_konst, new_q)
                        };
                    }
                }
            }
        }
    }

    let wide_q = cast(a.ty.widen().with_code(TypeCode::UInt), q.clone());
    let result = rounding_shift_right(widening_mul(a.clone(), b.clone()), wide_q);
    if qv.is_some_and(|v| v >= bits) {
        narrow(result)
    } else {
        saturating_narrow(result)
    }
}

// =============================================================================
// Integer division and modulo
// =============================================================================

/// Lower a round-to-negative-infinity integer division to round-to-zero
/// hardware division plus a branchless correction.
pub fn lower_int_uint_div(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: div type mismatch");
    if a.ty.is_int() {
        if let Some(pow2) = is_const_power_of_two(b) {
            // An arithmetic shift right already rounds toward -inf.
            return shift_right(a.clone(), make_const(a.ty, pow2 as i128));
        }
    }
    let rtz = div_round_to_zero(a.clone(), b.clone());
    if a.ty.is_uint() {
        return rtz;
    }
    let q = var(a.ty, "div_q");
    let r = ir::sub(a.clone(), ir::mul(q.clone(), b.clone()));
    let needs_fixup = ir::and(
        ir::ne(r.clone(), make_zero(a.ty)),
        ir::ne(
            ir::lt(r, make_zero(a.ty)),
            ir::lt(b.clone(), make_zero(a.ty)),
        ),
    );
    let fixed = select(needs_fixup, ir::sub(q.clone(), make_one(a.ty)), q);
    let_expr("div_q", rtz, fixed)
}

/// Lower a floor modulo to round-to-zero hardware remainder plus a
/// branchless correction; the result takes the sign of the divisor.
pub fn lower_int_uint_mod(a: &Expr, b: &Expr) -> Expr {
    assert_eq!(a.ty, b.ty, "BUG: mod type mismatch");
    let rtz = mod_round_to_zero(a.clone(), b.clone());
    if a.ty.is_uint() {
        return rtz;
    }
    let r = var(a.ty, "mod_r");
    let needs_fixup = ir::and(
        ir::ne(r.clone(), make_zero(a.ty)),
        ir::ne(
            ir::lt(r.clone(), make_zero(a.ty)),
            ir::lt(b.clone(), make_zero(a.ty)),
        ),
    );
    let fixed = select(needs_fixup, ir::add(r.clone(), b.clone()), r);
    let_expr("mod_r", rtz, fixed)
}

fn div_round_to_zero(a: Expr, b: Expr) -> Expr {
    let ty = a.ty;
    ir::call(ty, CallOp::Intrin(Intrinsic::DivRoundToZero), vec![a, b])
}

fn mod_round_to_zero(a: Expr, b: Expr) -> Expr {
    let ty = a.ty;
    ir::call(ty, CallOp::Intrin(Intrinsic::ModRoundToZero), vec![a, b])
}

// =============================================================================
// Dispatch
// =============================================================================

/// The efficient lowering of an intrinsic call, or `None` if the opcode is
/// not one of the higher-order arithmetic intrinsics.
pub fn lower_intrinsic(e: &Expr) -> Option<Expr> {
    let ExprKind::Call {
        op: CallOp::Intrin(op),
        args,
    } = e.kind()
    else {
        return None;
    };
    let r = match op {
        Intrinsic::WidenRightAdd => lower_widen_right_add(&args[0], &args[1]),
        Intrinsic::WidenRightMul => lower_widen_right_mul(&args[0], &args[1]),
        Intrinsic::WidenRightSub => lower_widen_right_sub(&args[0], &args[1]),
        Intrinsic::WideningAdd => lower_widening_add(&args[0], &args[1]),
        Intrinsic::WideningMul => lower_widening_mul(&args[0], &args[1]),
        Intrinsic::WideningSub => lower_widening_sub(&args[0], &args[1]),
        Intrinsic::SaturatingAdd => lower_saturating_add(&args[0], &args[1]),
        Intrinsic::SaturatingSub => lower_saturating_sub(&args[0], &args[1]),
        Intrinsic::SaturatingCast => lower_saturating_cast(e.ty, &args[0]),
        Intrinsic::WideningShiftLeft => lower_widening_shift_left(&args[0], &args[1]),
        Intrinsic::WideningShiftRight => lower_widening_shift_right(&args[0], &args[1]),
        Intrinsic::RoundingShiftRight => lower_rounding_shift_right(&args[0], &args[1]),
        Intrinsic::RoundingShiftLeft => lower_rounding_shift_left(&args[0], &args[1]),
        Intrinsic::HalvingAdd => lower_halving_add(&args[0], &args[1]),
        Intrinsic::HalvingSub => lower_halving_sub(&args[0], &args[1]),
        Intrinsic::RoundingHalvingAdd => lower_rounding_halving_add(&args[0], &args[1]),
        Intrinsic::RoundingMulShiftRight => {
            lower_rounding_mul_shift_right(&args[0], &args[1], &args[2])
        }
        Intrinsic::MulShiftRight => lower_mul_shift_right(&args[0], &args[1], &args[2]),
        Intrinsic::SortedAvg => lower_sorted_avg(&args[0], &args[1]),
        Intrinsic::Absd => lower_absd(e.ty, &args[0], &args[1]),
        _ => return None,
    };
    Some(r)
}

/// The reference lowering: always goes through the widened type, so the
/// recognizer can round-trip it back to the intrinsic.
pub fn lower_intrinsic_reference(e: &Expr) -> Option<Expr> {
    let ExprKind::Call {
        op: CallOp::Intrin(op),
        args,
    } = e.kind()
    else {
        return None;
    };
    let bits = e.ty.bits;
    let r = match op {
        Intrinsic::WidenRightAdd => ir::add(args[0].clone(), widen(args[1].clone())),
        Intrinsic::WidenRightMul => ir::mul(args[0].clone(), widen(args[1].clone())),
        Intrinsic::WidenRightSub => ir::sub(args[0].clone(), widen(args[1].clone())),
        Intrinsic::WideningAdd => lower_widening_add(&args[0], &args[1]),
        Intrinsic::WideningMul => lower_widening_mul(&args[0], &args[1]),
        Intrinsic::WideningSub => lower_widening_sub(&args[0], &args[1]),
        Intrinsic::SaturatingAdd => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            saturating_narrow(ir::add(widen(args[0].clone()), widen(args[1].clone())))
        }
        Intrinsic::SaturatingSub => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            saturating_narrow(widening_sub(args[0].clone(), args[1].clone()))
        }
        Intrinsic::SaturatingCast => lower_saturating_cast(e.ty, &args[0]),
        Intrinsic::WideningShiftLeft => lower_widening_shift_left(&args[0], &args[1]),
        Intrinsic::WideningShiftRight => lower_widening_shift_right(&args[0], &args[1]),
        Intrinsic::RoundingShiftRight => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let x = &args[0];
            let y = cast(x.ty.with_code(args[1].ty.code), args[1].clone());
            let zero = make_zero(x.ty);
            let one = make_one(x.ty);
            let round = select(
                ir::gt(y.clone(), make_zero(y.ty)),
                shift_left(one, ir::sub(y.clone(), make_one(y.ty))),
                zero,
            );
            let round = cast(x.ty, round);
            saturating_narrow(shift_right(
                widening_add(x.clone(), round),
                cast(x.ty.widen().with_code(y.ty.code), y),
            ))
        }
        Intrinsic::RoundingShiftLeft => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let x = &args[0];
            let y = cast(x.ty.with_code(args[1].ty.code), args[1].clone());
            let zero = make_zero(x.ty);
            let one = make_one(x.ty);
            let round = select(
                ir::lt(y.clone(), make_zero(y.ty)),
                shift_right(one, ir::add(y.clone(), make_one(y.ty))),
                zero,
            );
            let round = cast(x.ty, round);
            saturating_narrow(shift_left(
                widening_add(x.clone(), round),
                cast(x.ty.widen().with_code(y.ty.code), y),
            ))
        }
        Intrinsic::HalvingAdd => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let two = make_const(args[0].ty.widen(), 2);
            narrow(ir::div(
                ir::add(widen(args[0].clone()), widen(args[1].clone())),
                two,
            ))
        }
        Intrinsic::HalvingSub => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let wide = widening_sub(args[0].clone(), args[1].clone());
            let two = make_const(wide.ty, 2);
            cast(e.ty, ir::div(wide, two))
        }
        Intrinsic::RoundingHalvingAdd => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let wide = ir::add(widen(args[0].clone()), widen(args[1].clone()));
            let two = make_const(wide.ty, 2);
            narrow(ir::div(ir::add(wide, make_one(two.ty)), two))
        }
        Intrinsic::RoundingMulShiftRight => {
            if bits > 16 {
                return lower_intrinsic(e);
            }
            let wide_q = cast(
                args[0].ty.widen().with_code(TypeCode::UInt),
                args[2].clone(),
            );
            saturating_narrow(rounding_shift_right(
                widening_mul(args[0].clone(), args[1].clone()),
                wide_q,
            ))
        }
        Intrinsic::MulShiftRight => {
            if bits > 32 {
                return lower_intrinsic(e);
            }
            let wide_q = cast(
                args[0].ty.widen().with_code(TypeCode::UInt),
                args[2].clone(),
            );
            saturating_narrow(shift_right(
                widening_mul(args[0].clone(), args[1].clone()),
                wide_q,
            ))
        }
        Intrinsic::SortedAvg => lower_sorted_avg(&args[0], &args[1]),
        Intrinsic::Absd => lower_absd(e.ty, &args[0], &args[1]),
        _ => return None,
    };
    Some(r)
}

/// Lower every higher-order intrinsic in an expression, recursively.
pub fn lower_intrinsics(e: &Expr) -> Expr {
    if let Some(lowered) = lower_intrinsic(e) {
        assert_eq!(
            lowered.ty, e.ty,
            "BUG: lowering changed type: {} -> {}",
            e, lowered
        );
        return lower_intrinsics(&lowered);
    }
    mutate_children(e, &mut |c| lower_intrinsics(c))
}

pub fn lower_intrinsics_stmt(s: &Stmt) -> Stmt {
    mutate_stmt_children(s, &mut |e| lower_intrinsics(e), &mut |c| {
        lower_intrinsics_stmt(c)
    })
}

// =============================================================================
// CPU-path fallback
// =============================================================================

fn llvm_suffix(t: Type) -> String {
    let mut s = String::new();
    if t.lanes > 1 {
        s.push_str(&format!("v{}", t.lanes));
    }
    s.push_str(&format!("i{}", t.bits));
    s
}

/// Rewrite saturating add/sub to the names the CPU back end expects, and
/// pre-lower vector integer div/mod so pattern-matching still applies.
pub fn lower_for_llvm(e: &Expr) -> Expr {
    let e = mutate_children(e, &mut |c| lower_for_llvm(c));
    match e.kind() {
        ExprKind::Div(a, b) if e.ty.is_vector() && e.ty.is_int_or_uint() => {
            lower_for_llvm(&lower_int_uint_div(a, b))
        }
        ExprKind::Mod(a, b) if e.ty.is_vector() && e.ty.is_int_or_uint() => {
            lower_for_llvm(&lower_int_uint_mod(a, b))
        }
        ExprKind::Call {
            op: CallOp::Intrin(i),
            args,
        } if matches!(i, Intrinsic::SaturatingAdd | Intrinsic::SaturatingSub) => {
            let stem = match (i, e.ty.is_int()) {
                (Intrinsic::SaturatingAdd, true) => "llvm.sadd.sat.",
                (Intrinsic::SaturatingAdd, false) => "llvm.uadd.sat.",
                (Intrinsic::SaturatingSub, true) => "llvm.ssub.sat.",
                (Intrinsic::SaturatingSub, false) => "llvm.usub.sat.",
                _ => unreachable!(),
            };
            let name = format!("{}{}", stem, llvm_suffix(e.ty));
            ir::call(e.ty, CallOp::Extern(name), args.clone())
        }
        _ => e,
    }
}

pub fn lower_for_llvm_stmt(s: &Stmt) -> Stmt {
    mutate_stmt_children(s, &mut |e| lower_for_llvm(e), &mut |c| lower_for_llvm_stmt(c))
}
