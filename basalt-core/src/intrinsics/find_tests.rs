use crate::intrinsics::find::find_intrinsics;
use crate::intrinsics::{
    self as intrin, rounding_halving_add, saturating_add, widening_add, widening_mul,
};
use crate::ir::{self, cast, make_const, Expr, ExprKind, Type};

fn i16x4() -> Type {
    Type::int(16, 4)
}

fn i32x4() -> Type {
    Type::int(32, 4)
}

fn u8x8() -> Type {
    Type::uint(8, 8)
}

fn u16x8() -> Type {
    Type::uint(16, 8)
}

#[test]
fn test_recognize_widening_add() {
    // cast(i32x4, a) + cast(i32x4, b) with a, b : i16x4
    let a = ir::var(i16x4(), "a");
    let b = ir::var(i16x4(), "b");
    let e = ir::add(cast(i32x4(), a.clone()), cast(i32x4(), b.clone()));
    let found = find_intrinsics(&e);
    assert_eq!(found, widening_add(a, b));
    assert_eq!(found.ty, e.ty);
}

#[test]
fn test_recognize_widening_mul() {
    let a = ir::var(u8x8(), "a");
    let b = ir::var(u8x8(), "b");
    let e = ir::mul(cast(u16x8(), a.clone()), cast(u16x8(), b.clone()));
    let found = find_intrinsics(&e);
    assert_eq!(found, widening_mul(a, b));
}

#[test]
fn test_recognize_rounding_halving_add() {
    // cast(u8x8, shift_right(widening_add(x, y) + 1, 1)) -> rounding_halving_add
    let x = ir::var(u8x8(), "x");
    let y = ir::var(u8x8(), "y");
    let wide_sum = widening_add(x.clone(), y.clone());
    let plus_one = ir::add(wide_sum, make_const(u16x8(), 1));
    let shifted = intrin::shift_right(plus_one, make_const(u16x8(), 1));
    let e = cast(u8x8(), shifted);
    let found = find_intrinsics(&e);
    assert_eq!(found, rounding_halving_add(x, y));
    assert_eq!(found.ty, e.ty);
}

#[test]
fn test_recognize_halving_add() {
    // cast(u8x8, shift_right(widening_add(x, y), 1)) -> halving_add
    let x = ir::var(u8x8(), "x");
    let y = ir::var(u8x8(), "y");
    let shifted = intrin::shift_right(widening_add(x.clone(), y.clone()), make_const(u16x8(), 1));
    let found = find_intrinsics(&cast(u8x8(), shifted));
    assert_eq!(found, intrin::halving_add(x, y));
}

#[test]
fn test_recognize_saturating_add() {
    // cast(u8x8, max(min(widening_add(x, y), 255), 0)) -> saturating_add
    let x = ir::var(u8x8(), "x");
    let y = ir::var(u8x8(), "y");
    let wide = widening_add(x.clone(), y.clone());
    let clamped = ir::max(
        ir::min(wide, make_const(u16x8(), 255)),
        make_const(u16x8(), 0),
    );
    let found = find_intrinsics(&cast(u8x8(), clamped));
    assert_eq!(found, saturating_add(x, y));
}

#[test]
fn test_recognize_saturating_cast() {
    // A clamp to the target bounds with no widening op is a saturating cast.
    let x = ir::var(u16x8(), "x");
    let clamped = ir::max(
        ir::min(x.clone(), make_const(u16x8(), 255)),
        make_const(u16x8(), 0),
    );
    let found = find_intrinsics(&cast(u8x8(), clamped));
    assert_eq!(found, intrin::saturating_cast(u8x8(), x));
}

#[test]
fn test_sub_of_negative_constant_becomes_widening_add() {
    // a - (-3) narrows to widening_add(a, 3) rather than widening_sub.
    let a = ir::var(i16x4(), "a");
    let e = ir::sub(
        cast(i32x4(), a.clone()),
        make_const(i32x4(), -3),
    );
    let found = find_intrinsics(&e);
    assert_eq!(found, widening_add(a, make_const(i16x4(), 3)));
}

#[test]
fn test_mul_distributes_constants_before_widening() {
    // (cast(a) + cast(b)) * 2 distributes, then each product is examined.
    let a = ir::var(i16x4(), "a");
    let b = ir::var(i16x4(), "b");
    let sum = ir::add(cast(i32x4(), a), cast(i32x4(), b));
    let e = ir::mul(sum, make_const(i32x4(), 2));
    let found = find_intrinsics(&e);
    // Whatever shape results, distribution must have removed the top-level
    // multiply by a constant.
    assert!(!matches!(found.kind(), ExprKind::Mul(_, b2) if b2.is_const()));
    assert_eq!(found.ty, e.ty);
}

#[test]
fn test_mul_by_power_of_two_becomes_shift() {
    let a = ir::var(u16x8(), "a");
    let e = ir::mul(a.clone(), make_const(u16x8(), 8));
    let found = find_intrinsics(&e);
    assert_eq!(found, intrin::shift_left(a, make_const(u16x8(), 3)));
}

#[test]
fn test_abs_of_widening_sub_is_absd() {
    let x = ir::var(u8x8(), "x");
    let y = ir::var(u8x8(), "y");
    let e = intrin::abs(intrin::widening_sub(x.clone(), y.clone()));
    let found = find_intrinsics(&e);
    assert_eq!(found, cast(e.ty, intrin::absd(x, y)));
}

#[test]
fn test_same_width_cast_normalizes_to_reinterpret() {
    let x = ir::var(i16x4(), "x");
    let e = cast(Type::uint(16, 4), x.clone());
    let found = find_intrinsics(&e);
    assert_eq!(found, ir::reinterpret(Type::uint(16, 4), x));
}

#[test]
fn test_double_reinterpret_collapses() {
    let x = ir::var(i16x4(), "x");
    let e = ir::reinterpret(i16x4(), ir::reinterpret(Type::uint(16, 4), x.clone()));
    assert_eq!(find_intrinsics(&e), x);
}

#[test]
fn test_widening_reaches_across_let_binding() {
    // let w = cast(i32x4, a) in w + cast(i32x4, b): the widening let value
    // is substituted so the add pattern can see both casts.
    let a = ir::var(i16x4(), "a");
    let b = ir::var(i16x4(), "b");
    let body = ir::add(ir::var(i32x4(), "w"), cast(i32x4(), b.clone()));
    let e = ir::let_expr("w", cast(i32x4(), a.clone()), body);
    let found = find_intrinsics(&e);
    assert_eq!(found, widening_add(a, b));
}

#[test]
fn test_scalar_expressions_pass_through() {
    // Recognition only applies to vectors.
    let a = ir::var(Type::int(16, 1), "a");
    let b = ir::var(Type::int(16, 1), "b");
    let e = ir::add(
        cast(Type::int(32, 1), a),
        cast(Type::int(32, 1), b),
    );
    assert_eq!(find_intrinsics(&e), e);
}

#[test]
fn test_no_match_returns_tree_unchanged() {
    let a = ir::var(i32x4(), "a");
    let b = ir::var(i32x4(), "b");
    let e = ir::mul(a, b);
    assert_eq!(find_intrinsics(&e), e);
}

#[test]
fn test_widen_right_add_folding() {
    // widen_right_add(widen_right_add(x, y), z) -> x + widening_add(y, z)
    let x = ir::var(u16x8(), "x");
    let y = ir::var(u8x8(), "y");
    let z = ir::var(u8x8(), "z");
    let inner = intrin::widen_right_add(x.clone(), y.clone());
    let e = intrin::widen_right_add(inner, z.clone());
    let found = find_intrinsics(&e);
    assert_eq!(found, ir::add(x, widening_add(y, z)));
}

#[test]
fn test_every_rewrite_preserves_type() {
    let cases: Vec<Expr> = vec![
        ir::add(
            cast(i32x4(), ir::var(i16x4(), "a")),
            cast(i32x4(), ir::var(i16x4(), "b")),
        ),
        cast(
            u8x8(),
            intrin::shift_right(
                widening_add(ir::var(u8x8(), "x"), ir::var(u8x8(), "y")),
                make_const(u16x8(), 1),
            ),
        ),
        ir::mul(ir::var(u16x8(), "a"), make_const(u16x8(), 16)),
        ir::div(ir::var(u16x8(), "a"), make_const(u16x8(), 4)),
    ];
    for e in cases {
        assert_eq!(find_intrinsics(&e).ty, e.ty, "type changed for {}", e);
    }
}
