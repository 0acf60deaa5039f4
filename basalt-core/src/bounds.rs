//! Constant integer interval analysis.
//!
//! Answers the `upper_bounded` / `lower_bounded` rewrite predicates and the
//! interval side of `can_prove`. Intervals are computed bottom-up, memoised
//! per distinct expression, and seeded from the ambient let-scope. These
//! queries are expensive relative to the matcher, so the cache is shared
//! across a whole recognizer run.

use std::collections::HashMap;

use crate::intrinsics::Intrinsic;
use crate::ir::{Expr, ExprKind};

/// A possibly-open interval of integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstInterval {
    pub min: Option<i128>,
    pub max: Option<i128>,
}

impl ConstInterval {
    pub fn everything() -> ConstInterval {
        ConstInterval {
            min: None,
            max: None,
        }
    }

    pub fn single(v: i128) -> ConstInterval {
        ConstInterval {
            min: Some(v),
            max: Some(v),
        }
    }

    pub fn bounded(min: i128, max: i128) -> ConstInterval {
        ConstInterval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn union(self, other: ConstInterval) -> ConstInterval {
        ConstInterval {
            min: self.min.zip(other.min).map(|(a, b)| a.min(b)),
            max: self.max.zip(other.max).map(|(a, b)| a.max(b)),
        }
    }
}

fn arith(
    a: ConstInterval,
    b: ConstInterval,
    f: impl Fn(i128, i128) -> i128 + Copy,
) -> ConstInterval {
    // Monotonicity is not assumed: take the hull over all corner pairs.
    match (a.min, a.max, b.min, b.max) {
        (Some(al), Some(ah), Some(bl), Some(bh)) => {
            let corners = [f(al, bl), f(al, bh), f(ah, bl), f(ah, bh)];
            ConstInterval::bounded(
                *corners.iter().min().unwrap(),
                *corners.iter().max().unwrap(),
            )
        }
        _ => ConstInterval::everything(),
    }
}

/// Memoising interval query with a let-scope.
pub struct BoundsCache {
    cache: HashMap<Expr, ConstInterval>,
    scope: HashMap<String, Vec<ConstInterval>>,
}

impl BoundsCache {
    pub fn new() -> Self {
        BoundsCache {
            cache: HashMap::new(),
            scope: HashMap::new(),
        }
    }

    pub fn push_binding(&mut self, name: &str, interval: ConstInterval) {
        self.scope.entry(name.to_string()).or_default().push(interval);
        // Cached intervals may reference the shadowed binding.
        self.cache.clear();
    }

    pub fn pop_binding(&mut self, name: &str) {
        if let Some(stack) = self.scope.get_mut(name) {
            stack.pop();
        }
        self.cache.clear();
    }

    pub fn interval(&mut self, e: &Expr) -> ConstInterval {
        if let Some(&i) = self.cache.get(e) {
            return i;
        }
        let i = self.compute(e);
        self.cache.insert(e.clone(), i);
        i
    }

    pub fn upper_bounded(&mut self, e: &Expr, bound: i128) -> bool {
        matches!(self.interval(e).max, Some(max) if max <= bound)
    }

    pub fn lower_bounded(&mut self, e: &Expr, bound: i128) -> bool {
        matches!(self.interval(e).min, Some(min) if min >= bound)
    }

    fn type_interval(e: &Expr) -> ConstInterval {
        let ty = e.ty.element_of();
        if ty.is_int_or_uint() && ty.bits <= 64 {
            ConstInterval::bounded(ty.min_value(), ty.max_value())
        } else {
            ConstInterval::everything()
        }
    }

    fn compute(&mut self, e: &Expr) -> ConstInterval {
        if e.ty.is_float() || e.ty.is_bool() {
            return ConstInterval::everything();
        }
        let fallback = Self::type_interval(e);
        let refined = match e.kind() {
            ExprKind::IntImm(v) => ConstInterval::single(*v as i128),
            ExprKind::UIntImm(v) => ConstInterval::single(*v as i128),
            ExprKind::Var(name) => self
                .scope
                .get(name)
                .and_then(|s| s.last().copied())
                .unwrap_or(fallback),
            ExprKind::Cast(v) => {
                let inner = self.interval(v);
                // A cast keeps the value when it stays in range; otherwise
                // all we know is the result type's range.
                match (inner.min, inner.max) {
                    (Some(lo), Some(hi))
                        if e.ty.element_of().can_represent_value(lo)
                            && e.ty.element_of().can_represent_value(hi) =>
                    {
                        inner
                    }
                    _ => fallback,
                }
            }
            ExprKind::Add(a, b) => arith(self.interval(a), self.interval(b), |x, y| x + y),
            ExprKind::Sub(a, b) => arith(self.interval(a), self.interval(b), |x, y| x - y),
            ExprKind::Mul(a, b) => arith(self.interval(a), self.interval(b), |x, y| x * y),
            ExprKind::Min(a, b) => arith(self.interval(a), self.interval(b), |x, y| x.min(y)),
            ExprKind::Max(a, b) => arith(self.interval(a), self.interval(b), |x, y| x.max(y)),
            ExprKind::Broadcast { value, .. } => self.interval(value),
            ExprKind::Ramp { base, stride, lanes } => {
                let last_ofs = |s: i128| s * (*lanes as i128 - 1);
                let first = self.interval(base);
                let last = arith(first, self.interval(stride), |b, s| b + last_ofs(s));
                first.union(last)
            }
            ExprKind::Select {
                true_value,
                false_value,
                ..
            } => self.interval(true_value).union(self.interval(false_value)),
            ExprKind::Let { name, value, body } => {
                let vi = self.interval(value);
                self.push_binding(name, vi);
                let bi = self.compute(body);
                self.pop_binding(name);
                return bi;
            }
            ExprKind::Call { args, .. } => {
                if let Some((op, args2)) = e.as_intrinsic(&[
                    Intrinsic::WideningAdd,
                    Intrinsic::WideningSub,
                    Intrinsic::WideningMul,
                    Intrinsic::WidenRightAdd,
                    Intrinsic::WidenRightSub,
                    Intrinsic::WidenRightMul,
                    Intrinsic::HalvingAdd,
                    Intrinsic::RoundingHalvingAdd,
                    Intrinsic::HalvingSub,
                    Intrinsic::Absd,
                ]) {
                    let a = self.interval(&args2[0]);
                    let b = self.interval(&args2[1]);
                    match op {
                        Intrinsic::WideningAdd | Intrinsic::WidenRightAdd => {
                            arith(a, b, |x, y| x + y)
                        }
                        Intrinsic::WideningSub | Intrinsic::WidenRightSub => {
                            arith(a, b, |x, y| x - y)
                        }
                        Intrinsic::WideningMul | Intrinsic::WidenRightMul => {
                            arith(a, b, |x, y| x * y)
                        }
                        Intrinsic::HalvingAdd => arith(a, b, |x, y| (x + y) >> 1),
                        Intrinsic::RoundingHalvingAdd => arith(a, b, |x, y| (x + y + 1) >> 1),
                        Intrinsic::HalvingSub => arith(a, b, |x, y| (x - y) >> 1),
                        Intrinsic::Absd => {
                            let d = arith(a, b, |x, y| x - y);
                            match (d.min, d.max) {
                                (Some(lo), Some(hi)) => {
                                    let max = lo.abs().max(hi.abs());
                                    let min = if lo <= 0 && hi >= 0 { 0 } else { lo.abs().min(hi.abs()) };
                                    ConstInterval::bounded(min, max)
                                }
                                _ => fallback,
                            }
                        }
                        _ => unreachable!(),
                    }
                } else {
                    let _ = args;
                    fallback
                }
            }
            _ => fallback,
        };
        // Never report looser bounds than the type itself provides.
        ConstInterval {
            min: match (refined.min, fallback.min) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            max: match (refined.max, fallback.max) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

impl Default for BoundsCache {
    fn default() -> Self {
        Self::new()
    }
}
