//! Typed kernel IR: scalar/vector types, expression trees, statements.
//!
//! Expressions are a tagged sum with owning boxes in recursive positions.
//! Sharing is expressed with explicit `Let` binders; passes walk the tree
//! top-down or bottom-up and rebuild the nodes they change.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::intrinsics::Intrinsic;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Int,
    UInt,
    Float,
    Bool,
    Handle,
}

/// A scalar or fixed-width vector type: `(code, bits, lanes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl Type {
    pub const fn new(code: TypeCode, bits: u8, lanes: u16) -> Type {
        Type { code, bits, lanes }
    }

    pub const fn int(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::Int, bits, lanes)
    }

    pub const fn uint(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::UInt, bits, lanes)
    }

    pub const fn float(bits: u8, lanes: u16) -> Type {
        Type::new(TypeCode::Float, bits, lanes)
    }

    pub const fn bool(lanes: u16) -> Type {
        Type::new(TypeCode::Bool, 1, lanes)
    }

    /// Opaque pointer-sized handle; used for things the kernel never inspects.
    pub const fn handle() -> Type {
        Type::new(TypeCode::Handle, 64, 1)
    }

    pub fn is_int(&self) -> bool {
        self.code == TypeCode::Int
    }

    pub fn is_uint(&self) -> bool {
        self.code == TypeCode::UInt
    }

    pub fn is_int_or_uint(&self) -> bool {
        self.is_int() || self.is_uint()
    }

    pub fn is_float(&self) -> bool {
        self.code == TypeCode::Float
    }

    pub fn is_bool(&self) -> bool {
        self.code == TypeCode::Bool
    }

    pub fn is_handle(&self) -> bool {
        self.code == TypeCode::Handle
    }

    pub fn is_vector(&self) -> bool {
        self.lanes > 1
    }

    pub fn is_scalar(&self) -> bool {
        self.lanes == 1
    }

    pub fn with_code(&self, code: TypeCode) -> Type {
        let bits = if code == TypeCode::Bool { 1 } else { self.bits };
        Type::new(code, bits, self.lanes)
    }

    pub fn with_lanes(&self, lanes: u16) -> Type {
        Type::new(self.code, self.bits, lanes)
    }

    pub fn with_bits(&self, bits: u8) -> Type {
        Type::new(self.code, bits, self.lanes)
    }

    pub fn element_of(&self) -> Type {
        self.with_lanes(1)
    }

    /// Halve the bit width.
    pub fn narrow(&self) -> Type {
        assert!(self.bits >= 16, "BUG: cannot narrow {} below 8 bits", self);
        Type::new(self.code, self.bits / 2, self.lanes)
    }

    /// Double the bit width.
    pub fn widen(&self) -> Type {
        assert!(self.bits <= 32, "BUG: cannot widen {} beyond 64 bits", self);
        Type::new(self.code, self.bits * 2, self.lanes)
    }

    /// Total size in bytes, rounded up.
    pub fn bytes(&self) -> u32 {
        (self.bits as u32 * self.lanes as u32).div_ceil(8)
    }

    /// Largest representable value of an integer type.
    pub fn max_value(&self) -> i128 {
        match self.code {
            TypeCode::Int => (1i128 << (self.bits - 1)) - 1,
            TypeCode::UInt => (1i128 << self.bits) - 1,
            TypeCode::Bool => 1,
            _ => panic!("BUG: max_value of non-integer type {}", self),
        }
    }

    /// Smallest representable value of an integer type.
    pub fn min_value(&self) -> i128 {
        match self.code {
            TypeCode::Int => -(1i128 << (self.bits - 1)),
            TypeCode::UInt | TypeCode::Bool => 0,
            _ => panic!("BUG: min_value of non-integer type {}", self),
        }
    }

    pub fn max_expr(&self) -> Expr {
        make_const(*self, self.max_value())
    }

    pub fn min_expr(&self) -> Expr {
        make_const(*self, self.min_value())
    }

    /// True if every value of `other` converts to this type without loss.
    /// Lane counts must match.
    pub fn can_represent(&self, other: Type) -> bool {
        if self.lanes != other.lanes {
            return false;
        }
        match (self.code, other.code) {
            (TypeCode::Int, TypeCode::Int) => self.bits >= other.bits,
            (TypeCode::Int, TypeCode::UInt) => self.bits > other.bits,
            (TypeCode::UInt, TypeCode::UInt) => self.bits >= other.bits,
            (TypeCode::Float, TypeCode::Float) => self.bits >= other.bits,
            (TypeCode::Float, TypeCode::Int) | (TypeCode::Float, TypeCode::UInt) => {
                other.bits as u32 <= self.mantissa_bits()
            }
            _ => false,
        }
    }

    fn mantissa_bits(&self) -> u32 {
        match self.bits {
            16 => 11,
            32 => 24,
            64 => 53,
            _ => 0,
        }
    }

    /// True if `value` is exactly representable.
    pub fn can_represent_value(&self, value: i128) -> bool {
        match self.code {
            TypeCode::Int | TypeCode::UInt | TypeCode::Bool => {
                value >= self.min_value() && value <= self.max_value()
            }
            TypeCode::Float => true,
            TypeCode::Handle => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.code {
            TypeCode::Int => format!("i{}", self.bits),
            TypeCode::UInt => format!("u{}", self.bits),
            TypeCode::Float => format!("f{}", self.bits),
            TypeCode::Bool => "bool".to_string(),
            TypeCode::Handle => "handle".to_string(),
        };
        if self.lanes > 1 {
            write!(f, "{}x{}", base, self.lanes)
        } else {
            write!(f, "{}", base)
        }
    }
}

// =============================================================================
// Expressions
// =============================================================================

/// Float immediate stored as raw bits so expressions can be hashed and
/// compared structurally.
#[derive(Debug, Clone, Copy)]
pub struct FloatBits(pub f64);

impl FloatBits {
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl PartialEq for FloatBits {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatBits {}

impl Hash for FloatBits {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// The callee of a `Call` node: a named intrinsic or an external symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallOp {
    Intrin(Intrinsic),
    Extern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Mul,
    Min,
    Max,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprKind {
    IntImm(i64),
    UIntImm(u64),
    FloatImm(FloatBits),
    StringImm(String),
    Var(String),
    Cast(Expr),
    Reinterpret(Expr),
    Add(Expr, Expr),
    Sub(Expr, Expr),
    Mul(Expr, Expr),
    Div(Expr, Expr),
    Mod(Expr, Expr),
    Min(Expr, Expr),
    Max(Expr, Expr),
    Eq(Expr, Expr),
    Ne(Expr, Expr),
    Lt(Expr, Expr),
    Le(Expr, Expr),
    Gt(Expr, Expr),
    Ge(Expr, Expr),
    And(Expr, Expr),
    Or(Expr, Expr),
    Not(Expr),
    Select {
        condition: Expr,
        true_value: Expr,
        false_value: Expr,
    },
    Load {
        name: String,
        index: Expr,
        predicate: Option<Expr>,
    },
    Ramp {
        base: Expr,
        stride: Expr,
        lanes: u16,
    },
    Broadcast {
        value: Expr,
        lanes: u16,
    },
    Shuffle {
        vectors: Vec<Expr>,
        indices: Vec<u32>,
    },
    Call {
        op: CallOp,
        args: Vec<Expr>,
    },
    Let {
        name: String,
        value: Expr,
        body: Expr,
    },
    VectorReduce {
        op: ReduceOp,
        value: Expr,
    },
}

/// A typed expression. Every node carries its static type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expr {
    pub ty: Type,
    pub kind: Box<ExprKind>,
}

impl Expr {
    pub fn new(ty: Type, kind: ExprKind) -> Expr {
        Expr {
            ty,
            kind: Box::new(kind),
        }
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn as_int_imm(&self) -> Option<i64> {
        match self.kind() {
            ExprKind::IntImm(v) => Some(*v),
            ExprKind::Broadcast { value, .. } => value.as_int_imm(),
            _ => None,
        }
    }

    pub fn as_uint_imm(&self) -> Option<u64> {
        match self.kind() {
            ExprKind::UIntImm(v) => Some(*v),
            ExprKind::Broadcast { value, .. } => value.as_uint_imm(),
            _ => None,
        }
    }

    /// Constant integer value of either signedness, seen through broadcasts.
    pub fn as_const_int(&self) -> Option<i128> {
        match self.kind() {
            ExprKind::IntImm(v) => Some(*v as i128),
            ExprKind::UIntImm(v) => Some(*v as i128),
            ExprKind::Broadcast { value, .. } => value.as_const_int(),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self.kind(),
            ExprKind::IntImm(_) | ExprKind::UIntImm(_) | ExprKind::FloatImm(_)
        ) || matches!(self.kind(), ExprKind::Broadcast { value, .. } if value.is_const())
    }

    /// The intrinsic call payload, if this node is a call to `which`.
    pub fn as_intrinsic(&self, which: &[Intrinsic]) -> Option<(Intrinsic, &[Expr])> {
        if let ExprKind::Call {
            op: CallOp::Intrin(i),
            args,
        } = self.kind()
        {
            if which.contains(i) {
                return Some((*i, args));
            }
        }
        None
    }

    /// Calls with no side effects may be substituted and reordered freely.
    pub fn is_pure(&self) -> bool {
        match self.kind() {
            ExprKind::Call { op, .. } => match op {
                CallOp::Intrin(i) => i.is_pure(),
                CallOp::Extern(_) => false,
            },
            ExprKind::Load { .. } => false,
            _ => true,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::IntImm(v) => write!(f, "({}){}", self.ty, v),
            ExprKind::UIntImm(v) => write!(f, "({}){}", self.ty, v),
            ExprKind::FloatImm(v) => write!(f, "({}){}", self.ty, v.value()),
            ExprKind::StringImm(s) => write!(f, "{:?}", s),
            ExprKind::Var(name) => write!(f, "{}", name),
            ExprKind::Cast(e) => write!(f, "cast({}, {})", self.ty, e),
            ExprKind::Reinterpret(e) => write!(f, "reinterpret({}, {})", self.ty, e),
            ExprKind::Add(a, b) => write!(f, "({} + {})", a, b),
            ExprKind::Sub(a, b) => write!(f, "({} - {})", a, b),
            ExprKind::Mul(a, b) => write!(f, "({} * {})", a, b),
            ExprKind::Div(a, b) => write!(f, "({} / {})", a, b),
            ExprKind::Mod(a, b) => write!(f, "({} % {})", a, b),
            ExprKind::Min(a, b) => write!(f, "min({}, {})", a, b),
            ExprKind::Max(a, b) => write!(f, "max({}, {})", a, b),
            ExprKind::Eq(a, b) => write!(f, "({} == {})", a, b),
            ExprKind::Ne(a, b) => write!(f, "({} != {})", a, b),
            ExprKind::Lt(a, b) => write!(f, "({} < {})", a, b),
            ExprKind::Le(a, b) => write!(f, "({} <= {})", a, b),
            ExprKind::Gt(a, b) => write!(f, "({} > {})", a, b),
            ExprKind::Ge(a, b) => write!(f, "({} >= {})", a, b),
            ExprKind::And(a, b) => write!(f, "({} && {})", a, b),
            ExprKind::Or(a, b) => write!(f, "({} || {})", a, b),
            ExprKind::Not(a) => write!(f, "!{}", a),
            ExprKind::Select {
                condition,
                true_value,
                false_value,
            } => write!(f, "select({}, {}, {})", condition, true_value, false_value),
            ExprKind::Load { name, index, .. } => write!(f, "{}[{}]", name, index),
            ExprKind::Ramp { base, stride, lanes } => {
                write!(f, "ramp({}, {}, {})", base, stride, lanes)
            }
            ExprKind::Broadcast { value, lanes } => write!(f, "x{}({})", lanes, value),
            ExprKind::Shuffle { vectors, indices } => {
                write!(f, "shuffle(")?;
                for v in vectors {
                    write!(f, "{}, ", v)?;
                }
                write!(f, "{:?})", indices)
            }
            ExprKind::Call { op, args } => {
                match op {
                    CallOp::Intrin(i) => write!(f, "{}(", i.name())?,
                    CallOp::Extern(name) => write!(f, "{}(", name)?,
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            ExprKind::Let { name, value, body } => {
                write!(f, "(let {} = {} in {})", name, value, body)
            }
            ExprKind::VectorReduce { op, value } => write!(f, "reduce({:?}, {})", op, value),
        }
    }
}

// =============================================================================
// Statements
// =============================================================================

/// How a `For` loop maps onto the execution model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForKind {
    Serial,
    GpuBlock,
    GpuThread,
}

/// Where an `Allocate` lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    Stack,
    Shared,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    LetStmt {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    AssertStmt {
        condition: Expr,
        message: Expr,
    },
    Block(Vec<Stmt>),
    For {
        name: String,
        min: Expr,
        extent: Expr,
        kind: ForKind,
        body: Box<Stmt>,
    },
    IfThenElse {
        condition: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Store {
        name: String,
        value: Expr,
        index: Expr,
        predicate: Option<Expr>,
    },
    Allocate {
        name: String,
        ty: Type,
        extents: Vec<Expr>,
        memory: MemoryScope,
        body: Box<Stmt>,
    },
    Free {
        name: String,
    },
    Evaluate(Expr),
    Fork(Box<Stmt>, Box<Stmt>),
    Acquire {
        semaphore: Expr,
        count: Expr,
        body: Box<Stmt>,
    },
    Prefetch {
        name: String,
        offset: Expr,
        extent: Expr,
    },
}

// =============================================================================
// Constructors
// =============================================================================

pub fn int_imm(ty: Type, value: i64) -> Expr {
    assert!(ty.is_int(), "BUG: int_imm of {}", ty);
    let e = Expr::new(ty.element_of(), ExprKind::IntImm(value));
    spread(ty, e)
}

pub fn uint_imm(ty: Type, value: u64) -> Expr {
    assert!(
        ty.is_uint() || ty.is_bool(),
        "BUG: uint_imm of {}",
        ty
    );
    let e = Expr::new(ty.element_of(), ExprKind::UIntImm(value));
    spread(ty, e)
}

pub fn float_imm(ty: Type, value: f64) -> Expr {
    assert!(ty.is_float(), "BUG: float_imm of {}", ty);
    let e = Expr::new(ty.element_of(), ExprKind::FloatImm(FloatBits(value)));
    spread(ty, e)
}

fn spread(ty: Type, scalar: Expr) -> Expr {
    if ty.is_vector() {
        broadcast(scalar, ty.lanes)
    } else {
        scalar
    }
}

/// An integer constant of any integer (or bool) type, broadcast for vectors.
pub fn make_const(ty: Type, value: i128) -> Expr {
    assert!(
        ty.element_of().can_represent_value(value),
        "BUG: constant {} does not fit in {}",
        value,
        ty
    );
    match ty.code {
        TypeCode::Int => int_imm(ty, value as i64),
        TypeCode::UInt | TypeCode::Bool => uint_imm(ty, value as u64),
        TypeCode::Float => float_imm(ty, value as f64),
        TypeCode::Handle => panic!("BUG: constant of handle type"),
    }
}

pub fn make_zero(ty: Type) -> Expr {
    make_const(ty, 0)
}

pub fn make_one(ty: Type) -> Expr {
    make_const(ty, 1)
}

pub fn var(ty: Type, name: impl Into<String>) -> Expr {
    Expr::new(ty, ExprKind::Var(name.into()))
}

pub fn cast(ty: Type, value: Expr) -> Expr {
    if value.ty == ty {
        return value;
    }
    assert_eq!(
        ty.lanes, value.ty.lanes,
        "BUG: cast cannot change lanes: {} -> {}",
        value.ty, ty
    );
    Expr::new(ty, ExprKind::Cast(value))
}

pub fn reinterpret(ty: Type, value: Expr) -> Expr {
    if value.ty == ty {
        return value;
    }
    assert_eq!(
        ty.bits, value.ty.bits,
        "BUG: reinterpret must preserve bit width: {} -> {}",
        value.ty, ty
    );
    assert_eq!(ty.lanes, value.ty.lanes);
    Expr::new(ty, ExprKind::Reinterpret(value))
}

macro_rules! binop_constructor {
    ($name:ident, $kind:ident) => {
        pub fn $name(a: Expr, b: Expr) -> Expr {
            assert_eq!(
                a.ty,
                b.ty,
                "BUG: {} operand types differ: {} vs {}",
                stringify!($name),
                a.ty,
                b.ty
            );
            let ty = a.ty;
            Expr::new(ty, ExprKind::$kind(a, b))
        }
    };
}

macro_rules! cmp_constructor {
    ($name:ident, $kind:ident) => {
        pub fn $name(a: Expr, b: Expr) -> Expr {
            assert_eq!(
                a.ty,
                b.ty,
                "BUG: {} operand types differ: {} vs {}",
                stringify!($name),
                a.ty,
                b.ty
            );
            let ty = Type::bool(a.ty.lanes);
            Expr::new(ty, ExprKind::$kind(a, b))
        }
    };
}

binop_constructor!(add, Add);
binop_constructor!(sub, Sub);
binop_constructor!(mul, Mul);
binop_constructor!(div, Div);
binop_constructor!(modulo, Mod);
binop_constructor!(min, Min);
binop_constructor!(max, Max);
cmp_constructor!(eq, Eq);
cmp_constructor!(ne, Ne);
cmp_constructor!(lt, Lt);
cmp_constructor!(le, Le);
cmp_constructor!(gt, Gt);
cmp_constructor!(ge, Ge);

pub fn and(a: Expr, b: Expr) -> Expr {
    assert!(a.ty.is_bool() && b.ty.is_bool());
    let ty = a.ty;
    Expr::new(ty, ExprKind::And(a, b))
}

pub fn or(a: Expr, b: Expr) -> Expr {
    assert!(a.ty.is_bool() && b.ty.is_bool());
    let ty = a.ty;
    Expr::new(ty, ExprKind::Or(a, b))
}

pub fn not(a: Expr) -> Expr {
    assert!(a.ty.is_bool());
    let ty = a.ty;
    Expr::new(ty, ExprKind::Not(a))
}

pub fn select(condition: Expr, true_value: Expr, false_value: Expr) -> Expr {
    assert!(condition.ty.is_bool());
    assert_eq!(
        true_value.ty, false_value.ty,
        "BUG: select branch types differ: {} vs {}",
        true_value.ty, false_value.ty
    );
    assert_eq!(condition.ty.lanes, true_value.ty.lanes);
    let ty = true_value.ty;
    Expr::new(
        ty,
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        },
    )
}

pub fn clamp(e: Expr, lo: Expr, hi: Expr) -> Expr {
    min(max(e, lo), hi)
}

pub fn load(ty: Type, name: impl Into<String>, index: Expr) -> Expr {
    assert_eq!(ty.lanes, index.ty.lanes);
    Expr::new(
        ty,
        ExprKind::Load {
            name: name.into(),
            index,
            predicate: None,
        },
    )
}

pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Expr {
    assert!(base.ty.is_scalar() && stride.ty.is_scalar());
    assert_eq!(base.ty, stride.ty);
    let ty = base.ty.with_lanes(lanes);
    Expr::new(ty, ExprKind::Ramp { base, stride, lanes })
}

pub fn broadcast(value: Expr, lanes: u16) -> Expr {
    assert!(value.ty.is_scalar(), "BUG: broadcast of vector {}", value.ty);
    let ty = value.ty.with_lanes(lanes);
    Expr::new(ty, ExprKind::Broadcast { value, lanes })
}

pub fn let_expr(name: impl Into<String>, value: Expr, body: Expr) -> Expr {
    let ty = body.ty;
    Expr::new(
        ty,
        ExprKind::Let {
            name: name.into(),
            value,
            body,
        },
    )
}

pub fn call(ty: Type, op: CallOp, args: Vec<Expr>) -> Expr {
    Expr::new(ty, ExprKind::Call { op, args })
}

// =============================================================================
// Child-wise rebuilding
// =============================================================================

/// Rebuild `e` with every direct child passed through `f`. The node kind
/// and type are preserved; passes layer their own dispatch on top.
pub fn mutate_children(e: &Expr, f: &mut impl FnMut(&Expr) -> Expr) -> Expr {
    let kind = match e.kind() {
        ExprKind::IntImm(_)
        | ExprKind::UIntImm(_)
        | ExprKind::FloatImm(_)
        | ExprKind::StringImm(_)
        | ExprKind::Var(_) => return e.clone(),
        ExprKind::Cast(v) => ExprKind::Cast(f(v)),
        ExprKind::Reinterpret(v) => ExprKind::Reinterpret(f(v)),
        ExprKind::Add(a, b) => ExprKind::Add(f(a), f(b)),
        ExprKind::Sub(a, b) => ExprKind::Sub(f(a), f(b)),
        ExprKind::Mul(a, b) => ExprKind::Mul(f(a), f(b)),
        ExprKind::Div(a, b) => ExprKind::Div(f(a), f(b)),
        ExprKind::Mod(a, b) => ExprKind::Mod(f(a), f(b)),
        ExprKind::Min(a, b) => ExprKind::Min(f(a), f(b)),
        ExprKind::Max(a, b) => ExprKind::Max(f(a), f(b)),
        ExprKind::Eq(a, b) => ExprKind::Eq(f(a), f(b)),
        ExprKind::Ne(a, b) => ExprKind::Ne(f(a), f(b)),
        ExprKind::Lt(a, b) => ExprKind::Lt(f(a), f(b)),
        ExprKind::Le(a, b) => ExprKind::Le(f(a), f(b)),
        ExprKind::Gt(a, b) => ExprKind::Gt(f(a), f(b)),
        ExprKind::Ge(a, b) => ExprKind::Ge(f(a), f(b)),
        ExprKind::And(a, b) => ExprKind::And(f(a), f(b)),
        ExprKind::Or(a, b) => ExprKind::Or(f(a), f(b)),
        ExprKind::Not(a) => ExprKind::Not(f(a)),
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => ExprKind::Select {
            condition: f(condition),
            true_value: f(true_value),
            false_value: f(false_value),
        },
        ExprKind::Load {
            name,
            index,
            predicate,
        } => ExprKind::Load {
            name: name.clone(),
            index: f(index),
            predicate: predicate.as_ref().map(|p| f(p)),
        },
        ExprKind::Ramp { base, stride, lanes } => ExprKind::Ramp {
            base: f(base),
            stride: f(stride),
            lanes: *lanes,
        },
        ExprKind::Broadcast { value, lanes } => ExprKind::Broadcast {
            value: f(value),
            lanes: *lanes,
        },
        ExprKind::Shuffle { vectors, indices } => ExprKind::Shuffle {
            vectors: vectors.iter().map(|v| f(v)).collect(),
            indices: indices.clone(),
        },
        ExprKind::Call { op, args } => ExprKind::Call {
            op: op.clone(),
            args: args.iter().map(|a| f(a)).collect(),
        },
        ExprKind::Let { name, value, body } => ExprKind::Let {
            name: name.clone(),
            value: f(value),
            body: f(body),
        },
        ExprKind::VectorReduce { op, value } => ExprKind::VectorReduce {
            op: *op,
            value: f(value),
        },
    };
    Expr::new(e.ty, kind)
}

/// Rebuild `s` with direct child statements passed through `fs` and direct
/// child expressions through `fe`.
pub fn mutate_stmt_children(
    s: &Stmt,
    fe: &mut impl FnMut(&Expr) -> Expr,
    fs: &mut impl FnMut(&Stmt) -> Stmt,
) -> Stmt {
    match s {
        Stmt::LetStmt { name, value, body } => Stmt::LetStmt {
            name: name.clone(),
            value: fe(value),
            body: Box::new(fs(body)),
        },
        Stmt::AssertStmt { condition, message } => Stmt::AssertStmt {
            condition: fe(condition),
            message: fe(message),
        },
        Stmt::Block(stmts) => Stmt::Block(stmts.iter().map(|c| fs(c)).collect()),
        Stmt::For {
            name,
            min,
            extent,
            kind,
            body,
        } => Stmt::For {
            name: name.clone(),
            min: fe(min),
            extent: fe(extent),
            kind: *kind,
            body: Box::new(fs(body)),
        },
        Stmt::IfThenElse {
            condition,
            then_case,
            else_case,
        } => Stmt::IfThenElse {
            condition: fe(condition),
            then_case: Box::new(fs(then_case)),
            else_case: else_case.as_ref().map(|e| Box::new(fs(e))),
        },
        Stmt::Store {
            name,
            value,
            index,
            predicate,
        } => Stmt::Store {
            name: name.clone(),
            value: fe(value),
            index: fe(index),
            predicate: predicate.as_ref().map(|p| fe(p)),
        },
        Stmt::Allocate {
            name,
            ty,
            extents,
            memory,
            body,
        } => Stmt::Allocate {
            name: name.clone(),
            ty: *ty,
            extents: extents.iter().map(|e| fe(e)).collect(),
            memory: *memory,
            body: Box::new(fs(body)),
        },
        Stmt::Free { name } => Stmt::Free { name: name.clone() },
        Stmt::Evaluate(e) => Stmt::Evaluate(fe(e)),
        Stmt::Fork(a, b) => Stmt::Fork(Box::new(fs(a)), Box::new(fs(b))),
        Stmt::Acquire {
            semaphore,
            count,
            body,
        } => Stmt::Acquire {
            semaphore: fe(semaphore),
            count: fe(count),
            body: Box::new(fs(body)),
        },
        Stmt::Prefetch {
            name,
            offset,
            extent,
        } => Stmt::Prefetch {
            name: name.clone(),
            offset: fe(offset),
            extent: fe(extent),
        },
    }
}

/// True if no subexpression has side effects or reads memory.
pub fn is_pure_deep(e: &Expr) -> bool {
    let mut pure = true;
    visit_expr(e, &mut |c| pure &= c.is_pure());
    pure
}

/// Visit every subexpression of `e` (including `e` itself), pre-order.
pub fn visit_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    f(e);
    match e.kind() {
        ExprKind::IntImm(_)
        | ExprKind::UIntImm(_)
        | ExprKind::FloatImm(_)
        | ExprKind::StringImm(_)
        | ExprKind::Var(_) => {}
        ExprKind::Cast(v) | ExprKind::Reinterpret(v) | ExprKind::Not(v) => visit_expr(v, f),
        ExprKind::Add(a, b)
        | ExprKind::Sub(a, b)
        | ExprKind::Mul(a, b)
        | ExprKind::Div(a, b)
        | ExprKind::Mod(a, b)
        | ExprKind::Min(a, b)
        | ExprKind::Max(a, b)
        | ExprKind::Eq(a, b)
        | ExprKind::Ne(a, b)
        | ExprKind::Lt(a, b)
        | ExprKind::Le(a, b)
        | ExprKind::Gt(a, b)
        | ExprKind::Ge(a, b)
        | ExprKind::And(a, b)
        | ExprKind::Or(a, b) => {
            visit_expr(a, f);
            visit_expr(b, f);
        }
        ExprKind::Select {
            condition,
            true_value,
            false_value,
        } => {
            visit_expr(condition, f);
            visit_expr(true_value, f);
            visit_expr(false_value, f);
        }
        ExprKind::Load { index, predicate, .. } => {
            visit_expr(index, f);
            if let Some(p) = predicate {
                visit_expr(p, f);
            }
        }
        ExprKind::Ramp { base, stride, .. } => {
            visit_expr(base, f);
            visit_expr(stride, f);
        }
        ExprKind::Broadcast { value, .. } | ExprKind::VectorReduce { value, .. } => {
            visit_expr(value, f)
        }
        ExprKind::Shuffle { vectors, .. } => {
            for v in vectors {
                visit_expr(v, f);
            }
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                visit_expr(a, f);
            }
        }
        ExprKind::Let { value, body, .. } => {
            visit_expr(value, f);
            visit_expr(body, f);
        }
    }
}
