//! Pointer and size expressions.
//!
//! The engine core does not own a full symbolic expression language; it
//! consumes a small tagged variant that covers exactly what address
//! resolution and byte-level memory need: 64-bit machine words, 8-bit bytes
//! extracted from them, reads out of named symbolic arrays, and the boolean
//! combinators solver queries are built from. Anything richer lives behind
//! the solver backend.
//!
//! Expressions are immutable and shared via `Arc`; builders constant-fold
//! eagerly so that the concrete fast paths (`is_constant`/`as_concrete`)
//! stay cheap on the hot resolution loop.

use std::fmt;
use std::sync::Arc;

pub type ExprRef = Arc<Expr>;

/// Width, in bits, of a pointer-sized value.
pub const POINTER_WIDTH: u32 = 64;
/// Width, in bits, of a single memory byte.
pub const BYTE_WIDTH: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Concrete 64-bit machine word.
    Constant(u64),
    /// Free symbolic value of the given bit width.
    Symbol { name: Arc<str>, width: u32 },
    /// One byte read out of a named symbolic array at a symbolic index.
    Select { array: Arc<str>, index: ExprRef },
    Add(ExprRef, ExprRef),
    Sub(ExprRef, ExprRef),
    Mul(ExprRef, ExprRef),
    /// Byte `byte` (0 = least significant) of a word-sized expression.
    Extract { expr: ExprRef, byte: u32 },
    /// Big-endian concatenation: `hi` occupies the more significant bits.
    Concat { hi: ExprRef, lo: ExprRef },
    Eq(ExprRef, ExprRef),
    Ult(ExprRef, ExprRef),
    Ule(ExprRef, ExprRef),
    And(ExprRef, ExprRef),
    Or(ExprRef, ExprRef),
    Not(ExprRef),
    Ite {
        cond: ExprRef,
        then: ExprRef,
        otherwise: ExprRef,
    },
}

impl Expr {
    pub fn constant(value: u64) -> ExprRef {
        Arc::new(Expr::Constant(value))
    }

    pub fn bool_constant(value: bool) -> ExprRef {
        // Booleans ride on the word domain: 1 is true, 0 is false.
        Arc::new(Expr::Constant(u64::from(value)))
    }

    /// A concrete byte in the 8-bit domain.
    ///
    /// Built as a raw `Extract` node (not through [`Expr::extract_byte`],
    /// which folds back to a word constant) so that concrete bytes mix with
    /// symbolic bytes at equal width inside a `Concat` chain.
    pub fn byte_constant(value: u8) -> ExprRef {
        Arc::new(Expr::Extract {
            expr: Arc::new(Expr::Constant(u64::from(value))),
            byte: 0,
        })
    }

    pub fn symbol(name: impl Into<Arc<str>>, width: u32) -> ExprRef {
        Arc::new(Expr::Symbol {
            name: name.into(),
            width,
        })
    }

    pub fn select(array: impl Into<Arc<str>>, index: ExprRef) -> ExprRef {
        Arc::new(Expr::Select {
            array: array.into(),
            index,
        })
    }

    pub fn add(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::constant(a.wrapping_add(b)),
            (_, Some(0)) => lhs,
            (Some(0), _) => rhs,
            _ => Arc::new(Expr::Add(lhs, rhs)),
        }
    }

    pub fn sub(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::constant(a.wrapping_sub(b)),
            (_, Some(0)) => lhs,
            _ => Arc::new(Expr::Sub(lhs, rhs)),
        }
    }

    pub fn mul(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::constant(a.wrapping_mul(b)),
            (_, Some(1)) => lhs,
            (Some(1), _) => rhs,
            (Some(0), _) | (_, Some(0)) => Expr::constant(0),
            _ => Arc::new(Expr::Mul(lhs, rhs)),
        }
    }

    pub fn extract_byte(expr: ExprRef, byte: u32) -> ExprRef {
        if let Some(v) = expr.as_concrete() {
            return Expr::constant((v >> (byte * BYTE_WIDTH)) & 0xff);
        }
        Arc::new(Expr::Extract { expr, byte })
    }

    pub fn concat(hi: ExprRef, lo: ExprRef) -> ExprRef {
        Arc::new(Expr::Concat { hi, lo })
    }

    pub fn eq(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::bool_constant(a == b),
            _ if lhs == rhs => Expr::bool_constant(true),
            _ => Arc::new(Expr::Eq(lhs, rhs)),
        }
    }

    pub fn ult(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::bool_constant(a < b),
            _ => Arc::new(Expr::Ult(lhs, rhs)),
        }
    }

    pub fn ule(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::bool_constant(a <= b),
            _ => Arc::new(Expr::Ule(lhs, rhs)),
        }
    }

    pub fn and(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(0), _) | (_, Some(0)) => Expr::bool_constant(false),
            (Some(_), Some(_)) => Expr::bool_constant(true),
            (Some(_), None) => rhs,
            (None, Some(_)) => lhs,
            _ => Arc::new(Expr::And(lhs, rhs)),
        }
    }

    pub fn or(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        match (lhs.as_concrete(), rhs.as_concrete()) {
            (Some(a), Some(b)) => Expr::bool_constant(a != 0 || b != 0),
            (Some(0), None) => rhs,
            (None, Some(0)) => lhs,
            (Some(_), None) | (None, Some(_)) => Expr::bool_constant(true),
            (None, None) => Arc::new(Expr::Or(lhs, rhs)),
        }
    }

    pub fn not(expr: ExprRef) -> ExprRef {
        if let Some(v) = expr.as_concrete() {
            return Expr::bool_constant(v == 0);
        }
        if let Expr::Not(inner) = expr.as_ref() {
            return inner.clone();
        }
        Arc::new(Expr::Not(expr))
    }

    pub fn ite(cond: ExprRef, then: ExprRef, otherwise: ExprRef) -> ExprRef {
        match cond.as_concrete() {
            Some(0) => otherwise,
            Some(_) => then,
            None => Arc::new(Expr::Ite {
                cond,
                then,
                otherwise,
            }),
        }
    }

    /// The range-membership query `base <= ptr && ptr < base + size`.
    ///
    /// This is the shape every pointer-in-object solver check takes; the
    /// builders fold it to a boolean constant when all operands are concrete.
    pub fn in_range(ptr: ExprRef, base: ExprRef, size: ExprRef) -> ExprRef {
        let end = Expr::add(base.clone(), size);
        Expr::and(Expr::ule(base, ptr.clone()), Expr::ult(ptr, end))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant(_))
    }

    pub fn as_concrete(&self) -> Option<u64> {
        match self {
            Expr::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// Bit width of the value this expression denotes.
    pub fn width(&self) -> u32 {
        match self {
            Expr::Constant(_) => POINTER_WIDTH,
            Expr::Symbol { width, .. } => *width,
            Expr::Select { .. } | Expr::Extract { .. } => BYTE_WIDTH,
            Expr::Concat { hi, lo } => hi.width() + lo.width(),
            Expr::Add(lhs, _)
            | Expr::Sub(lhs, _)
            | Expr::Mul(lhs, _) => lhs.width(),
            Expr::Ite { then, .. } => then.width(),
            // Boolean combinators denote truth values.
            Expr::Eq(..)
            | Expr::Ult(..)
            | Expr::Ule(..)
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(..) => 1,
        }
    }

    /// Pre-order walk over the expression tree.
    pub fn walk(&self, visitor: &mut dyn ExprVisitor) {
        visitor.visit_expr(self);
        match self {
            Expr::Constant(_) | Expr::Symbol { .. } => {}
            Expr::Select { index, .. } => index.walk(visitor),
            Expr::Extract { expr, .. } | Expr::Not(expr) => expr.walk(visitor),
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Eq(a, b)
            | Expr::Ult(a, b)
            | Expr::Ule(a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b)
            | Expr::Concat { hi: a, lo: b } => {
                a.walk(visitor);
                b.walk(visitor);
            }
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(visitor);
                then.walk(visitor);
                otherwise.walk(visitor);
            }
        }
    }

    /// True when any free symbol or symbolic array read occurs in the tree.
    pub fn references_symbols(&self) -> bool {
        struct Finder {
            found: bool,
        }
        impl ExprVisitor for Finder {
            fn visit_expr(&mut self, expr: &Expr) {
                if matches!(expr, Expr::Symbol { .. } | Expr::Select { .. }) {
                    self.found = true;
                }
            }
        }
        let mut finder = Finder { found: false };
        self.walk(&mut finder);
        finder.found
    }
}

/// Visitor over expression nodes, invoked pre-order by [`Expr::walk`].
pub trait ExprVisitor {
    fn visit_expr(&mut self, expr: &Expr);
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(v) => write!(f, "{v:#x}"),
            Expr::Symbol { name, width } => write!(f, "{name}:{width}"),
            Expr::Select { array, index } => write!(f, "{array}[{index}]"),
            Expr::Add(a, b) => write!(f, "(add {a} {b})"),
            Expr::Sub(a, b) => write!(f, "(sub {a} {b})"),
            Expr::Mul(a, b) => write!(f, "(mul {a} {b})"),
            Expr::Extract { expr, byte } => write!(f, "(byte {byte} {expr})"),
            Expr::Concat { hi, lo } => write!(f, "(concat {hi} {lo})"),
            Expr::Eq(a, b) => write!(f, "(= {a} {b})"),
            Expr::Ult(a, b) => write!(f, "(ult {a} {b})"),
            Expr::Ule(a, b) => write!(f, "(ule {a} {b})"),
            Expr::And(a, b) => write!(f, "(and {a} {b})"),
            Expr::Or(a, b) => write!(f, "(or {a} {b})"),
            Expr::Not(a) => write!(f, "(not {a})"),
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => write!(f, "(ite {cond} {then} {otherwise})"),
        }
    }
}

/// Path condition accumulated by an execution state.
///
/// Order is preserved: solver backends assert constraints in push order so
/// query behavior is reproducible across runs.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<ExprRef>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: ExprRef) {
        // Tautologies carry no information and bloat every solver query.
        if constraint.as_concrete() == Some(1) {
            return;
        }
        self.constraints.push(constraint);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExprRef> {
        self.constraints.iter()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fold_concrete_operands() {
        let a = Expr::constant(0x1000);
        let b = Expr::constant(0x40);
        assert_eq!(Expr::add(a.clone(), b.clone()).as_concrete(), Some(0x1040));
        assert_eq!(Expr::sub(a.clone(), b.clone()).as_concrete(), Some(0xfc0));
        assert_eq!(Expr::ult(b, a).as_concrete(), Some(1));
    }

    #[test]
    fn in_range_folds_for_concrete_pointer() {
        let base = Expr::constant(0x1000);
        let size = Expr::constant(0x40);
        let inside = Expr::in_range(Expr::constant(0x103f), base.clone(), size.clone());
        let outside = Expr::in_range(Expr::constant(0x1040), base, size);
        assert_eq!(inside.as_concrete(), Some(1));
        assert_eq!(outside.as_concrete(), Some(0));
    }

    #[test]
    fn symbolic_pointer_stays_symbolic() {
        let ptr = Expr::symbol("p", POINTER_WIDTH);
        let range = Expr::in_range(ptr.clone(), Expr::constant(0x1000), Expr::constant(0x40));
        assert!(!range.is_constant());
        assert!(range.references_symbols());
        assert!(!Expr::constant(7).references_symbols());
    }

    #[test]
    fn not_not_cancels() {
        let p = Expr::symbol("flag", 1);
        let folded = Expr::not(Expr::not(p.clone()));
        assert_eq!(folded, p);
    }

    #[test]
    fn constraint_set_drops_tautologies() {
        let mut constraints = ConstraintSet::new();
        constraints.push(Expr::bool_constant(true));
        assert!(constraints.is_empty());
        constraints.push(Expr::eq(
            Expr::symbol("p", POINTER_WIDTH),
            Expr::constant(3),
        ));
        assert_eq!(constraints.len(), 1);
    }
}
