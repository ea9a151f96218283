//! Z3-backed [`SolverBackend`].
//!
//! Every query runs on a fresh `z3::Solver` configured with a deterministic
//! seed and a hard timeout, so resolution results are reproducible across
//! runs and a stuck query degrades to `Undecided` instead of wedging the
//! engine. Expressions lower structurally: words are bitvectors, bytes are
//! 8-bit extracts, symbolic array reads become `select`s on named const
//! arrays (same name, same declaration, so reads agree within a query).

use z3::ast::{Ast, Bool, BV};
use z3::{Context, Params, SatResult, Solver, Sort};

use crate::expr::{ConstraintSet, Expr, ExprRef, POINTER_WIDTH};
use crate::solver::{SolverBackend, SolverOutcome};

const DEFAULT_QUERY_TIMEOUT_MS: u32 = 2_000;
const SOLVER_RANDOM_SEED: u32 = 42;

pub struct Z3SolverBackend<'ctx> {
    ctx: &'ctx Context,
    timeout_ms: u32,
}

impl<'ctx> Z3SolverBackend<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self::with_timeout(ctx, DEFAULT_QUERY_TIMEOUT_MS)
    }

    pub fn with_timeout(ctx: &'ctx Context, timeout_ms: u32) -> Self {
        Self { ctx, timeout_ms }
    }

    fn fresh_solver(&self, constraints: &ConstraintSet) -> Solver<'ctx> {
        let solver = Solver::new(self.ctx);
        let mut params = Params::new(self.ctx);
        params.set_u32("timeout", self.timeout_ms);
        params.set_u32("random_seed", SOLVER_RANDOM_SEED);
        solver.set_params(&params);
        for constraint in constraints.iter() {
            solver.assert(&self.lower_bool(constraint));
        }
        solver
    }

    fn widen(bv: BV<'ctx>, width: u32) -> BV<'ctx> {
        let have = bv.get_size();
        if have < width {
            bv.zero_ext(width - have)
        } else {
            bv
        }
    }

    fn harmonize(&self, lhs: BV<'ctx>, rhs: BV<'ctx>) -> (BV<'ctx>, BV<'ctx>) {
        let width = lhs.get_size().max(rhs.get_size());
        (Self::widen(lhs, width), Self::widen(rhs, width))
    }

    fn byte_array(&self, name: &str) -> z3::ast::Array<'ctx> {
        let index_sort = Sort::bitvector(self.ctx, POINTER_WIDTH);
        let byte_sort = Sort::bitvector(self.ctx, 8);
        z3::ast::Array::new_const(self.ctx, name, &index_sort, &byte_sort)
    }

    fn lower_bv(&self, expr: &ExprRef) -> BV<'ctx> {
        match expr.as_ref() {
            Expr::Constant(v) => BV::from_u64(self.ctx, *v, POINTER_WIDTH),
            Expr::Symbol { name, width } => BV::new_const(self.ctx, name.as_ref(), *width),
            Expr::Select { array, index } => {
                let idx = Self::widen(self.lower_bv(index), POINTER_WIDTH);
                self.byte_array(array)
                    .select(&idx)
                    .as_bv()
                    .unwrap_or_else(|| BV::from_u64(self.ctx, 0, 8))
            }
            Expr::Extract { expr, byte } => {
                let inner = self.lower_bv(expr);
                let lo = byte * 8;
                let hi = lo + 7;
                debug_assert!(hi < inner.get_size(), "byte extract past expression width");
                inner.extract(hi, lo)
            }
            Expr::Concat { hi, lo } => self.lower_bv(hi).concat(&self.lower_bv(lo)),
            Expr::Add(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a.bvadd(&b)
            }
            Expr::Sub(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a.bvsub(&b)
            }
            Expr::Mul(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a.bvmul(&b)
            }
            Expr::Ite {
                cond,
                then,
                otherwise,
            } => {
                let (t, e) = self.harmonize(self.lower_bv(then), self.lower_bv(otherwise));
                self.lower_bool(cond).ite(&t, &e)
            }
            // Boolean-typed expression in a value position: 1 iff true.
            Expr::Eq(..)
            | Expr::Ult(..)
            | Expr::Ule(..)
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::Not(..) => {
                let one = BV::from_u64(self.ctx, 1, 1);
                let zero = BV::from_u64(self.ctx, 0, 1);
                self.lower_bool(expr).ite(&one, &zero)
            }
        }
    }

    fn lower_bool(&self, expr: &ExprRef) -> Bool<'ctx> {
        match expr.as_ref() {
            Expr::Constant(v) => Bool::from_bool(self.ctx, *v != 0),
            Expr::Eq(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a._eq(&b)
            }
            Expr::Ult(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a.bvult(&b)
            }
            Expr::Ule(a, b) => {
                let (a, b) = self.harmonize(self.lower_bv(a), self.lower_bv(b));
                a.bvule(&b)
            }
            Expr::And(a, b) => Bool::and(self.ctx, &[&self.lower_bool(a), &self.lower_bool(b)]),
            Expr::Or(a, b) => Bool::or(self.ctx, &[&self.lower_bool(a), &self.lower_bool(b)]),
            Expr::Not(a) => self.lower_bool(a).not(),
            // Value-typed expression in a boolean position: nonzero is true.
            _ => {
                let bv = self.lower_bv(expr);
                let zero = BV::from_u64(self.ctx, 0, bv.get_size());
                bv._eq(&zero).not()
            }
        }
    }

    /// Satisfiability of `constraints && condition` with a fresh solver.
    fn check_sat(&self, constraints: &ConstraintSet, condition: &Bool<'ctx>) -> SolverOutcome<bool> {
        let solver = self.fresh_solver(constraints);
        solver.assert(condition);
        match solver.check() {
            SatResult::Sat => SolverOutcome::Known(true),
            SatResult::Unsat => SolverOutcome::Known(false),
            SatResult::Unknown => SolverOutcome::Undecided,
        }
    }

    /// Smallest value in `[lo, hi]` for which `expr <= bound` is satisfiable.
    fn search_min(
        &self,
        constraints: &ConstraintSet,
        expr: &BV<'ctx>,
        mut lo: u64,
        mut hi: u64,
    ) -> SolverOutcome<u64> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let bound = BV::from_u64(self.ctx, mid, expr.get_size());
            match self.check_sat(constraints, &expr.bvule(&bound)) {
                SolverOutcome::Known(true) => hi = mid,
                SolverOutcome::Known(false) => lo = mid + 1,
                _ => return SolverOutcome::Undecided,
            }
        }
        SolverOutcome::Known(lo)
    }

    /// Largest value in `[lo, hi]` for which `expr >= bound` is satisfiable.
    fn search_max(
        &self,
        constraints: &ConstraintSet,
        expr: &BV<'ctx>,
        mut lo: u64,
        mut hi: u64,
    ) -> SolverOutcome<u64> {
        while lo < hi {
            let mid = lo + (hi - lo).div_ceil(2);
            let bound = BV::from_u64(self.ctx, mid, expr.get_size());
            match self.check_sat(constraints, &bound.bvule(expr)) {
                SolverOutcome::Known(true) => lo = mid,
                SolverOutcome::Known(false) => hi = mid - 1,
                _ => return SolverOutcome::Undecided,
            }
        }
        SolverOutcome::Known(lo)
    }
}

impl SolverBackend for Z3SolverBackend<'_> {
    fn evaluate(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<u64> {
        if let Some(v) = expr.as_concrete() {
            return SolverOutcome::Known(v);
        }
        let lowered = self.lower_bv(expr);
        let solver = self.fresh_solver(constraints);
        match solver.check() {
            SatResult::Sat => {
                let model = match solver.get_model() {
                    Some(m) => m,
                    None => return SolverOutcome::Undecided,
                };
                match model.eval(&lowered, true).and_then(|v| v.as_u64()) {
                    Some(v) => SolverOutcome::Known(v),
                    None => SolverOutcome::Undecided,
                }
            }
            SatResult::Unsat => SolverOutcome::Infeasible,
            SatResult::Unknown => SolverOutcome::Undecided,
        }
    }

    fn must_be_true(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<bool> {
        if let Some(v) = expr.as_concrete() {
            return SolverOutcome::Known(v != 0);
        }
        // expr holds everywhere iff its negation is unsatisfiable.
        match self.check_sat(constraints, &self.lower_bool(expr).not()) {
            SolverOutcome::Known(negation_sat) => SolverOutcome::Known(!negation_sat),
            SolverOutcome::Infeasible => SolverOutcome::Infeasible,
            SolverOutcome::Undecided => SolverOutcome::Undecided,
        }
    }

    fn get_range(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<(u64, u64)> {
        if let Some(v) = expr.as_concrete() {
            return SolverOutcome::Known((v, v));
        }
        let witness = match self.evaluate(constraints, expr) {
            SolverOutcome::Known(v) => v,
            SolverOutcome::Infeasible => return SolverOutcome::Infeasible,
            SolverOutcome::Undecided => return SolverOutcome::Undecided,
        };
        let lowered = self.lower_bv(expr);
        let ceiling = if lowered.get_size() >= 64 {
            u64::MAX
        } else {
            (1u64 << lowered.get_size()) - 1
        };
        let min = match self.search_min(constraints, &lowered, 0, witness) {
            SolverOutcome::Known(v) => v,
            SolverOutcome::Infeasible => return SolverOutcome::Infeasible,
            SolverOutcome::Undecided => return SolverOutcome::Undecided,
        };
        let max = match self.search_max(constraints, &lowered, witness, ceiling) {
            SolverOutcome::Known(v) => v,
            SolverOutcome::Infeasible => return SolverOutcome::Infeasible,
            SolverOutcome::Undecided => return SolverOutcome::Undecided,
        };
        SolverOutcome::Known((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::Config;

    fn with_backend(f: impl FnOnce(&Z3SolverBackend<'_>)) {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let backend = Z3SolverBackend::new(&ctx);
        f(&backend);
    }

    #[test]
    fn evaluate_respects_constraints() {
        with_backend(|backend| {
            let p = Expr::symbol("p", POINTER_WIDTH);
            let mut constraints = ConstraintSet::new();
            constraints.push(Expr::eq(p.clone(), Expr::constant(0x1040)));
            assert_eq!(
                backend.evaluate(&constraints, &p),
                SolverOutcome::Known(0x1040)
            );
        });
    }

    #[test]
    fn must_be_true_detects_forced_range() {
        with_backend(|backend| {
            let p = Expr::symbol("p", POINTER_WIDTH);
            let mut constraints = ConstraintSet::new();
            constraints.push(Expr::ule(Expr::constant(0x1000), p.clone()));
            constraints.push(Expr::ult(p.clone(), Expr::constant(0x1040)));
            let in_obj = Expr::in_range(p.clone(), Expr::constant(0x1000), Expr::constant(0x40));
            assert_eq!(
                backend.must_be_true(&constraints, &in_obj),
                SolverOutcome::Known(true)
            );
            let elsewhere =
                Expr::in_range(p, Expr::constant(0x2000), Expr::constant(0x40));
            assert_eq!(
                backend.must_be_true(&constraints, &elsewhere),
                SolverOutcome::Known(false)
            );
        });
    }

    #[test]
    fn get_range_tightens_to_constraint_bounds() {
        with_backend(|backend| {
            let p = Expr::symbol("p", POINTER_WIDTH);
            let mut constraints = ConstraintSet::new();
            constraints.push(Expr::ule(Expr::constant(0x2000), p.clone()));
            constraints.push(Expr::ule(p.clone(), Expr::constant(0x2fff)));
            assert_eq!(
                backend.get_range(&constraints, &p),
                SolverOutcome::Known((0x2000, 0x2fff))
            );
        });
    }

    #[test]
    fn infeasible_constraints_surface_as_infeasible() {
        with_backend(|backend| {
            let p = Expr::symbol("p", POINTER_WIDTH);
            let mut constraints = ConstraintSet::new();
            constraints.push(Expr::eq(p.clone(), Expr::constant(1)));
            constraints.push(Expr::eq(p.clone(), Expr::constant(2)));
            assert_eq!(backend.evaluate(&constraints, &p), SolverOutcome::Infeasible);
        });
    }
}
