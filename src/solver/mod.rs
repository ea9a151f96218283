//! Solver capability surface consumed by address resolution.
//!
//! The core never talks to a solver process directly; it talks to
//! [`SolverBackend`], a three-call capability set (`evaluate`,
//! `must_be_true`, `get_range`) in which every answer may come back
//! [`SolverOutcome::Undecided`] when the backend's own budget runs out.
//! Undecided is not an error: callers thread it through as an `incomplete`
//! flag next to whatever partial result they accumulated.
//!
//! [`TimingSolver`] decorates a backend with wall-clock accounting and
//! undecided-query counters so long resolution sweeps can be diagnosed
//! without attaching a profiler.

pub mod z3_backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::debug;

use crate::expr::{ConstraintSet, Expr, ExprRef};

/// Answer of a budgeted solver query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverOutcome<T> {
    /// The solver produced a definite answer.
    Known(T),
    /// No model satisfies the query under the current constraints.
    Infeasible,
    /// The backend's budget ran out before a verdict.
    Undecided,
}

impl<T> SolverOutcome<T> {
    pub fn known(self) -> Option<T> {
        match self {
            SolverOutcome::Known(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_undecided(&self) -> bool {
        matches!(self, SolverOutcome::Undecided)
    }
}

/// Capability set the core requires of an external solver.
///
/// Implementations carry their own time budget; each method returns
/// `Undecided` instead of blocking past it.
pub trait SolverBackend {
    /// One concrete value of `expr` under `constraints`, if any exists.
    fn evaluate(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<u64>;

    /// Whether `expr` holds in every model of `constraints`.
    fn must_be_true(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<bool>;

    /// Cheap concrete bounds `(min, max)` on the value of `expr`.
    fn get_range(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<(u64, u64)>;
}

/// `may_be_true` derived from `must_be_true` on the negation.
///
/// Free function rather than a trait method so backends only implement the
/// three-primitive capability set.
pub fn may_be_true(
    solver: &dyn SolverBackend,
    constraints: &ConstraintSet,
    expr: &ExprRef,
) -> SolverOutcome<bool> {
    match solver.must_be_true(constraints, &Expr::not(expr.clone())) {
        SolverOutcome::Known(negation_holds) => SolverOutcome::Known(!negation_holds),
        SolverOutcome::Infeasible => SolverOutcome::Infeasible,
        SolverOutcome::Undecided => SolverOutcome::Undecided,
    }
}

/// Query accounting wrapped around a [`SolverBackend`].
pub struct TimingSolver<'a> {
    backend: &'a dyn SolverBackend,
    queries: AtomicU64,
    undecided: AtomicU64,
    total_micros: AtomicU64,
}

impl<'a> TimingSolver<'a> {
    pub fn new(backend: &'a dyn SolverBackend) -> Self {
        Self {
            backend,
            queries: AtomicU64::new(0),
            undecided: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
        }
    }

    fn record<T>(&self, started: Instant, outcome: &SolverOutcome<T>) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if outcome.is_undecided() {
            self.undecided.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn evaluate(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<u64> {
        let started = Instant::now();
        let outcome = self.backend.evaluate(constraints, expr);
        self.record(started, &outcome);
        outcome
    }

    pub fn must_be_true(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<bool> {
        let started = Instant::now();
        let outcome = self.backend.must_be_true(constraints, expr);
        self.record(started, &outcome);
        outcome
    }

    pub fn may_be_true(&self, constraints: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<bool> {
        let started = Instant::now();
        let outcome = may_be_true(self.backend, constraints, expr);
        self.record(started, &outcome);
        outcome
    }

    pub fn get_range(
        &self,
        constraints: &ConstraintSet,
        expr: &ExprRef,
    ) -> SolverOutcome<(u64, u64)> {
        let started = Instant::now();
        let outcome = self.backend.get_range(constraints, expr);
        self.record(started, &outcome);
        if outcome.is_undecided() {
            debug!(expr = %expr, "range query undecided within solver budget");
        }
        outcome
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn undecided_count(&self) -> u64 {
        self.undecided.load(Ordering::Relaxed)
    }

    pub fn total_query_time_micros(&self) -> u64 {
        self.total_micros.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::POINTER_WIDTH;

    /// Backend that decides everything by constant folding and gives up on
    /// anything genuinely symbolic.
    struct FoldingBackend;

    impl SolverBackend for FoldingBackend {
        fn evaluate(&self, _: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<u64> {
            match expr.as_concrete() {
                Some(v) => SolverOutcome::Known(v),
                None => SolverOutcome::Undecided,
            }
        }

        fn must_be_true(&self, _: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<bool> {
            match expr.as_concrete() {
                Some(v) => SolverOutcome::Known(v != 0),
                None => SolverOutcome::Undecided,
            }
        }

        fn get_range(&self, _: &ConstraintSet, expr: &ExprRef) -> SolverOutcome<(u64, u64)> {
            match expr.as_concrete() {
                Some(v) => SolverOutcome::Known((v, v)),
                None => SolverOutcome::Undecided,
            }
        }
    }

    #[test]
    fn may_be_true_flips_must_be_true_of_negation() {
        let backend = FoldingBackend;
        let constraints = ConstraintSet::new();
        let truth = Expr::bool_constant(true);
        let falsity = Expr::bool_constant(false);
        assert_eq!(
            may_be_true(&backend, &constraints, &truth),
            SolverOutcome::Known(true)
        );
        assert_eq!(
            may_be_true(&backend, &constraints, &falsity),
            SolverOutcome::Known(false)
        );
        let free = Expr::symbol("q", POINTER_WIDTH);
        assert!(may_be_true(&backend, &constraints, &free).is_undecided());
    }

    #[test]
    fn timing_solver_counts_undecided_queries() {
        let backend = FoldingBackend;
        let solver = TimingSolver::new(&backend);
        let constraints = ConstraintSet::new();
        solver.evaluate(&constraints, &Expr::constant(4));
        solver.evaluate(&constraints, &Expr::symbol("p", POINTER_WIDTH));
        assert_eq!(solver.query_count(), 2);
        assert_eq!(solver.undecided_count(), 1);
    }
}
