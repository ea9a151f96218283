//! The per-state address space.
//!
//! An address space maps memory objects to their byte-level contents under a
//! copy-on-write discipline: forking a state shares every object state and
//! copies nothing; the first write through `get_writeable` clones exactly
//! the object being written. Ownership is tracked with a stamp: an object
//! state whose `copy_on_write_owner` equals the space's `cow_key` may be
//! mutated in place, anything else must be cloned first.
//!
//! Resolution enumerates the objects a symbolic pointer may alias, in
//! strictly increasing address order, bounded by a resolution cap, a wall
//! clock budget, the solver's own budget, and an external halt flag. A
//! bounded exit always returns the partial list with `incomplete = true`;
//! none of these paths is an error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::expr::{ConstraintSet, ExprRef};
use crate::memory::concrete_store::ConcreteStore;
use crate::memory::object::{MemoryObjectRef, ObjectKey, SYMBOLIC_BASE};
use crate::memory::object_state::ObjectState;
use crate::solver::{SolverOutcome, TimingSolver};

pub type ObjectPair = (MemoryObjectRef, Arc<ObjectState>);
pub type ResolutionList = Vec<ObjectPair>;

/// Shadow capacity given to lazily initialized objects whose size does not
/// fold to a constant.
const LAZY_OBJECT_CAPACITY: usize = 4096;

/// COW keys are issued from one process-wide cell so every fork observes a
/// strictly larger key than any stamp already in circulation.
static NEXT_COW_KEY: AtomicU32 = AtomicU32::new(1);

fn next_cow_key() -> u32 {
    NEXT_COW_KEY.fetch_add(1, Ordering::Relaxed)
}

/// Verdict of one pointer-against-object solver check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerCheck {
    /// The pointer can only land in this object.
    Unique,
    /// The pointer may land in this object.
    Maybe,
    /// The pointer cannot land in this object.
    No,
}

/// Result of the unique-resolution attempt for a symbolic pointer.
#[derive(Debug, Clone)]
pub struct ResolveOneOutcome {
    pub pair: Option<ObjectPair>,
    /// True iff a unique object was identified.
    pub success: bool,
    /// True iff a solver budget ran out or the halt flag was observed.
    pub incomplete: bool,
}

impl ResolveOneOutcome {
    fn found(pair: ObjectPair) -> Self {
        Self {
            pair: Some(pair),
            success: true,
            incomplete: false,
        }
    }

    fn missed(incomplete: bool) -> Self {
        Self {
            pair: None,
            success: false,
            incomplete,
        }
    }
}

#[derive(Debug)]
pub struct AddressSpace {
    /// Stamp identifying the object states this space may mutate in place.
    cow_key: u32,
    /// Ordered by `(base address, id)`; resolution relies on this order.
    objects: BTreeMap<ObjectKey, ObjectPair>,
    /// False while lazily synthesized bindings are pending materialization.
    complete: bool,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            cow_key: next_cow_key(),
            objects: BTreeMap::new(),
            complete: true,
        }
    }

    pub fn cow_key(&self) -> u32 {
        self.cow_key
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Caller materialized all pending lazy bindings.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Bindings in address order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectPair> {
        self.objects.values()
    }

    /// Fork this space for a new execution state.
    ///
    /// Both spaces receive fresh COW keys (the child's strictly larger), so
    /// every stamp already in the map goes stale and the next write on
    /// either side clones. The map spine is copied; no object state is.
    pub fn fork(&mut self) -> AddressSpace {
        self.cow_key = next_cow_key();
        AddressSpace {
            cow_key: next_cow_key(),
            objects: self.objects.clone(),
            complete: self.complete,
        }
    }

    /// Bind `os` to `mo`, taking ownership and stamping with this space's key.
    pub fn bind_object(&mut self, mo: &MemoryObjectRef, mut os: ObjectState) {
        debug_assert_eq!(os.object_id(), mo.id(), "binding state of a different object");
        os.stamp(self.cow_key);
        self.objects.insert(mo.key(), (mo.clone(), Arc::new(os)));
    }

    /// Bind an already-shared object state without restamping. The state
    /// stays shared; the first write through `get_writeable` clones it.
    pub fn bind_shared(&mut self, mo: &MemoryObjectRef, os: Arc<ObjectState>) {
        debug_assert_eq!(os.object_id(), mo.id(), "binding state of a different object");
        debug_assert!(
            os.copy_on_write_owner() <= self.cow_key,
            "shared binding carries a stamp from the future"
        );
        self.objects.insert(mo.key(), (mo.clone(), os));
    }

    pub fn unbind_object(&mut self, mo: &MemoryObjectRef) -> Option<ObjectPair> {
        self.objects.remove(&mo.key())
    }

    pub fn find_object(&self, mo: &MemoryObjectRef) -> Option<ObjectPair> {
        self.objects.get(&mo.key()).cloned()
    }

    /// The sole sanctioned path to mutation.
    ///
    /// Returns the bound state as mutable when this space owns it, otherwise
    /// clones it, restamps the clone with this space's key, rebinds, and
    /// returns the clone. `None` when `mo` is not bound.
    pub fn get_writeable(&mut self, mo: &MemoryObjectRef) -> Option<&mut ObjectState> {
        let cow_key = self.cow_key;
        let (_, os) = self.objects.get_mut(&mo.key())?;
        if os.copy_on_write_owner() != cow_key {
            let mut fresh = os.clone_unowned();
            fresh.stamp(cow_key);
            *os = Arc::new(fresh);
        }
        // Owned by stamp, but a pair handed out by `find_object` may still
        // alias the Arc; `make_mut` clones in that case instead of mutating
        // a snapshot someone else is reading.
        Some(Arc::make_mut(os))
    }

    /// Synthesize contents for an object the engine has not bound yet:
    /// fully symbolic, backed by a fresh named array.
    pub fn lazy_initialize_object(&self, mo: &MemoryObjectRef) -> ObjectState {
        let capacity = mo
            .concrete_size()
            .map(|size| size as usize)
            .unwrap_or(LAZY_OBJECT_CAPACITY);
        ObjectState::fully_symbolic(mo, format!("mo{}_lazy", mo.id()), capacity)
    }

    /// Existing binding, or a lazily synthesized one bound on the spot.
    /// Synthesizing marks the space incomplete until the caller materializes
    /// pending bindings and calls [`mark_complete`](Self::mark_complete).
    pub fn find_or_lazy_initialize_object(&mut self, mo: &MemoryObjectRef) -> ObjectPair {
        if let Some(pair) = self.find_object(mo) {
            return pair;
        }
        let os = Arc::new(self.lazy_initialize_object(mo));
        debug!(object = mo.id(), "lazy-initializing unbound object");
        self.bind_shared(mo, os.clone());
        self.complete = false;
        (mo.clone(), os)
    }

    /// Locate the unique object whose `[base, base + size)` range contains a
    /// fully concrete address. Nearest base wins; zero-sized objects never
    /// resolve.
    pub fn resolve_one_concrete(&self, address: u64) -> Option<ObjectPair> {
        let upper = ObjectKey {
            base: address,
            id: u64::MAX,
        };
        self.objects
            .range(..=upper)
            .rev()
            .find(|(_, (mo, _))| mo.contains_concrete(address))
            .map(|(_, pair)| pair.clone())
    }

    /// Check whether `ptr` can land in the object of `pair`.
    ///
    /// Returns the verdict plus an incomplete flag raised when the solver
    /// could not decide within budget.
    fn check_pointer_in_object(
        &self,
        constraints: &ConstraintSet,
        solver: &TimingSolver<'_>,
        ptr: &ExprRef,
        pair: &ObjectPair,
    ) -> (PointerCheck, bool) {
        let (mo, _) = pair;
        if mo.is_zero_sized() {
            return (PointerCheck::No, false);
        }
        let in_range = mo.bounds_query(ptr.clone());
        match solver.may_be_true(constraints, &in_range) {
            SolverOutcome::Known(false) | SolverOutcome::Infeasible => (PointerCheck::No, false),
            SolverOutcome::Undecided => (PointerCheck::No, true),
            SolverOutcome::Known(true) => match solver.must_be_true(constraints, &in_range) {
                SolverOutcome::Known(true) => (PointerCheck::Unique, false),
                SolverOutcome::Known(false) | SolverOutcome::Infeasible => {
                    (PointerCheck::Maybe, false)
                }
                SolverOutcome::Undecided => (PointerCheck::Maybe, true),
            },
        }
    }

    /// Try to resolve a symbolic pointer to the one object it must refer to.
    ///
    /// Asks the solver for an example value, looks up the containing object,
    /// and confirms uniqueness. Ambiguity is reported through
    /// `success = false` so the caller can escalate to [`resolve`](Self::resolve);
    /// solver exhaustion and the halt flag surface as `incomplete`.
    pub fn resolve_one(
        &self,
        constraints: &ConstraintSet,
        solver: &TimingSolver<'_>,
        ptr: &ExprRef,
        halt: &AtomicBool,
    ) -> ResolveOneOutcome {
        if let Some(address) = ptr.as_concrete() {
            return match self.resolve_one_concrete(address) {
                Some(pair) => ResolveOneOutcome::found(pair),
                None => ResolveOneOutcome::missed(false),
            };
        }

        let example = match solver.evaluate(constraints, ptr) {
            SolverOutcome::Known(v) => v,
            SolverOutcome::Infeasible => return ResolveOneOutcome::missed(false),
            SolverOutcome::Undecided => return ResolveOneOutcome::missed(true),
        };

        if halt.load(Ordering::Relaxed) {
            return ResolveOneOutcome::missed(true);
        }

        let pair = match self.resolve_one_concrete(example) {
            Some(pair) => pair,
            // The example points at no object; a unique referent cannot be
            // established without the full enumeration.
            None => return ResolveOneOutcome::missed(false),
        };

        let in_range = pair.0.bounds_query(ptr.clone());
        match solver.must_be_true(constraints, &in_range) {
            SolverOutcome::Known(true) => ResolveOneOutcome::found(pair),
            SolverOutcome::Known(false) | SolverOutcome::Infeasible => {
                ResolveOneOutcome::missed(false)
            }
            SolverOutcome::Undecided => ResolveOneOutcome::missed(true),
        }
    }

    /// Enumerate every object `ptr` may alias, in address order.
    ///
    /// `max_resolutions == 0` means unbounded; a zero `timeout` disables the
    /// wall clock. The returned flag is true iff the enumeration stopped
    /// early (cap reached, budget exceeded, solver undecided, or halt
    /// observed); the partial list accumulated so far is always returned.
    pub fn resolve(
        &self,
        constraints: &ConstraintSet,
        solver: &TimingSolver<'_>,
        ptr: &ExprRef,
        max_resolutions: usize,
        timeout: Duration,
        halt: &AtomicBool,
    ) -> (ResolutionList, bool) {
        if let Some(address) = ptr.as_concrete() {
            let list = self.resolve_one_concrete(address).into_iter().collect();
            return (list, false);
        }

        // Cheap concrete window. An undecided range query degrades to a full
        // sweep rather than aborting: the per-object checks below still
        // bound the work.
        let (min, max) = match solver.get_range(constraints, ptr) {
            SolverOutcome::Known(bounds) => bounds,
            SolverOutcome::Infeasible => return (Vec::new(), false),
            SolverOutcome::Undecided => (0, u64::MAX),
        };

        let started = Instant::now();
        let mut list: ResolutionList = Vec::new();

        // Start the concrete window at the last object based at or below
        // `min`, so an object straddling the lower bound is not skipped.
        let window_floor = ObjectKey { base: min, id: u64::MAX };
        let start_base = self
            .objects
            .range(..=window_floor)
            .next_back()
            .map(|(key, _)| key.base)
            .unwrap_or(min);
        let window_start = ObjectKey {
            base: start_base,
            id: 0,
        };
        let window_end = ObjectKey {
            base: max.min(SYMBOLIC_BASE - 1),
            id: u64::MAX,
        };
        let symbolic_tail = ObjectKey {
            base: SYMBOLIC_BASE,
            id: 0,
        };

        // Objects with symbolic bases sort past every concrete window and
        // are always swept; only the solver can rule them out. The concrete
        // window can be empty when the pointer is pinned past every object.
        let concrete_window = (window_start <= window_end)
            .then(|| self.objects.range(window_start..=window_end));
        let candidates = concrete_window
            .into_iter()
            .flatten()
            .chain(self.objects.range(symbolic_tail..));

        for (_, pair) in candidates {
            let (verdict, undecided) =
                self.check_pointer_in_object(constraints, solver, ptr, pair);
            match verdict {
                PointerCheck::Unique => {
                    return (vec![pair.clone()], false);
                }
                PointerCheck::Maybe => {
                    list.push(pair.clone());
                    if undecided {
                        return (list, true);
                    }
                    if max_resolutions != 0 && list.len() >= max_resolutions {
                        debug!(cap = max_resolutions, "resolution cap reached");
                        return (list, true);
                    }
                }
                PointerCheck::No => {
                    if undecided {
                        return (list, true);
                    }
                }
            }

            // Budgets are checked after each candidate so a bounded exit
            // still carries the prefix enumerated so far.
            if halt.load(Ordering::Relaxed) {
                debug!(resolved = list.len(), "resolution halted externally");
                return (list, true);
            }
            if !timeout.is_zero() && started.elapsed() > timeout {
                debug!(resolved = list.len(), "resolution timed out");
                return (list, true);
            }
        }

        (list, false)
    }

    /// [`resolve`](Self::resolve) with the budgets of a [`ResolutionLimits`].
    pub fn resolve_with_limits(
        &self,
        constraints: &ConstraintSet,
        solver: &TimingSolver<'_>,
        ptr: &ExprRef,
        limits: &crate::utils::ResolutionLimits,
        halt: &AtomicBool,
    ) -> (ResolutionList, bool) {
        self.resolve(
            constraints,
            solver,
            ptr,
            limits.max_resolutions,
            limits.timeout,
            halt,
        )
    }

    /// Copy the concrete shadow of every bound object out to the external
    /// region table.
    pub fn copy_out_concretes(&self, store: &mut ConcreteStore) {
        for (mo, os) in self.objects.values() {
            store.put(mo.id(), os.shadow_bytes());
        }
    }

    /// Copy externally modified bytes back in, concretizing what changed.
    ///
    /// Objects whose external bytes are unchanged are not touched (and not
    /// cloned). Returns `false` without modifying anything when an external
    /// write hit a read-only object.
    pub fn copy_in_concretes(&mut self, store: &ConcreteStore) -> bool {
        let mut dirty: Vec<(MemoryObjectRef, Vec<u8>)> = Vec::new();
        for (mo, os) in self.objects.values() {
            let Some(external) = store.get(mo.id()) else {
                continue;
            };
            let shadow = os.shadow_bytes();
            let shared = shadow.len().min(external.len());
            if shadow[..shared] != external[..shared] {
                if os.read_only {
                    debug!(object = mo.id(), "external write to read-only object");
                    return false;
                }
                dirty.push((mo.clone(), external[..shared].to_vec()));
            }
        }
        for (mo, bytes) in dirty {
            let os = self
                .get_writeable(&mo)
                .expect("dirty object vanished during copy-in");
            for (offset, byte) in bytes.iter().enumerate() {
                if os.shadow_bytes()[offset] != *byte {
                    os.write_concrete(offset, u64::from(*byte), 1);
                }
            }
        }
        true
    }
}
