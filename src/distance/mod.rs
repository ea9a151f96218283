//! Guided-search distance ranking.
//!
//! For a `(state, target block)` query the calculator classifies where the
//! target sits relative to the state: same function (`Local`), forward in
//! the call graph (`Pre`), in a function already on the stack below us
//! (`Post`), or unreachable (`None`). It then produces a `DistanceResult`
//! ranking the state's proximity. Results are pure in the code graph, so
//! they are cached per `(target, block, kind)` and stay valid for every
//! execution state until the graph itself is rebuilt.
//!
//! The cache is sharded (`DashMap`), so one calculator can be shared across
//! search worker threads.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::graph::{BlockId, CodeGraph, FunctionId};
use crate::state::{ExecutionState, StackFrame};

/// Verdict of a distance query, in ranking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightResult {
    /// The state already sits on the target block.
    Done = 0,
    /// The target remains reachable; `weight` hops remain.
    Continue = 1,
    /// No path to the target from this state.
    Miss = 2,
}

pub type Weight = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DistanceResult {
    pub result: WeightResult,
    pub weight: Weight,
    pub is_inside_function: bool,
}

impl DistanceResult {
    pub fn new(result: WeightResult, weight: Weight, is_inside_function: bool) -> Self {
        Self {
            result,
            weight,
            is_inside_function,
        }
    }

    pub fn miss() -> Self {
        Self::new(WeightResult::Miss, 0, true)
    }

    fn rank(&self) -> (u8, Weight, bool) {
        (self.result as u8, self.weight, !self.is_inside_function)
    }
}

/// Lexicographic on (verdict, weight, outside-function): `Done` beats
/// `Continue` beats `Miss`, closer beats farther, inside beats outside.
/// Total, hence a strict weak order usable in priority queues.
impl Ord for DistanceResult {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for DistanceResult {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DistanceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = match self.result {
            WeightResult::Done => "Done",
            WeightResult::Continue => "Continue",
            WeightResult::Miss => "Miss",
        };
        let site = if self.is_inside_function {
            "inside"
        } else {
            "outside"
        };
        write!(f, "{verdict}(weight={}, {site})", self.weight)
    }
}

/// Position of the queried block relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// Same function as the target.
    Local,
    /// The target's function lies forward in the call graph.
    Pre,
    /// The target's function sits below us on the call stack.
    Post,
    /// The call graph offers no path.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    target: BlockId,
    block: BlockId,
    kind: TargetKind,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct DistanceCalculator {
    graph: Arc<CodeGraph>,
    cache: DashMap<CacheKey, DistanceResult>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DistanceCalculator {
    pub fn new(graph: Arc<CodeGraph>) -> Self {
        Self {
            graph,
            cache: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn graph(&self) -> &Arc<CodeGraph> {
        &self.graph
    }

    /// Distance of an execution state to `target`. Never fails: unreachable
    /// targets produce `Miss`.
    pub fn distance(&self, state: &ExecutionState, target: BlockId) -> DistanceResult {
        self.distance_for(state.pc, &state.frames, target)
    }

    /// Same query from raw parts: current block plus call frames.
    pub fn distance_for(
        &self,
        current: BlockId,
        frames: &[StackFrame],
        target: BlockId,
    ) -> DistanceResult {
        let current_fn = self.graph.block(current).function;
        let target_fn = self.graph.block(target).function;

        if current_fn == target_fn {
            return self.cached(current, TargetKind::Local, target);
        }
        if self
            .graph
            .function_distance(current_fn)
            .contains_key(&target_fn)
        {
            return self.cached(current, TargetKind::Pre, target);
        }

        // Post: the target's function must be re-entered by returning. Walk
        // the frames top-down and rank every continuation block that can
        // still reach the target's function; nearest wins.
        let mut best: Option<DistanceResult> = None;
        for frame in frames.iter().rev() {
            let Some(continuation) = frame.return_block else {
                continue;
            };
            let cont_fn = self.graph.block(continuation).function;
            if cont_fn != target_fn
                && !self
                    .graph
                    .function_distance(cont_fn)
                    .contains_key(&target_fn)
            {
                continue;
            }
            let candidate = self.cached(continuation, TargetKind::Post, target);
            if candidate.result == WeightResult::Miss {
                continue;
            }
            best = Some(match best {
                Some(current_best) if current_best <= candidate => current_best,
                _ => candidate,
            });
        }
        best.unwrap_or_else(DistanceResult::miss)
    }

    /// Cache statistics: hits, misses, resident entries.
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(AtomicOrdering::Relaxed),
            misses: self.misses.load(AtomicOrdering::Relaxed),
            entries: self.cache.len(),
        }
    }

    /// Drop every cached result. Required when the code graph is rebuilt;
    /// never needed during normal operation.
    pub fn clear_cache(&self) {
        debug!(entries = self.cache.len(), "clearing distance cache");
        self.cache.clear();
    }

    fn cached(&self, block: BlockId, kind: TargetKind, target: BlockId) -> DistanceResult {
        let key = CacheKey {
            target,
            block,
            kind,
        };
        if let Some(hit) = self.cache.get(&key) {
            self.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return *hit;
        }
        let computed = self.compute(block, kind, target);
        self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        self.cache.insert(key, computed);
        computed
    }

    fn compute(&self, block: BlockId, kind: TargetKind, target: BlockId) -> DistanceResult {
        match kind {
            TargetKind::Local => self.local_result(block, target, true),
            TargetKind::Pre => self.pre_result(block, target, true),
            TargetKind::Post => {
                // Weight from a continuation block onward: local when it
                // already shares the target's function, call-graph descent
                // otherwise. Either way frames were popped to get here.
                let target_fn = self.graph.block(target).function;
                let cont_fn = self.graph.block(block).function;
                let mut result = if cont_fn == target_fn {
                    self.local_result(block, target, false)
                } else {
                    self.pre_result(block, target, false)
                };
                // A popped frame is never "already at" the target.
                if result.result == WeightResult::Done {
                    result.result = WeightResult::Continue;
                }
                result
            }
            TargetKind::None => DistanceResult::miss(),
        }
    }

    fn local_result(&self, block: BlockId, target: BlockId, inside: bool) -> DistanceResult {
        let distances = self.graph.block_distance(block);
        match distances.get(&target) {
            Some(0) => DistanceResult::new(WeightResult::Done, 0, inside),
            Some(weight) => DistanceResult::new(WeightResult::Continue, *weight, inside),
            None => DistanceResult::new(WeightResult::Miss, 0, inside),
        }
    }

    /// Minimum over eligible call sites of
    /// `blockdist(block -> call site) + calldist(callee -> target fn)`.
    fn pre_result(&self, block: BlockId, target: BlockId, inside: bool) -> DistanceResult {
        let target_fn = self.graph.block(target).function;
        let block_fn = self.graph.block(block).function;
        let to_target_fn = self.graph.function_backward_distance(target_fn);
        let reachable = self.graph.block_distance(block);

        let mut best: Option<Weight> = None;
        for &call_site in self.graph.call_sites_in(block_fn) {
            let callee = self
                .graph
                .block(call_site)
                .callee
                .expect("call-site index lists only call blocks");
            let Some(call_distance) = to_target_fn.get(&callee) else {
                continue;
            };
            let Some(reach) = reachable.get(&call_site) else {
                continue;
            };
            let candidate = reach + call_distance;
            best = Some(best.map_or(candidate, |b: Weight| b.min(candidate)));
        }

        match best {
            Some(weight) => DistanceResult::new(WeightResult::Continue, weight, inside),
            None => DistanceResult::new(WeightResult::Miss, 0, inside),
        }
    }
}

/// Classification helper exposed for diagnostics and tests.
pub fn classify(
    graph: &CodeGraph,
    current_fn: FunctionId,
    frames: &[StackFrame],
    target_fn: FunctionId,
) -> TargetKind {
    if current_fn == target_fn {
        return TargetKind::Local;
    }
    if graph.function_distance(current_fn).contains_key(&target_fn) {
        return TargetKind::Pre;
    }
    let reachable_from_frame = frames.iter().rev().any(|frame| {
        frame.return_block.is_some_and(|b| {
            let f = graph.block(b).function;
            f == target_fn || graph.function_distance(f).contains_key(&target_fn)
        })
    });
    if reachable_from_frame {
        TargetKind::Post
    } else {
        TargetKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_prefers_done_then_weight_then_inside() {
        let done = DistanceResult::new(WeightResult::Done, 0, true);
        let near = DistanceResult::new(WeightResult::Continue, 1, true);
        let near_outside = DistanceResult::new(WeightResult::Continue, 1, false);
        let far = DistanceResult::new(WeightResult::Continue, 9, true);
        let miss = DistanceResult::miss();

        assert!(done < near);
        assert!(near < near_outside);
        assert!(near_outside < far);
        assert!(far < miss);
    }

    #[test]
    fn display_names_the_verdict() {
        let r = DistanceResult::new(WeightResult::Continue, 3, false);
        assert_eq!(r.to_string(), "Continue(weight=3, outside)");
    }
}
