//! Program code graph.
//!
//! Holds the block-level control-flow graph of every function plus the
//! interprocedural call graph, and serves the distance queries guided
//! search runs on: intraprocedural block distances, call-graph distances
//! (forward and backward), and call-site indexes. The graph is immutable
//! after `build()`; distance maps are computed on first use and memoized,
//! so a graph shared across search threads answers repeat queries without
//! recomputation.
//!
//! All distances are unweighted hop counts, which keeps them stable across
//! runs for identical programs.

use std::sync::Arc;

use dashmap::DashMap;
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Reversed;
use rustc_hash::FxHashMap;

use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub function: FunctionId,
    pub label: String,
    /// Callee when this block ends in a call.
    pub callee: Option<FunctionId>,
}

#[derive(Debug)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub entry: Option<BlockId>,
    pub blocks: Vec<BlockId>,
}

pub type BlockDistanceMap = FxHashMap<BlockId, u32>;
pub type FunctionDistanceMap = FxHashMap<FunctionId, u32>;

/// Mutable construction side of [`CodeGraph`].
#[derive(Debug, Default)]
pub struct CodeGraphBuilder {
    functions: Vec<Function>,
    blocks: Vec<Block>,
    cfg_edges: Vec<(BlockId, BlockId)>,
    call_edges: Vec<(FunctionId, FunctionId)>,
}

impl CodeGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, name: impl Into<String>) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            id,
            name: name.into(),
            entry: None,
            blocks: Vec::new(),
        });
        id
    }

    /// The first block added to a function becomes its entry.
    pub fn add_block(&mut self, function: FunctionId, label: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            function,
            label: label.into(),
            callee: None,
        });
        let func = &mut self.functions[function.0 as usize];
        if func.entry.is_none() {
            func.entry = Some(id);
        }
        func.blocks.push(id);
        id
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        assert_eq!(
            self.blocks[from.0 as usize].function,
            self.blocks[to.0 as usize].function,
            "control-flow edges stay within one function"
        );
        self.cfg_edges.push((from, to));
    }

    /// Mark `block` as a call site of `callee` and record the call edge.
    pub fn set_call(&mut self, block: BlockId, callee: FunctionId) {
        let caller = self.blocks[block.0 as usize].function;
        self.blocks[block.0 as usize].callee = Some(callee);
        self.call_edges.push((caller, callee));
    }

    pub fn build(self) -> CodeGraph {
        let mut cfg = DiGraph::<(), ()>::with_capacity(self.blocks.len(), self.cfg_edges.len());
        for _ in &self.blocks {
            cfg.add_node(());
        }
        for (from, to) in &self.cfg_edges {
            cfg.add_edge(
                NodeIndex::new(from.0 as usize),
                NodeIndex::new(to.0 as usize),
                (),
            );
        }

        let mut call_graph =
            DiGraph::<(), ()>::with_capacity(self.functions.len(), self.call_edges.len());
        for _ in &self.functions {
            call_graph.add_node(());
        }
        for (caller, callee) in &self.call_edges {
            call_graph.add_edge(
                NodeIndex::new(caller.0 as usize),
                NodeIndex::new(callee.0 as usize),
                (),
            );
        }

        let mut call_sites: Vec<Vec<BlockId>> = vec![Vec::new(); self.functions.len()];
        for block in &self.blocks {
            if block.callee.is_some() {
                call_sites[block.function.0 as usize].push(block.id);
            }
        }

        CodeGraph {
            functions: self.functions,
            blocks: self.blocks,
            cfg,
            call_graph,
            call_sites,
            block_distances: DashMap::new(),
            function_distances: DashMap::new(),
            function_backward_distances: DashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct CodeGraph {
    functions: Vec<Function>,
    blocks: Vec<Block>,
    cfg: DiGraph<(), ()>,
    call_graph: DiGraph<(), ()>,
    call_sites: Vec<Vec<BlockId>>,
    block_distances: DashMap<BlockId, Arc<BlockDistanceMap>>,
    function_distances: DashMap<FunctionId, Arc<FunctionDistanceMap>>,
    function_backward_distances: DashMap<FunctionId, Arc<FunctionDistanceMap>>,
}

impl CodeGraph {
    pub fn try_block(&self, id: BlockId) -> Result<&Block, GraphError> {
        self.blocks
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownBlock(id))
    }

    pub fn try_function(&self, id: FunctionId) -> Result<&Function, GraphError> {
        self.functions
            .get(id.0 as usize)
            .ok_or(GraphError::UnknownFunction(id))
    }

    /// Panics on unknown ids: querying outside the loaded program is a
    /// caller bug. Use [`try_block`](Self::try_block) at trust boundaries.
    pub fn block(&self, id: BlockId) -> &Block {
        self.try_block(id).expect("block query outside the loaded program")
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        self.try_function(id)
            .expect("function query outside the loaded program")
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Call-site blocks of `function`, in block order.
    pub fn call_sites_in(&self, function: FunctionId) -> &[BlockId] {
        &self.call_sites[function.0 as usize]
    }

    /// Call-site blocks of `function` whose callee is `callee`.
    pub fn call_sites_to(
        &self,
        callee: FunctionId,
        function: FunctionId,
    ) -> impl Iterator<Item = BlockId> + '_ {
        self.call_sites_in(function)
            .iter()
            .copied()
            .filter(move |b| self.block(*b).callee == Some(callee))
    }

    /// Hop distances from `from` to every block reachable within its
    /// function. Includes `from` itself at distance zero.
    pub fn block_distance(&self, from: BlockId) -> Arc<BlockDistanceMap> {
        let _ = self.block(from);
        self.block_distances
            .entry(from)
            .or_insert_with(|| {
                let raw = dijkstra(&self.cfg, NodeIndex::new(from.0 as usize), None, |_| 1u32);
                let map = raw
                    .into_iter()
                    .map(|(node, dist)| (BlockId(node.index() as u32), dist))
                    .collect();
                Arc::new(map)
            })
            .clone()
    }

    /// Call-graph hop distances from `from` to every function it can reach
    /// (including itself at distance zero).
    pub fn function_distance(&self, from: FunctionId) -> Arc<FunctionDistanceMap> {
        let _ = self.function(from);
        self.function_distances
            .entry(from)
            .or_insert_with(|| {
                let raw = dijkstra(
                    &self.call_graph,
                    NodeIndex::new(from.0 as usize),
                    None,
                    |_| 1u32,
                );
                Arc::new(Self::collect_function_map(raw))
            })
            .clone()
    }

    /// Call-graph hop distances *to* `to`: for each function `f` in the map,
    /// the distance from `f` to `to`.
    pub fn function_backward_distance(&self, to: FunctionId) -> Arc<FunctionDistanceMap> {
        let _ = self.function(to);
        self.function_backward_distances
            .entry(to)
            .or_insert_with(|| {
                let raw = dijkstra(
                    Reversed(&self.call_graph),
                    NodeIndex::new(to.0 as usize),
                    None,
                    |_| 1u32,
                );
                Arc::new(Self::collect_function_map(raw))
            })
            .clone()
    }

    fn collect_function_map(
        raw: std::collections::HashMap<NodeIndex, u32>,
    ) -> FunctionDistanceMap {
        raw.into_iter()
            .map(|(node, dist)| (FunctionId(node.index() as u32), dist))
            .collect()
    }

    /// Trace traversability: whether execution can get from `from` to `to`,
    /// through the CFG when both share a function, through the call graph in
    /// either direction otherwise.
    pub fn can_reach(&self, from: BlockId, to: BlockId) -> bool {
        let from_fn = self.block(from).function;
        let to_fn = self.block(to).function;
        if from_fn == to_fn {
            return from == to || self.block_distance(from).contains_key(&to);
        }
        self.function_distance(from_fn).contains_key(&to_fn)
            || self.function_backward_distance(from_fn).contains_key(&to_fn)
    }
}
