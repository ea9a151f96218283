//! Execution-state view consumed by the memory and distance subsystems.
//!
//! The full interpreter owns much more (instruction cursors, statistics,
//! target bookkeeping); this core only needs the program position, the call
//! stack, the state's address space, and its path condition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::expr::ConstraintSet;
use crate::graph::{BlockId, FunctionId};
use crate::memory::AddressSpace;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// One call-stack entry.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub function: FunctionId,
    /// Block in the caller where execution resumes after return. `None` for
    /// the entry frame.
    pub return_block: Option<BlockId>,
}

#[derive(Debug)]
pub struct ExecutionState {
    pub id: u64,
    pub pc: BlockId,
    pub prev_pc: BlockId,
    pub frames: Vec<StackFrame>,
    pub memory: AddressSpace,
    pub constraints: ConstraintSet,
}

impl ExecutionState {
    /// Fresh state positioned at `entry` of `function`.
    pub fn new(function: FunctionId, entry: BlockId) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            pc: entry,
            prev_pc: entry,
            frames: vec![StackFrame {
                function,
                return_block: None,
            }],
            memory: AddressSpace::new(),
            constraints: ConstraintSet::new(),
        }
    }

    /// Fork at a branch: the child shares the address space copy-on-write
    /// and inherits frames and path condition.
    pub fn fork(&mut self) -> ExecutionState {
        ExecutionState {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            pc: self.pc,
            prev_pc: self.prev_pc,
            frames: self.frames.clone(),
            memory: self.memory.fork(),
            constraints: self.constraints.clone(),
        }
    }

    pub fn advance_to(&mut self, block: BlockId) {
        self.prev_pc = self.pc;
        self.pc = block;
    }

    pub fn push_frame(&mut self, function: FunctionId, return_block: BlockId) {
        self.frames.push(StackFrame {
            function,
            return_block: Some(return_block),
        });
    }

    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    pub fn current_function(&self) -> Option<FunctionId> {
        self.frames.last().map(|f| f.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_assigns_fresh_ids_and_separate_memory_keys() {
        let mut state = ExecutionState::new(FunctionId(0), BlockId(0));
        let child = state.fork();
        assert_ne!(state.id, child.id);
        assert_ne!(state.memory.cow_key(), child.memory.cow_key());
    }

    #[test]
    fn advance_tracks_previous_block() {
        let mut state = ExecutionState::new(FunctionId(0), BlockId(0));
        state.advance_to(BlockId(3));
        assert_eq!(state.prev_pc, BlockId(0));
        assert_eq!(state.pc, BlockId(3));
    }
}
