//! Memory object descriptors.
//!
//! A `MemoryObject` is the immutable identity of one allocation. Contents
//! live in `ObjectState`; the descriptor only records where the allocation
//! sits (possibly symbolically), how big it is, and how it may be used.
//! Identity is the globally unique id, never the address: two objects can
//! overlap symbolically yet stay distinct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::expr::{Expr, ExprRef};
use crate::graph::BlockId;

pub type MemoryObjectRef = Arc<MemoryObject>;

/// Ids are issued monotonically for the lifetime of the process, so an id
/// can serve as an allocation-order tie-breaker.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Sort key of objects whose base address does not fold to a constant.
/// They order after every concrete-based object and are always swept by
/// symbolic resolution.
pub const SYMBOLIC_BASE: u64 = u64::MAX;

/// Total order key of the address-space map: base address first, id as the
/// tie-breaker. Stable across clones of the address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub base: u64,
    pub id: u64,
}

/// Where an allocation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocSite {
    /// Module-level global, alive for the whole run.
    Global,
    /// Stack slot allocated at the given block.
    Stack { block: BlockId },
    /// Heap allocation made at the given block.
    Heap { block: BlockId },
    /// Memory handed to the engine from outside the modeled program.
    External,
}

#[derive(Debug)]
pub struct MemoryObject {
    id: u64,
    address: ExprRef,
    size: ExprRef,
    pub is_local: bool,
    pub is_global: bool,
    pub is_read_only: bool,
    pub alloc_site: AllocSite,
}

impl MemoryObject {
    pub fn allocate(address: ExprRef, size: ExprRef, alloc_site: AllocSite) -> MemoryObjectRef {
        Self::allocate_with_flags(address, size, alloc_site, false, false, false)
    }

    pub fn allocate_with_flags(
        address: ExprRef,
        size: ExprRef,
        alloc_site: AllocSite,
        is_local: bool,
        is_global: bool,
        is_read_only: bool,
    ) -> MemoryObjectRef {
        Arc::new(MemoryObject {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            address,
            size,
            is_local,
            is_global,
            is_read_only,
            alloc_site,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ExprRef {
        &self.address
    }

    pub fn size(&self) -> &ExprRef {
        &self.size
    }

    pub fn concrete_base(&self) -> Option<u64> {
        self.address.as_concrete()
    }

    pub fn concrete_size(&self) -> Option<u64> {
        self.size.as_concrete()
    }

    /// A zero-sized object contains no byte and never resolves.
    pub fn is_zero_sized(&self) -> bool {
        self.concrete_size() == Some(0)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            base: self.concrete_base().unwrap_or(SYMBOLIC_BASE),
            id: self.id,
        }
    }

    /// Whether a fully concrete address falls inside this object.
    /// Only meaningful for concrete-based, concrete-sized objects.
    pub fn contains_concrete(&self, addr: u64) -> bool {
        match (self.concrete_base(), self.concrete_size()) {
            (Some(base), Some(size)) => size != 0 && addr >= base && addr - base < size,
            _ => false,
        }
    }

    /// The range-membership query `address <= ptr < address + size`.
    pub fn bounds_query(&self, ptr: ExprRef) -> ExprRef {
        Expr::in_range(ptr, self.address.clone(), self.size.clone())
    }
}

impl PartialEq for MemoryObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemoryObject {}

impl std::hash::Hash for MemoryObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
