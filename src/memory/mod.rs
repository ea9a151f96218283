//! Symbolic memory model: objects, their byte-level contents, and the
//! copy-on-write address space with solver-driven pointer resolution.

pub mod address_space;
pub mod concrete_store;
pub mod object;
pub mod object_state;

pub use address_space::{
    AddressSpace, ObjectPair, PointerCheck, ResolutionList, ResolveOneOutcome,
};
pub use concrete_store::ConcreteStore;
pub use object::{AllocSite, MemoryObject, MemoryObjectRef, ObjectKey, SYMBOLIC_BASE};
pub use object_state::{ObjectState, COW_UNOWNED};
