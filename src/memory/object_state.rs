//! Byte-level symbolic contents of one memory object.
//!
//! The store is a hybrid: a concrete shadow buffer for the common mostly-
//! concrete case, a sparse map of symbolic byte expressions, a word-packed
//! bitmap marking which offsets are currently symbolic, and an ordered log
//! of symbolic-offset writes that reads fold into ITE chains. Objects
//! created by lazy initialization carry a named backing array; bytes never
//! written read straight out of it.
//!
//! Multi-byte values are little-endian. Reads through the expression path
//! are limited to 8 bytes; wider accesses are split by the interpreter.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::expr::{Expr, ExprRef};
use crate::memory::object::MemoryObjectRef;

/// Stamp of an object state no address space may mutate in place.
pub const COW_UNOWNED: u32 = 0;

/// Word-packed offset bitmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct OffsetMask {
    words: Vec<u64>,
}

impl OffsetMask {
    fn with_capacity(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
        }
    }

    fn filled(bits: usize) -> Self {
        let mut mask = Self::with_capacity(bits);
        for (i, word) in mask.words.iter_mut().enumerate() {
            let remaining = bits - i * 64;
            *word = if remaining >= 64 {
                u64::MAX
            } else {
                (1u64 << remaining) - 1
            };
        }
        mask
    }

    fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .is_some_and(|w| w & (1 << (bit % 64)) != 0)
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1 << (bit % 64));
    }

    fn any_in_range(&self, start: usize, end: usize) -> bool {
        (start..end).any(|bit| self.get(bit))
    }

    fn all_in_range(&self, start: usize, end: usize) -> bool {
        (start..end).all(|bit| self.get(bit))
    }
}

/// One byte written at a symbolic offset, in program order.
#[derive(Debug, Clone)]
struct SymbolicWrite {
    offset: ExprRef,
    value: ExprRef,
}

#[derive(Debug, Clone)]
pub struct ObjectState {
    object_id: u64,
    capacity: usize,
    concrete: Box<[u8]>,
    /// Set iff the byte's current value is the expression in `symbolic_bytes`.
    symbolic_mask: OffsetMask,
    symbolic_bytes: BTreeMap<usize, ExprRef>,
    /// Set iff the byte has a definite value (buffer or expression).
    /// Unset bytes read from `backing` when present.
    initialized_mask: OffsetMask,
    backing: Option<Arc<str>>,
    write_log: Vec<SymbolicWrite>,
    pub read_only: bool,
    copy_on_write_owner: u32,
}

impl ObjectState {
    /// Zero-filled concrete state for `mo`. Requires a concrete size.
    pub fn zeroed(mo: &MemoryObjectRef) -> Self {
        let capacity = mo
            .concrete_size()
            .expect("zeroed object state requires a concrete object size")
            as usize;
        Self {
            object_id: mo.id(),
            capacity,
            concrete: vec![0; capacity].into_boxed_slice(),
            symbolic_mask: OffsetMask::with_capacity(capacity),
            symbolic_bytes: BTreeMap::new(),
            initialized_mask: OffsetMask::filled(capacity),
            backing: None,
            write_log: Vec::new(),
            read_only: mo.is_read_only,
            copy_on_write_owner: COW_UNOWNED,
        }
    }

    pub fn from_bytes(mo: &MemoryObjectRef, bytes: &[u8]) -> Self {
        let mut state = Self::zeroed(mo);
        assert!(bytes.len() <= state.capacity, "initializer exceeds object size");
        state.concrete[..bytes.len()].copy_from_slice(bytes);
        state
    }

    /// Fully symbolic state backed by a named array; every byte reads out of
    /// the backing until written. `capacity` bounds the concrete shadow (the
    /// object's concrete size, or the lazy-initialization cap for objects of
    /// symbolic size).
    pub fn fully_symbolic(mo: &MemoryObjectRef, name: impl Into<Arc<str>>, capacity: usize) -> Self {
        Self {
            object_id: mo.id(),
            capacity,
            concrete: vec![0; capacity].into_boxed_slice(),
            symbolic_mask: OffsetMask::with_capacity(capacity),
            symbolic_bytes: BTreeMap::new(),
            initialized_mask: OffsetMask::with_capacity(capacity),
            backing: Some(name.into()),
            write_log: Vec::new(),
            read_only: mo.is_read_only,
            copy_on_write_owner: COW_UNOWNED,
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn copy_on_write_owner(&self) -> u32 {
        self.copy_on_write_owner
    }

    pub(crate) fn stamp(&mut self, cow_key: u32) {
        self.copy_on_write_owner = cow_key;
    }

    /// Contents-preserving copy with the COW stamp reset; the binding
    /// address space restamps it.
    pub fn clone_unowned(&self) -> Self {
        let mut copy = self.clone();
        copy.copy_on_write_owner = COW_UNOWNED;
        copy
    }

    /// Whether any byte currently holds a symbolic value (including pending
    /// symbolic-offset writes and unread lazy backing).
    pub fn has_symbolic_content(&self) -> bool {
        !self.symbolic_bytes.is_empty()
            || !self.write_log.is_empty()
            || (self.backing.is_some() && !self.initialized_mask.all_in_range(0, self.capacity))
    }

    /// The concrete shadow buffer. Bytes flagged symbolic hold their last
    /// concrete value and must not be trusted without checking the mask.
    pub fn shadow_bytes(&self) -> &[u8] {
        &self.concrete
    }

    /// Fast path: the concrete little-endian value at a concrete offset, or
    /// `None` when anything in the range is symbolic or uninitialized.
    pub fn read_concrete(&self, offset: usize, width: usize) -> Option<u64> {
        assert!(width >= 1 && width <= 8, "concrete read width out of range");
        self.check_bounds(offset, width);
        if !self.write_log.is_empty()
            || self.symbolic_mask.any_in_range(offset, offset + width)
            || !self.initialized_mask.all_in_range(offset, offset + width)
        {
            return None;
        }
        let mut value = 0u64;
        for i in (0..width).rev() {
            value = (value << 8) | u64::from(self.concrete[offset + i]);
        }
        Some(value)
    }

    /// Store a concrete little-endian value at a concrete offset.
    pub fn write_concrete(&mut self, offset: usize, value: u64, width: usize) {
        assert!(width >= 1 && width <= 8, "concrete write width out of range");
        self.check_bounds(offset, width);
        for i in 0..width {
            self.write_concrete_byte(offset + i, (value >> (8 * i)) as u8);
        }
    }

    fn write_concrete_byte(&mut self, offset: usize, byte: u8) {
        self.concrete[offset] = byte;
        if self.symbolic_mask.get(offset) {
            self.symbolic_mask.clear(offset);
            self.symbolic_bytes.remove(&offset);
        }
        self.initialized_mask.set(offset);
    }

    fn write_symbolic_byte(&mut self, offset: usize, expr: ExprRef) {
        self.symbolic_bytes.insert(offset, expr);
        self.symbolic_mask.set(offset);
        self.initialized_mask.set(offset);
    }

    /// Expression for the byte at a concrete offset, before the write log.
    fn base_byte_expr(&self, offset: usize) -> ExprRef {
        if self.symbolic_mask.get(offset) {
            return self.symbolic_bytes[&offset].clone();
        }
        if self.initialized_mask.get(offset) {
            return Expr::byte_constant(self.concrete[offset]);
        }
        match &self.backing {
            Some(array) => Expr::select(array.clone(), Expr::constant(offset as u64)),
            None => Expr::byte_constant(0),
        }
    }

    /// Expression for the byte at a symbolic index, before the write log:
    /// backing select when available, else an ITE chain over the shadow.
    fn base_byte_expr_at(&self, index: &ExprRef) -> ExprRef {
        if let Some(array) = &self.backing {
            let mut expr = Expr::select(array.clone(), index.clone());
            // Materialized bytes shadow the backing.
            for offset in 0..self.capacity {
                if self.initialized_mask.get(offset) {
                    expr = Expr::ite(
                        Expr::eq(index.clone(), Expr::constant(offset as u64)),
                        self.base_byte_expr(offset),
                        expr,
                    );
                }
            }
            return expr;
        }
        let mut expr = Expr::byte_constant(0);
        for offset in 0..self.capacity {
            expr = Expr::ite(
                Expr::eq(index.clone(), Expr::constant(offset as u64)),
                self.base_byte_expr(offset),
                expr,
            );
        }
        expr
    }

    /// Byte at `index`, with the symbolic-offset write log applied newest-last.
    fn byte_expr_at(&self, index: &ExprRef) -> ExprRef {
        let mut expr = match index.as_concrete() {
            Some(off) if self.write_log.is_empty() => return self.base_byte_expr(off as usize),
            Some(off) => self.base_byte_expr(off as usize),
            None => self.base_byte_expr_at(index),
        };
        for write in &self.write_log {
            expr = Expr::ite(
                Expr::eq(index.clone(), write.offset.clone()),
                write.value.clone(),
                expr,
            );
        }
        expr
    }

    /// Read `width` bytes starting at `offset` as a little-endian value
    /// expression. Concrete offset + fully concrete bytes folds to a
    /// constant.
    pub fn read(&self, offset: &ExprRef, width: usize) -> ExprRef {
        assert!(width >= 1 && width <= 8, "expression read width out of range");
        if let Some(off) = offset.as_concrete() {
            let off = off as usize;
            self.check_bounds(off, width);
            if let Some(value) = self.read_concrete(off, width) {
                return Expr::constant(value);
            }
        }
        // Most significant byte first so the concat comes out little-endian.
        let mut expr: Option<ExprRef> = None;
        for i in (0..width).rev() {
            let index = Expr::add(offset.clone(), Expr::constant(i as u64));
            let byte = self.byte_expr_at(&index);
            expr = Some(match expr {
                None => byte,
                Some(hi) => Expr::concat(hi, byte),
            });
        }
        expr.expect("width is at least one byte")
    }

    /// Store a `width`-byte value expression at `offset`, marking affected
    /// bytes as potentially symbolic.
    pub fn write(&mut self, offset: &ExprRef, value: &ExprRef, width: usize) {
        assert!(width >= 1 && width <= 8, "expression write width out of range");
        if let Some(off) = offset.as_concrete() {
            let off = off as usize;
            self.check_bounds(off, width);
            if let Some(v) = value.as_concrete() {
                self.write_concrete(off, v, width);
                return;
            }
            for i in 0..width {
                self.write_symbolic_byte(off + i, Expr::extract_byte(value.clone(), i as u32));
            }
            return;
        }
        for i in 0..width {
            self.write_log.push(SymbolicWrite {
                offset: Expr::add(offset.clone(), Expr::constant(i as u64)),
                value: Expr::extract_byte(value.clone(), i as u32),
            });
        }
    }

    fn check_bounds(&self, offset: usize, width: usize) {
        assert!(
            offset
                .checked_add(width)
                .is_some_and(|end| end <= self.capacity),
            "access of {width} bytes at offset {offset} exceeds object capacity {}",
            self.capacity
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::POINTER_WIDTH;
    use crate::memory::object::{AllocSite, MemoryObject};

    fn test_object(size: u64) -> MemoryObjectRef {
        MemoryObject::allocate(
            Expr::constant(0x1000),
            Expr::constant(size),
            AllocSite::Global,
        )
    }

    #[test]
    fn concrete_roundtrip_little_endian() {
        let mo = test_object(16);
        let mut os = ObjectState::zeroed(&mo);
        os.write_concrete(4, 0xdead_beef, 4);
        assert_eq!(os.read_concrete(4, 4), Some(0xdead_beef));
        assert_eq!(os.read_concrete(4, 1), Some(0xef));
        assert_eq!(os.shadow_bytes()[4], 0xef);
    }

    #[test]
    fn read_folds_to_constant_when_fully_concrete() {
        let mo = test_object(8);
        let mut os = ObjectState::zeroed(&mo);
        os.write_concrete(0, 0x1122, 2);
        let value = os.read(&Expr::constant(0), 2);
        assert_eq!(value.as_concrete(), Some(0x1122));
    }

    #[test]
    fn symbolic_write_poisons_concrete_fast_path() {
        let mo = test_object(8);
        let mut os = ObjectState::zeroed(&mo);
        let v = Expr::symbol("v", POINTER_WIDTH);
        os.write(&Expr::constant(2), &v, 1);
        assert_eq!(os.read_concrete(2, 1), None);
        assert_eq!(os.read_concrete(0, 2), Some(0));
        assert!(os.has_symbolic_content());
        let back = os.read(&Expr::constant(2), 1);
        assert!(back.references_symbols());
    }

    #[test]
    fn concrete_overwrite_clears_symbolic_byte() {
        let mo = test_object(8);
        let mut os = ObjectState::zeroed(&mo);
        os.write(&Expr::constant(3), &Expr::symbol("v", POINTER_WIDTH), 1);
        os.write_concrete(3, 0x7f, 1);
        assert_eq!(os.read_concrete(3, 1), Some(0x7f));
        assert!(!os.has_symbolic_content());
    }

    #[test]
    fn symbolic_offset_write_lands_in_log_and_reads_fold_it() {
        let mo = test_object(8);
        let mut os = ObjectState::zeroed(&mo);
        os.write_concrete(0, 0xaa, 1);
        let idx = Expr::symbol("i", POINTER_WIDTH);
        os.write(&idx, &Expr::constant(0xbb), 1);
        // Any concrete read now has to account for the pending write.
        assert_eq!(os.read_concrete(0, 1), None);
        let read_back = os.read(&Expr::constant(0), 1);
        assert!(read_back.references_symbols());
    }

    #[test]
    fn lazy_backing_serves_unwritten_bytes() {
        let mo = test_object(8);
        let mut os = ObjectState::fully_symbolic(&mo, "mo_lazy", 8);
        assert!(os.has_symbolic_content());
        let untouched = os.read(&Expr::constant(1), 1);
        assert!(untouched.references_symbols());
        os.write_concrete(1, 0x42, 1);
        assert_eq!(os.read_concrete(1, 1), Some(0x42));
    }

    #[test]
    fn clone_unowned_resets_stamp_and_preserves_contents() {
        let mo = test_object(8);
        let mut os = ObjectState::zeroed(&mo);
        os.write_concrete(0, 0x11, 1);
        os.stamp(7);
        let copy = os.clone_unowned();
        assert_eq!(copy.copy_on_write_owner(), COW_UNOWNED);
        assert_eq!(copy.read_concrete(0, 1), Some(0x11));
        assert_eq!(os.copy_on_write_owner(), 7);
    }
}
