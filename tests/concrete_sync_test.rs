use std::sync::Arc;

use shadow_engine::expr::Expr;
use shadow_engine::memory::{
    AddressSpace, AllocSite, ConcreteStore, MemoryObject, MemoryObjectRef, ObjectState,
};

fn object(base: u64, size: u64) -> MemoryObjectRef {
    MemoryObject::allocate(
        Expr::constant(base),
        Expr::constant(size),
        AllocSite::External,
    )
}

fn read_only_object(base: u64, size: u64) -> MemoryObjectRef {
    MemoryObject::allocate_with_flags(
        Expr::constant(base),
        Expr::constant(size),
        AllocSite::Global,
        false,
        true,
        true,
    )
}

#[test]
fn copy_out_then_copy_in_is_a_noop() {
    let mut space = AddressSpace::new();
    let a = object(0x1000, 4);
    let b = object(0x2000, 4);
    space.bind_object(&a, ObjectState::from_bytes(&a, &[1, 2, 3, 4]));
    space.bind_object(&b, ObjectState::from_bytes(&b, &[9, 8, 7, 6]));

    let before_a = space.find_object(&a).unwrap().1;
    let before_b = space.find_object(&b).unwrap().1;

    let mut store = ConcreteStore::new();
    space.copy_out_concretes(&mut store);
    assert_eq!(store.len(), 2);
    assert!(space.copy_in_concretes(&store));

    // Contents unchanged, and nothing was cloned along the way.
    let after_a = space.find_object(&a).unwrap().1;
    let after_b = space.find_object(&b).unwrap().1;
    assert!(Arc::ptr_eq(&before_a, &after_a));
    assert!(Arc::ptr_eq(&before_b, &after_b));
    assert_eq!(after_a.read_concrete(0, 4), Some(0x0403_0201));
    assert_eq!(after_b.read_concrete(0, 4), Some(0x0607_0809));
}

#[test]
fn external_writes_are_copied_in_and_concretized() {
    let mut space = AddressSpace::new();
    let a = object(0x1000, 4);
    space.bind_object(&a, ObjectState::from_bytes(&a, &[0, 0, 0, 0]));

    let mut store = ConcreteStore::new();
    space.copy_out_concretes(&mut store);
    store.get_mut(a.id()).unwrap()[1] = 0xcc;

    assert!(space.copy_in_concretes(&store));
    let (_, os) = space.find_object(&a).unwrap();
    assert_eq!(os.read_concrete(1, 1), Some(0xcc));
    assert_eq!(os.read_concrete(0, 1), Some(0));
}

#[test]
fn copy_in_rejects_external_writes_to_read_only_objects() {
    let mut space = AddressSpace::new();
    let rodata = read_only_object(0x4000, 4);
    let data = object(0x5000, 4);
    space.bind_object(&rodata, ObjectState::from_bytes(&rodata, &[5, 5, 5, 5]));
    space.bind_object(&data, ObjectState::from_bytes(&data, &[0, 0, 0, 0]));

    let mut store = ConcreteStore::new();
    space.copy_out_concretes(&mut store);
    store.get_mut(rodata.id()).unwrap()[0] = 0xee;
    store.get_mut(data.id()).unwrap()[0] = 0x11;

    assert!(!space.copy_in_concretes(&store));

    // The failed copy-in modified nothing, including the writable object.
    let (_, ro) = space.find_object(&rodata).unwrap();
    let (_, rw) = space.find_object(&data).unwrap();
    assert_eq!(ro.read_concrete(0, 1), Some(5));
    assert_eq!(rw.read_concrete(0, 1), Some(0));
}

#[test]
fn copy_in_ignores_objects_missing_from_the_store() {
    let mut space = AddressSpace::new();
    let a = object(0x1000, 4);
    space.bind_object(&a, ObjectState::from_bytes(&a, &[1, 1, 1, 1]));

    let store = ConcreteStore::new();
    assert!(space.copy_in_concretes(&store));
    let (_, os) = space.find_object(&a).unwrap();
    assert_eq!(os.read_concrete(0, 4), Some(0x0101_0101));
}

#[test]
fn copy_in_only_clones_objects_that_actually_changed() {
    let mut parent = AddressSpace::new();
    let hot = object(0x1000, 4);
    let cold = object(0x2000, 4);
    parent.bind_object(&hot, ObjectState::zeroed(&hot));
    parent.bind_object(&cold, ObjectState::zeroed(&cold));
    let mut child = parent.fork();

    let mut store = ConcreteStore::new();
    child.copy_out_concretes(&mut store);
    store.get_mut(hot.id()).unwrap()[0] = 0x77;

    assert!(child.copy_in_concretes(&store));

    // The untouched object is still the parent's shared state.
    let parent_cold = parent.find_object(&cold).unwrap().1;
    let child_cold = child.find_object(&cold).unwrap().1;
    assert!(Arc::ptr_eq(&parent_cold, &child_cold));

    // The modified one was cloned into the child only.
    let parent_hot = parent.find_object(&hot).unwrap().1;
    let child_hot = child.find_object(&hot).unwrap().1;
    assert!(!Arc::ptr_eq(&parent_hot, &child_hot));
    assert_eq!(parent_hot.read_concrete(0, 1), Some(0));
    assert_eq!(child_hot.read_concrete(0, 1), Some(0x77));
}
