use std::sync::Arc;

use shadow_engine::expr::Expr;
use shadow_engine::memory::{
    AddressSpace, AllocSite, MemoryObject, MemoryObjectRef, ObjectState, COW_UNOWNED,
};

fn object(base: u64, size: u64) -> MemoryObjectRef {
    MemoryObject::allocate(
        Expr::constant(base),
        Expr::constant(size),
        AllocSite::Global,
    )
}

#[test]
fn fork_isolates_writes_between_spaces() {
    let mut space1 = AddressSpace::new();
    let a = object(0x1000, 4);
    space1.bind_object(&a, ObjectState::from_bytes(&a, &[0, 0, 0, 0]));

    let mut space2 = space1.fork();
    assert!(space2.cow_key() > space1.cow_key());
    assert_eq!(space1.object_count(), space2.object_count());

    {
        let os = space2.get_writeable(&a).expect("A is bound in the fork");
        os.write_concrete(0, 1, 1);
    }

    let (_, seen_by_1) = space1.find_object(&a).unwrap();
    let (_, seen_by_2) = space2.find_object(&a).unwrap();
    assert_eq!(seen_by_1.read_concrete(0, 1), Some(0));
    assert_eq!(seen_by_2.read_concrete(0, 1), Some(1));

    // Spine sizes unchanged on both sides.
    assert_eq!(space1.object_count(), 1);
    assert_eq!(space2.object_count(), 1);
}

#[test]
fn fork_shares_object_states_without_copying() {
    let mut space1 = AddressSpace::new();
    let mos: Vec<_> = (0..16).map(|i| object(0x1000 + i * 0x100, 8)).collect();
    for mo in &mos {
        space1.bind_object(mo, ObjectState::zeroed(mo));
    }

    let space2 = space1.fork();
    for mo in &mos {
        let (_, os1) = space1.find_object(mo).unwrap();
        let (_, os2) = space2.find_object(mo).unwrap();
        assert!(Arc::ptr_eq(&os1, &os2), "fork must not copy object states");
    }
}

#[test]
fn every_bound_stamp_stays_at_or_below_the_cow_key() {
    let mut space1 = AddressSpace::new();
    let a = object(0x1000, 4);
    let b = object(0x2000, 4);
    space1.bind_object(&a, ObjectState::zeroed(&a));

    let mut space2 = space1.fork();
    space2.bind_object(&b, ObjectState::zeroed(&b));
    space2.get_writeable(&a).unwrap().write_concrete(0, 9, 1);

    for space in [&space1, &space2] {
        for (_, os) in space.iter() {
            assert!(os.copy_on_write_owner() <= space.cow_key());
        }
    }
}

#[test]
fn get_writeable_returns_an_owned_state_visible_through_find() {
    let mut space = AddressSpace::new();
    let a = object(0x1000, 4);
    space.bind_object(&a, ObjectState::zeroed(&a));
    let mut fork = space.fork();

    let key = fork.cow_key();
    {
        let os = fork.get_writeable(&a).unwrap();
        assert_eq!(os.copy_on_write_owner(), key);
        os.write_concrete(2, 0x5a, 1);
    }
    let (_, rebound) = fork.find_object(&a).unwrap();
    assert_eq!(rebound.copy_on_write_owner(), key);
    assert_eq!(rebound.read_concrete(2, 1), Some(0x5a));

    // Repeated writes keep mutating the same owned state in place.
    {
        let os = fork.get_writeable(&a).unwrap();
        os.write_concrete(3, 0x5b, 1);
    }
    let (_, again) = fork.find_object(&a).unwrap();
    assert_eq!(again.read_concrete(2, 1), Some(0x5a));
    assert_eq!(again.read_concrete(3, 1), Some(0x5b));
}

#[test]
fn fork_of_fork_preserves_logical_contents() {
    let mut space1 = AddressSpace::new();
    let a = object(0x1000, 4);
    space1.bind_object(&a, ObjectState::from_bytes(&a, &[7, 7, 7, 7]));

    let mut space2 = space1.fork();
    let space3 = space2.fork();

    for space in [&space1, &space2, &space3] {
        let (_, os) = space.find_object(&a).unwrap();
        assert_eq!(os.read_concrete(0, 4), Some(0x0707_0707));
    }
    assert!(space3.cow_key() > space2.cow_key());
}

#[test]
fn bind_shared_keeps_the_state_shared_until_written() {
    let mut origin = AddressSpace::new();
    let a = object(0x1000, 4);
    origin.bind_object(&a, ObjectState::from_bytes(&a, &[1, 2, 3, 4]));
    let (_, shared) = origin.find_object(&a).unwrap();

    // A second space adopts the same state without restamping.
    let mut adopter = AddressSpace::new();
    adopter.bind_shared(&a, shared.clone());
    let (_, adopted) = adopter.find_object(&a).unwrap();
    assert!(Arc::ptr_eq(&shared, &adopted));

    // First write clones: the origin's view is untouched.
    adopter.get_writeable(&a).unwrap().write_concrete(0, 0xff, 1);
    let (_, origin_view) = origin.find_object(&a).unwrap();
    assert_eq!(origin_view.read_concrete(0, 1), Some(1));
    let (_, adopter_view) = adopter.find_object(&a).unwrap();
    assert_eq!(adopter_view.read_concrete(0, 1), Some(0xff));
}

#[test]
fn unowned_clone_is_mutable_only_through_get_writeable() {
    let mut space = AddressSpace::new();
    let a = object(0x1000, 4);
    space.bind_object(&a, ObjectState::zeroed(&a));

    let (_, os) = space.find_object(&a).unwrap();
    let detached = os.clone_unowned();
    assert_eq!(detached.copy_on_write_owner(), COW_UNOWNED);
    // The detached copy is independent: mutating the space does not reach it.
    space.get_writeable(&a).unwrap().write_concrete(0, 3, 1);
    assert_eq!(detached.read_concrete(0, 1), Some(0));
}
