//! Randomized checks of the structural guarantees of populated address spaces.

use addrspace::hwmap::tlb::CountingTlb;
use addrspace::hwmap::pte::EntryFlags;
use addrspace::hwmap::Access;
use addrspace::store::SpaceBank;
use addrspace::walk::{resolve, walk, FaultCode};
use addrspace::{
    Bank, BankId, Capability, Config, Guard, MemoryContext, ObjectKind, ObjectRef, ObjectSource,
    Restrictions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Context = MemoryContext<CountingTlb>;

fn context() -> Context {
    MemoryContext::new(Config::default(), CountingTlb::new()).unwrap()
}

/// An empty space spanning the whole address width with a root of l2v 60
fn empty_space(context: &Context, bank: &impl Bank) -> Capability {
    let root = bank.allocate(ObjectKind::Gpt).unwrap();
    context.store().with_gpt_mut(root, |g| g.l2v = 60);
    Capability::memory(ObjectKind::Gpt, root, Restrictions::empty(), Guard::FULL)
}

/// Page aligned user addresses, some of them clustered so that they share parts of their paths
fn addresses(rng: &mut StdRng, count: usize) -> Vec<u64> {
    let mut result = Vec::new();
    while result.len() < count {
        let base = rng.gen_range(0..1u64 << 26) << 12;
        result.push(base);
        if rng.gen_bool(0.5) {
            let near = base ^ (rng.gen_range(1..64u64) << 12);
            result.push(near);
        }
    }
    result.truncate(count);
    result
}

/// Check the guards and radixes of everything reachable from `cap`, collecting the objects found in `seen`
fn check_tree(
    context: &Context,
    cap: Capability,
    parent_l2v: Option<u8>,
    seen: &mut Vec<ObjectRef>,
) {
    let Some((kind, obj)) = cap.memory_object() else {
        return;
    };
    if let Some(parent_l2v) = parent_l2v {
        assert!(cap.guard().l2g() <= parent_l2v, "{cap:?} is wider than its slot");
    }
    if !seen.contains(&obj) {
        seen.push(obj);
    }
    if kind != ObjectKind::Gpt {
        assert!(cap.guard().l2g() >= 12);
        return;
    }
    let gpt = context.store().gpt(obj).unwrap();
    assert!(cap.guard().l2g() >= gpt.l2v, "{cap:?} is narrower than the slots of {gpt:?}");
    if let Some(parent_l2v) = parent_l2v {
        assert!(gpt.l2v < parent_l2v, "l2v does not decrease below {gpt:?}");
    }
    for slot in gpt.slots.iter().take(gpt.addressable_slots()) {
        check_tree(context, *slot, Some(gpt.l2v), seen);
    }
}

#[test]
fn test_populating_preserves_other_addresses() {
    // arrange
    let mut rng = StdRng::seed_from_u64(0x5eed_0001);
    let context = context();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let addrs = addresses(&mut rng, 48);
    let mut leaves = Vec::new();

    // act
    for addr in addrs.iter() {
        let leaf = context.populate(&bank, space, *addr, true, false).unwrap();
        assert_eq!(leaf.offset, 0);
        leaves.push(leaf.object);

        // assert that everything populated so far still resolves to the same leaf
        for (earlier, leaf) in addrs.iter().zip(leaves.iter()) {
            let (_, resolved, _) = resolve(context.store(), space, *earlier).unwrap();
            assert_eq!(resolved, *leaf, "{earlier:#x} moved after populating {addr:#x}");
        }
    }
}

#[test]
fn test_populated_trees_are_well_formed() {
    // arrange
    let mut rng = StdRng::seed_from_u64(0x5eed_0002);
    let context = context();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);

    // act
    for addr in addresses(&mut rng, 64) {
        let want_cap = rng.gen_bool(0.2);
        // an address may have been populated with the other kind of leaf already
        let _ = context.populate(&bank, space, addr, rng.gen_bool(0.5), want_cap);
    }

    // assert
    let mut seen = Vec::new();
    check_tree(&context, space, None, &mut seen);
    assert_eq!(seen.len(), bank.live());
}

#[test]
fn test_repeated_population_allocates_nothing() {
    let mut rng = StdRng::seed_from_u64(0x5eed_0003);
    let context = context();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let addrs = addresses(&mut rng, 32);
    for addr in addrs.iter() {
        context.populate(&bank, space, *addr, true, false).unwrap();
    }
    let allocations = bank.allocations();

    for addr in addrs.iter() {
        context.populate(&bank, space, *addr, true, false).unwrap();
        context.populate(&bank, space, *addr, false, false).unwrap();
    }

    assert_eq!(bank.allocations(), allocations);
}

#[test]
fn test_restrictions_only_accumulate() {
    // arrange: a read-only, no-execute subtree below a plain root
    let context = context();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let child = bank.allocate(ObjectKind::Gpt).unwrap();
    context.store().with_gpt_mut(child, |g| g.l2v = 20);
    let restr = Restrictions::NO_EXECUTE | Restrictions::CACHE_DISABLE;
    context
        .set_slot(
            space,
            0,
            Capability::memory(ObjectKind::Gpt, child, restr, Guard::span(24).unwrap()),
        )
        .unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed_0004);

    for _ in 0..16 {
        // act
        let addr = rng.gen_range(0..1u64 << 12) << 12;
        let leaf = context.populate(&bank, space, addr, true, false).unwrap();

        // assert
        assert!(leaf.restrictions.contains(restr));
        let walk = walk(context.store(), space, addr, false);
        let mut accumulated = Restrictions::empty();
        for entry in walk.entries.iter() {
            accumulated |= entry.restr;
            assert!(walk.restrictions.contains(accumulated));
        }
        let resolution = context.handle_fault(space, addr, Access::READ).unwrap();
        assert!(!resolution.translation.flags.contains(EntryFlags::Execute));
        assert_eq!(
            context.handle_fault(space, addr, Access::EXECUTE),
            Err(FaultCode::NoExecute)
        );
    }
}
