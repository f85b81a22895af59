use addrspace::hwmap::tlb::CountingTlb;
use addrspace::hwmap::{frame_paddr, Access, RootTable};
use addrspace::invoke::{Opcode, Request};
use addrspace::ops::InvokeError;
use addrspace::store::SpaceBank;
use addrspace::walk::{walk, FaultCode};
use addrspace::{
    Bank, BankId, Capability, Config, Guard, MemoryContext, ObjectKind, ObjectRef, Restrictions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type Context = MemoryContext<CountingTlb>;

fn empty_space(context: &Context, bank: &impl Bank) -> Capability {
    let root = bank.allocate(ObjectKind::Gpt).unwrap();
    context.store().with_gpt_mut(root, |g| g.l2v = 60);
    Capability::memory(ObjectKind::Gpt, root, Restrictions::empty(), Guard::FULL)
}

/// The GPT and slot holding the leaf `addr` resolves to
fn leaf_slot(context: &Context, space: Capability, addr: u64) -> (ObjectRef, usize) {
    let walk = walk(context.store(), space, addr, false);
    let leaf = walk.leaf().unwrap();
    let parent = walk.entries[walk.entries.len() - 2];
    (parent.object, leaf.slot.unwrap())
}

fn invoked(gpt: ObjectRef) -> Capability {
    Capability::memory(ObjectKind::Gpt, gpt, Restrictions::empty(), Guard::FULL)
}

#[test]
fn test_no_translation_survives_its_slot() {
    // arrange
    let mut rng = StdRng::seed_from_u64(0xdeb_0001);
    let context = MemoryContext::new(Config::default(), CountingTlb::new()).unwrap();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let mut addrs = Vec::new();
    let mut root: Option<RootTable> = None;
    for _ in 0..24 {
        let base = rng.gen_range(0..1u64 << 20) << 18;
        for page in 0..rng.gen_range(1..4u64) {
            let addr = base + (page << 12);
            context.populate(&bank, space, addr, true, false).unwrap();
            let resolution = context.handle_fault(space, addr, Access::WRITE).unwrap();
            root = Some(resolution.root);
            addrs.push(addr);
        }
    }
    let root = root.unwrap();

    while !addrs.is_empty() {
        // act
        let victim = addrs[rng.gen_range(0..addrs.len())];
        let (gpt, slot) = leaf_slot(&context, space, victim);
        context.set_slot(invoked(gpt), slot, Capability::NULL).unwrap();

        // assert
        assert_eq!(context.projection().translate(root, victim), None);
        assert_eq!(
            context.handle_fault(space, victim, Access::READ),
            Err(FaultCode::InvalidDataReference)
        );
        // the cleared slot may have held a whole subtree, so more than the victim can be gone
        addrs.retain(|addr| {
            let leaf = walk(context.store(), space, *addr, false).leaf().map(|leaf| leaf.object);
            let projected = context.projection().translate(root, *addr);
            match leaf {
                None => {
                    assert_eq!(projected, None, "{addr:#x} is still projected");
                    false
                }
                Some(object) => {
                    if let Some(translation) = projected {
                        assert_eq!(translation.paddr & !0xfff, frame_paddr(object.id));
                    }
                    true
                }
            }
        });
    }
}

#[test]
fn test_store_then_fetch_until_overwritten() {
    // arrange
    let context = MemoryContext::new(Config::default(), CountingTlb::new()).unwrap();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let addr = 0x7_0000_0000;
    context.populate(&bank, space, addr, true, true).unwrap();
    let page = bank.allocate(ObjectKind::Page).unwrap();
    let first = Capability::memory(ObjectKind::Page, page, Restrictions::empty(), Guard::PAGE);
    let second = first.with_restrictions(Restrictions::READ_ONLY);

    // act + assert
    context.store_cap(space, addr + 0x20, first).unwrap();
    assert_eq!(context.fetch_cap(space, addr + 0x20), Ok(first));
    assert_eq!(context.fetch_cap(space, addr + 0x20), Ok(first));
    context.store_cap(space, addr + 0x20, second).unwrap();
    assert_eq!(context.fetch_cap(space, addr + 0x20), Ok(second));
    assert_eq!(
        context.fetch_cap(space, addr + 0x1000),
        Err(InvokeError::InvalidAddress)
    );
}

#[test]
fn test_extended_store_replaces_a_subtree() {
    // arrange
    let context = MemoryContext::new(Config::default(), CountingTlb::new()).unwrap();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let fresh = bank.allocate(ObjectKind::Page).unwrap();
    let fresh = Capability::memory(ObjectKind::Page, fresh, Restrictions::empty(), Guard::PAGE);

    // act: install a page directly into the root slot covering the first 2^60 bytes
    context
        .invoke(
            &bank,
            space,
            &Request::new(Opcode::ExtendedStore, [0, 60, 0]).with_cap(fresh),
        )
        .unwrap();

    // assert
    let resolution = context.handle_fault(space, 0x10, Access::READ).unwrap();
    assert_eq!(
        resolution.translation.paddr,
        frame_paddr(fresh.memory_object().unwrap().1.id) + 0x10
    );
    assert_eq!(
        context.handle_fault(space, 0x1000, Access::READ),
        Err(FaultCode::InvalidDataReference)
    );
}

#[test]
fn test_destroying_a_populated_leaf() {
    let context = MemoryContext::new(Config::default(), CountingTlb::new()).unwrap();
    let bank = SpaceBank::new(BankId(1), context.store());
    let space = empty_space(&context, &bank);
    let leaf = context.populate(&bank, space, 0x3000, true, false).unwrap();
    let resolution = context.handle_fault(space, 0x3000, Access::WRITE).unwrap();
    let live = bank.live();

    let page =
        Capability::memory(ObjectKind::Page, leaf.object, Restrictions::empty(), Guard::PAGE);
    context.destroy(&bank, page).unwrap();

    assert_eq!(bank.live(), live - 1);
    assert_eq!(context.projection().translate(resolution.root, 0x3000), None);
    // the slot still refers to the destroyed page
    assert_eq!(
        context.handle_fault(space, 0x3000, Access::WRITE),
        Err(FaultCode::InvalidDataReference)
    );
}
