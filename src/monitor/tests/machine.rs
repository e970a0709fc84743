//! Integration tests that exercise a real VM. They need /dev/kvm, so
//! they are ignored by default: `cargo test -- --ignored` on a KVM host.

use monitor::mem::{GUEST_MEM_START_VA, MIB};
use monitor::{Machine, MachineConfig};

#[test]
#[ignore] // requires /dev/kvm
fn brk_plugs_and_unplugs_slots() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let base = machine.mem_brk(0) as u64;
    assert_eq!(base, GUEST_MEM_START_VA);

    let new = base + 8 * MIB;
    assert_eq!(machine.mem_brk(new), new as i64);

    // The plugged slots are readable and writable through the aliases.
    machine.write_obj(base + 4 * MIB, &0xdead_beef_u64).unwrap();
    let val: u64 = machine.read_obj(base + 4 * MIB).unwrap();
    assert_eq!(val, 0xdead_beef);

    // Shrinking frees the slots above the new brk; the alias is gone.
    assert_eq!(machine.mem_brk(base), base as i64);
    assert!(machine.read_obj::<u64>(base + 4 * MIB).is_err());
}

#[test]
#[ignore] // requires /dev/kvm
fn brk_refuses_to_cross_the_midpoint() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let too_much = machine.layout.max_brk() + MIB;
    assert_eq!(machine.mem_brk(too_much), -(libc::ENOMEM as i64));
    // Nothing was left half-plugged: the old brk still stands.
    assert_eq!(machine.mem_brk(0) as u64, GUEST_MEM_START_VA);
}

#[test]
#[ignore] // requires /dev/kvm
fn mmap_refills_a_freed_hole_exactly() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let first = machine.guest_mmap(0, 200 * MIB, prot, flags, None);
    assert!(first > 0, "mmap failed: {}", first);
    let addr = first as u64;
    // Block tbrk so the hole is the only fit.
    assert!(machine.guest_mmap(0, 10 * MIB, prot, flags, None) > 0);

    assert_eq!(machine.guest_munmap(addr + 50 * MIB, 100 * MIB), 0);
    let refill = machine.guest_mmap(0, 100 * MIB, prot, flags, None);
    assert_eq!(refill as u64, addr + 50 * MIB);
}

#[test]
#[ignore] // requires /dev/kvm
fn munmap_of_unmapped_range_succeeds() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let addr = machine.guest_mmap(0, 8 * MIB, prot, flags, None);
    assert!(addr > 0);
    let addr = addr as u64;
    assert_eq!(machine.guest_munmap(addr, 8 * MIB), 0);
    // Doubly unmapped: still success.
    assert_eq!(machine.guest_munmap(addr, 8 * MIB), 0);
    // Misaligned: EINVAL.
    assert_eq!(
        machine.guest_munmap(addr + 20, MIB),
        -(libc::EINVAL as i64)
    );
}

#[test]
#[ignore] // requires /dev/kvm
fn mprotect_needs_full_coverage() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    let addr = machine.guest_mmap(0, 8 * MIB, prot, flags, None) as u64;
    assert_eq!(machine.guest_munmap(addr + 2 * MIB, 2 * MIB), 0);
    // A hole in the middle fails the whole call.
    assert_eq!(
        machine.guest_mprotect(addr, 8 * MIB, libc::PROT_READ),
        -(libc::ENOMEM as i64)
    );
    // The fully mapped prefix is fine.
    assert_eq!(machine.guest_mprotect(addr, 2 * MIB, libc::PROT_READ), 0);
}

#[test]
#[ignore] // requires /dev/kvm
fn mremap_validates_flags_and_sizes() {
    let machine = Machine::new(MachineConfig::default()).unwrap();
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let addr = machine.guest_mmap(0, 4 * MIB, prot, flags, None) as u64;

    let einval = -(libc::EINVAL as i64);
    assert_eq!(machine.guest_mremap(addr, 2 * MIB, MIB, libc::MREMAP_FIXED, 0), einval);
    assert_eq!(machine.guest_mremap(addr, MIB, 0, libc::MREMAP_MAYMOVE, 0), einval);
    assert_eq!(machine.guest_mremap(addr, 0, MIB, libc::MREMAP_MAYMOVE, 0), einval);
    assert_eq!(machine.guest_mremap(addr + 1, 2 * MIB, MIB, libc::MREMAP_MAYMOVE, 0), einval);
    assert_eq!(machine.guest_mremap(addr, 2 * MIB, MIB, 0x44, 0), einval);

    // Shrink in place leaves the address alone.
    assert_eq!(
        machine.guest_mremap(addr, 4 * MIB, 2 * MIB, libc::MREMAP_MAYMOVE, 0),
        addr as i64
    );
    // Grow back into the hole we just left.
    assert_eq!(
        machine.guest_mremap(addr, 2 * MIB, 4 * MIB, libc::MREMAP_MAYMOVE, 0),
        addr as i64
    );
}
