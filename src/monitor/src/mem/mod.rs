// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest memory manager.
//!
//! Physical memory layout:
//!
//! - `[0, 4 KiB)` hole, never mapped.
//! - `[4 KiB, 256 KiB)` reserved slot 0: PML4, two PDPT pages, two PD
//!   pages, GDT and IDT, each on its own page.
//! - hole up to 2 MiB.
//! - heap slots, starting at 2 MiB, each double the size of the previous
//!   one (2 MiB, 4 MiB, 8 MiB, ...) up to the midpoint of
//!   `guest_max_physmem`.
//! - the upper half mirrors the lower half: slot `j` has the size of slot
//!   `last_idx - j` and sits at the mirrored distance from the top. The
//!   topmost 2 MiB (mirror of the hole + reserved area) is never plugged.
//!
//! Virtual address layout: the bottom region `[2 MiB, brk)` is identity
//! mapped (GVA == GPA) and grows up on `brk()`. The top region
//! `[tbrk, GUEST_MEM_TOP_VA)` holds stacks and mmap areas, grows down on
//! `tbrk()`, and is offset from its physical frames by the constant
//! `va_offset`, so translation either way is one subtraction.
//!
//! Page tables live in the reserved slot. The first and last GiB of
//! address space use 2 MiB pages; everything in between uses 1 GiB pages
//! (which is why `guest_max_physmem` is clamped to 2 GiB on hosts without
//! pdpe1g support). Two PML4 entries are in use: entry 0 for the bottom
//! region and entry 255 for the top one. Slot remaps flush guest TLBs, so
//! no explicit invalidation is needed after an edit.

use std::sync::MutexGuard;

use vm_memory::MmapRegion;

use crate::{Gva, Machine};

pub mod mmap;

pub const PAGE_SIZE: u64 = 0x1000;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// Reserved slot: 63 pages at 4 KiB, ending at 256 KiB.
pub const RSV_MEM_START: u64 = PAGE_SIZE;
pub const RSV_MEM_SIZE: u64 = 63 * PAGE_SIZE;

/// Page offsets inside the reserved slot.
const RSV_PML4_OFFSET: u64 = 0;
const RSV_PDPT_OFFSET: u64 = 0x1000;
const RSV_PDPT2_OFFSET: u64 = 0x2000;
const RSV_PD_OFFSET: u64 = 0x3000;
const RSV_PD2_OFFSET: u64 = 0x4000;
pub const RSV_GDT_OFFSET: u64 = 0x5000;
pub const RSV_IDT_OFFSET: u64 = 0x6000;

const fn rsv_guest_pa(offset: u64) -> u64 {
    RSV_MEM_START + offset
}

/// First usable guest virtual address (and physical address).
pub const GUEST_MEM_START_VA: u64 = 2 * MIB;

/// Top of the guest virtual address space: the last 2 MiB of the lower
/// half of the 47-bit canonical window stay unmapped.
pub const GUEST_MEM_TOP_VA: u64 = (1 << 47) - 2 * MIB;

/// Hard cap on guest physical memory; two PML4 entries cover it.
pub const GUEST_MAX_PHYSMEM: u64 = 512 * GIB;

/// Default size of a guest thread stack.
pub const GUEST_STACK_SIZE: u64 = 2 * MIB;

// Page table entry bits.
const PTE_P: u64 = 1 << 0;
const PTE_W: u64 = 1 << 1;
const PTE_PS: u64 = 1 << 7;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no memory for guest region of {0} bytes")]
    RegionAlloc(u64),
    #[error("hypervisor rejected memory region: {0}")]
    Hv(#[from] crate::hv::Error),
    #[error("guest out of memory")]
    GuestOom,
}

/// Slot geometry. Everything here is pure arithmetic so the ladder can be
/// checked without a hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct MemLayout {
    pub guest_max_physmem: u64,
    pub mid_physmem: u64,
    pub mid_idx: usize,
    pub last_idx: usize,
    /// Upper GVA == GPA + va_offset.
    pub va_offset: u64,
    pub pdpe1g: bool,
}

/// Index of the lower-half slot containing physical address `gpa`.
/// Addresses below 2 MiB land in the reserved slot 0.
fn lower_idx(gpa: u64) -> usize {
    if gpa < GUEST_MEM_START_VA {
        0
    } else {
        (63 - gpa.leading_zeros()) as usize - 20
    }
}

impl MemLayout {
    pub fn new(phys_bits: u8, pdpe1g: bool) -> MemLayout {
        let mut max = GUEST_MAX_PHYSMEM.min(1u64 << phys_bits);
        if !pdpe1g {
            // Without 1 GiB pages only the first and last GiB are mappable.
            max = max.min(2 * GIB);
        }
        let mid = max >> 1;
        let mid_idx = lower_idx(mid - 1);
        MemLayout {
            guest_max_physmem: max,
            mid_physmem: mid,
            mid_idx,
            last_idx: 2 * mid_idx + 1,
            va_offset: GUEST_MEM_TOP_VA - (max - 2 * MIB),
            pdpe1g,
        }
    }

    pub fn memreg_size(&self, idx: usize) -> u64 {
        if idx == 0 {
            2 * MIB
        } else if idx <= self.mid_idx {
            1 << (idx + 20)
        } else {
            self.memreg_size(self.last_idx - idx)
        }
    }

    pub fn memreg_base(&self, idx: usize) -> u64 {
        if idx == 0 {
            0
        } else if idx <= self.mid_idx {
            1 << (idx + 20)
        } else {
            let mirror = self.last_idx - idx;
            self.guest_max_physmem - self.memreg_top(mirror)
        }
    }

    pub fn memreg_top(&self, idx: usize) -> u64 {
        self.memreg_base(idx) + self.memreg_size(idx)
    }

    /// Slot containing physical address `gpa`.
    pub fn gpa_to_idx(&self, gpa: u64) -> usize {
        if gpa < self.mid_physmem {
            lower_idx(gpa)
        } else {
            let dist = self.guest_max_physmem - gpa;
            self.last_idx - lower_idx(dist - 1)
        }
    }

    /// Lowest mappable upper-region virtual address.
    pub fn min_tbrk(&self) -> Gva {
        self.mid_physmem + self.va_offset
    }

    /// Highest brk value: the heap may use the whole lower half.
    pub fn max_brk(&self) -> Gva {
        self.mid_physmem
    }

    /// The never-plugged top 2 MiB of physical memory; handed to the
    /// hypervisor for its TSS pages since no slot will ever cover it.
    pub fn tss_base(&self) -> u64 {
        self.guest_max_physmem - 2 * MIB
    }
}

pub struct SlotEntry {
    pub guest_phys: u64,
    pub size: u64,
    pub region: Option<MmapRegion>,
}

/// Mutable memory-manager state, owned by `Machine::mem` (the brk lock).
pub struct MemState {
    pub slots: Vec<SlotEntry>,
    pub brk: Gva,
    pub tbrk: Gva,
}

impl MemState {
    pub fn new(layout: &MemLayout) -> MemState {
        let mut slots = Vec::with_capacity(layout.last_idx + 1);
        for idx in 0..=layout.last_idx {
            slots.push(SlotEntry {
                guest_phys: layout.memreg_base(idx),
                size: layout.memreg_size(idx),
                region: None,
            });
        }
        MemState {
            slots,
            brk: GUEST_MEM_START_VA,
            tbrk: GUEST_MEM_TOP_VA,
        }
    }

    fn rsv_kma(&self) -> *mut u8 {
        self.slots[0]
            .region
            .as_ref()
            .expect("reserved slot is plugged for the life of the machine")
            .as_ptr()
    }
}

fn table_write(rsv: *mut u8, table_offset: u64, slot: usize, entry: u64) {
    // SAFETY: the reserved slot spans all page table pages; `slot` is a
    // 9-bit table index computed from a canonical address.
    unsafe {
        (rsv.add(table_offset as usize) as *mut u64)
            .add(slot)
            .write_volatile(entry)
    }
}

fn table_clear_page(rsv: *mut u8, table_offset: u64) {
    // SAFETY: as above; whole-page clear.
    unsafe { std::ptr::write_bytes(rsv.add(table_offset as usize), 0, PAGE_SIZE as usize) }
}

/// PD slot for `addr` (position within its GiB).
fn pde_slot(addr: u64) -> usize {
    ((addr & (GIB - 1)) >> 21) as usize
}

/// PDPT slot for `addr` (position within its 512 GiB).
fn pdpte_slot(addr: u64) -> usize {
    ((addr & (512 * GIB - 1)) >> 30) as usize
}

/// Build the static part of the paging hierarchy: two PML4 entries, the
/// two PDPT pages and the two PD pages for the first and last GiB.
fn init_pml4(rsv: *mut u8) {
    table_clear_page(rsv, RSV_PML4_OFFSET);
    table_clear_page(rsv, RSV_PDPT_OFFSET);
    table_clear_page(rsv, RSV_PDPT2_OFFSET);
    table_clear_page(rsv, RSV_PD_OFFSET);
    table_clear_page(rsv, RSV_PD2_OFFSET);

    table_write(
        rsv,
        RSV_PML4_OFFSET,
        0,
        rsv_guest_pa(RSV_PDPT_OFFSET) | PTE_P | PTE_W,
    );
    let high = ((GUEST_MEM_TOP_VA - 1) >> 39) as usize & 0x1ff;
    table_write(
        rsv,
        RSV_PML4_OFFSET,
        high,
        rsv_guest_pa(RSV_PDPT2_OFFSET) | PTE_P | PTE_W,
    );

    table_write(
        rsv,
        RSV_PDPT_OFFSET,
        0,
        rsv_guest_pa(RSV_PD_OFFSET) | PTE_P | PTE_W,
    );
    table_write(
        rsv,
        RSV_PDPT2_OFFSET,
        pdpte_slot(GUEST_MEM_TOP_VA),
        rsv_guest_pa(RSV_PD2_OFFSET) | PTE_P | PTE_W,
    );
}

/// Reflect the addition of a slot in the paging hierarchy. Slots smaller
/// than 1 GiB get 2 MiB PDEs (they always sit inside the first or last
/// GiB); larger slots get 1 GiB PDPTEs.
fn set_pml4_hierarchy(rsv: *mut u8, layout: &MemLayout, base: u64, size: u64, upper: bool) {
    if size < GIB {
        let pd = if upper { RSV_PD2_OFFSET } else { RSV_PD_OFFSET };
        let mut addr = base;
        // va_offset is GiB aligned, so the PA indexes the PD correctly for
        // the upper region too.
        while addr < base + size {
            table_write(rsv, pd, pde_slot(addr), addr | PTE_P | PTE_W | PTE_PS);
            addr += 2 * MIB;
        }
    } else {
        assert!(layout.pdpe1g, "1 GiB slot without pdpe1g support");
        let pdpt = if upper { RSV_PDPT2_OFFSET } else { RSV_PDPT_OFFSET };
        let mut pa = base;
        while pa < base + size {
            let va = if upper { pa + layout.va_offset } else { pa };
            table_write(rsv, pdpt, pdpte_slot(va), pa | PTE_P | PTE_W | PTE_PS);
            pa += GIB;
        }
    }
}

fn clear_pml4_hierarchy(rsv: *mut u8, layout: &MemLayout, base: u64, size: u64, upper: bool) {
    if size < GIB {
        let pd = if upper { RSV_PD2_OFFSET } else { RSV_PD_OFFSET };
        let mut addr = base;
        while addr < base + size {
            table_write(rsv, pd, pde_slot(addr), 0);
            addr += 2 * MIB;
        }
    } else {
        let pdpt = if upper { RSV_PDPT2_OFFSET } else { RSV_PDPT_OFFSET };
        let mut pa = base;
        while pa < base + size {
            let va = if upper { pa + layout.va_offset } else { pa };
            table_write(rsv, pdpt, pdpte_slot(va), 0);
            pa += GIB;
        }
    }
}

impl Machine {
    /// Plug the reserved slot, build the paging hierarchy and hand the
    /// hypervisor its TSS range. Called once from `Machine::new`.
    pub(crate) fn mem_init(&self) -> Result<(), Error> {
        let mut st = self.mem.lock().unwrap();
        let region =
            MmapRegion::new(RSV_MEM_SIZE as usize).map_err(|_| Error::RegionAlloc(RSV_MEM_SIZE))?;
        let hv = self.hv.read().unwrap();
        hv.set_memory_region(0, RSV_MEM_START, RSV_MEM_SIZE, region.as_ptr() as u64, 0)?;
        hv.set_tss_addr(self.layout.tss_base())?;
        st.slots[0].guest_phys = RSV_MEM_START;
        st.slots[0].size = RSV_MEM_SIZE;
        st.slots[0].region = Some(region);
        init_pml4(st.rsv_kma());
        Ok(())
    }

    /// Re-register every plugged slot with a freshly created VM. Used by
    /// the fork child, which inherits the memory but not the hypervisor
    /// fds.
    pub(crate) fn mem_reregister_slots(&self) -> Result<(), Error> {
        let st = self.mem.lock().unwrap();
        let hv = self.hv.read().unwrap();
        for (idx, slot) in st.slots.iter().enumerate() {
            if let Some(region) = &slot.region {
                hv.set_memory_region(
                    idx as u32,
                    slot.guest_phys,
                    slot.size,
                    region.as_ptr() as u64,
                    0,
                )?;
            }
        }
        hv.set_tss_addr(self.layout.tss_base())?;
        Ok(())
    }

    /// Allocate host memory for slot `idx`, register it and map it in the
    /// guest page tables. Fresh upper slots start out PROT_NONE on the
    /// host: every byte of them is on the mmap free list until carved out.
    fn plug_slot(&self, st: &mut MemState, idx: usize, upper: bool) -> Result<(), i64> {
        let base = self.layout.memreg_base(idx);
        let size = self.layout.memreg_size(idx);
        assert!(st.slots[idx].region.is_none(), "slot {} double plug", idx);

        let region = MmapRegion::new(size as usize).map_err(|_| -(libc::ENOMEM as i64))?;
        let hv = self.hv.read().unwrap();
        if let Err(e) =
            hv.set_memory_region(idx as u32, base, size, region.as_ptr() as u64, 0)
        {
            tracing::warn!(target: "monitor::mem", slot = idx, error = %e, "memory region plug failed");
            return Err(-(libc::ENOMEM as i64));
        }
        if upper {
            // SAFETY: region covers `size` bytes and stays alive in the slot
            // table; protection is restored by the mmap manager on carve.
            unsafe {
                libc::mprotect(region.as_ptr() as *mut libc::c_void, size as usize, libc::PROT_NONE);
            }
        }
        set_pml4_hierarchy(st.rsv_kma(), &self.layout, base, size, upper);
        st.slots[idx].region = Some(region);
        tracing::debug!(target: "monitor::mem", slot = idx, base, size, upper, "plugged");
        Ok(())
    }

    fn unplug_slot(&self, st: &mut MemState, idx: usize, upper: bool) {
        let base = self.layout.memreg_base(idx);
        let size = self.layout.memreg_size(idx);
        assert!(st.slots[idx].region.is_some(), "slot {} not plugged", idx);
        clear_pml4_hierarchy(st.rsv_kma(), &self.layout, base, size, upper);
        let hv = self.hv.read().unwrap();
        if let Err(e) = hv.set_memory_region(idx as u32, base, 0, 0, 0) {
            // The slot table and the hypervisor view must not diverge.
            panic!("failed to unplug memory region {}: {}", idx, e);
        }
        st.slots[idx].region = None;
        tracing::debug!(target: "monitor::mem", slot = idx, base, size, upper, "unplugged");
    }

    /// brk() implementation: move the heap ceiling, plugging or unplugging
    /// slots as needed. Returns the new brk or -errno; `new == 0` reads
    /// the current value. Either every slot needed for the move is plugged
    /// or none remain plugged.
    pub fn mem_brk(&self, new: Gva) -> i64 {
        if new == 0 {
            return self.mem.lock().unwrap().brk as i64;
        }
        if new < GUEST_MEM_START_VA || new > self.layout.max_brk() {
            return -(libc::ENOMEM as i64);
        }
        let mut st = self.mem.lock().unwrap();
        // First physical frame owned by the upper region.
        let ceiling = st.tbrk - self.layout.va_offset;
        if new > ceiling {
            return -(libc::ENOMEM as i64);
        }

        if new > st.brk {
            let start_idx = if st.brk <= GUEST_MEM_START_VA {
                0
            } else {
                lower_idx(st.brk - 1)
            };
            let mut idx = start_idx;
            while self.layout.memreg_top(idx) < new {
                let nidx = idx + 1;
                let conflict = self.layout.memreg_top(nidx) > ceiling;
                if conflict || self.plug_slot(&mut st, nidx, false).is_err() {
                    for i in (start_idx + 1..=idx).rev() {
                        self.unplug_slot(&mut st, i, false);
                    }
                    return -(libc::ENOMEM as i64);
                }
                idx = nidx;
            }
        } else if new < st.brk {
            // Unplug slots whose base lies strictly above the new brk.
            let mut idx = lower_idx(st.brk - 1);
            while idx >= 1 && self.layout.memreg_base(idx) > new {
                self.unplug_slot(&mut st, idx, false);
                idx -= 1;
            }
        }
        st.brk = new;
        new as i64
    }

    /// tbrk() implementation, the mirror of `mem_brk` for the upper
    /// region: moving down plugs mirrored slots, moving up unplugs them.
    pub fn mem_tbrk(&self, new: Gva) -> i64 {
        if new == 0 {
            return self.mem.lock().unwrap().tbrk as i64;
        }
        if new < self.layout.min_tbrk() || new > GUEST_MEM_TOP_VA {
            return -(libc::ENOMEM as i64);
        }
        let mut st = self.mem.lock().unwrap();
        let floor = st.brk; // identity mapped, so also the top heap PA
        if new - self.layout.va_offset <= floor {
            return -(libc::ENOMEM as i64);
        }

        if new < st.tbrk {
            let start_idx = if st.tbrk == GUEST_MEM_TOP_VA {
                self.layout.last_idx
            } else {
                self.layout.gpa_to_idx(st.tbrk - self.layout.va_offset)
            };
            let mut idx = start_idx;
            while self.layout.memreg_base(idx) + self.layout.va_offset > new {
                let nidx = idx - 1;
                let conflict = self.layout.memreg_base(nidx) < floor;
                if conflict || self.plug_slot(&mut st, nidx, true).is_err() {
                    for i in idx..start_idx {
                        self.unplug_slot(&mut st, i, true);
                    }
                    return -(libc::ENOMEM as i64);
                }
                idx = nidx;
            }
        } else if new > st.tbrk {
            let mut idx = self.layout.gpa_to_idx(st.tbrk - self.layout.va_offset);
            while idx < self.layout.last_idx
                && self.layout.memreg_top(idx) + self.layout.va_offset <= new
            {
                self.unplug_slot(&mut st, idx, true);
                idx += 1;
            }
        }
        st.tbrk = new;
        new as i64
    }

    /// Translate a guest virtual address. `None` for anything outside the
    /// currently plugged heap and upper regions.
    pub(crate) fn gva_to_gpa_locked(&self, st: &MemState, gva: Gva) -> Option<u64> {
        if (GUEST_MEM_START_VA..st.brk).contains(&gva) {
            Some(gva)
        } else if (st.tbrk..GUEST_MEM_TOP_VA).contains(&gva) {
            Some(gva - self.layout.va_offset)
        } else {
            None
        }
    }

    /// Monitor-space alias of `gva`, valid while the backing slot stays
    /// plugged. The pointer is only good up to the end of its slot; use
    /// the chunked accessors for anything that may span slots.
    pub fn gva_to_kma(&self, gva: Gva) -> Option<*mut u8> {
        let st = self.mem.lock().unwrap();
        let gpa = self.gva_to_gpa_locked(&st, gva)?;
        let idx = self.layout.gpa_to_idx(gpa);
        let slot = &st.slots[idx];
        let region = slot.region.as_ref()?;
        let off = gpa.checked_sub(slot.guest_phys)?;
        if off >= slot.size {
            return None;
        }
        // SAFETY: off < slot.size, checked above.
        Some(unsafe { region.as_ptr().add(off as usize) })
    }

    /// Walk `[gva, gva + len)` slot by slot, handing the callback one
    /// contiguous monitor-space chunk at a time. Fails with EFAULT if any
    /// byte is unbacked.
    pub(crate) fn for_each_kma_chunk<F>(&self, gva: Gva, len: u64, mut f: F) -> Result<(), i64>
    where
        F: FnMut(*mut u8, usize, u64) -> Result<(), i64>,
    {
        let mut done: u64 = 0;
        while done < len {
            let cur = gva + done;
            let (ptr, avail) = {
                let st = self.mem.lock().unwrap();
                let gpa = self
                    .gva_to_gpa_locked(&st, cur)
                    .ok_or(-(libc::EFAULT as i64))?;
                let idx = self.layout.gpa_to_idx(gpa);
                let slot = &st.slots[idx];
                let region = slot.region.as_ref().ok_or(-(libc::EFAULT as i64))?;
                let off = gpa - slot.guest_phys;
                if off >= slot.size {
                    return Err(-(libc::EFAULT as i64));
                }
                // SAFETY: off < slot.size.
                (unsafe { region.as_ptr().add(off as usize) }, slot.size - off)
            };
            let chunk = avail.min(len - done);
            f(ptr, chunk as usize, done)?;
            done += chunk;
        }
        Ok(())
    }

    pub fn read_guest(&self, gva: Gva, buf: &mut [u8]) -> Result<(), i64> {
        let base = buf.as_mut_ptr();
        self.for_each_kma_chunk(gva, buf.len() as u64, |ptr, len, off| {
            // SAFETY: chunk bounds were validated against the slot table and
            // `off + len <= buf.len()` by construction.
            unsafe { std::ptr::copy_nonoverlapping(ptr, base.add(off as usize), len) };
            Ok(())
        })
    }

    pub fn write_guest(&self, gva: Gva, buf: &[u8]) -> Result<(), i64> {
        let base = buf.as_ptr();
        self.for_each_kma_chunk(gva, buf.len() as u64, |ptr, len, off| {
            // SAFETY: as in read_guest, with the copy direction reversed.
            unsafe { std::ptr::copy_nonoverlapping(base.add(off as usize), ptr, len) };
            Ok(())
        })
    }

    pub fn read_obj<T: Copy>(&self, gva: Gva) -> Result<T, i64> {
        let mut val = std::mem::MaybeUninit::<T>::uninit();
        // SAFETY: the buffer spans exactly the object; read_guest fills all
        // of it or fails.
        let buf = unsafe {
            std::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, std::mem::size_of::<T>())
        };
        self.read_guest(gva, buf)?;
        // SAFETY: fully initialized above.
        Ok(unsafe { val.assume_init() })
    }

    pub fn write_obj<T: Copy>(&self, gva: Gva, val: &T) -> Result<(), i64> {
        // SAFETY: plain-old-data view of a repr(C) value.
        let buf = unsafe {
            std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
        };
        self.write_guest(gva, buf)
    }

    /// Read a NUL-terminated guest string, bounded by `max`.
    pub fn read_cstr(&self, gva: Gva, max: usize) -> Result<String, i64> {
        let mut out = Vec::new();
        let mut cur = gva;
        while out.len() < max {
            let b: u8 = self.read_obj(cur)?;
            if b == 0 {
                return String::from_utf8(out).map_err(|_| -(libc::EINVAL as i64));
            }
            out.push(b);
            cur += 1;
        }
        Err(-(libc::ENAMETOOLONG as i64))
    }

    /// Copy between two guest ranges through a bounce buffer (the ranges
    /// may live in different slots and must not alias host-side).
    pub fn copy_within_guest(&self, dst: Gva, src: Gva, len: u64) -> Result<(), i64> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(buf.len() as u64) as usize;
            self.read_guest(src + done, &mut buf[..chunk])?;
            self.write_guest(dst + done, &buf[..chunk])?;
            done += chunk as u64;
        }
        Ok(())
    }

    // Host-side mapping edits for the upper region. All take guest virtual
    // addresses, page aligned, and walk the backing slots chunk by chunk.

    pub(crate) fn host_mprotect(&self, gva: Gva, len: u64, prot: i32) -> Result<(), i64> {
        self.for_each_kma_chunk(gva, len, |ptr, chunk, _| {
            // SAFETY: ptr/chunk describe a live slot range, page aligned.
            let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, chunk, prot) };
            if rc < 0 {
                Err(-(io_errno()) as i64)
            } else {
                Ok(())
            }
        })
    }

    /// Return an anonymous range to zero pages (used when a free interval
    /// is re-carved: the host guarantees fresh maps read as zero).
    pub(crate) fn host_zero(&self, gva: Gva, len: u64) -> Result<(), i64> {
        self.for_each_kma_chunk(gva, len, |ptr, chunk, _| {
            // SAFETY: live slot range; MADV_DONTNEED resets private
            // anonymous pages to zero fill.
            let rc = unsafe { libc::madvise(ptr as *mut libc::c_void, chunk, libc::MADV_DONTNEED) };
            if rc < 0 {
                Err(-(io_errno()) as i64)
            } else {
                Ok(())
            }
        })
    }

    /// Map a file over a guest range (file-backed guest mmap).
    pub(crate) fn host_map_file(
        &self,
        gva: Gva,
        len: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<(), i64> {
        let share = flags & (libc::MAP_SHARED | libc::MAP_PRIVATE);
        self.for_each_kma_chunk(gva, len, |ptr, chunk, done| {
            // SAFETY: remapping a range inside a slot region we own;
            // MAP_FIXED replaces it in place.
            let rc = unsafe {
                libc::mmap(
                    ptr as *mut libc::c_void,
                    chunk,
                    prot,
                    share | libc::MAP_FIXED,
                    fd,
                    (offset + done) as libc::off_t,
                )
            };
            if rc == libc::MAP_FAILED {
                Err(-(io_errno()) as i64)
            } else {
                Ok(())
            }
        })
    }

    /// Drop whatever backs a guest range and replace it with inaccessible
    /// anonymous pages: used on munmap so stale file contents cannot leak
    /// into a later mapping and stray access faults.
    pub(crate) fn host_reset_anon(&self, gva: Gva, len: u64) -> Result<(), i64> {
        self.for_each_kma_chunk(gva, len, |ptr, chunk, _| {
            // SAFETY: remapping a range inside a slot region we own.
            let rc = unsafe {
                libc::mmap(
                    ptr as *mut libc::c_void,
                    chunk,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
                    -1,
                    0,
                )
            };
            if rc == libc::MAP_FAILED {
                Err(-(io_errno()) as i64)
            } else {
                Ok(())
            }
        })
    }

    pub(crate) fn mem_state(&self) -> MutexGuard<'_, MemState> {
        self.mem.lock().unwrap()
    }

    /// Monitor-space pointer to the reserved slot (page tables, GDT, IDT).
    pub(crate) fn rsv_ptr(&self) -> *mut u8 {
        self.mem.lock().unwrap().rsv_kma()
    }
}

fn io_errno() -> i64 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64
}

pub fn round_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

pub fn round_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_is_mirrored_512g() {
        let layout = MemLayout::new(39, true);
        assert_eq!(layout.guest_max_physmem, 512 * GIB);
        assert_eq!(layout.mid_physmem, 256 * GIB);
        assert_eq!(layout.mid_idx, 17);
        assert_eq!(layout.last_idx, 35);
        assert_eq!(layout.memreg_base(1), 2 * MIB);
        assert_eq!(layout.memreg_size(1), 2 * MIB);
        assert_eq!(layout.memreg_top(layout.mid_idx), layout.mid_physmem);
        // Mirror: same sizes, mirrored bases.
        for j in layout.mid_idx + 1..=layout.last_idx {
            let m = layout.last_idx - j;
            assert_eq!(layout.memreg_size(j), layout.memreg_size(m));
            assert_eq!(
                layout.memreg_base(j),
                layout.guest_max_physmem - layout.memreg_top(m)
            );
        }
        // Last slot is the 2 MiB mirror of the hole + reserved area.
        assert_eq!(
            layout.memreg_base(layout.last_idx),
            layout.guest_max_physmem - 2 * MIB
        );
    }

    #[test]
    fn ladder_covers_physmem_without_overlap() {
        for &(bits, pdpe1g) in &[(39u8, true), (36, true), (46, true), (39, false)] {
            let layout = MemLayout::new(bits, pdpe1g);
            // Lower half: contiguous from 2 MiB to the midpoint.
            let mut at = 2 * MIB;
            for idx in 1..=layout.mid_idx {
                assert_eq!(layout.memreg_base(idx), at);
                at = layout.memreg_top(idx);
            }
            assert_eq!(at, layout.mid_physmem);
            // Upper half: contiguous from the midpoint to max - 2 MiB,
            // walking mirrored slots downward in index from the top.
            let mut at = layout.mid_physmem;
            for idx in layout.mid_idx + 1..=layout.last_idx {
                assert_eq!(layout.memreg_base(idx), at);
                at = layout.memreg_top(idx);
            }
            assert_eq!(at, layout.guest_max_physmem);
        }
    }

    #[test]
    fn gpa_to_idx_roundtrips() {
        let layout = MemLayout::new(39, true);
        for idx in 1..=layout.last_idx {
            let base = layout.memreg_base(idx);
            let top = layout.memreg_top(idx);
            assert_eq!(layout.gpa_to_idx(base), idx, "base of slot {}", idx);
            assert_eq!(layout.gpa_to_idx(top - 1), idx, "top of slot {}", idx);
        }
    }

    #[test]
    fn no_pdpe1g_clamps_to_two_gib() {
        let layout = MemLayout::new(46, false);
        assert_eq!(layout.guest_max_physmem, 2 * GIB);
        // Every slot fits in the first or last GiB: 2 MiB pages suffice.
        for idx in 1..=layout.last_idx {
            assert!(layout.memreg_size(idx) < GIB);
        }
    }

    #[test]
    fn upper_va_translation_is_constant_offset() {
        let layout = MemLayout::new(39, true);
        let top_pa = layout.guest_max_physmem - 2 * MIB;
        assert_eq!(top_pa + layout.va_offset, GUEST_MEM_TOP_VA);
        assert_eq!(layout.va_offset % GIB, 0);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_down(PAGE_SIZE + 1, PAGE_SIZE), PAGE_SIZE);
    }
}
