// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest mmap/munmap/mprotect/mremap over the upper virtual region.
//!
//! Two ordered interval sets partition `[tbrk, GUEST_MEM_TOP_VA)` exactly:
//! `busy` holds live mappings, `free` holds carved-out holes. Adjacent
//! intervals with the same protection, flags and backing are merged, so
//! neither set ever contains two mergeable neighbors. Allocation without
//! MAP_FIXED is highest-address first fit from the free set, falling back
//! to growing tbrk downward.
//!
//! Host-side, the slot alias of every busy interval carries the interval's
//! protection and free intervals are PROT_NONE anonymous pages, which is
//! what turns guest protection violations into vCPU faults the dispatcher
//! converts to SIGSEGV.

use std::collections::BTreeMap;

use crate::mem::{round_up, GUEST_MEM_TOP_VA, PAGE_SIZE};
use crate::{Gva, Machine};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileBacking {
    /// Host file descriptor (already translated from the guest fd).
    pub fd: i32,
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Interval {
    pub base: Gva,
    pub size: u64,
    pub prot: i32,
    pub flags: i32,
    pub backing: Option<FileBacking>,
}

impl Interval {
    pub fn top(&self) -> Gva {
        self.base + self.size
    }
}

/// Busy/free interval lists, owned by `Machine::mmaps`.
#[derive(Default)]
pub struct MmapState {
    pub busy: BTreeMap<Gva, Interval>,
    pub free: BTreeMap<Gva, Interval>,
}

/// `lo` directly below `hi` with identical protection and compatible
/// backing (anonymous, or the same file with contiguous offsets).
fn mergeable(lo: &Interval, hi: &Interval) -> bool {
    if lo.top() != hi.base || lo.prot != hi.prot || lo.flags != hi.flags {
        return false;
    }
    match (&lo.backing, &hi.backing) {
        (None, None) => true,
        (Some(a), Some(b)) => a.fd == b.fd && a.offset + lo.size == b.offset,
        _ => false,
    }
}

fn insert_merged(map: &mut BTreeMap<Gva, Interval>, mut iv: Interval) {
    let prev_key = match map.range(..iv.base).next_back() {
        Some((k, prev)) if mergeable(prev, &iv) => Some(*k),
        _ => None,
    };
    if let Some(k) = prev_key {
        let prev = map.remove(&k).unwrap();
        iv = Interval {
            base: prev.base,
            size: prev.size + iv.size,
            backing: prev.backing,
            ..iv
        };
    }
    let next_key = match map.range(iv.top()..).next() {
        Some((k, next)) if mergeable(&iv, next) => Some(*k),
        _ => None,
    };
    if let Some(k) = next_key {
        let next = map.remove(&k).unwrap();
        iv.size += next.size;
    }
    map.insert(iv.base, iv);
}

/// Put a hole back on the free list. Free intervals are normalized
/// (PROT_NONE, no flags, no backing) so adjacency is the only merge rule.
fn insert_free(free: &mut BTreeMap<Gva, Interval>, base: Gva, size: u64) {
    insert_merged(
        free,
        Interval {
            base,
            size,
            prot: libc::PROT_NONE,
            flags: 0,
            backing: None,
        },
    );
}

/// Highest-address first fit: take `need` bytes from the top of the
/// highest free interval large enough.
fn carve_free(free: &mut BTreeMap<Gva, Interval>, need: u64) -> Option<Gva> {
    let key = free
        .iter()
        .rev()
        .find(|(_, iv)| iv.size >= need)
        .map(|(k, _)| *k)?;
    let mut iv = free.remove(&key).unwrap();
    let base = iv.top() - need;
    if iv.size > need {
        iv.size -= need;
        free.insert(iv.base, iv);
    }
    Some(base)
}

/// Remove exactly `[base, base + size)` from the free set. Fails (with the
/// set unchanged) unless the whole range is free.
fn take_free_exact(free: &mut BTreeMap<Gva, Interval>, base: Gva, size: u64) -> bool {
    let key = match free.range(..=base).next_back() {
        Some((k, iv)) if iv.top() >= base + size => *k,
        _ => return false,
    };
    let iv = free.remove(&key).unwrap();
    if iv.base < base {
        insert_free_raw(free, iv.base, base - iv.base);
    }
    if iv.top() > base + size {
        insert_free_raw(free, base + size, iv.top() - (base + size));
    }
    true
}

// Re-insert a remainder without the merge walk (it cannot merge: its
// neighbors were just carved away).
fn insert_free_raw(free: &mut BTreeMap<Gva, Interval>, base: Gva, size: u64) {
    free.insert(
        base,
        Interval {
            base,
            size,
            prot: libc::PROT_NONE,
            flags: 0,
            backing: None,
        },
    );
}

/// Split the busy interval containing `at` (if any) so that `at` becomes
/// an interval boundary.
fn split_busy_at(busy: &mut BTreeMap<Gva, Interval>, at: Gva) {
    let key = match busy.range(..at).next_back() {
        Some((k, iv)) if iv.top() > at => *k,
        _ => return,
    };
    let mut lo = busy.remove(&key).unwrap();
    let hi_size = lo.top() - at;
    lo.size = at - lo.base;
    let hi = Interval {
        base: at,
        size: hi_size,
        prot: lo.prot,
        flags: lo.flags,
        backing: lo.backing.as_ref().map(|fb| FileBacking {
            fd: fb.fd,
            offset: fb.offset + lo.size,
        }),
    };
    busy.insert(lo.base, lo);
    busy.insert(hi.base, hi);
}

/// Remove and return the busy intervals fully inside `[base, base+size)`,
/// splitting stragglers at the boundaries first.
fn remove_busy_range(busy: &mut BTreeMap<Gva, Interval>, base: Gva, size: u64) -> Vec<Interval> {
    split_busy_at(busy, base);
    split_busy_at(busy, base + size);
    let keys: Vec<Gva> = busy
        .range(base..base + size)
        .map(|(k, _)| *k)
        .collect();
    keys.into_iter().map(|k| busy.remove(&k).unwrap()).collect()
}

/// True if `[base, base+size)` is fully covered by busy intervals.
fn busy_covers(busy: &BTreeMap<Gva, Interval>, base: Gva, size: u64) -> bool {
    let mut cur = base;
    let end = base + size;
    let start = match busy.range(..=base).next_back() {
        Some((k, iv)) if iv.top() > base => *k,
        _ => base,
    };
    for (_, iv) in busy.range(start..end) {
        if iv.base > cur {
            return false;
        }
        cur = cur.max(iv.top());
        if cur >= end {
            return true;
        }
    }
    cur >= end
}

impl Machine {
    /// Anonymous read-write allocation used by the monitor itself, mostly
    /// for guest thread stacks.
    pub fn mmap_simple(&self, size: u64) -> Result<Gva, i64> {
        let ret = self.guest_mmap(
            0,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            None,
        );
        if ret < 0 {
            Err(ret)
        } else {
            Ok(ret as Gva)
        }
    }

    /// Guest-visible tbrk: the interval lists own the partition of the
    /// upper region, so the hypercall moves tbrk through them. Moving
    /// down exposes new free space; moving up requires the abandoned
    /// range to be entirely free.
    pub fn guest_tbrk(&self, new: Gva) -> i64 {
        if new == 0 {
            return self.mem_tbrk(0);
        }
        if new & (PAGE_SIZE - 1) != 0 {
            return -(libc::EINVAL as i64);
        }
        let mut st = self.mmaps.lock().unwrap();
        let cur = self.mem_state().tbrk;
        if new < cur {
            let ret = self.mem_tbrk(new);
            if ret >= 0 {
                insert_free(&mut st.free, new, cur - new);
            }
            ret
        } else if new > cur {
            if !take_free_exact(&mut st.free, cur, new - cur) {
                return -(libc::ENOMEM as i64);
            }
            let ret = self.mem_tbrk(new);
            if ret < 0 {
                insert_free(&mut st.free, cur, new - cur);
            }
            ret
        } else {
            new as i64
        }
    }

    /// Guest mmap. `backing` carries the already-translated host fd for
    /// file maps. Returns the mapped address or -errno.
    pub fn guest_mmap(
        &self,
        addr: Gva,
        size: u64,
        prot: i32,
        flags: i32,
        backing: Option<FileBacking>,
    ) -> i64 {
        if size == 0 {
            return -(libc::EINVAL as i64);
        }
        let fixed = flags & libc::MAP_FIXED != 0;
        if fixed && addr == 0 {
            return -(libc::EPERM as i64);
        }
        if fixed && addr & (PAGE_SIZE - 1) != 0 {
            return -(libc::EINVAL as i64);
        }
        if flags & (libc::MAP_PRIVATE | libc::MAP_SHARED) == 0 {
            return -(libc::EINVAL as i64);
        }
        if let Some(fb) = &backing {
            if fb.offset & (PAGE_SIZE - 1) != 0 {
                return -(libc::EINVAL as i64);
            }
        }
        let len = round_up(size, PAGE_SIZE);
        if len > GUEST_MEM_TOP_VA - self.layout.min_tbrk() {
            return -(libc::ENOMEM as i64);
        }

        let mut st = self.mmaps.lock().unwrap();
        let base = if fixed {
            if let Err(e) = self.fixed_carve_locked(&mut st, addr, len) {
                return e;
            }
            addr
        } else {
            match carve_free(&mut st.free, len) {
                Some(b) => b,
                None => match self.grow_for_locked(&mut st, len) {
                    Ok(b) => b,
                    Err(e) => return e,
                },
            }
        };

        if let Err(e) = self.apply_backing(base, len, prot, flags, &backing) {
            let _ = self.host_reset_anon(base, len);
            insert_free(&mut st.free, base, len);
            return e;
        }
        insert_merged(
            &mut st.busy,
            Interval {
                base,
                size: len,
                prot,
                flags,
                backing,
            },
        );
        tracing::debug!(target: "monitor::mem", base, len, prot, flags, "mmap");
        base as i64
    }

    /// Extend the upper region downward until `len` contiguous bytes are
    /// available at its bottom, consuming a free interval that already
    /// touches tbrk.
    fn grow_for_locked(&self, st: &mut MmapState, len: u64) -> Result<Gva, i64> {
        let tbrk = self.mem_state().tbrk;
        let avail = match st.free.get(&tbrk) {
            Some(iv) => iv.size,
            None => 0,
        };
        let grow = len - avail;
        let ret = self.mem_tbrk(tbrk - grow);
        if ret < 0 {
            return Err(-(libc::ENOMEM as i64));
        }
        if avail > 0 {
            st.free.remove(&tbrk);
        }
        Ok(tbrk - grow)
    }

    /// Make `[addr, addr+len)` available for a fixed-address mapping:
    /// grow tbrk over it if needed, evict busy overlap, take it from the
    /// free set.
    fn fixed_carve_locked(&self, st: &mut MmapState, addr: Gva, len: u64) -> Result<(), i64> {
        if addr < self.layout.min_tbrk() || addr + len > GUEST_MEM_TOP_VA {
            return Err(-(libc::ENOMEM as i64));
        }
        let tbrk = self.mem_state().tbrk;
        if addr < tbrk {
            if self.mem_tbrk(addr) < 0 {
                return Err(-(libc::ENOMEM as i64));
            }
            insert_free(&mut st.free, addr, tbrk - addr);
        }
        self.munmap_locked(st, addr, len)?;
        if !take_free_exact(&mut st.free, addr, len) {
            return Err(-(libc::ENOMEM as i64));
        }
        Ok(())
    }

    fn apply_backing(
        &self,
        base: Gva,
        len: u64,
        prot: i32,
        flags: i32,
        backing: &Option<FileBacking>,
    ) -> Result<(), i64> {
        match backing {
            Some(fb) => self.host_map_file(base, len, prot, flags, fb.fd, fb.offset),
            None => {
                self.host_mprotect(base, len, prot)?;
                self.host_zero(base, len)
            }
        }
    }

    /// Guest munmap. Unmapping pages that are not mapped is not an error;
    /// a misaligned address is.
    pub fn guest_munmap(&self, addr: Gva, size: u64) -> i64 {
        if addr & (PAGE_SIZE - 1) != 0 || size == 0 {
            return -(libc::EINVAL as i64);
        }
        let len = round_up(size, PAGE_SIZE);
        let mut st = self.mmaps.lock().unwrap();
        match self.munmap_locked(&mut st, addr, len) {
            Ok(()) => 0,
            Err(e) => e,
        }
    }

    fn munmap_locked(&self, st: &mut MmapState, addr: Gva, len: u64) -> Result<(), i64> {
        for iv in remove_busy_range(&mut st.busy, addr, len) {
            self.host_reset_anon(iv.base, iv.size)?;
            insert_free(&mut st.free, iv.base, iv.size);
        }
        Ok(())
    }

    /// Guest mprotect: all-or-nothing over busy intervals.
    pub fn guest_mprotect(&self, addr: Gva, size: u64, prot: i32) -> i64 {
        if addr & (PAGE_SIZE - 1) != 0 {
            return -(libc::EINVAL as i64);
        }
        if size == 0 {
            return 0;
        }
        let len = round_up(size, PAGE_SIZE);
        let mut st = self.mmaps.lock().unwrap();
        if !busy_covers(&st.busy, addr, len) {
            return -(libc::ENOMEM as i64);
        }
        if let Err(e) = self.host_mprotect(addr, len, prot) {
            return e;
        }
        split_busy_at(&mut st.busy, addr);
        split_busy_at(&mut st.busy, addr + len);
        let keys: Vec<Gva> = st.busy.range(addr..addr + len).map(|(k, _)| *k).collect();
        for k in keys {
            let mut iv = st.busy.remove(&k).unwrap();
            iv.prot = prot;
            insert_merged(&mut st.busy, iv);
        }
        tracing::debug!(target: "monitor::mem", addr, len, prot, "mprotect");
        0
    }

    /// Guest mremap. File-backed ranges are not remappable here.
    pub fn guest_mremap(
        &self,
        old: Gva,
        old_size: u64,
        new_size: u64,
        flags: i32,
        new_addr: Gva,
    ) -> i64 {
        const KNOWN: i32 = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED;
        if flags & !KNOWN != 0 {
            return -(libc::EINVAL as i64);
        }
        if flags & libc::MREMAP_FIXED != 0 && flags & libc::MREMAP_MAYMOVE == 0 {
            return -(libc::EINVAL as i64);
        }
        if old & (PAGE_SIZE - 1) != 0 || old_size == 0 || new_size == 0 {
            return -(libc::EINVAL as i64);
        }
        let fixed = flags & libc::MREMAP_FIXED != 0;
        if fixed && new_addr & (PAGE_SIZE - 1) != 0 {
            return -(libc::EINVAL as i64);
        }
        let old_len = round_up(old_size, PAGE_SIZE);
        let new_len = round_up(new_size, PAGE_SIZE);
        if fixed && (new_addr + new_len > old && new_addr < old + old_len) {
            return -(libc::EINVAL as i64);
        }

        let mut st = self.mmaps.lock().unwrap();
        if !busy_covers(&st.busy, old, old_len) {
            return -(libc::EFAULT as i64);
        }
        let has_file_backing = {
            split_busy_at(&mut st.busy, old);
            split_busy_at(&mut st.busy, old + old_len);
            st.busy
                .range(old..old + old_len)
                .any(|(_, iv)| iv.backing.is_some())
        };
        if has_file_backing {
            return -(libc::EINVAL as i64);
        }
        let prot = st.busy.range(old..).next().map(|(_, iv)| iv.prot).unwrap();
        let iv_flags = st
            .busy
            .range(old..)
            .next()
            .map(|(_, iv)| iv.flags)
            .unwrap();

        if !fixed && new_len == old_len {
            return old as i64;
        }
        if !fixed && new_len < old_len {
            // Shrink in place, leaving a hole above the survivor.
            return match self.munmap_locked(&mut st, old + new_len, old_len - new_len) {
                Ok(()) => old as i64,
                Err(e) => e,
            };
        }
        if !fixed && take_free_exact(&mut st.free, old + old_len, new_len - old_len) {
            // Grow in place.
            let ext = new_len - old_len;
            if let Err(e) = self
                .host_mprotect(old + old_len, ext, prot)
                .and_then(|_| self.host_zero(old + old_len, ext))
            {
                insert_free(&mut st.free, old + old_len, ext);
                return e;
            }
            insert_merged(
                &mut st.busy,
                Interval {
                    base: old + old_len,
                    size: ext,
                    prot,
                    flags: iv_flags,
                    backing: None,
                },
            );
            return old as i64;
        }
        if flags & libc::MREMAP_MAYMOVE == 0 {
            return -(libc::ENOMEM as i64);
        }

        // Move: allocate the destination, copy, free the old range.
        let dest = if fixed {
            if let Err(e) = self.fixed_carve_locked(&mut st, new_addr, new_len) {
                return e;
            }
            new_addr
        } else {
            match carve_free(&mut st.free, new_len) {
                Some(b) => b,
                None => match self.grow_for_locked(&mut st, new_len) {
                    Ok(b) => b,
                    Err(e) => return e,
                },
            }
        };
        let copy = old_len.min(new_len);
        let staging = self
            .host_mprotect(dest, new_len, libc::PROT_READ | libc::PROT_WRITE)
            .and_then(|_| self.host_zero(dest, new_len))
            .and_then(|_| {
                if prot & libc::PROT_READ == 0 {
                    self.host_mprotect(old, old_len, libc::PROT_READ)
                } else {
                    Ok(())
                }
            })
            .and_then(|_| self.copy_within_guest(dest, old, copy))
            .and_then(|_| self.host_mprotect(dest, new_len, prot));
        if let Err(e) = staging {
            let _ = self.host_reset_anon(dest, new_len);
            insert_free(&mut st.free, dest, new_len);
            return e;
        }
        insert_merged(
            &mut st.busy,
            Interval {
                base: dest,
                size: new_len,
                prot,
                flags: iv_flags,
                backing: None,
            },
        );
        if let Err(e) = self.munmap_locked(&mut st, old, old_len) {
            return e;
        }
        tracing::debug!(target: "monitor::mem", old, old_len, new_len, dest, "mremap moved");
        dest as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn anon(base: Gva, size: u64, prot: i32) -> Interval {
        Interval {
            base,
            size,
            prot,
            flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            backing: None,
        }
    }

    const M: u64 = 1 << 20;

    #[test]
    fn free_inserts_merge_adjacent() {
        let mut free = BTreeMap::new();
        insert_free(&mut free, 10 * M, M);
        insert_free(&mut free, 12 * M, M);
        assert_eq!(free.len(), 2);
        insert_free(&mut free, 11 * M, M);
        assert_eq!(free.len(), 1);
        let iv = free.values().next().unwrap();
        assert_eq!((iv.base, iv.size), (10 * M, 3 * M));
    }

    #[test]
    fn carve_takes_highest_fit_from_top() {
        let mut free = BTreeMap::new();
        insert_free(&mut free, 10 * M, 4 * M);
        insert_free(&mut free, 20 * M, 2 * M);
        // Both fit; the higher block wins and is consumed from its top.
        assert_eq!(carve_free(&mut free, 2 * M), Some(20 * M));
        // Now only the lower block fits; high end carved first.
        assert_eq!(carve_free(&mut free, 2 * M), Some(12 * M));
        assert_eq!(carve_free(&mut free, 2 * M), Some(10 * M));
        assert_eq!(carve_free(&mut free, M), None);
    }

    #[test]
    fn exact_take_splits_hole() {
        let mut free = BTreeMap::new();
        insert_free(&mut free, 10 * M, 10 * M);
        assert!(take_free_exact(&mut free, 12 * M, 2 * M));
        let bases: Vec<_> = free.values().map(|iv| (iv.base, iv.size)).collect();
        assert_eq!(bases, vec![(10 * M, 2 * M), (14 * M, 6 * M)]);
        // The taken range is gone.
        assert!(!take_free_exact(&mut free, 12 * M, M));
    }

    #[test]
    fn busy_split_keeps_file_offsets() {
        let mut busy = BTreeMap::new();
        let iv = Interval {
            base: 10 * M,
            size: 4 * M,
            prot: libc::PROT_READ,
            flags: libc::MAP_PRIVATE,
            backing: Some(FileBacking { fd: 7, offset: 0 }),
        };
        busy.insert(iv.base, iv);
        split_busy_at(&mut busy, 11 * M);
        let hi = busy.get(&(11 * M)).unwrap();
        assert_eq!(hi.backing.as_ref().unwrap().offset, M);
        assert_eq!(hi.size, 3 * M);
    }

    #[test]
    fn split_file_halves_remerge() {
        let mut busy = BTreeMap::new();
        busy.insert(
            10 * M,
            Interval {
                base: 10 * M,
                size: 4 * M,
                prot: libc::PROT_READ,
                flags: libc::MAP_PRIVATE,
                backing: Some(FileBacking { fd: 7, offset: 0 }),
            },
        );
        split_busy_at(&mut busy, 12 * M);
        let hi = busy.remove(&(12 * M)).unwrap();
        insert_merged(&mut busy, hi);
        assert_eq!(busy.len(), 1);
        assert_eq!(busy.get(&(10 * M)).unwrap().size, 4 * M);
    }

    #[test]
    fn coverage_detects_holes() {
        let mut busy = BTreeMap::new();
        busy.insert(10 * M, anon(10 * M, 2 * M, libc::PROT_READ));
        busy.insert(12 * M, anon(12 * M, 2 * M, libc::PROT_WRITE));
        busy.insert(16 * M, anon(16 * M, 2 * M, libc::PROT_READ));
        assert!(busy_covers(&busy, 10 * M, 4 * M));
        assert!(busy_covers(&busy, 11 * M, 2 * M));
        assert!(!busy_covers(&busy, 10 * M, 8 * M));
        assert!(!busy_covers(&busy, 14 * M, M));
        assert!(!busy_covers(&busy, 9 * M, 2 * M));
    }

    #[test]
    fn remove_range_trims_stragglers() {
        let mut busy = BTreeMap::new();
        busy.insert(10 * M, anon(10 * M, 8 * M, libc::PROT_READ));
        let removed = remove_busy_range(&mut busy, 12 * M, 2 * M);
        assert_eq!(removed.len(), 1);
        assert_eq!((removed[0].base, removed[0].size), (12 * M, 2 * M));
        let left: Vec<_> = busy.values().map(|iv| (iv.base, iv.size)).collect();
        assert_eq!(left, vec![(10 * M, 2 * M), (14 * M, 4 * M)]);
    }

    proptest! {
        /// Carving from the free set and putting the pieces back always
        /// restores a single merged hole: the partition never leaks or
        /// overlaps.
        #[test]
        fn carve_and_free_roundtrip(sizes in proptest::collection::vec(1u64..64, 1..16)) {
            let span = 1024 * M;
            let mut free = BTreeMap::new();
            insert_free(&mut free, 10 * M, span);
            let mut taken = Vec::new();
            for pages in &sizes {
                let need = pages * PAGE_SIZE;
                if let Some(base) = carve_free(&mut free, need) {
                    // No overlap with anything taken before.
                    for &(b, s) in &taken {
                        prop_assert!(base + need <= b || base >= b + s);
                    }
                    taken.push((base, need));
                }
            }
            for (b, s) in taken {
                insert_free(&mut free, b, s);
            }
            prop_assert_eq!(free.len(), 1);
            let iv = free.values().next().unwrap();
            prop_assert_eq!((iv.base, iv.size), (10 * M, span));
        }
    }
}
