// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Initial stack construction for the payload's main thread, per the
//! x86_64 psABI: environment and argument strings at the top, then the
//! auxiliary vector, environment and argument pointer arrays, and argc at
//! a 16-byte aligned stack pointer.

use crate::loader::LoadedPayload;
use crate::mem::{round_down, GUEST_STACK_SIZE, PAGE_SIZE};
use crate::{Gva, Machine};

/// Bound on the combined size of argument and environment strings.
pub const GUEST_ARG_MAX: u64 = 32 * PAGE_SIZE;

const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_FLAGS: u64 = 8;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_PLATFORM: u64 = 15;
const AT_CLKTCK: u64 = 17;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

const PLATFORM: &[u8] = b"X86_64\0";

/// The pointer arrays below the auxv are 8-byte entries; pad one pointer
/// when their count would leave argc off 16-byte alignment.
fn needs_pointer_pad(argc: usize, envc: usize) -> bool {
    (argc + envc) % 2 == 0
}

/// Auxiliary vector in push order: the null terminator first (it lands
/// highest in memory), AT_PAGESZ last.
fn build_auxv(payload: &LoadedPayload, platform_gva: Gva, execfn: Gva, at_random: Option<Gva>) -> Vec<(u64, u64)> {
    let guest = &payload.guest;
    let mut ents: Vec<(u64, u64)> = Vec::with_capacity(18);
    ents.push((0, 0));
    ents.push((AT_PLATFORM, platform_gva));
    ents.push((AT_EXECFN, execfn));
    if let Some(rnd) = at_random {
        ents.push((AT_RANDOM, rnd));
    }
    ents.push((AT_SECURE, 0));
    ents.push((AT_EGID, 0));
    ents.push((AT_GID, 0));
    ents.push((AT_EUID, 0));
    ents.push((AT_UID, 0));
    ents.push((AT_ENTRY, guest.entry()));
    ents.push((AT_FLAGS, 0));
    if let Some(dl) = &payload.dynlinker {
        ents.push((AT_BASE, dl.load_adjust));
    }
    ents.push((AT_PHNUM, guest.e_phnum));
    ents.push((AT_PHENT, guest.e_phentsize));
    ents.push((AT_PHDR, at_phdr(payload)));
    // SAFETY: sysconf is async-signal-safe and cannot fail for CLK_TCK.
    ents.push((AT_CLKTCK, unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64));
    ents.push((AT_PAGESZ, PAGE_SIZE));
    ents
}

/// AT_PHDR prefers an explicit PT_PHDR entry; otherwise the first PT_LOAD
/// locates the header table.
fn at_phdr(payload: &LoadedPayload) -> u64 {
    let guest = &payload.guest;
    for ph in &guest.phdrs {
        if ph.p_type == goblin::elf::program_header::PT_PHDR {
            return ph.p_vaddr + guest.load_adjust;
        }
    }
    for ph in &guest.phdrs {
        if ph.p_type == goblin::elf::program_header::PT_LOAD {
            return guest.e_phoff + ph.p_vaddr + guest.load_adjust;
        }
    }
    guest.load_adjust
}

impl Machine {
    /// Allocate the main-thread stack and lay out argv/envp/auxv on it.
    /// Returns the initial stack pointer (pointing at argc).
    pub fn init_main(&self, argv: &[String], envp: &[String]) -> Result<Gva, i64> {
        let payload = self
            .payload
            .lock()
            .unwrap()
            .clone()
            .expect("payload must be loaded before process init");

        let map_base = self.mmap_simple(GUEST_STACK_SIZE)?;
        let top = map_base + GUEST_STACK_SIZE;
        let mut sp = top;

        let push = |sp: &mut Gva, bytes: &[u8]| -> Result<Gva, i64> {
            *sp -= bytes.len() as u64;
            if top - *sp > GUEST_ARG_MAX {
                return Err(-(libc::E2BIG as i64));
            }
            self.write_guest(*sp, bytes)?;
            Ok(*sp)
        };

        let mut env_gvas = Vec::with_capacity(envp.len());
        for env in envp {
            let mut bytes = env.clone().into_bytes();
            bytes.push(0);
            env_gvas.push(push(&mut sp, &bytes)?);
        }
        sp = round_down(sp, 8);

        let mut arg_gvas = Vec::with_capacity(argv.len());
        for arg in argv.iter().rev() {
            let mut bytes = arg.clone().into_bytes();
            bytes.push(0);
            arg_gvas.push(push(&mut sp, &bytes)?);
        }
        arg_gvas.reverse();

        let platform_gva = push(&mut sp, PLATFORM)?;

        let mut rnd = [0u8; 16];
        // SAFETY: writes at most 16 bytes into the buffer.
        let got = unsafe { libc::getrandom(rnd.as_mut_ptr() as *mut libc::c_void, 16, 0) };
        let at_random = if got == 16 {
            Some(push(&mut sp, &rnd)?)
        } else {
            tracing::warn!(target: "monitor::load", got, "getrandom came up short, no AT_RANDOM");
            None
        };

        sp = round_down(sp, 16);
        if needs_pointer_pad(argv.len(), envp.len()) {
            sp -= 8;
        }

        let execfn = arg_gvas.first().copied().unwrap_or(0);
        let auxv = build_auxv(&payload, platform_gva, execfn, at_random);
        let auxv_bytes: Vec<u8> = auxv
            .iter()
            .rev()
            .flat_map(|(k, v)| {
                let mut b = k.to_le_bytes().to_vec();
                b.extend_from_slice(&v.to_le_bytes());
                b
            })
            .collect();
        sp -= auxv_bytes.len() as u64;
        self.write_guest(sp, &auxv_bytes)?;
        // Keep a copy for coredump notes.
        *self.auxv.lock().unwrap() = auxv_bytes;

        let mut ptrs: Vec<u8> = Vec::new();
        for gva in &env_gvas {
            ptrs.extend_from_slice(&gva.to_le_bytes());
        }
        ptrs.extend_from_slice(&0u64.to_le_bytes());
        sp -= ptrs.len() as u64;
        self.write_guest(sp, &ptrs)?;

        let mut ptrs: Vec<u8> = Vec::new();
        for gva in &arg_gvas {
            ptrs.extend_from_slice(&gva.to_le_bytes());
        }
        ptrs.extend_from_slice(&0u64.to_le_bytes());
        sp -= ptrs.len() as u64;
        self.write_guest(sp, &ptrs)?;

        sp -= 8;
        self.write_guest(sp, &(argv.len() as u64).to_le_bytes())?;
        debug_assert_eq!(sp % 16, 0);

        tracing::debug!(target: "monitor::load", stack_top = sp, map_base, "main stack ready");
        Ok(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Image;

    fn payload_fixture(dynlinker: bool) -> LoadedPayload {
        let image = Image {
            path: "payload".into(),
            e_entry: 0x20_1000,
            e_phoff: 64,
            e_phentsize: 56,
            e_phnum: 2,
            phdrs: vec![
                crate::loader::Phdr {
                    p_type: goblin::elf::program_header::PT_PHDR,
                    p_flags: 4,
                    p_offset: 64,
                    p_vaddr: 0x20_0040,
                    p_filesz: 112,
                    p_memsz: 112,
                },
                crate::loader::Phdr {
                    p_type: goblin::elf::program_header::PT_LOAD,
                    p_flags: 5,
                    p_offset: 0,
                    p_vaddr: 0x20_0000,
                    p_filesz: 0x1000,
                    p_memsz: 0x1000,
                },
            ],
            min_vaddr: 0x20_0000,
            load_adjust: 0,
        };
        LoadedPayload {
            dynlinker: if dynlinker {
                Some(Image {
                    load_adjust: 0x40_0000,
                    ..image.clone()
                })
            } else {
                None
            },
            guest: image,
            dlopen: None,
            intr_entry: None,
        }
    }

    #[test]
    fn pointer_pad_keeps_argc_aligned() {
        // Entries below the aligned point: auxv (16-byte each), the two
        // pointer arrays and argc. Padding applies exactly when the
        // pointer count is even.
        assert!(needs_pointer_pad(1, 1));
        assert!(!needs_pointer_pad(1, 2));
        assert!(needs_pointer_pad(2, 4));
        for argc in 0..5 {
            for envc in 0..5 {
                let pad = if needs_pointer_pad(argc, envc) { 1 } else { 0 };
                let words = (argc + 1) + (envc + 1) + 1 + pad;
                assert_eq!(words % 2, 0, "argc {} envc {}", argc, envc);
            }
        }
    }

    #[test]
    fn auxv_terminates_high_and_prefers_pt_phdr() {
        let payload = payload_fixture(false);
        let ents = build_auxv(&payload, 0x1000, 0x2000, Some(0x3000));
        // Push order: the null entry is first (highest address).
        assert_eq!(ents[0], (0, 0));
        let phdr = ents.iter().find(|(k, _)| *k == AT_PHDR).unwrap();
        assert_eq!(phdr.1, 0x20_0040);
        assert!(ents.iter().any(|(k, v)| *k == AT_ENTRY && *v == 0x20_1000));
        assert!(!ents.iter().any(|(k, _)| *k == AT_BASE));
    }

    #[test]
    fn auxv_carries_base_for_dynlinked_payloads() {
        let payload = payload_fixture(true);
        let ents = build_auxv(&payload, 0x1000, 0x2000, None);
        assert!(ents.iter().any(|(k, v)| *k == AT_BASE && *v == 0x40_0000));
        assert!(!ents.iter().any(|(k, _)| *k == AT_RANDOM));
    }
}
