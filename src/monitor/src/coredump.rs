// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ELF64 core file writer.
//!
//! One PT_LOAD per live guest region (the brk heap plus every busy mmap
//! interval) and a PT_NOTE carrying prpsinfo, one prstatus per vCPU, and
//! the saved auxv. Written with the world stopped, so the vCPU register
//! caches are current.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::mem::{GUEST_MEM_START_VA, PAGE_SIZE};
use crate::vcpu::VcpuState;
use crate::Machine;

const ET_CORE: u16 = 4;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_NOTE: u32 = 4;
const NT_PRSTATUS: u32 = 1;
const NT_PRPSINFO: u32 = 3;
const NT_AUXV: u32 = 6;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

fn bytes_of<T: Copy>(val: &T) -> &[u8] {
    // SAFETY: plain-old-data view of a repr(C) value.
    unsafe {
        std::slice::from_raw_parts(val as *const T as *const u8, std::mem::size_of::<T>())
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ElfPhdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// prstatus note body, x86_64 layout.
#[repr(C)]
#[derive(Clone, Copy)]
struct Prstatus {
    pr_info: [u32; 3],
    pr_cursig: u16,
    pad0: u16,
    pr_sigpend: u64,
    pr_sighold: u64,
    pr_pid: u32,
    pr_ppid: u32,
    pr_pgrp: u32,
    pr_sid: u32,
    pr_utime: [u64; 2],
    pr_stime: [u64; 2],
    pr_cutime: [u64; 2],
    pr_cstime: [u64; 2],
    pr_reg: [u64; 27],
    pr_fpvalid: u32,
    pad1: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Prpsinfo {
    pr_state: u8,
    pr_sname: u8,
    pr_zomb: u8,
    pr_nice: u8,
    pad0: u32,
    pr_flag: u64,
    pr_uid: u32,
    pr_gid: u32,
    pr_pid: u32,
    pr_ppid: u32,
    pr_pgrp: u32,
    pr_sid: u32,
    pr_fname: [u8; 16],
    pr_psargs: [u8; 80],
}

fn note(buf: &mut Vec<u8>, n_type: u32, desc: &[u8]) {
    const NAME: &[u8] = b"CORE\0";
    buf.extend_from_slice(&(NAME.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    buf.extend_from_slice(&n_type.to_le_bytes());
    buf.extend_from_slice(NAME);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf.extend_from_slice(desc);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn prot_to_pflags(prot: i32) -> u32 {
    let mut flags = 0;
    if prot & libc::PROT_READ != 0 {
        flags |= 4;
    }
    if prot & libc::PROT_WRITE != 0 {
        flags |= 2;
    }
    if prot & libc::PROT_EXEC != 0 {
        flags |= 1;
    }
    flags
}

impl Machine {
    /// Write an ELF core for the current (paused) guest state.
    pub fn write_coredump(&self, path: &Path, signo: i32) -> io::Result<()> {
        // Dumpable regions: the heap, then every busy interval.
        let mut regions: Vec<(u64, u64, u32)> = Vec::new();
        {
            let mem = self.mem_state();
            if mem.brk > GUEST_MEM_START_VA {
                regions.push((
                    GUEST_MEM_START_VA,
                    mem.brk - GUEST_MEM_START_VA,
                    4 | 2 | 1,
                ));
            }
        }
        {
            let mmaps = self.mmaps.lock().unwrap();
            for iv in mmaps.busy.values() {
                regions.push((iv.base, iv.size, prot_to_pflags(iv.prot)));
            }
        }

        let mut notes: Vec<u8> = Vec::new();
        let psinfo = self.build_prpsinfo();
        note(&mut notes, NT_PRPSINFO, bytes_of(&psinfo));
        {
            let table = self.vcpus.lock().unwrap();
            for vcpu in table.table.iter().flatten() {
                let inner = vcpu.inner.lock().unwrap();
                if inner.state == VcpuState::Done && vcpu.id != 0 {
                    continue;
                }
                let st = self.build_prstatus(
                    self.vcpu_tid(vcpu),
                    signo,
                    &inner.regs,
                    inner.guest_thr,
                );
                note(&mut notes, NT_PRSTATUS, bytes_of(&st));
            }
        }
        let auxv = self.auxv.lock().unwrap().clone();
        if !auxv.is_empty() {
            note(&mut notes, NT_AUXV, &auxv);
        }

        let phnum = regions.len() + 1;
        let headers = EHDR_SIZE + phnum * PHDR_SIZE;
        let note_offset = headers as u64;
        let mut data_offset =
            (note_offset + notes.len() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let mut phdrs: Vec<ElfPhdr> = Vec::with_capacity(phnum);
        phdrs.push(ElfPhdr {
            p_type: PT_NOTE,
            p_flags: 4,
            p_offset: note_offset,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: notes.len() as u64,
            p_memsz: 0,
            p_align: 4,
        });
        for (base, size, flags) in &regions {
            phdrs.push(ElfPhdr {
                p_type: PT_LOAD,
                p_flags: *flags,
                p_offset: data_offset,
                p_vaddr: *base,
                p_paddr: 0,
                p_filesz: *size,
                p_memsz: *size,
                p_align: PAGE_SIZE,
            });
            data_offset += (*size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        }

        let mut file = File::create(path)?;
        let mut ehdr = [0u8; EHDR_SIZE];
        ehdr[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ehdr[4] = 2; // ELFCLASS64
        ehdr[5] = 1; // little endian
        ehdr[6] = 1; // current version
        ehdr[16..18].copy_from_slice(&ET_CORE.to_le_bytes());
        ehdr[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        ehdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        ehdr[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        ehdr[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        ehdr[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        ehdr[56..58].copy_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum
        file.write_all(&ehdr)?;
        for ph in &phdrs {
            file.write_all(bytes_of(ph))?;
        }
        file.write_all(&notes)?;

        let mut written = note_offset + notes.len() as u64;
        let mut buf = vec![0u8; 64 * 1024];
        for (idx, (base, size, _)) in regions.iter().enumerate() {
            let target = phdrs[idx + 1].p_offset;
            while written < target {
                let pad = ((target - written) as usize).min(buf.len());
                buf[..pad].iter_mut().for_each(|b| *b = 0);
                file.write_all(&buf[..pad])?;
                written += pad as u64;
            }
            let mut done = 0u64;
            while done < *size {
                let chunk = (*size - done).min(buf.len() as u64) as usize;
                if self.read_guest(base + done, &mut buf[..chunk]).is_err() {
                    buf[..chunk].iter_mut().for_each(|b| *b = 0);
                }
                file.write_all(&buf[..chunk])?;
                done += chunk as u64;
                written += chunk as u64;
            }
        }
        tracing::info!(target: "monitor::vcpu", path = %path.display(), regions = regions.len(),
            "coredump written");
        Ok(())
    }

    fn build_prpsinfo(&self) -> Prpsinfo {
        let mut psinfo = Prpsinfo {
            pr_state: 0,
            pr_sname: b'R',
            pr_zomb: 0,
            pr_nice: 0,
            pad0: 0,
            pr_flag: 0,
            pr_uid: 0,
            pr_gid: 0,
            pr_pid: self.pid() as u32,
            pr_ppid: self.ppid() as u32,
            pr_pgrp: 0,
            pr_sid: 0,
            pr_fname: [0; 16],
            pr_psargs: [0; 80],
        };
        if let Some(payload) = self.payload.lock().unwrap().as_ref() {
            let name = payload.guest.path.as_bytes();
            let n = name.len().min(15);
            psinfo.pr_fname[..n].copy_from_slice(&name[name.len() - n..]);
            let n = name.len().min(79);
            psinfo.pr_psargs[..n].copy_from_slice(&name[..n]);
        }
        psinfo
    }

    fn build_prstatus(
        &self,
        tid: i32,
        signo: i32,
        regs: &kvm_bindings::kvm_regs,
        fs_base: u64,
    ) -> Prstatus {
        let mut st = Prstatus {
            pr_info: [signo as u32, 0, 0],
            pr_cursig: signo as u16,
            pad0: 0,
            pr_sigpend: 0,
            pr_sighold: 0,
            pr_pid: tid as u32,
            pr_ppid: self.ppid() as u32,
            pr_pgrp: 0,
            pr_sid: 0,
            pr_utime: [0; 2],
            pr_stime: [0; 2],
            pr_cutime: [0; 2],
            pr_cstime: [0; 2],
            pr_reg: [0; 27],
            pr_fpvalid: 0,
            pad1: 0,
        };
        // user_regs_struct order.
        st.pr_reg = [
            regs.r15, regs.r14, regs.r13, regs.r12, regs.rbp, regs.rbx, regs.r11, regs.r10,
            regs.r9, regs.r8, regs.rax, regs.rcx, regs.rdx, regs.rsi, regs.rdi,
            0, // orig_rax
            regs.rip,
            8, // cs
            regs.rflags, regs.rsp,
            16, // ss
            fs_base,
            0, // gs_base
            16, 16, 0, 0, // ds, es, fs, gs
        ];
        st
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn note_body_sizes_match_the_abi() {
        assert_eq!(std::mem::size_of::<Prstatus>(), 336);
        assert_eq!(std::mem::size_of::<Prpsinfo>(), 136);
        assert_eq!(std::mem::size_of::<ElfPhdr>(), PHDR_SIZE);
    }

    #[test]
    fn notes_are_four_byte_aligned() {
        let mut buf = Vec::new();
        note(&mut buf, NT_PRPSINFO, &[1, 2, 3]);
        assert_eq!(buf.len() % 4, 0);
        let namesz = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(namesz, 5);
        let descsz = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(descsz, 3);
    }
}
