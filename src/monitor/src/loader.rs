// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ELF payload loader.
//!
//! Loads the payload image (and, for dynamically linked payloads, the
//! dynamic linker named by PT_INTERP) into guest memory through the brk
//! region. ET_EXEC images keep their literal addresses; ET_DYN images are
//! placed at the bottom of the guest address space and the shift is
//! recorded so the dynamic linker and coredumps can reconstruct it.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;

use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::sym::{STB_GLOBAL, STT_FUNC};
use goblin::elf::{header, Elf};

use crate::mem::{round_up, GUEST_MEM_START_VA, PAGE_SIZE};
use crate::{Gva, Machine};

/// Runtime entry point the dynamic linker exports for monitor-driven
/// dlopen (snapshot restore loads shared objects through it).
const DLOPEN_SYM: &str = "__rt_dlopen";

/// Interrupt stub table exported by the payload runtime; vector `n` is a
/// 16-byte stub at `__rt_intr_entry + n * 16` that reports the exception
/// through a hypercall.
const INTR_SYM: &str = "__rt_intr_entry";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open payload {0}: {1}")]
    Open(String, std::io::Error),
    #[error("cannot parse ELF {0}: {1}")]
    Parse(String, goblin::error::Error),
    #[error("not a 64 bit LSB ELF")]
    Format,
    #[error("machine is not x86_64")]
    Machine,
    #[error("not a current-version ELF")]
    Version,
    #[error("ELF type must be ET_EXEC or ET_DYN")]
    Type,
    #[error("PT_LOAD below the guest address space: {0:#x}")]
    Layout(u64),
    #[error("no memory to load ELF segment at {0:#x}")]
    NoMemory(u64),
    #[error("cannot map ELF segment at {0:#x}: errno {1}")]
    Map(u64, i64),
    #[error("PT_INTERP string is not valid")]
    Interp,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

/// One loaded ELF image: the payload itself or its dynamic linker.
#[derive(Debug, Clone)]
pub struct Image {
    pub path: String,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_phentsize: u64,
    pub e_phnum: u64,
    pub phdrs: Vec<Phdr>,
    pub min_vaddr: u64,
    pub load_adjust: u64,
}

impl Image {
    pub fn entry(&self) -> Gva {
        self.e_entry + self.load_adjust
    }
}

/// Everything the process initializer and coredumper need to know about
/// what was loaded.
#[derive(Debug, Clone)]
pub struct LoadedPayload {
    pub guest: Image,
    pub dynlinker: Option<Image>,
    /// Monitor-callable dlopen entry inside the dynamic linker.
    pub dlopen: Option<Gva>,
    /// Base of the runtime's exception stub table.
    pub intr_entry: Option<Gva>,
}

impl LoadedPayload {
    /// Where vCPU 0 starts: the dynamic linker when there is one.
    pub fn start_rip(&self) -> Gva {
        match &self.dynlinker {
            Some(dl) => dl.entry(),
            None => self.guest.entry(),
        }
    }
}

fn validate(elf: &Elf) -> Result<()> {
    let ident = &elf.header.e_ident;
    if ident[header::EI_CLASS] != header::ELFCLASS64
        || ident[header::EI_DATA] != header::ELFDATA2LSB
    {
        return Err(Error::Format);
    }
    if elf.header.e_machine != header::EM_X86_64 {
        return Err(Error::Machine);
    }
    if elf.header.e_version != header::EV_CURRENT as u32 {
        return Err(Error::Version);
    }
    if elf.header.e_type != header::ET_EXEC && elf.header.e_type != header::ET_DYN {
        return Err(Error::Type);
    }
    Ok(())
}

fn prot_from_elf(p_flags: u32) -> i32 {
    let mut prot = 0;
    if p_flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if p_flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if p_flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn phdrs_of(elf: &Elf) -> Vec<Phdr> {
    elf.program_headers
        .iter()
        .map(|ph| Phdr {
            p_type: ph.p_type,
            p_flags: ph.p_flags,
            p_offset: ph.p_offset,
            p_vaddr: ph.p_vaddr,
            p_filesz: ph.p_filesz,
            p_memsz: ph.p_memsz,
        })
        .collect()
}

fn min_load_vaddr(phdrs: &[Phdr]) -> u64 {
    phdrs
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.p_vaddr)
        .min()
        .unwrap_or(0)
}

/// Look up a global function symbol in the image's symtab.
fn find_symbol(elf: &Elf, name: &str) -> Option<u64> {
    for sym in elf.syms.iter() {
        if sym.st_bind() != STB_GLOBAL || sym.st_type() != STT_FUNC {
            continue;
        }
        if let Some(Ok(sym_name)) = elf.strtab.get(sym.st_name) {
            if sym_name == name {
                return Some(sym.st_value);
            }
        }
    }
    None
}

impl Machine {
    /// Map one PT_LOAD extent: grow brk over it, map the file bytes, zero
    /// the BSS tail and apply the segment protection.
    fn load_extent(&self, fd: i32, phdr: &Phdr, adjust: u64) -> Result<()> {
        let addr = phdr.p_vaddr + adjust;
        let top = addr + phdr.p_memsz;
        if addr < GUEST_MEM_START_VA {
            return Err(Error::Layout(addr));
        }
        tracing::debug!(target: "monitor::load", addr, top, filesz = phdr.p_filesz, "load extent");

        if top > self.mem_brk(0) as u64 && self.mem_brk(top) != top as i64 {
            return Err(Error::NoMemory(top));
        }

        // Map on page boundaries; the segment start may sit inside a page.
        let extra = addr & (PAGE_SIZE - 1);
        if phdr.p_filesz > 0 {
            self.host_map_file(
                addr - extra,
                phdr.p_filesz + extra,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE,
                fd,
                phdr.p_offset - extra,
            )
            .map_err(|e| Error::Map(addr, e))?;
        }
        // Zero from the end of the file bytes to the later of the segment
        // end and the end of the last file-backed page: a later brk grow
        // must not expose stale file bytes from the page tail. brk covers
        // the tail page so the write goes through the guest accessors.
        let file_end = addr + phdr.p_filesz;
        let zero_end = top.max(round_up(file_end, PAGE_SIZE));
        if zero_end > self.mem_brk(0) as u64 && self.mem_brk(zero_end) != zero_end as i64 {
            return Err(Error::NoMemory(zero_end));
        }
        if zero_end > file_end {
            let zeros = vec![0u8; (zero_end - file_end) as usize];
            self.write_guest(file_end, &zeros)
                .map_err(|e| Error::Map(file_end, e))?;
        }

        let prot = self.protection_adjust(prot_from_elf(phdr.p_flags));
        self.host_mprotect(addr - extra, phdr.p_memsz + extra, prot)
            .map_err(|e| Error::Map(addr, e))?;
        Ok(())
    }

    /// Load the dynamic linker right above the payload's brk.
    fn load_dynlink(&self, path: &str) -> Result<(Image, Option<Gva>, Option<Gva>)> {
        let mut file = File::open(path).map_err(|e| Error::Open(path.to_string(), e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::Open(path.to_string(), e))?;
        let elf = Elf::parse(&bytes).map_err(|e| Error::Parse(path.to_string(), e))?;
        validate(&elf)?;

        let mut base = self.mem_brk(0) as u64;
        if base != round_up(base, PAGE_SIZE) {
            base = round_up(base, PAGE_SIZE);
            if self.mem_brk(base) != base as i64 {
                return Err(Error::NoMemory(base));
            }
        }

        let phdrs = phdrs_of(&elf);
        let min_vaddr = min_load_vaddr(&phdrs);
        let adjust = base - min_vaddr;
        for phdr in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
            self.load_extent(file.as_raw_fd(), phdr, adjust)?;
        }

        let dlopen = find_symbol(&elf, DLOPEN_SYM).map(|v| v + adjust);
        let intr = find_symbol(&elf, INTR_SYM).map(|v| v + adjust);
        tracing::info!(target: "monitor::load", path, adjust, "dynamic linker loaded");

        Ok((
            Image {
                path: path.to_string(),
                e_entry: elf.header.e_entry,
                e_phoff: elf.header.e_phoff,
                e_phentsize: elf.header.e_phentsize as u64,
                e_phnum: elf.header.e_phnum as u64,
                phdrs,
                min_vaddr,
                load_adjust: adjust,
            },
            dlopen,
            intr,
        ))
    }

    /// Load the payload ELF and, if it names one, its dynamic linker.
    pub fn load_payload(&self, path: &str) -> Result<()> {
        let mut file = File::open(path).map_err(|e| Error::Open(path.to_string(), e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::Open(path.to_string(), e))?;
        let elf = Elf::parse(&bytes).map_err(|e| Error::Parse(path.to_string(), e))?;
        validate(&elf)?;

        let phdrs = phdrs_of(&elf);
        let min_vaddr = min_load_vaddr(&phdrs);
        // ET_EXEC carries literal addresses; ET_DYN (PIE or dynamic linker
        // style payloads) is placed at the start of guest memory.
        let adjust = match elf.header.e_type {
            header::ET_EXEC => 0,
            _ => GUEST_MEM_START_VA - min_vaddr,
        };
        tracing::info!(target: "monitor::load", path, min_vaddr, adjust, "loading payload");

        for phdr in phdrs.iter().filter(|ph| ph.p_type == PT_LOAD) {
            self.load_extent(file.as_raw_fd(), phdr, adjust)?;
        }

        let mut intr_entry = find_symbol(&elf, INTR_SYM).map(|v| v + adjust);
        let mut dlopen = None;
        let dynlinker = match elf.interpreter {
            Some(interp) if !interp.is_empty() => {
                let interp = interp.to_string();
                let (image, dl_dlopen, dl_intr) = self.load_dynlink(&interp)?;
                dlopen = dl_dlopen;
                if intr_entry.is_none() {
                    intr_entry = dl_intr;
                }
                Some(image)
            }
            Some(_) => return Err(Error::Interp),
            None => None,
        };

        let payload = LoadedPayload {
            guest: Image {
                path: path.to_string(),
                e_entry: elf.header.e_entry,
                e_phoff: elf.header.e_phoff,
                e_phentsize: elf.header.e_phentsize as u64,
                e_phnum: elf.header.e_phnum as u64,
                phdrs,
                min_vaddr,
                load_adjust: adjust,
            },
            dynlinker,
            dlopen,
            intr_entry,
        };
        *self.payload.lock().unwrap() = Some(payload);
        Ok(())
    }

    /// Hook for debugger-driven loads that need text pages writable.
    fn protection_adjust(&self, prot: i32) -> i32 {
        if self.load_writable {
            prot | libc::PROT_WRITE
        } else {
            prot
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal ELF64 header bytes with the given type/machine/class.
    fn ehdr_bytes(class: u8, data: u8, machine: u16, e_type: u16, version: u32) -> Vec<u8> {
        let mut b = vec![0u8; 64];
        b[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        b[4] = class;
        b[5] = data;
        b[6] = 1; // ident version
        b[16..18].copy_from_slice(&e_type.to_le_bytes());
        b[18..20].copy_from_slice(&machine.to_le_bytes());
        b[20..24].copy_from_slice(&version.to_le_bytes());
        // e_ehsize / e_phentsize left zero; goblin tolerates them for a
        // header-only image.
        b
    }

    fn parse_and_validate(bytes: &[u8]) -> Result<()> {
        let elf = Elf::parse(bytes).map_err(|e| Error::Parse("test".into(), e))?;
        validate(&elf)
    }

    #[test]
    fn accepts_x86_64_exec_and_dyn() {
        for e_type in &[header::ET_EXEC, header::ET_DYN] {
            let b = ehdr_bytes(
                header::ELFCLASS64,
                header::ELFDATA2LSB,
                header::EM_X86_64,
                *e_type,
                header::EV_CURRENT as u32,
            );
            assert!(parse_and_validate(&b).is_ok());
        }
    }

    #[test]
    fn rejects_wrong_machine() {
        let b = ehdr_bytes(
            header::ELFCLASS64,
            header::ELFDATA2LSB,
            header::EM_AARCH64,
            header::ET_EXEC,
            header::EV_CURRENT as u32,
        );
        assert!(matches!(parse_and_validate(&b), Err(Error::Machine)));
    }

    #[test]
    fn rejects_relocatable_objects() {
        let b = ehdr_bytes(
            header::ELFCLASS64,
            header::ELFDATA2LSB,
            header::EM_X86_64,
            header::ET_REL,
            header::EV_CURRENT as u32,
        );
        assert!(matches!(parse_and_validate(&b), Err(Error::Type)));
    }

    #[test]
    fn segment_protection_mapping() {
        assert_eq!(prot_from_elf(PF_R), libc::PROT_READ);
        assert_eq!(
            prot_from_elf(PF_R | PF_X),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(
            prot_from_elf(PF_R | PF_W),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(prot_from_elf(0), 0);
    }
}
