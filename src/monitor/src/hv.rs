// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Thin adapter over the KVM device.
//!
//! Everything the monitor needs from the hypervisor goes through this
//! wrapper: VM and vCPU creation, user memory region registration, and the
//! CPU feature probes that size the guest physical address space.

use std::result;

use kvm_bindings::{kvm_userspace_memory_region, CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};

/// Errors encountered while talking to the hypervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("KVM API version {0} is not supported")]
    ApiVersion(i32),
}

pub type Result<T> = result::Result<T, Error>;

/// Minimum KVM API version the monitor is written against.
const KVM_API_VERSION: i32 = 12;

/// The hypervisor capability: an open `/dev/kvm` plus one VM.
///
/// A fork child replaces the whole thing (the inherited fds belong to the
/// parent's VM) and re-registers its memory slots against the new VM.
pub struct Hv {
    kvm: Kvm,
    vm: VmFd,
    supported_cpuid: CpuId,
    /// Width of the CPU physical address bus, from CPUID 0x8000_0008.
    pub phys_bits: u8,
    /// 1 GiB page support, from CPUID 0x8000_0001 EDX bit 26.
    pub pdpe1g: bool,
}

impl Hv {
    /// Open the KVM device and create a VM.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;
        let version = kvm.get_api_version();
        if version != KVM_API_VERSION {
            return Err(Error::ApiVersion(version));
        }
        let vm = kvm.create_vm().map_err(Error::KvmIoctl)?;
        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        let (phys_bits, pdpe1g) = probe_cpu_features();

        Ok(Hv {
            kvm,
            vm,
            supported_cpuid,
            phys_bits,
            pdpe1g,
        })
    }

    /// Drop the inherited VM and build a fresh one against a new KVM fd.
    ///
    /// Used in the fork child: the old fds reference the parent's VM and are
    /// useless here. Memory slots must be re-registered by the caller.
    pub fn recreate_vm(&mut self) -> Result<()> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;
        let vm = kvm.create_vm().map_err(Error::KvmIoctl)?;
        self.kvm = kvm;
        self.vm = vm;
        Ok(())
    }

    /// Register, resize or delete (size 0) a user memory region.
    pub fn set_memory_region(
        &self,
        slot: u32,
        guest_phys: u64,
        size: u64,
        host_addr: u64,
        flags: u32,
    ) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags,
            guest_phys_addr: guest_phys,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // SAFETY: host_addr points at a mapping owned by the memory manager
        // which outlives the region registration.
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(Error::KvmIoctl)
        }
    }

    /// Set the 3-page TSS range the VMX backend requires. Must not overlap
    /// any memory slot; the memory manager points it at the never-plugged
    /// top 2 MiB of guest physical memory.
    pub fn set_tss_addr(&self, addr: u64) -> Result<()> {
        self.vm
            .set_tss_address(addr as usize)
            .map_err(Error::KvmIoctl)
    }

    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd> {
        self.vm.create_vcpu(id).map_err(Error::KvmIoctl)
    }

    pub fn supported_cpuid(&self) -> CpuId {
        self.supported_cpuid.clone()
    }
}

/// Probe host CPUID for the physical address bus width and 1 GiB page
/// support. Both bound what the memory manager may map for the guest.
fn probe_cpu_features() -> (u8, bool) {
    // SAFETY: the cpuid instruction is always available on x86_64.
    let max_ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) }.eax;

    let phys_bits = if max_ext >= 0x8000_0008 {
        // SAFETY: leaf is within the supported extended range.
        (unsafe { core::arch::x86_64::__cpuid(0x8000_0008) }.eax & 0xff) as u8
    } else {
        36
    };
    let pdpe1g = if max_ext >= 0x8000_0001 {
        // SAFETY: leaf is within the supported extended range.
        unsafe { core::arch::x86_64::__cpuid(0x8000_0001) }.edx & (1 << 26) != 0
    } else {
        false
    };
    (phys_bits, pdpe1g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_probe_reports_sane_bus_width() {
        let (phys_bits, _) = probe_cpu_features();
        assert!(phys_bits >= 32 && phys_bits <= 52);
    }
}
