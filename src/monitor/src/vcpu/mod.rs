// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! vCPU lifecycle and scheduling: one host thread per guest thread.
//!
//! There is no monitor-wide event loop. Each vCPU host thread blocks in
//! the hypervisor's run operation until the guest traps out, handles the
//! exit, and re-enters. Cross-thread coordination happens at hypercall
//! boundaries: pause requests, pending signals and shutdown are all
//! checked there, and a vCPU stuck inside the guest is kicked out with a
//! host signal that interrupts the run ioctl.
//!
//! A vCPU that finishes its guest thread parks on its condvar and goes to
//! the idle pool; `vcpu_get` hands it out again with fresh thread state
//! but the same hypervisor fd.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use kvm_bindings::{kvm_fpu, kvm_regs, kvm_sregs};
use kvm_ioctls::{VcpuExit, VcpuFd};
use vmm_sys_util::signal::Killable;

use crate::hc::{self, HcAction};
use crate::signal::{DeliverOutcome, GuestSiginfo, GuestStackT, SEGV_ACCERR, SEGV_MAPERR};
use crate::{Gva, Machine};

mod gdt;

pub const MAX_VCPUS: usize = 128;

/// Host signal used to knock vCPU threads out of the run ioctl.
pub(crate) fn kick_signal() -> i32 {
    vmm_sys_util::signal::SIGRTMIN()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Starting,
    Hypercall,
    InGuest,
    Paused,
    Done,
}

pub struct VcpuInner {
    pub state: VcpuState,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub fpu: kvm_fpu,
    /// The register cache mirrors the hypervisor state.
    pub regs_valid: bool,
    /// The cache was modified and must be written back before entry.
    pub regs_dirty: bool,
    pub sregs_dirty: bool,
    pub fpu_dirty: bool,
    pub stack_top: Gva,
    /// Guest TLS base, written through to FS.
    pub guest_thr: Gva,
    pub set_child_tid: Gva,
    pub clear_child_tid: Gva,
    pub sigmask: u64,
    pub altstack: GuestStackT,
    pub pending: std::collections::VecDeque<GuestSiginfo>,
    pub delayed_munmap: Option<(Gva, u64)>,
}

fn boot_fpu() -> kvm_fpu {
    kvm_fpu {
        fcw: 0x37f,
        mxcsr: 0x1f80,
        ..Default::default()
    }
}

impl VcpuInner {
    fn new(sregs: kvm_sregs) -> VcpuInner {
        VcpuInner {
            state: VcpuState::Starting,
            regs: kvm_regs {
                rflags: 0x2,
                ..Default::default()
            },
            sregs,
            fpu: boot_fpu(),
            regs_valid: true,
            regs_dirty: true,
            sregs_dirty: true,
            fpu_dirty: true,
            stack_top: 0,
            guest_thr: 0,
            set_child_tid: 0,
            clear_child_tid: 0,
            sigmask: 0,
            altstack: GuestStackT::default(),
            pending: std::collections::VecDeque::new(),
            delayed_munmap: None,
        }
    }

    fn reset_for_reuse(&mut self, sregs: kvm_sregs) {
        *self = VcpuInner::new(sregs);
    }
}

pub struct Vcpu {
    pub id: u32,
    /// The hypervisor fd, run by the owning host thread. `None` only in a
    /// fork child while the table is being torn down.
    pub fd: Mutex<Option<VcpuFd>>,
    pub inner: Mutex<VcpuInner>,
    pub cv: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Vcpu {
    /// Interrupt this vCPU's host thread so it reaches a hypercall
    /// boundary. No-op when the thread is parked.
    pub fn kick(&self) {
        let t = self.thread.lock().unwrap();
        if let Some(handle) = t.as_ref() {
            let _ = handle.kill(kick_signal());
        }
    }

    /// Drop the hypervisor fd (fork child teardown).
    pub(crate) fn take_fd(&self) -> Option<VcpuFd> {
        self.fd.lock().unwrap().take()
    }
}

/// The vCPU table and idle pool, owned by `Machine::vcpus`.
pub struct VcpuTable {
    pub table: Vec<Option<Arc<Vcpu>>>,
    pub idle: Vec<u32>,
    /// vCPUs whose host thread is inside the run loop.
    pub running: usize,
}

impl VcpuTable {
    pub fn new() -> VcpuTable {
        VcpuTable {
            table: Vec::new(),
            idle: Vec::new(),
            running: 0,
        }
    }
}

/// Stop-the-world coordination, owned by `Machine::pause`.
pub struct PauseCtl {
    pub stop: bool,
    pub paused: usize,
}

/// Refresh the register cache from the hypervisor unless the cache is
/// already authoritative.
pub(crate) fn sync_regs_with(fd: &VcpuFd, inner: &mut VcpuInner) -> Result<(), i64> {
    if !inner.regs_valid {
        inner.regs = fd.get_regs().map_err(|_| -(libc::EIO as i64))?;
        inner.regs_valid = true;
    }
    Ok(())
}

impl Machine {
    pub fn vcpu_tid(&self, vcpu: &Vcpu) -> i32 {
        self.pid() + vcpu.id as i32
    }

    /// Pop an idle vCPU or create a fresh one, bounded by `MAX_VCPUS`.
    pub fn vcpu_get(&self) -> Option<Arc<Vcpu>> {
        let template = *self.sregs_template.lock().unwrap();
        let mut table = self.vcpus.lock().unwrap();
        if let Some(id) = table.idle.pop() {
            let vcpu = table.table[id as usize].clone().unwrap();
            vcpu.inner.lock().unwrap().reset_for_reuse(template);
            tracing::debug!(target: "monitor::vcpu", id, "vcpu reused");
            return Some(vcpu);
        }
        let id = table.table.len();
        if id >= MAX_VCPUS {
            return None;
        }
        let hv = self.hv.read().unwrap();
        let fd = match hv.create_vcpu(id as u64) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::warn!(target: "monitor::vcpu", id, error = %e, "create_vcpu failed");
                return None;
            }
        };
        if fd.set_cpuid2(&hv.supported_cpuid()).is_err() {
            return None;
        }
        drop(hv);
        let vcpu = Arc::new(Vcpu {
            id: id as u32,
            fd: Mutex::new(Some(fd)),
            inner: Mutex::new(VcpuInner::new(template)),
            cv: Condvar::new(),
            thread: Mutex::new(None),
        });
        table.table.push(Some(vcpu.clone()));
        tracing::debug!(target: "monitor::vcpu", id, "vcpu created");
        Some(vcpu)
    }

    /// Return a vCPU to the idle pool.
    pub fn vcpu_put(&self, vcpu: &Arc<Vcpu>) {
        let mut table = self.vcpus.lock().unwrap();
        vcpu.inner.lock().unwrap().state = VcpuState::Done;
        table.idle.push(vcpu.id);
    }

    /// Start (or restart) guest execution on a prepared vCPU: spawns the
    /// host thread on first use, wakes the parked thread on reuse.
    pub fn vcpu_activate(self: &Arc<Self>, vcpu: &Arc<Vcpu>) -> Result<(), crate::Error> {
        self.vcpus.lock().unwrap().running += 1;
        vcpu.inner.lock().unwrap().state = VcpuState::Hypercall;

        let mut thread = vcpu.thread.lock().unwrap();
        if thread.is_none() {
            let machine = self.clone();
            let vc = vcpu.clone();
            let handle = std::thread::Builder::new()
                .name(format!("vcpu{}", vcpu.id))
                .spawn(move || vcpu_thread_main(machine, vc))
                .map_err(crate::Error::Io)?;
            *thread = Some(handle);
        } else {
            vcpu.cv.notify_all();
        }
        Ok(())
    }

    pub(crate) fn vcpu_sync_regs(&self, vcpu: &Arc<Vcpu>) -> Result<(), i64> {
        let fdg = vcpu.fd.lock().unwrap();
        let fd = fdg.as_ref().ok_or(-(libc::EIO as i64))?;
        sync_regs_with(fd, &mut vcpu.inner.lock().unwrap())
    }

    /// clone(CLONE_THREAD): new vCPU sharing the address space, entered at
    /// the parent's next instruction with RAX = 0 and the supplied stack.
    pub fn guest_clone(
        self: &Arc<Self>,
        vcpu: &Arc<Vcpu>,
        flags: u64,
        child_stack: Gva,
        ptid: Gva,
        ctid: Gva,
        newtls: Gva,
    ) -> i64 {
        let child_stack = child_stack & !0x7;
        if self.gva_to_kma(child_stack.wrapping_sub(8)).is_none() {
            return -(libc::EINVAL as i64);
        }
        let new_vcpu = match self.vcpu_get() {
            Some(v) => v,
            None => return -(libc::EAGAIN as i64),
        };
        {
            let parent = vcpu.inner.lock().unwrap();
            let mut child = new_vcpu.inner.lock().unwrap();
            child.regs = parent.regs;
            child.regs.rsp = child_stack;
            child.regs.rax = 0;
            child.regs_valid = true;
            child.regs_dirty = true;
            child.stack_top = child_stack;
            child.sigmask = parent.sigmask;
            if flags & libc::CLONE_SETTLS as u64 != 0 {
                child.guest_thr = newtls;
                child.sregs.fs.base = newtls;
                child.sregs_dirty = true;
            }
            if flags & libc::CLONE_CHILD_SETTID as u64 != 0 {
                child.set_child_tid = ctid;
            }
            if flags & libc::CLONE_CHILD_CLEARTID as u64 != 0 {
                child.clear_child_tid = ctid;
            }
        }
        let tid = self.vcpu_tid(&new_vcpu);
        if flags & libc::CLONE_PARENT_SETTID as u64 != 0 && ptid != 0 {
            let _ = self.write_obj(ptid, &tid);
        }
        let set_tid = new_vcpu.inner.lock().unwrap().set_child_tid;
        if set_tid != 0 {
            let _ = self.write_obj(set_tid, &tid);
        }
        {
            let inner = new_vcpu.inner.lock().unwrap();
            tracing::debug!(target: "monitor::vcpu", id = new_vcpu.id, rip = inner.regs.rip,
                rsp = inner.regs.rsp, "starting cloned thread");
        }
        if self.vcpu_activate(&new_vcpu).is_err() {
            self.vcpu_put(&new_vcpu);
            return -(libc::EAGAIN as i64);
        }
        tid as i64
    }

    pub fn guest_set_tid_address(&self, vcpu: &Arc<Vcpu>, tidptr: Gva) -> i64 {
        vcpu.inner.lock().unwrap().clear_child_tid = tidptr;
        self.vcpu_tid(vcpu) as i64
    }

    /// Guest thread exit: honor the clear_child_tid protocol, run the
    /// delayed unmap of the thread stack, and recycle the vCPU. Exiting
    /// the last thread ends the payload.
    pub(crate) fn vcpu_thread_exit(&self, vcpu: &Arc<Vcpu>, status: i32) {
        let (ctid, delayed) = {
            let mut inner = vcpu.inner.lock().unwrap();
            (inner.clear_child_tid, inner.delayed_munmap.take())
        };
        if ctid != 0 && self.write_obj(ctid, &0u32).is_ok() {
            if let Some(ptr) = self.gva_to_kma(ctid) {
                // SAFETY: futex wake on a valid guest address alias.
                unsafe {
                    libc::syscall(libc::SYS_futex, ptr, libc::FUTEX_WAKE, 1, 0, 0, 0);
                }
            }
        }
        if let Some((base, size)) = delayed {
            self.guest_munmap(base, size);
        }
        self.vcpu_put(vcpu);
        let last = {
            let mut table = self.vcpus.lock().unwrap();
            table.running -= 1;
            table.running == 0
        };
        tracing::debug!(target: "monitor::vcpu", id = vcpu.id, status, last, "thread exited");
        if last && !self.is_shutdown() {
            self.request_shutdown(status & 0xff);
        }
    }

    /// Stop-the-world: ask every running vCPU to park at its next
    /// hypercall boundary and wait until they have. Kicks are re-posted
    /// on a short period to close the window where a vCPU re-entered the
    /// guest just before the request landed.
    pub fn pause_all(&self) {
        let mut ctl = self.pause.lock().unwrap();
        ctl.stop = true;
        loop {
            let need = self.vcpus.lock().unwrap().running;
            if ctl.paused >= need {
                break;
            }
            let kick_list: Vec<Arc<Vcpu>> = {
                let table = self.vcpus.lock().unwrap();
                table.table.iter().flatten().cloned().collect()
            };
            for vcpu in kick_list {
                let state = vcpu.inner.lock().unwrap().state;
                if state == VcpuState::InGuest || state == VcpuState::Hypercall {
                    vcpu.kick();
                }
            }
            let (guard, _) = self
                .pause_cv
                .wait_timeout(ctl, Duration::from_millis(10))
                .unwrap();
            ctl = guard;
        }
        tracing::debug!(target: "monitor::vcpu", paused = ctl.paused, "world stopped");
    }

    pub fn resume_all(&self) {
        let mut ctl = self.pause.lock().unwrap();
        ctl.stop = false;
        drop(ctl);
        self.pause_cv.notify_all();
    }

    /// Hypercall-boundary pause point. Refreshes the register cache on
    /// entry so the pauser (fork, coredump) sees current state.
    fn check_pause(&self, vcpu: &Arc<Vcpu>) {
        if !self.pause.lock().unwrap().stop {
            return;
        }
        let _ = self.vcpu_sync_regs(vcpu);
        let mut ctl = self.pause.lock().unwrap();
        if !ctl.stop {
            return;
        }
        vcpu.inner.lock().unwrap().state = VcpuState::Paused;
        ctl.paused += 1;
        self.pause_cv.notify_all();
        while ctl.stop {
            ctl = self.pause_cv.wait(ctl).unwrap();
        }
        ctl.paused -= 1;
        vcpu.inner.lock().unwrap().state = VcpuState::Hypercall;
    }

    /// One pass of the vCPU loop: boundary work, then enter the guest and
    /// demultiplex the exit. Returns when the guest thread is done or the
    /// machine is shutting down.
    fn run_vcpu(&self, vcpu: &Arc<Vcpu>) {
        loop {
            if self.is_shutdown() {
                return;
            }
            self.drain_host_signals();
            self.check_pause(vcpu);
            if self.is_shutdown() {
                return;
            }
            if let Some(si) = self.next_signal(vcpu) {
                if self.vcpu_sync_regs(vcpu).is_err() {
                    self.request_shutdown(128 + libc::SIGSEGV);
                    return;
                }
                match self.deliver_signal(vcpu, si) {
                    DeliverOutcome::Handled => {}
                    DeliverOutcome::Fatal { signo, core } => {
                        self.fatal_signal(signo, core);
                        return;
                    }
                }
            }

            let mut fdg = vcpu.fd.lock().unwrap();
            let fd = match fdg.as_mut() {
                Some(fd) => fd,
                None => return,
            };
            {
                let mut inner = vcpu.inner.lock().unwrap();
                if inner.sregs_dirty && fd.set_sregs(&inner.sregs).is_ok() {
                    inner.sregs_dirty = false;
                }
                if inner.fpu_dirty && fd.set_fpu(&inner.fpu).is_ok() {
                    inner.fpu_dirty = false;
                }
                if inner.regs_dirty && fd.set_regs(&inner.regs).is_ok() {
                    inner.regs_dirty = false;
                }
                inner.state = VcpuState::InGuest;
            }
            // The exit structure borrows the fd's run page; reduce it to
            // an owned summary before touching the fd again.
            enum Exit {
                Hypercall(u16, u32),
                StrayPort(u16),
                Mmio(u64),
                Hlt,
                TripleFault,
                Unhandled(String),
                Interrupted,
                HostFault,
                RunError(i32, String),
            }
            let exit = match fd.run() {
                Ok(VcpuExit::IoOut(port, data)) if hc::is_hypercall_port(port) => {
                    let mut eax = [0u8; 4];
                    let n = data.len().min(4);
                    eax[..n].copy_from_slice(&data[..n]);
                    Exit::Hypercall(port, u32::from_le_bytes(eax))
                }
                Ok(VcpuExit::IoOut(port, _)) | Ok(VcpuExit::IoIn(port, _)) => {
                    Exit::StrayPort(port)
                }
                Ok(VcpuExit::MmioRead(addr, _)) | Ok(VcpuExit::MmioWrite(addr, _)) => {
                    Exit::Mmio(addr)
                }
                Ok(VcpuExit::Hlt) => Exit::Hlt,
                Ok(VcpuExit::Shutdown) => Exit::TripleFault,
                Ok(other) => Exit::Unhandled(format!("{:?}", other)),
                Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                    Exit::Interrupted
                }
                Err(e) if e.errno() == libc::EFAULT => Exit::HostFault,
                Err(e) => Exit::RunError(e.errno(), e.to_string()),
            };
            {
                let mut inner = vcpu.inner.lock().unwrap();
                inner.state = VcpuState::Hypercall;
                if !inner.regs_dirty {
                    inner.regs_valid = false;
                }
            }

            let action = match exit {
                Exit::Hypercall(port, eax) => hc::dispatch(self, vcpu, fd, port, eax),
                Exit::StrayPort(port) => {
                    tracing::warn!(target: "monitor::vcpu", port, "stray port access");
                    self.post_fault_signal(
                        vcpu,
                        GuestSiginfo::fault(libc::SIGSEGV, SEGV_MAPERR, 0),
                    );
                    HcAction::Continue
                }
                Exit::Mmio(addr) => {
                    // Access to an unplugged guest physical page.
                    self.post_fault_signal(
                        vcpu,
                        GuestSiginfo::fault(libc::SIGSEGV, SEGV_MAPERR, addr),
                    );
                    HcAction::Continue
                }
                Exit::Hlt => {
                    tracing::info!(target: "monitor::vcpu", id = vcpu.id, "guest HLT");
                    self.request_shutdown(self.exit_status.load(Ordering::SeqCst));
                    HcAction::Shutdown
                }
                Exit::TripleFault => {
                    // No exception stubs installed, or a trashed IDT.
                    tracing::error!(target: "monitor::vcpu", id = vcpu.id, "guest triple fault");
                    self.fatal_signal(libc::SIGSEGV, true);
                    HcAction::Shutdown
                }
                Exit::Unhandled(what) => {
                    tracing::error!(target: "monitor::vcpu", id = vcpu.id, exit = %what, "unhandled exit");
                    self.fatal_signal(libc::SIGILL, true);
                    HcAction::Shutdown
                }
                Exit::Interrupted => HcAction::Continue,
                Exit::HostFault => {
                    // Protection fault against the host mapping (an
                    // mprotected guest page).
                    self.post_fault_signal(
                        vcpu,
                        GuestSiginfo::fault(libc::SIGSEGV, SEGV_ACCERR, 0),
                    );
                    HcAction::Continue
                }
                Exit::RunError(errno, msg) => {
                    tracing::error!(target: "monitor::vcpu", id = vcpu.id, errno, error = %msg, "run failed");
                    self.request_shutdown(125);
                    HcAction::Shutdown
                }
            };
            drop(fdg);

            match action {
                HcAction::Continue => {}
                HcAction::ThreadExit(status) => {
                    self.vcpu_thread_exit(vcpu, status);
                    return;
                }
                HcAction::Shutdown => return,
            }
        }
    }
}

/// Host-thread entry point: run guest threads on this vCPU until the
/// machine shuts down, parking between reuses.
pub(crate) fn vcpu_thread_main(machine: Arc<Machine>, vcpu: Arc<Vcpu>) {
    tracing::debug!(target: "monitor::vcpu", id = vcpu.id, "host thread up");
    loop {
        machine.run_vcpu(&vcpu);
        if machine.is_shutdown() {
            return;
        }
        let mut inner = vcpu.inner.lock().unwrap();
        loop {
            if machine.is_shutdown() {
                return;
            }
            if inner.state == VcpuState::Hypercall {
                break;
            }
            let (guard, _) = vcpu
                .cv
                .wait_timeout(inner, Duration::from_millis(100))
                .unwrap();
            inner = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_inner_is_dirty_everywhere() {
        let inner = VcpuInner::new(kvm_sregs::default());
        assert_eq!(inner.state, VcpuState::Starting);
        assert!(inner.regs_dirty && inner.sregs_dirty && inner.fpu_dirty);
        assert_eq!(inner.regs.rflags, 0x2);
        assert_eq!(inner.fpu.fcw, 0x37f);
        assert_eq!(inner.fpu.mxcsr, 0x1f80);
    }

    #[test]
    fn reuse_clears_thread_state() {
        let mut inner = VcpuInner::new(kvm_sregs::default());
        inner.sigmask = 0xff;
        inner.clear_child_tid = 0x1000;
        inner.guest_thr = 0x2000;
        inner.delayed_munmap = Some((0x3000, 0x1000));
        inner.reset_for_reuse(kvm_sregs::default());
        assert_eq!(inner.sigmask, 0);
        assert_eq!(inner.clear_child_tid, 0);
        assert_eq!(inner.guest_thr, 0);
        assert!(inner.delayed_munmap.is_none());
    }
}
