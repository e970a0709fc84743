// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! User-space virtual machine monitor kernel.
//!
//! Runs one unmodified position-independent ELF64 payload inside a
//! KVM-backed guest, presenting a POSIX personality: flat address space
//! with brk and mmap regions, threads, signals, fork, and a hypercall
//! surface that mirrors the Linux syscall table over port I/O.
//!
//! The [`Machine`] is the singleton monitor state, constructed in `main`
//! and shared as an `Arc`; the only process-wide statics are the
//! async-signal bookkeeping atomics in [`fork`].

#![cfg(target_arch = "x86_64")]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use kvm_bindings::kvm_sregs;
use vmm_sys_util::eventfd::EventFd;

pub mod coredump;
pub mod fdtab;
pub mod fork;
pub mod hc;
pub mod hv;
pub mod loader;
pub mod mem;
pub mod signal;
pub mod stack;
pub mod vcpu;

/// Guest virtual address.
pub type Gva = u64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("hypervisor: {0}")]
    Hv(#[from] hv::Error),
    #[error("guest memory: {0}")]
    Mem(#[from] mem::Error),
    #[error("payload: {0}")]
    Load(#[from] loader::Error),
    #[error("I/O: {0}")]
    Io(std::io::Error),
    #[error("guest setup failed with errno {0}")]
    Guest(i64),
    #[error("no vcpu available")]
    NoVcpu,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Work the monitor main thread must perform on behalf of vCPU threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    /// A fork/clone prefix completed; run the host fork.
    Fork,
    /// The payload is done; unwind and exit.
    Shutdown,
}

/// External serializer interface: the snapshot hypercalls dispatch here
/// when hooks are installed and fail with ENOSYS otherwise.
pub trait SnapshotHooks: Send + Sync {
    fn take(&self, machine: &Machine, args: &hc::HcArgs) -> i64;
    fn get_data(&self, machine: &Machine, args: &hc::HcArgs) -> i64;
    fn put_data(&self, machine: &Machine, args: &hc::HcArgs) -> i64;
}

pub struct MachineConfig {
    /// Core file path for fatal guest signals.
    pub coredump: PathBuf,
    /// Recorded for the (external) gdb stub.
    pub gdb_port: Option<u16>,
    /// Recorded for the (external) snapshot serializer.
    pub snapshot_label: Option<String>,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            coredump: PathBuf::from("kestrel.core"),
            gdb_port: None,
            snapshot_label: None,
        }
    }
}

/// The monitor machine: one guest VM, its memory, vCPUs and guest-visible
/// process state.
pub struct Machine {
    pub layout: mem::MemLayout,
    pub config: MachineConfig,
    pub(crate) hv: RwLock<hv::Hv>,
    /// brk lock: slot table, brk/tbrk, page tables.
    pub(crate) mem: Mutex<mem::MemState>,
    /// mmap lock: busy/free interval lists. Ordered before `mem`.
    pub(crate) mmaps: Mutex<mem::mmap::MmapState>,
    pub(crate) payload: Mutex<Option<loader::LoadedPayload>>,
    pub(crate) auxv: Mutex<Vec<u8>>,
    pub(crate) load_writable: bool,
    pub(crate) sregs_template: Mutex<kvm_sregs>,
    pub(crate) vcpus: Mutex<vcpu::VcpuTable>,
    pub(crate) signals: Mutex<signal::SignalState>,
    pub(crate) fork: fork::ForkState,
    pub(crate) pause: Mutex<vcpu::PauseCtl>,
    pub(crate) pause_cv: Condvar,
    events: Mutex<VecDeque<MachineEvent>>,
    events_cv: Condvar,
    shutdown: AtomicBool,
    pub(crate) exit_status: AtomicI32,
    core_signal: AtomicI32,
    pub pid: AtomicI32,
    pub ppid: AtomicI32,
    pub(crate) fdtab: fdtab::FdTable,
    snapshot: Mutex<Option<Box<dyn SnapshotHooks>>>,
    /// Wakes external collaborators (gdb stub) on guest activity.
    pub intr_fd: EventFd,
    /// Signalled once when the machine begins shutting down.
    pub shutdown_fd: EventFd,
    self_ref: Mutex<Weak<Machine>>,
}

impl Machine {
    /// Probe the hypervisor, build the guest memory skeleton and the
    /// shared descriptor tables. The payload is loaded separately.
    pub fn new(config: MachineConfig) -> Result<Arc<Machine>> {
        let hv = hv::Hv::new()?;
        let layout = mem::MemLayout::new(hv.phys_bits, hv.pdpe1g);
        tracing::info!(
            target: "monitor::mem",
            max_physmem = layout.guest_max_physmem,
            pdpe1g = layout.pdpe1g,
            "machine layout"
        );

        let machine = Arc::new(Machine {
            mem: Mutex::new(mem::MemState::new(&layout)),
            layout,
            config,
            hv: RwLock::new(hv),
            mmaps: Mutex::new(mem::mmap::MmapState::default()),
            payload: Mutex::new(None),
            auxv: Mutex::new(Vec::new()),
            load_writable: false,
            sregs_template: Mutex::new(kvm_sregs::default()),
            vcpus: Mutex::new(vcpu::VcpuTable::new()),
            signals: Mutex::new(signal::SignalState::new()),
            fork: fork::ForkState::new(),
            pause: Mutex::new(vcpu::PauseCtl {
                stop: false,
                paused: 0,
            }),
            pause_cv: Condvar::new(),
            events: Mutex::new(VecDeque::new()),
            events_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            core_signal: AtomicI32::new(0),
            pid: AtomicI32::new(std::process::id() as i32),
            // SAFETY: plain getppid(2).
            ppid: AtomicI32::new(unsafe { libc::getppid() }),
            fdtab: fdtab::FdTable::new(),
            snapshot: Mutex::new(None),
            intr_fd: EventFd::new(libc::EFD_NONBLOCK).map_err(Error::Io)?,
            shutdown_fd: EventFd::new(libc::EFD_NONBLOCK).map_err(Error::Io)?,
            self_ref: Mutex::new(Weak::new()),
        });
        *machine.self_ref.lock().unwrap() = Arc::downgrade(&machine);

        fork::host_signal_init();
        machine.mem_init()?;
        machine.init_sregs_template();
        Ok(machine)
    }

    pub(crate) fn arc(&self) -> Arc<Machine> {
        self.self_ref
            .lock()
            .unwrap()
            .upgrade()
            .expect("machine outlives all users")
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn ppid(&self) -> i32 {
        self.ppid.load(Ordering::SeqCst)
    }

    pub fn set_snapshot_hooks(&self, hooks: Box<dyn SnapshotHooks>) {
        *self.snapshot.lock().unwrap() = Some(hooks);
    }

    pub(crate) fn snapshot_take(&self, args: &hc::HcArgs) -> i64 {
        match self.snapshot.lock().unwrap().as_ref() {
            Some(h) => h.take(self, args),
            None => -(libc::ENOSYS as i64),
        }
    }

    pub(crate) fn snapshot_getdata(&self, args: &hc::HcArgs) -> i64 {
        match self.snapshot.lock().unwrap().as_ref() {
            Some(h) => h.get_data(self, args),
            None => -(libc::ENOSYS as i64),
        }
    }

    pub(crate) fn snapshot_putdata(&self, args: &hc::HcArgs) -> i64 {
        match self.snapshot.lock().unwrap().as_ref() {
            Some(h) => h.put_data(self, args),
            None => -(libc::ENOSYS as i64),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// First caller wins; the status sticks and everyone gets woken.
    pub fn request_shutdown(&self, status: i32) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.exit_status.store(status, Ordering::SeqCst);
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(target: "monitor::vcpu", status, "shutdown requested");
        let _ = self.shutdown_fd.write(1);
        self.post_event(MachineEvent::Shutdown);
        let table = self.vcpus.lock().unwrap();
        for vcpu in table.table.iter().flatten() {
            vcpu.kick();
            vcpu.cv.notify_all();
        }
    }

    /// A guest signal with a fatal default action: remember it for the
    /// coredump pass and terminate with the conventional status.
    pub fn fatal_signal(&self, signo: i32, core: bool) {
        if core {
            self.core_signal.store(signo, Ordering::SeqCst);
        }
        self.request_shutdown(128 + signo);
    }

    pub(crate) fn post_event(&self, ev: MachineEvent) {
        self.events.lock().unwrap().push_back(ev);
        self.events_cv.notify_all();
        let _ = self.intr_fd.write(1);
    }

    pub(crate) fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    fn wait_event(&self) -> Option<MachineEvent> {
        let mut events = self.events.lock().unwrap();
        if let Some(ev) = events.pop_front() {
            return Some(ev);
        }
        let (mut events, _) = self
            .events_cv
            .wait_timeout(events, Duration::from_millis(250))
            .unwrap();
        events.pop_front()
    }

    pub(crate) fn reset_pause_after_fork(&self) {
        let mut ctl = self.pause.lock().unwrap();
        ctl.stop = false;
        ctl.paused = 0;
        drop(ctl);
        self.pause_cv.notify_all();
    }

    /// Load the payload, build the initial stack and start vCPU 0 at the
    /// payload (or dynamic linker) entry point.
    pub fn start(self: &Arc<Self>, path: &str, argv: &[String], envp: &[String]) -> Result<()> {
        self.load_payload(path)?;
        let (start_rip, intr_entry) = {
            let payload = self.payload.lock().unwrap();
            let p = payload.as_ref().expect("just loaded");
            (p.start_rip(), p.intr_entry)
        };
        match intr_entry {
            Some(entry) => self.init_idt(entry),
            None => tracing::warn!(
                target: "monitor::load",
                "payload has no exception stub table; guest faults become triple faults"
            ),
        }

        let stack_top = self.init_main(argv, envp).map_err(Error::Guest)?;
        let vcpu = self.vcpu_get().ok_or(Error::NoVcpu)?;
        {
            let mut inner = vcpu.inner.lock().unwrap();
            inner.regs.rip = start_rip;
            inner.regs.rsp = stack_top;
            inner.regs.rflags = 0x2;
            inner.regs_dirty = true;
            inner.stack_top = stack_top;
        }
        tracing::info!(target: "monitor::vcpu", rip = start_rip, rsp = stack_top, "payload starting");
        self.vcpu_activate(&vcpu)
    }

    /// Main-thread loop: service fork requests and wait for shutdown.
    /// Returns the process exit status (guest exit_group status, or
    /// 128+signo for a fatal signal).
    pub fn run(self: &Arc<Self>) -> i32 {
        loop {
            match self.wait_event() {
                Some(MachineEvent::Fork) => {
                    // In the child the main thread simply keeps serving
                    // the (new) machine.
                    let _in_child = fork::do_fork(self);
                }
                Some(MachineEvent::Shutdown) => break,
                None => {
                    self.drain_host_signals();
                    if self.is_shutdown() {
                        break;
                    }
                }
            }
        }

        let signo = self.core_signal.load(Ordering::SeqCst);
        if signo != 0 {
            // The vCPU threads are draining out on the shutdown flag; the
            // faulting vCPU synced its registers before raising the
            // signal. Wait until nobody is inside the run ioctl so the
            // caches are as current as they will get.
            self.quiesce_vcpus(Duration::from_millis(500));
            if let Err(e) = self.write_coredump(&self.config.coredump, signo) {
                tracing::error!(target: "monitor::vcpu", error = %e, "coredump failed");
            }
        }
        self.machine_fini();
        self.exit_status.load(Ordering::SeqCst)
    }

    fn quiesce_vcpus(&self, limit: Duration) {
        let deadline = std::time::Instant::now() + limit;
        loop {
            let busy = {
                let table = self.vcpus.lock().unwrap();
                table
                    .table
                    .iter()
                    .flatten()
                    .any(|v| v.inner.lock().unwrap().state == vcpu::VcpuState::InGuest)
            };
            if !busy || std::time::Instant::now() >= deadline {
                return;
            }
            let table = self.vcpus.lock().unwrap();
            for v in table.table.iter().flatten() {
                v.kick();
            }
            drop(table);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Unwind: make sure every vCPU thread has seen the shutdown flag.
    /// Host resources (hypervisor fds, slot memory) go with the process.
    pub fn machine_fini(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let table = self.vcpus.lock().unwrap();
        for vcpu in table.table.iter().flatten() {
            vcpu.kick();
            vcpu.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_a_core_file() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.coredump, PathBuf::from("kestrel.core"));
        assert!(cfg.gdb_port.is_none());
    }
}
