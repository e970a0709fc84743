// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Fork and address-space-separating clone.
//!
//! The faulting vCPU thread only runs the prefix: snapshot everything the
//! surviving child thread will need (registers, stack, TLS, signal state)
//! into the single-slot fork record and hand off. The host fork() itself
//! happens on the monitor main thread, so the one thread that survives in
//! the child is the same thread that owns payload termination and the
//! debugger stub. The child then tears down every hypervisor fd it
//! inherited, builds a fresh VM over the same (copy-on-write) memory, and
//! restarts the snapshot on a single new vCPU.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_bindings::{kvm_fpu, kvm_regs};
use kvm_ioctls::VcpuFd;

use crate::hc::HcArgs;
use crate::signal::{GuestSiginfo, GuestStackT};
use crate::vcpu::{kick_signal, sync_regs_with, Vcpu};
use crate::{Gva, Machine, MachineEvent};

#[derive(Clone)]
pub struct ForkRecord {
    pub in_progress: bool,
    pub is_clone: bool,
    pub args: HcArgs,
    /// Where the parent-side hc_ret goes.
    pub args_gva: Gva,
    pub regs: kvm_regs,
    pub fpu: kvm_fpu,
    pub stack_top: Gva,
    pub guest_thr: Gva,
    pub altstack: GuestStackT,
    pub sigmask: u64,
}

impl ForkRecord {
    fn new() -> ForkRecord {
        ForkRecord {
            in_progress: false,
            is_clone: false,
            args: HcArgs::default(),
            args_gva: 0,
            regs: kvm_regs::default(),
            fpu: kvm_fpu::default(),
            stack_top: 0,
            guest_thr: 0,
            altstack: GuestStackT::default(),
            sigmask: 0,
        }
    }
}

/// At most one address-space-separating fork/clone is in flight; others
/// wait on the condvar.
pub struct ForkState {
    pub inner: Mutex<ForkRecord>,
    pub cv: Condvar,
}

impl ForkState {
    pub fn new() -> ForkState {
        ForkState {
            inner: Mutex::new(ForkRecord::new()),
            cv: Condvar::new(),
        }
    }
}

// SIGCHLD forwarding: the host handler may run on any thread at any time,
// so it only touches atomics; the payload-visible signal is posted at the
// next hypercall boundary.
static SIGCHLD_PENDING: AtomicBool = AtomicBool::new(false);
static SIGCHLD_PID: AtomicI32 = AtomicI32::new(0);
static SIGCHLD_STATUS: AtomicI32 = AtomicI32::new(0);

extern "C" fn sigchld_handler(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if !info.is_null() {
        // SAFETY: the kernel hands us a valid siginfo for SIGCHLD.
        unsafe {
            SIGCHLD_PID.store((*info).si_pid(), Ordering::Relaxed);
            SIGCHLD_STATUS.store((*info).si_status(), Ordering::Relaxed);
        }
    }
    SIGCHLD_PENDING.store(true, Ordering::Release);
}

extern "C" fn kick_handler(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // The only job of the kick signal is interrupting the run ioctl.
}

/// Install the host-side handlers: the vCPU kick and the SIGCHLD
/// forwarder. Called once at machine init and again in fork children.
pub(crate) fn host_signal_init() {
    if let Err(e) = vmm_sys_util::signal::register_signal_handler(kick_signal(), kick_handler) {
        panic!("cannot register vcpu kick handler: {}", e);
    }
    // SAFETY: installing a handler that only touches atomics.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigchld_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_NOCLDSTOP;
        libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut());
    }
}

static WAIT_FOR_DEBUGGER: AtomicBool = AtomicBool::new(false);

/// `KM_WAIT_FOR_GDB_ATTACH=1` parks a fresh fork child until a debugger
/// clears the in-memory flag.
fn wait_for_gdb_attach() {
    if std::env::var_os("KM_WAIT_FOR_GDB_ATTACH").is_none() {
        return;
    }
    WAIT_FOR_DEBUGGER.store(true, Ordering::SeqCst);
    tracing::warn!(target: "monitor::fork",
        pid = std::process::id(),
        "waiting for debugger attach; clear monitor::fork::WAIT_FOR_DEBUGGER to continue");
    while WAIT_FOR_DEBUGGER.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

impl Machine {
    /// Drain host-signal side effects at a hypercall boundary.
    pub(crate) fn drain_host_signals(&self) {
        if SIGCHLD_PENDING.swap(false, Ordering::AcqRel) {
            let pid = SIGCHLD_PID.load(Ordering::Relaxed);
            let status = SIGCHLD_STATUS.load(Ordering::Relaxed);
            tracing::debug!(target: "monitor::fork", pid, status, "forwarding SIGCHLD");
            self.post_signal(None, GuestSiginfo::child(pid, status, libc::CLD_EXITED));
        }
    }

    /// Fork/clone prefix, run on the faulting vCPU's host thread. The
    /// caller suppresses the normal hc_ret write; the fork body fills it
    /// in for the parent and zeroes it for the child.
    pub(crate) fn before_fork(
        &self,
        vcpu: &Arc<Vcpu>,
        fd: &VcpuFd,
        args: &HcArgs,
        args_gva: Gva,
        is_clone: bool,
    ) -> Result<(), i64> {
        let mut st = self.fork.inner.lock().unwrap();
        if st.in_progress {
            // A waiter here cannot park at the pause point, and the fork
            // in flight needs the world paused to finish; leave the
            // running count while blocked so the pause does not wait for
            // us.
            self.vcpus.lock().unwrap().running -= 1;
            while st.in_progress {
                st = self.fork.cv.wait(st).unwrap();
            }
            self.vcpus.lock().unwrap().running += 1;
        }
        {
            let mut inner = vcpu.inner.lock().unwrap();
            sync_regs_with(fd, &mut inner)?;
            st.regs = inner.regs;
            st.stack_top = inner.stack_top;
            st.guest_thr = inner.guest_thr;
            st.altstack = inner.altstack;
            st.sigmask = inner.sigmask;
        }
        st.fpu = fd.get_fpu().map_err(|_| -(libc::EIO as i64))?;
        st.args = *args;
        st.args_gva = args_gva;
        st.is_clone = is_clone;

        if is_clone && args.arg[1] != 0 {
            // A clone with a caller-supplied stack: park a copy of the
            // argument block just below it so the runtime's clone
            // trampoline can pop it in the child, and start the child
            // right at that copy.
            let child_stack = args.arg[1];
            let copy_gva = child_stack - std::mem::size_of::<HcArgs>() as u64;
            let mut child_args = *args;
            child_args.hc_ret = 0;
            self.write_obj(copy_gva, &child_args)?;
            st.stack_top = child_stack;
            st.regs.rsp = copy_gva;
        }
        st.in_progress = true;
        tracing::debug!(target: "monitor::fork", is_clone, rip = st.regs.rip, "fork prefix done");
        drop(st);
        self.post_event(MachineEvent::Fork);
        Ok(())
    }

    /// execve: re-exec the monitor over this process with the new payload
    /// argv. Returns only on failure.
    pub fn guest_execve(&self, path_gva: Gva, argv_gva: Gva, envp_gva: Gva) -> i64 {
        use std::ffi::CString;

        let read_vec = |base: Gva| -> Result<Vec<String>, i64> {
            let mut out = Vec::new();
            if base == 0 {
                return Ok(out);
            }
            for i in 0..256u64 {
                let ptr: u64 = self.read_obj(base + i * 8)?;
                if ptr == 0 {
                    return Ok(out);
                }
                out.push(self.read_cstr(ptr, libc::PATH_MAX as usize)?);
            }
            Err(-(libc::E2BIG as i64))
        };

        let path = match self.read_cstr(path_gva, libc::PATH_MAX as usize) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let argv = match read_vec(argv_gva) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let envp = match read_vec(envp_gva) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let exe = match std::env::current_exe() {
            Ok(p) => p,
            Err(_) => return -(libc::ENOENT as i64),
        };
        let mut cargs: Vec<CString> = Vec::new();
        let cstr = |s: &str| CString::new(s).map_err(|_| -(libc::EINVAL as i64));
        match (|| -> Result<(), i64> {
            cargs.push(cstr(&exe.to_string_lossy())?);
            cargs.push(cstr(&path)?);
            cargs.push(cstr("--")?);
            for arg in argv.iter().skip(1) {
                cargs.push(cstr(arg)?);
            }
            Ok(())
        })() {
            Ok(()) => {}
            Err(e) => return e,
        }
        let cenv: Vec<CString> = match envp.iter().map(|e| cstr(e)).collect() {
            Ok(v) => v,
            Err(e) => return e,
        };

        let mut argv_ptrs: Vec<*const libc::c_char> =
            cargs.iter().map(|c| c.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = cenv.iter().map(|c| c.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        tracing::info!(target: "monitor::fork", payload = %path, "execve re-exec");
        // SAFETY: NUL-terminated argument vectors; on success this
        // process image is gone.
        unsafe { libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };
        -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT) as i64)
    }
}

/// Main-thread fork body. Returns true when resuming in the child.
pub fn do_fork(machine: &Arc<Machine>) -> bool {
    let snap = {
        let st = machine.fork.inner.lock().unwrap();
        if !st.in_progress {
            return false;
        }
        st.clone()
    };

    machine.pause_all();

    // Hold off the kick signal and SIGCHLD over the fork window.
    let mut block: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut former: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: local sigsets, standard blocking dance.
    unsafe {
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, kick_signal());
        libc::sigaddset(&mut block, libc::SIGCHLD);
        libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut former);
    }

    // SAFETY: every vCPU thread is parked at its pause point holding no
    // monitor lock, so the child's copies of the mutexes are unlocked.
    let child_pid = unsafe { libc::fork() };

    if child_pid == 0 {
        wait_for_gdb_attach();
        machine.pid.store(std::process::id() as i32, Ordering::SeqCst);
        // SAFETY: plain getppid(2).
        machine
            .ppid
            .store(unsafe { libc::getppid() }, Ordering::SeqCst);
        {
            let mut st = machine.fork.inner.lock().unwrap();
            st.in_progress = false;
        }
        // Clear the inherited stop-the-world state before any new vCPU
        // thread can reach its first pause check.
        machine.reset_pause_after_fork();
        let _ = machine.write_obj(snap.args_gva, &0u64);
        fork_child_vm_init(machine, &snap);
        // SAFETY: restoring the mask saved above.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &former, std::ptr::null_mut()) };
        tracing::info!(target: "monitor::fork", pid = machine.pid(), "child running");
        true
    } else {
        let ret: i64 = if child_pid > 0 {
            child_pid as i64
        } else {
            -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EAGAIN) as i64)
        };
        let _ = machine.write_obj(snap.args_gva, &(ret as u64));
        {
            let mut st = machine.fork.inner.lock().unwrap();
            st.in_progress = false;
        }
        machine.fork.cv.notify_all();
        // SAFETY: restoring the mask saved above.
        unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &former, std::ptr::null_mut()) };
        machine.resume_all();
        tracing::debug!(target: "monitor::fork", child_pid, "parent resumed");
        false
    }
}

/// Child-side reconstruction: close out the parent's hypervisor state,
/// create a fresh VM over the inherited memory, and restart the snapshot
/// on one new vCPU.
fn fork_child_vm_init(machine: &Arc<Machine>, snap: &ForkRecord) {
    // The inherited vCPU fds reference the parent's VM.
    {
        let mut table = machine.vcpus.lock().unwrap();
        for vcpu in table.table.iter().flatten() {
            vcpu.take_fd();
        }
        table.table.clear();
        table.idle.clear();
        table.running = 0;
    }

    if let Err(e) = machine.hv.write().unwrap().recreate_vm() {
        tracing::error!(target: "monitor::fork", error = %e, "child cannot recreate VM");
        std::process::exit(2);
    }
    if let Err(e) = machine.mem_reregister_slots() {
        tracing::error!(target: "monitor::fork", error = %e, "child cannot replug memory");
        std::process::exit(2);
    }

    // Handlers and dispositions survive a fork; queued-but-undelivered
    // signals do not.
    machine.signals.lock().unwrap().pending.clear();
    machine.clear_events();
    host_signal_init();

    let vcpu = match machine.vcpu_get() {
        Some(v) => v,
        None => {
            tracing::error!(target: "monitor::fork", "child cannot allocate a vcpu");
            std::process::exit(2);
        }
    };
    {
        let mut inner = vcpu.inner.lock().unwrap();
        inner.regs = snap.regs;
        inner.regs.rax = 0;
        inner.regs_valid = true;
        inner.regs_dirty = true;
        inner.fpu = snap.fpu;
        inner.fpu_dirty = true;
        inner.stack_top = snap.stack_top;
        inner.guest_thr = snap.guest_thr;
        inner.sregs.fs.base = snap.guest_thr;
        inner.sregs_dirty = true;
        inner.altstack = snap.altstack;
        inner.sigmask = snap.sigmask;
        tracing::debug!(target: "monitor::fork",
            rip = inner.regs.rip, rsp = inner.regs.rsp, "child vcpu restored");
    }
    if machine.vcpu_activate(&vcpu).is_err() {
        tracing::error!(target: "monitor::fork", "child cannot start its vcpu thread");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_idle() {
        let st = ForkState::new();
        assert!(!st.inner.lock().unwrap().in_progress);
    }

    #[test]
    fn sigchld_drain_is_one_shot() {
        SIGCHLD_PENDING.store(true, Ordering::Release);
        assert!(SIGCHLD_PENDING.swap(false, Ordering::AcqRel));
        assert!(!SIGCHLD_PENDING.swap(false, Ordering::AcqRel));
    }
}
