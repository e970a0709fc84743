// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest signal handling: the process-wide sigaction table and pending
//! queue, per-vCPU masks and alternate stacks, and delivery.
//!
//! A signal is delivered by the receiving vCPU just before it re-enters
//! the guest, at most one per hypercall boundary. Delivery pushes a frame
//! (return address to the registered restorer, siginfo, ucontext) onto
//! the handler stack; rt_sigreturn restores the machine context from the
//! frame, so any register the handler left alone in the ucontext comes
//! back unchanged.

use std::collections::VecDeque;
use std::sync::Arc;

use kvm_bindings::kvm_regs;

use crate::mem::round_down;
use crate::vcpu::{Vcpu, VcpuState};
use crate::{Gva, Machine};

pub const NSIG: usize = 64;

/// Bound on queued pending signals; entries beyond it are dropped the way
/// the kernel drops non-RT signals already pending.
const MAX_PENDING: usize = 128;

pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

// si_code values for SIGSEGV/SIGFPE/SIGILL. Not exposed by the `libc` crate
// for this target; values are from <asm-generic/siginfo.h>.
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
pub const FPE_INTDIV: i32 = 1;
pub const FPE_INTOVF: i32 = 2;
pub const ILL_ILLOPC: i32 = 1;

pub const SA_SIGINFO: u64 = 0x4;
pub const SA_RESTORER: u64 = 0x0400_0000;
pub const SA_ONSTACK: u64 = 0x0800_0000;
pub const SA_NODEFER: u64 = 0x4000_0000;

const SS_ONSTACK: i32 = 1;
const SS_DISABLE: i32 = 2;
const MIN_SIGSTACK: u64 = 2048;

pub fn sig_bit(signo: i32) -> u64 {
    1u64 << (signo - 1)
}

pub fn sig_valid(signo: i32) -> bool {
    signo >= 1 && signo <= NSIG as i32
}

/// SIGKILL and SIGSTOP can be neither blocked nor handled.
const UNBLOCKABLE: u64 = (1 << (libc::SIGKILL - 1)) | (1 << (libc::SIGSTOP - 1));

/// Guest-ABI sigaction entry, the four words of the Linux rt_sigaction
/// layout.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// Guest-ABI siginfo, 128 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GuestSiginfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    pad: i32,
    pub fields: [u64; 14],
}

impl GuestSiginfo {
    pub fn fault(signo: i32, code: i32, addr: Gva) -> GuestSiginfo {
        let mut si = GuestSiginfo::user(signo, 0);
        si.si_code = code;
        si.fields[0] = addr;
        si
    }

    pub fn user(signo: i32, pid: i32) -> GuestSiginfo {
        let mut fields = [0u64; 14];
        fields[0] = pid as u32 as u64;
        GuestSiginfo {
            si_signo: signo,
            si_errno: 0,
            si_code: 0,
            pad: 0,
            fields,
        }
    }

    pub fn child(pid: i32, status: i32, code: i32) -> GuestSiginfo {
        let mut si = GuestSiginfo::user(libc::SIGCHLD, pid);
        si.si_code = code;
        si.fields[1] = status as u32 as u64;
        si
    }

    pub fn fault_addr(&self) -> Gva {
        self.fields[0]
    }
}

/// Guest-ABI stack_t.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GuestStackT {
    pub sp: u64,
    pub flags: i32,
    pad: i32,
    pub size: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Mcontext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub csgsfs: u64,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    pub fpstate: u64,
    reserved: [u64; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ucontext {
    pub uc_flags: u64,
    pub uc_link: u64,
    pub uc_stack: GuestStackT,
    pub uc_mcontext: Mcontext,
    pub uc_sigmask: u64,
}

/// What delivery pushes on the handler stack. The restorer's hypercall
/// finds it again right under the post-return RSP.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SigFrame {
    pub ret_addr: u64,
    pub info: GuestSiginfo,
    pub uc: Ucontext,
}

const FRAME_INFO_OFFSET: u64 = 8;
const FRAME_UC_OFFSET: u64 = 8 + std::mem::size_of::<GuestSiginfo>() as u64;

pub struct SignalState {
    pub actions: [SigAction; NSIG],
    pub pending: VecDeque<GuestSiginfo>,
}

impl SignalState {
    pub fn new() -> SignalState {
        SignalState {
            actions: [SigAction::default(); NSIG],
            pending: VecDeque::with_capacity(MAX_PENDING),
        }
    }
}

enum DefaultAction {
    Terminate,
    Core,
    Ignore,
}

fn default_action(signo: i32) -> DefaultAction {
    match signo {
        libc::SIGQUIT | libc::SIGILL | libc::SIGTRAP | libc::SIGABRT | libc::SIGBUS
        | libc::SIGFPE | libc::SIGSEGV | libc::SIGXCPU | libc::SIGXFSZ | libc::SIGSYS => {
            DefaultAction::Core
        }
        // No job control inside the guest: the stop family is ignored.
        libc::SIGCHLD | libc::SIGURG | libc::SIGWINCH | libc::SIGCONT | libc::SIGSTOP
        | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU => DefaultAction::Ignore,
        _ => DefaultAction::Terminate,
    }
}

pub enum DeliverOutcome {
    Handled,
    Fatal { signo: i32, core: bool },
}

impl Machine {
    /// Queue a signal for the guest. With a target vCPU the signal goes on
    /// that vCPU's private queue; otherwise any vCPU not blocking it gets
    /// woken, falling back to the process queue for later pickup.
    pub fn post_signal(&self, target: Option<&Arc<Vcpu>>, si: GuestSiginfo) {
        if !sig_valid(si.si_signo) {
            return;
        }
        let mut sigs = self.signals.lock().unwrap();
        let act = sigs.actions[si.si_signo as usize - 1];
        if act.handler == SIG_IGN
            || (act.handler == SIG_DFL
                && matches!(default_action(si.si_signo), DefaultAction::Ignore))
        {
            return;
        }
        if let Some(vcpu) = target {
            let mut inner = vcpu.inner.lock().unwrap();
            if inner.pending.len() < MAX_PENDING {
                inner.pending.push_back(si);
            }
            drop(inner);
            drop(sigs);
            vcpu.kick();
            return;
        }
        if sigs.pending.len() >= MAX_PENDING {
            tracing::warn!(target: "monitor::signal", signo = si.si_signo, "pending queue full, dropping");
            return;
        }
        sigs.pending.push_back(si);
        drop(sigs);
        // Wake some vCPU that can take it.
        let bit = sig_bit(si.si_signo);
        let table = self.vcpus.lock().unwrap();
        for slot in table.table.iter().flatten() {
            let inner = slot.inner.lock().unwrap();
            let can = inner.state != VcpuState::Done && inner.sigmask & bit == 0;
            drop(inner);
            if can {
                slot.kick();
                break;
            }
        }
    }

    /// Post a synchronous hardware fault. A fault the vCPU has blocked or
    /// ignored cannot be retried (the faulting instruction would just
    /// fault again), so it terminates the payload with a core instead.
    pub fn post_fault_signal(&self, vcpu: &Arc<Vcpu>, si: GuestSiginfo) {
        let blocked = {
            let inner = vcpu.inner.lock().unwrap();
            inner.sigmask & sig_bit(si.si_signo) != 0
        };
        let ignored = {
            let sigs = self.signals.lock().unwrap();
            sigs.actions[si.si_signo as usize - 1].handler == SIG_IGN
        };
        if blocked || ignored {
            tracing::warn!(target: "monitor::signal", signo = si.si_signo,
                addr = si.fault_addr(), blocked, "unrecoverable guest fault");
            self.fatal_signal(si.si_signo, true);
            return;
        }
        self.post_signal(Some(vcpu), si);
    }

    /// Next deliverable signal for this vCPU: its own queue first, then
    /// the process queue, FIFO within each.
    pub fn next_signal(&self, vcpu: &Arc<Vcpu>) -> Option<GuestSiginfo> {
        let mask = vcpu.inner.lock().unwrap().sigmask;
        {
            let mut inner = vcpu.inner.lock().unwrap();
            if let Some(pos) = inner
                .pending
                .iter()
                .position(|si| mask & sig_bit(si.si_signo) == 0)
            {
                return inner.pending.remove(pos);
            }
        }
        let mut sigs = self.signals.lock().unwrap();
        let pos = sigs
            .pending
            .iter()
            .position(|si| mask & sig_bit(si.si_signo) == 0)?;
        sigs.pending.remove(pos)
    }

    /// Deliver one signal to a vCPU stopped at a hypercall boundary. The
    /// caller owns the vCPU's register cache (it is its host thread).
    pub fn deliver_signal(&self, vcpu: &Arc<Vcpu>, si: GuestSiginfo) -> DeliverOutcome {
        let act = self.signals.lock().unwrap().actions[si.si_signo as usize - 1];
        if act.handler == SIG_IGN {
            return DeliverOutcome::Handled;
        }
        if act.handler == SIG_DFL {
            return match default_action(si.si_signo) {
                DefaultAction::Ignore => DeliverOutcome::Handled,
                DefaultAction::Terminate => DeliverOutcome::Fatal {
                    signo: si.si_signo,
                    core: false,
                },
                DefaultAction::Core => DeliverOutcome::Fatal {
                    signo: si.si_signo,
                    core: true,
                },
            };
        }

        let mut inner = vcpu.inner.lock().unwrap();
        let regs = inner.regs;
        let altstack = inner.altstack;
        let on_altstack =
            altstack.sp != 0 && regs.rsp > altstack.sp && regs.rsp <= altstack.sp + altstack.size;
        let take_alt = act.flags & SA_ONSTACK != 0
            && altstack.sp != 0
            && altstack.flags & SS_DISABLE == 0
            && !on_altstack;
        let stack_base = if take_alt {
            altstack.sp + altstack.size
        } else {
            regs.rsp - 128 // skip the red zone
        };
        let frame_gva =
            round_down(stack_base - std::mem::size_of::<SigFrame>() as u64, 16) - 8;

        let frame = SigFrame {
            ret_addr: act.restorer,
            info: si,
            uc: Ucontext {
                uc_flags: 0,
                uc_link: 0,
                uc_stack: altstack,
                uc_mcontext: Mcontext {
                    r8: regs.r8,
                    r9: regs.r9,
                    r10: regs.r10,
                    r11: regs.r11,
                    r12: regs.r12,
                    r13: regs.r13,
                    r14: regs.r14,
                    r15: regs.r15,
                    rdi: regs.rdi,
                    rsi: regs.rsi,
                    rbp: regs.rbp,
                    rbx: regs.rbx,
                    rdx: regs.rdx,
                    rax: regs.rax,
                    rcx: regs.rcx,
                    rsp: regs.rsp,
                    rip: regs.rip,
                    eflags: regs.rflags,
                    csgsfs: 0,
                    err: 0,
                    trapno: 0,
                    oldmask: inner.sigmask,
                    cr2: si.fault_addr(),
                    fpstate: 0,
                    reserved: [0; 8],
                },
                uc_sigmask: inner.sigmask,
            },
        };
        if self.write_obj(frame_gva, &frame).is_err() {
            // Handler stack is gone; same fate as an unhandled SIGSEGV.
            return DeliverOutcome::Fatal {
                signo: libc::SIGSEGV,
                core: true,
            };
        }

        inner.regs.rip = act.handler;
        inner.regs.rsp = frame_gva;
        inner.regs.rdi = si.si_signo as u64;
        inner.regs.rsi = frame_gva + FRAME_INFO_OFFSET;
        inner.regs.rdx = frame_gva + FRAME_UC_OFFSET;
        inner.regs.rax = 0;
        inner.regs_dirty = true;

        let mut mask = inner.sigmask | act.mask;
        if act.flags & SA_NODEFER == 0 {
            mask |= sig_bit(si.si_signo);
        }
        inner.sigmask = mask & !UNBLOCKABLE;
        tracing::debug!(target: "monitor::signal", signo = si.si_signo, handler = act.handler,
            frame = frame_gva, "delivered");
        DeliverOutcome::Handled
    }

    /// rt_sigreturn: restore the context saved at delivery. The restorer
    /// issues the hypercall straight after the handler returns, so the
    /// frame sits one word below the current stack pointer.
    pub fn sigreturn(&self, vcpu: &Arc<Vcpu>) -> Result<(), i64> {
        let frame_gva = {
            let inner = vcpu.inner.lock().unwrap();
            inner.regs.rsp - 8
        };
        let frame: SigFrame = self.read_obj(frame_gva)?;
        let mc = &frame.uc.uc_mcontext;
        let mut inner = vcpu.inner.lock().unwrap();
        inner.regs = kvm_regs {
            r8: mc.r8,
            r9: mc.r9,
            r10: mc.r10,
            r11: mc.r11,
            r12: mc.r12,
            r13: mc.r13,
            r14: mc.r14,
            r15: mc.r15,
            rdi: mc.rdi,
            rsi: mc.rsi,
            rbp: mc.rbp,
            rbx: mc.rbx,
            rdx: mc.rdx,
            rax: mc.rax,
            rcx: mc.rcx,
            rsp: mc.rsp,
            rip: mc.rip,
            rflags: mc.eflags,
        };
        inner.regs_dirty = true;
        inner.sigmask = frame.uc.uc_sigmask & !UNBLOCKABLE;
        inner.altstack = frame.uc.uc_stack;
        tracing::debug!(target: "monitor::signal", rip = mc.rip, "sigreturn");
        Ok(())
    }

    pub fn rt_sigaction(
        &self,
        signo: i32,
        act_gva: Gva,
        oldact_gva: Gva,
        sigsetsize: u64,
    ) -> i64 {
        if sigsetsize != 8 || !sig_valid(signo) {
            return -(libc::EINVAL as i64);
        }
        if act_gva != 0 && (signo == libc::SIGKILL || signo == libc::SIGSTOP) {
            return -(libc::EINVAL as i64);
        }
        let mut sigs = self.signals.lock().unwrap();
        let old = sigs.actions[signo as usize - 1];
        if act_gva != 0 {
            match self.read_obj::<SigAction>(act_gva) {
                Ok(act) => sigs.actions[signo as usize - 1] = act,
                Err(e) => return e,
            }
        }
        drop(sigs);
        if oldact_gva != 0 {
            if let Err(e) = self.write_obj(oldact_gva, &old) {
                return e;
            }
        }
        0
    }

    pub fn rt_sigprocmask(
        &self,
        vcpu: &Arc<Vcpu>,
        how: i32,
        set_gva: Gva,
        oldset_gva: Gva,
        sigsetsize: u64,
    ) -> i64 {
        if sigsetsize != 8 {
            return -(libc::EINVAL as i64);
        }
        let old = vcpu.inner.lock().unwrap().sigmask;
        if oldset_gva != 0 {
            if let Err(e) = self.write_obj(oldset_gva, &old) {
                return e;
            }
        }
        if set_gva == 0 {
            return 0;
        }
        let set: u64 = match self.read_obj(set_gva) {
            Ok(s) => s,
            Err(e) => return e,
        };
        let new = match how {
            libc::SIG_BLOCK => old | set,
            libc::SIG_UNBLOCK => old & !set,
            libc::SIG_SETMASK => set,
            _ => return -(libc::EINVAL as i64),
        };
        vcpu.inner.lock().unwrap().sigmask = new & !UNBLOCKABLE;
        0
    }

    pub fn rt_sigpending(&self, vcpu: &Arc<Vcpu>, set_gva: Gva, sigsetsize: u64) -> i64 {
        if sigsetsize != 8 {
            return -(libc::EINVAL as i64);
        }
        let mut set: u64 = 0;
        for si in &self.signals.lock().unwrap().pending {
            set |= sig_bit(si.si_signo);
        }
        for si in &vcpu.inner.lock().unwrap().pending {
            set |= sig_bit(si.si_signo);
        }
        match self.write_obj(set_gva, &set) {
            Ok(()) => 0,
            Err(e) => e,
        }
    }

    pub fn guest_sigaltstack(&self, vcpu: &Arc<Vcpu>, ss_gva: Gva, old_gva: Gva) -> i64 {
        let mut inner = vcpu.inner.lock().unwrap();
        let cur = inner.altstack;
        if old_gva != 0 {
            let mut out = cur;
            let on_it =
                cur.sp != 0 && inner.regs.rsp > cur.sp && inner.regs.rsp <= cur.sp + cur.size;
            out.flags = if on_it { SS_ONSTACK } else { cur.flags };
            drop(inner);
            if let Err(e) = self.write_obj(old_gva, &out) {
                return e;
            }
            inner = vcpu.inner.lock().unwrap();
        }
        if ss_gva == 0 {
            return 0;
        }
        let on_cur = cur.sp != 0
            && inner.regs.rsp > cur.sp
            && inner.regs.rsp <= cur.sp + cur.size;
        if on_cur {
            return -(libc::EPERM as i64);
        }
        drop(inner);
        let ss: GuestStackT = match self.read_obj(ss_gva) {
            Ok(s) => s,
            Err(e) => return e,
        };
        if ss.flags & !SS_DISABLE != 0 {
            return -(libc::EINVAL as i64);
        }
        if ss.flags & SS_DISABLE == 0 && ss.size < MIN_SIGSTACK {
            return -(libc::ENOMEM as i64);
        }
        vcpu.inner.lock().unwrap().altstack = if ss.flags & SS_DISABLE != 0 {
            GuestStackT::default()
        } else {
            ss
        };
        0
    }

    /// kill(): to ourselves through the guest queue, to anyone else
    /// through the host.
    pub fn guest_kill(&self, pid: i32, signo: i32) -> i64 {
        if signo != 0 && !sig_valid(signo) {
            return -(libc::EINVAL as i64);
        }
        let self_pid = self.pid();
        if pid == self_pid {
            if signo != 0 {
                self.post_signal(None, GuestSiginfo::user(signo, self_pid));
            }
            return 0;
        }
        // SAFETY: plain kill(2).
        let rc = unsafe { libc::kill(pid, signo) };
        if rc < 0 {
            -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL) as i64)
        } else {
            0
        }
    }

    pub fn guest_tkill(&self, tid: i32, signo: i32) -> i64 {
        if !sig_valid(signo) {
            return -(libc::EINVAL as i64);
        }
        let self_pid = self.pid();
        // Guest tids are pid + vcpu id; vCPU 0 is the thread group leader.
        let id = tid - self_pid;
        if id >= 0 && (id as usize) < crate::vcpu::MAX_VCPUS {
            let target = {
                let table = self.vcpus.lock().unwrap();
                table.table.get(id as usize).and_then(|s| s.clone())
            };
            if let Some(vcpu) = target {
                self.post_signal(Some(&vcpu), GuestSiginfo::user(signo, self_pid));
                return 0;
            }
            return -(libc::ESRCH as i64);
        }
        // SAFETY: plain tgkill(2) to a foreign thread.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, tid, tid, signo) };
        if rc < 0 {
            -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::ESRCH) as i64)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(std::mem::size_of::<GuestSiginfo>(), 128);
        assert_eq!(std::mem::size_of::<Mcontext>(), 256);
        assert_eq!(std::mem::size_of::<SigAction>(), 32);
        assert_eq!(std::mem::size_of::<GuestStackT>(), 24);
    }

    #[test]
    fn frame_offsets_match_handler_args() {
        assert_eq!(FRAME_INFO_OFFSET, 8);
        assert_eq!(
            FRAME_UC_OFFSET as usize,
            8 + std::mem::size_of::<GuestSiginfo>()
        );
        // The frame base is chosen so RSP at handler entry is 8 mod 16.
        let base = round_down(0x7fff_0000u64 - std::mem::size_of::<SigFrame>() as u64, 16) - 8;
        assert_eq!(base % 16, 8);
    }

    #[test]
    fn default_actions() {
        assert!(matches!(default_action(libc::SIGSEGV), DefaultAction::Core));
        assert!(matches!(
            default_action(libc::SIGTERM),
            DefaultAction::Terminate
        ));
        assert!(matches!(default_action(libc::SIGCHLD), DefaultAction::Ignore));
        assert!(matches!(
            default_action(libc::SIGKILL),
            DefaultAction::Terminate
        ));
    }

    #[test]
    fn unblockable_signals_stay_unblocked() {
        assert_eq!(UNBLOCKABLE & sig_bit(libc::SIGKILL), sig_bit(libc::SIGKILL));
        assert_eq!(UNBLOCKABLE & sig_bit(libc::SIGSTOP), sig_bit(libc::SIGSTOP));
        assert_eq!(UNBLOCKABLE & sig_bit(libc::SIGUSR1), 0);
    }

    #[test]
    fn siginfo_constructors() {
        let si = GuestSiginfo::fault(libc::SIGSEGV, 1, 0xdead_b000);
        assert_eq!(si.si_signo, libc::SIGSEGV);
        assert_eq!(si.fault_addr(), 0xdead_b000);
        let si = GuestSiginfo::child(1234, 17, libc::CLD_EXITED);
        assert_eq!(si.si_signo, libc::SIGCHLD);
        assert_eq!(si.fields[1], 17);
    }
}
