// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hypercall dispatch.
//!
//! The guest traps out with `out %eax, %dx` where DX is
//! `PORT_BASE + number` and EAX locates a packed block of seven 64-bit
//! words `{hc_ret, arg1..arg6}` on the calling thread's stack. EAX only
//! carries the low half of the address; the block always lives on the
//! current guest stack, so the stack top supplies the high half.
//!
//! Hypercall numbers mirror Linux x86_64 syscall numbers where a direct
//! correspondence exists; monitor-specific calls live above 500. Handlers
//! return a signed value, negative meaning -errno, and the dispatcher
//! writes it back to `hc_ret` without further interpretation.

use std::sync::Arc;

use kvm_ioctls::VcpuFd;

use crate::mem::mmap::FileBacking;
use crate::signal::{
    GuestSiginfo, FPE_INTDIV, FPE_INTOVF, ILL_ILLOPC, SEGV_ACCERR, SEGV_MAPERR,
};
use crate::vcpu::{sync_regs_with, Vcpu};
use crate::{Gva, Machine};

pub const PORT_BASE: u16 = 0x8000;
pub const MAX_HYPERCALL: u16 = 512;

pub fn is_hypercall_port(port: u16) -> bool {
    (PORT_BASE..PORT_BASE + MAX_HYPERCALL).contains(&port)
}

/// The argument block shared with the guest runtime.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HcArgs {
    pub hc_ret: u64,
    pub arg: [u64; 6],
}

/// What the run loop should do after an exit was handled.
pub enum HcAction {
    Continue,
    ThreadExit(i32),
    Shutdown,
}

enum Outcome {
    Ret(i64),
    /// hc_ret is owned by someone else (fork body, sigreturn).
    NoRet,
    ThreadExit(i32),
    Shutdown,
}

// Linux x86_64 syscall numbers with a direct hypercall correspondence.
const HC_READ: u16 = 0;
const HC_WRITE: u16 = 1;
const HC_OPEN: u16 = 2;
const HC_CLOSE: u16 = 3;
const HC_FSTAT: u16 = 5;
const HC_LSEEK: u16 = 8;
const HC_MMAP: u16 = 9;
const HC_MPROTECT: u16 = 10;
const HC_MUNMAP: u16 = 11;
const HC_BRK: u16 = 12;
const HC_RT_SIGACTION: u16 = 13;
const HC_RT_SIGPROCMASK: u16 = 14;
const HC_RT_SIGRETURN: u16 = 15;
const HC_READV: u16 = 19;
const HC_WRITEV: u16 = 20;
const HC_MREMAP: u16 = 25;
const HC_DUP: u16 = 32;
const HC_DUP2: u16 = 33;
const HC_GETPID: u16 = 39;
const HC_CLONE: u16 = 56;
const HC_FORK: u16 = 57;
const HC_EXECVE: u16 = 59;
const HC_EXIT: u16 = 60;
const HC_WAIT4: u16 = 61;
const HC_KILL: u16 = 62;
const HC_GETPPID: u16 = 110;
const HC_RT_SIGPENDING: u16 = 127;
const HC_SIGALTSTACK: u16 = 131;
const HC_TKILL: u16 = 200;
const HC_FUTEX: u16 = 202;
const HC_SET_TID_ADDRESS: u16 = 218;
const HC_EXIT_GROUP: u16 = 231;
const HC_TGKILL: u16 = 234;
const HC_OPENAT: u16 = 257;
const HC_CLONE3: u16 = 435;

// Monitor-specific hypercalls.
const HC_GUEST_INTERRUPT: u16 = 500;
const HC_UNMAPSELF: u16 = 501;
const HC_TBRK: u16 = 502;
const HC_SNAPSHOT: u16 = 503;
const HC_SNAPSHOT_GETDATA: u16 = 504;
const HC_SNAPSHOT_PUTDATA: u16 = 505;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hypercall {
    Read,
    Write,
    Open,
    Close,
    Fstat,
    Lseek,
    Mmap,
    Mprotect,
    Munmap,
    Brk,
    RtSigaction,
    RtSigprocmask,
    RtSigreturn,
    Readv,
    Writev,
    Mremap,
    Dup,
    Dup2,
    Getpid,
    Clone,
    Fork,
    Execve,
    Exit,
    Wait4,
    Kill,
    Getppid,
    RtSigpending,
    Sigaltstack,
    Tkill,
    Futex,
    SetTidAddress,
    ExitGroup,
    Tgkill,
    Openat,
    Clone3,
    GuestInterrupt,
    Unmapself,
    Tbrk,
    Snapshot,
    SnapshotGetdata,
    SnapshotPutdata,
}

impl Hypercall {
    pub fn from_num(num: u16) -> Option<Hypercall> {
        Some(match num {
            HC_READ => Hypercall::Read,
            HC_WRITE => Hypercall::Write,
            HC_OPEN => Hypercall::Open,
            HC_CLOSE => Hypercall::Close,
            HC_FSTAT => Hypercall::Fstat,
            HC_LSEEK => Hypercall::Lseek,
            HC_MMAP => Hypercall::Mmap,
            HC_MPROTECT => Hypercall::Mprotect,
            HC_MUNMAP => Hypercall::Munmap,
            HC_BRK => Hypercall::Brk,
            HC_RT_SIGACTION => Hypercall::RtSigaction,
            HC_RT_SIGPROCMASK => Hypercall::RtSigprocmask,
            HC_RT_SIGRETURN => Hypercall::RtSigreturn,
            HC_READV => Hypercall::Readv,
            HC_WRITEV => Hypercall::Writev,
            HC_MREMAP => Hypercall::Mremap,
            HC_DUP => Hypercall::Dup,
            HC_DUP2 => Hypercall::Dup2,
            HC_GETPID => Hypercall::Getpid,
            HC_CLONE => Hypercall::Clone,
            HC_FORK => Hypercall::Fork,
            HC_EXECVE => Hypercall::Execve,
            HC_EXIT => Hypercall::Exit,
            HC_WAIT4 => Hypercall::Wait4,
            HC_KILL => Hypercall::Kill,
            HC_GETPPID => Hypercall::Getppid,
            HC_RT_SIGPENDING => Hypercall::RtSigpending,
            HC_SIGALTSTACK => Hypercall::Sigaltstack,
            HC_TKILL => Hypercall::Tkill,
            HC_FUTEX => Hypercall::Futex,
            HC_SET_TID_ADDRESS => Hypercall::SetTidAddress,
            HC_EXIT_GROUP => Hypercall::ExitGroup,
            HC_TGKILL => Hypercall::Tgkill,
            HC_OPENAT => Hypercall::Openat,
            HC_CLONE3 => Hypercall::Clone3,
            HC_GUEST_INTERRUPT => Hypercall::GuestInterrupt,
            HC_UNMAPSELF => Hypercall::Unmapself,
            HC_TBRK => Hypercall::Tbrk,
            HC_SNAPSHOT => Hypercall::Snapshot,
            HC_SNAPSHOT_GETDATA => Hypercall::SnapshotGetdata,
            HC_SNAPSHOT_PUTDATA => Hypercall::SnapshotPutdata,
            _ => return None,
        })
    }
}

/// The argument block sits on the calling thread's stack; EAX carries the
/// low 32 address bits and the stack top anchors the high ones.
fn hc_args_gva(vcpu: &Arc<Vcpu>, eax: u32) -> Gva {
    let anchor = vcpu.inner.lock().unwrap().stack_top;
    (anchor & !0xffff_ffffu64) | eax as u64
}

pub fn dispatch(
    machine: &Machine,
    vcpu: &Arc<Vcpu>,
    fd: &VcpuFd,
    port: u16,
    eax: u32,
) -> HcAction {
    let num = port - PORT_BASE;
    let args_gva = hc_args_gva(vcpu, eax);
    let mut args: HcArgs = match machine.read_obj(args_gva) {
        Ok(a) => a,
        Err(_) => {
            machine.post_fault_signal(
                vcpu,
                GuestSiginfo::fault(libc::SIGSEGV, SEGV_MAPERR, args_gva),
            );
            return HcAction::Continue;
        }
    };
    let hc = match Hypercall::from_num(num) {
        Some(hc) => hc,
        None => {
            tracing::warn!(target: "monitor::hc", num, "unknown hypercall");
            args.hc_ret = -(libc::ENOSYS as i64) as u64;
            let _ = machine.write_obj(args_gva, &args.hc_ret);
            return HcAction::Continue;
        }
    };
    tracing::trace!(target: "monitor::hc", ?hc, args = ?args.arg, "hypercall");

    match handle(machine, vcpu, fd, hc, &args, Some(args_gva)) {
        Outcome::Ret(v) => {
            let _ = machine.write_obj(args_gva, &(v as u64));
            HcAction::Continue
        }
        Outcome::NoRet => HcAction::Continue,
        Outcome::ThreadExit(st) => HcAction::ThreadExit(st),
        Outcome::Shutdown => HcAction::Shutdown,
    }
}

fn handle(
    machine: &Machine,
    vcpu: &Arc<Vcpu>,
    fd: &VcpuFd,
    hc: Hypercall,
    args: &HcArgs,
    args_gva: Option<Gva>,
) -> Outcome {
    let a = &args.arg;
    let machine_arc = machine.arc();
    match hc {
        // Memory.
        Hypercall::Brk => Outcome::Ret(machine.mem_brk(a[0])),
        Hypercall::Tbrk => Outcome::Ret(machine.guest_tbrk(a[0])),
        Hypercall::Mmap => {
            let flags = a[3] as i32;
            let backing = if flags & libc::MAP_ANONYMOUS == 0 {
                match machine.host_fd(a[4] as i32) {
                    Some(fd) => Some(FileBacking {
                        fd,
                        offset: a[5],
                    }),
                    None => return Outcome::Ret(-(libc::EBADF as i64)),
                }
            } else {
                None
            };
            Outcome::Ret(machine.guest_mmap(a[0], a[1], a[2] as i32, flags, backing))
        }
        Hypercall::Munmap => Outcome::Ret(machine.guest_munmap(a[0], a[1])),
        Hypercall::Mprotect => Outcome::Ret(machine.guest_mprotect(a[0], a[1], a[2] as i32)),
        Hypercall::Mremap => {
            Outcome::Ret(machine.guest_mremap(a[0], a[1], a[2], a[3] as i32, a[4]))
        }

        // Threading.
        Hypercall::Clone => {
            if a[0] & libc::CLONE_THREAD as u64 != 0 {
                if let Err(e) = sync_regs_with(fd, &mut vcpu.inner.lock().unwrap()) {
                    return Outcome::Ret(e);
                }
                Outcome::Ret(machine_arc.guest_clone(vcpu, a[0], a[1], a[2], a[3], a[4]))
            } else {
                match args_gva {
                    Some(gva) => match machine.before_fork(vcpu, fd, args, gva, true) {
                        Ok(()) => Outcome::NoRet,
                        Err(e) => Outcome::Ret(e),
                    },
                    None => Outcome::Ret(-(libc::ENOSYS as i64)),
                }
            }
        }
        Hypercall::Clone3 => {
            #[repr(C)]
            #[derive(Clone, Copy, Default)]
            struct CloneArgs {
                flags: u64,
                pidfd: u64,
                child_tid: u64,
                parent_tid: u64,
                exit_signal: u64,
                stack: u64,
                stack_size: u64,
                tls: u64,
                set_tid: u64,
                set_tid_size: u64,
                cgroup: u64,
            }
            if a[1] < 64 {
                return Outcome::Ret(-(libc::EINVAL as i64));
            }
            let cl: CloneArgs = match machine.read_obj(a[0]) {
                Ok(c) => c,
                Err(e) => return Outcome::Ret(e),
            };
            if cl.set_tid_size != 0 || cl.cgroup != 0 {
                return Outcome::Ret(-(libc::ENOSYS as i64));
            }
            let flat = HcArgs {
                hc_ret: 0,
                arg: [
                    cl.flags | cl.exit_signal,
                    cl.stack + cl.stack_size,
                    cl.parent_tid,
                    cl.child_tid,
                    cl.tls,
                    0,
                ],
            };
            if flat.arg[0] & libc::CLONE_THREAD as u64 != 0 {
                if let Err(e) = sync_regs_with(fd, &mut vcpu.inner.lock().unwrap()) {
                    return Outcome::Ret(e);
                }
                Outcome::Ret(machine_arc.guest_clone(
                    vcpu,
                    flat.arg[0],
                    flat.arg[1],
                    flat.arg[2],
                    flat.arg[3],
                    flat.arg[4],
                ))
            } else {
                match args_gva {
                    Some(gva) => match machine.before_fork(vcpu, fd, &flat, gva, true) {
                        Ok(()) => Outcome::NoRet,
                        Err(e) => Outcome::Ret(e),
                    },
                    None => Outcome::Ret(-(libc::ENOSYS as i64)),
                }
            }
        }
        Hypercall::SetTidAddress => Outcome::Ret(machine.guest_set_tid_address(vcpu, a[0])),
        Hypercall::Futex => Outcome::Ret(guest_futex(machine, a)),
        Hypercall::Exit => Outcome::ThreadExit(a[0] as i32),
        Hypercall::ExitGroup => {
            machine.request_shutdown(a[0] as i32 & 0xff);
            Outcome::Shutdown
        }

        // Signals.
        Hypercall::RtSigaction => {
            Outcome::Ret(machine.rt_sigaction(a[0] as i32, a[1], a[2], a[3]))
        }
        Hypercall::RtSigprocmask => {
            Outcome::Ret(machine.rt_sigprocmask(vcpu, a[0] as i32, a[1], a[2], a[3]))
        }
        Hypercall::RtSigpending => Outcome::Ret(machine.rt_sigpending(vcpu, a[0], a[1])),
        Hypercall::RtSigreturn => {
            if let Err(e) = sync_regs_with(fd, &mut vcpu.inner.lock().unwrap()) {
                return Outcome::Ret(e);
            }
            match machine.sigreturn(vcpu) {
                Ok(()) => Outcome::NoRet,
                Err(_) => {
                    machine.fatal_signal(libc::SIGSEGV, true);
                    Outcome::Shutdown
                }
            }
        }
        Hypercall::Sigaltstack => {
            if let Err(e) = sync_regs_with(fd, &mut vcpu.inner.lock().unwrap()) {
                return Outcome::Ret(e);
            }
            Outcome::Ret(machine.guest_sigaltstack(vcpu, a[0], a[1]))
        }
        Hypercall::Kill => Outcome::Ret(machine.guest_kill(a[0] as i32, a[1] as i32)),
        Hypercall::Tkill => Outcome::Ret(machine.guest_tkill(a[0] as i32, a[1] as i32)),
        Hypercall::Tgkill => {
            if a[0] as i32 == machine.pid() {
                Outcome::Ret(machine.guest_tkill(a[1] as i32, a[2] as i32))
            } else {
                // SAFETY: plain tgkill(2) to a foreign process.
                let rc = unsafe {
                    libc::syscall(libc::SYS_tgkill, a[0] as i32, a[1] as i32, a[2] as i32)
                };
                Outcome::Ret(if rc < 0 { -errno() } else { rc as i64 })
            }
        }

        // Process.
        Hypercall::Fork => match args_gva {
            Some(gva) => match machine.before_fork(vcpu, fd, args, gva, false) {
                Ok(()) => Outcome::NoRet,
                Err(e) => Outcome::Ret(e),
            },
            None => Outcome::Ret(-(libc::ENOSYS as i64)),
        },
        Hypercall::Wait4 => Outcome::Ret(guest_wait4(machine, a)),
        Hypercall::Getpid => Outcome::Ret(machine.pid() as i64),
        Hypercall::Getppid => Outcome::Ret(machine.ppid() as i64),
        Hypercall::Execve => Outcome::Ret(machine.guest_execve(a[0], a[1], a[2])),

        // I/O, delegated to the fd table.
        Hypercall::Read => Outcome::Ret(machine.guest_read(a[0] as i32, a[1], a[2])),
        Hypercall::Write => Outcome::Ret(machine.guest_write(a[0] as i32, a[1], a[2])),
        Hypercall::Readv => Outcome::Ret(machine.guest_readv(a[0] as i32, a[1], a[2] as i32)),
        Hypercall::Writev => Outcome::Ret(machine.guest_writev(a[0] as i32, a[1], a[2] as i32)),
        Hypercall::Open => Outcome::Ret(machine.guest_openat(
            libc::AT_FDCWD,
            a[0],
            a[1] as i32,
            a[2] as u32,
        )),
        Hypercall::Openat => {
            let dirfd = match a[0] as i32 {
                libc::AT_FDCWD => libc::AT_FDCWD,
                gfd => match machine.host_fd(gfd) {
                    Some(h) => h,
                    None => return Outcome::Ret(-(libc::EBADF as i64)),
                },
            };
            Outcome::Ret(machine.guest_openat(dirfd, a[1], a[2] as i32, a[3] as u32))
        }
        Hypercall::Close => Outcome::Ret(machine.guest_close(a[0] as i32)),
        Hypercall::Lseek => Outcome::Ret(machine.guest_lseek(a[0] as i32, a[1] as i64, a[2] as i32)),
        Hypercall::Dup => Outcome::Ret(machine.guest_dup(a[0] as i32)),
        Hypercall::Dup2 => Outcome::Ret(machine.guest_dup2(a[0] as i32, a[1] as i32)),
        Hypercall::Fstat => Outcome::Ret(machine.guest_fstat(a[0] as i32, a[1])),

        // Snapshot hooks (external serializer).
        Hypercall::Snapshot => Outcome::Ret(machine.snapshot_take(args)),
        Hypercall::SnapshotGetdata => Outcome::Ret(machine.snapshot_getdata(args)),
        Hypercall::SnapshotPutdata => Outcome::Ret(machine.snapshot_putdata(args)),

        // Control.
        Hypercall::Unmapself => {
            vcpu.inner.lock().unwrap().delayed_munmap = Some((a[0], a[1]));
            Outcome::ThreadExit(0)
        }
        Hypercall::GuestInterrupt => guest_interrupt(machine, vcpu, fd, a),
    }
}

/// Exception report from the runtime's IDT stubs: vector, error code,
/// fault address, then the interrupted RIP/RSP/RFLAGS. The interrupted
/// context is restored into the register cache before the signal is
/// posted so the delivered frame describes the faulting instruction, not
/// the stub.
fn guest_interrupt(
    machine: &Machine,
    vcpu: &Arc<Vcpu>,
    fd: &VcpuFd,
    a: &[u64; 6],
) -> Outcome {
    let (vector, error, cr2, rip, rsp, rflags) = (a[0], a[1], a[2], a[3], a[4], a[5]);
    {
        let mut inner = vcpu.inner.lock().unwrap();
        if sync_regs_with(fd, &mut inner).is_err() {
            machine.fatal_signal(libc::SIGSEGV, true);
            return Outcome::Shutdown;
        }
        inner.regs.rip = rip;
        inner.regs.rsp = rsp;
        inner.regs.rflags = rflags;
        inner.regs_dirty = true;
    }

    let si = match vector {
        0 => GuestSiginfo::fault(libc::SIGFPE, FPE_INTDIV, rip),
        3 => GuestSiginfo::fault(libc::SIGTRAP, 1, rip),
        4 => GuestSiginfo::fault(libc::SIGFPE, FPE_INTOVF, rip),
        6 => {
            // A #UD at a syscall opcode is the runtime using the kernel
            // ABI; remap it onto the hypercall table.
            let mut opcode = [0u8; 2];
            if machine.read_guest(rip, &mut opcode).is_ok() && opcode == [0x0f, 0x05] {
                return remap_syscall(machine, vcpu, fd);
            }
            GuestSiginfo::fault(libc::SIGILL, ILL_ILLOPC, rip)
        }
        13 => GuestSiginfo::fault(libc::SIGSEGV, SEGV_ACCERR, cr2),
        14 => {
            let code = if error & 0x1 != 0 {
                SEGV_ACCERR
            } else {
                SEGV_MAPERR
            };
            GuestSiginfo::fault(libc::SIGSEGV, code, cr2)
        }
        _ => GuestSiginfo::fault(libc::SIGSEGV, SEGV_MAPERR, cr2),
    };
    tracing::debug!(target: "monitor::hc", vector, rip, cr2, signo = si.si_signo, "guest exception");
    machine.post_fault_signal(vcpu, si);
    Outcome::NoRet
}

/// Execute a trapped `syscall` instruction as a hypercall: number in RAX,
/// arguments in the syscall registers, result back in RAX, RIP advanced
/// past the two-byte opcode.
fn remap_syscall(machine: &Machine, vcpu: &Arc<Vcpu>, fd: &VcpuFd) -> Outcome {
    let (num, flat) = {
        let inner = vcpu.inner.lock().unwrap();
        let r = &inner.regs;
        (
            r.rax,
            HcArgs {
                hc_ret: 0,
                arg: [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9],
            },
        )
    };
    let hc = match Hypercall::from_num(num as u16) {
        Some(hc) if num < MAX_HYPERCALL as u64 => hc,
        _ => {
            finish_syscall(vcpu, -(libc::ENOSYS as i64));
            return Outcome::NoRet;
        }
    };
    // The register-convention path cannot carry the calls that need the
    // on-stack argument block or replace the whole register file.
    let ret = match hc {
        Hypercall::Fork
        | Hypercall::Clone
        | Hypercall::Clone3
        | Hypercall::RtSigreturn
        | Hypercall::Execve => -(libc::ENOSYS as i64),
        _ => match handle(machine, vcpu, fd, hc, &flat, None) {
            Outcome::Ret(v) => v,
            Outcome::NoRet => 0,
            Outcome::ThreadExit(st) => return Outcome::ThreadExit(st),
            Outcome::Shutdown => return Outcome::Shutdown,
        },
    };
    finish_syscall(vcpu, ret);
    Outcome::NoRet
}

fn finish_syscall(vcpu: &Arc<Vcpu>, ret: i64) {
    let mut inner = vcpu.inner.lock().unwrap();
    inner.regs.rax = ret as u64;
    inner.regs.rip += 2;
    inner.regs_dirty = true;
}

fn guest_futex(machine: &Machine, a: &[u64; 6]) -> i64 {
    let uaddr = match machine.gva_to_kma(a[0]) {
        Some(p) => p,
        None => return -(libc::EFAULT as i64),
    };
    let op = a[1] as i32;
    let cmd = op & !(libc::FUTEX_PRIVATE_FLAG | libc::FUTEX_CLOCK_REALTIME);
    // arg4 is a timespec pointer only for the waiting commands.
    let timeout_is_ptr = matches!(
        cmd,
        libc::FUTEX_WAIT | libc::FUTEX_WAIT_BITSET | libc::FUTEX_LOCK_PI
    );
    let arg4: u64 = if timeout_is_ptr && a[3] != 0 {
        match machine.gva_to_kma(a[3]) {
            Some(p) => p as u64,
            None => return -(libc::EFAULT as i64),
        }
    } else {
        a[3]
    };
    let uaddr2: u64 = if a[4] != 0 {
        match machine.gva_to_kma(a[4]) {
            Some(p) => p as u64,
            None => return -(libc::EFAULT as i64),
        }
    } else {
        0
    };
    // SAFETY: futex on validated guest memory aliases; blocking waits are
    // interruptible by the vCPU kick signal.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            uaddr,
            op,
            a[2] as u32,
            arg4,
            uaddr2,
            a[5] as u32,
        )
    };
    if rc < 0 {
        -errno()
    } else {
        rc as i64
    }
}

fn guest_wait4(machine: &Machine, a: &[u64; 6]) -> i64 {
    let mut status: i32 = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: out-params are locals, written back to the guest below.
    let rc = unsafe {
        libc::wait4(
            a[0] as i32,
            &mut status,
            a[2] as i32,
            if a[3] != 0 {
                &mut rusage
            } else {
                std::ptr::null_mut()
            },
        )
    };
    if rc < 0 {
        return -errno();
    }
    if a[1] != 0 {
        if let Err(e) = machine.write_obj(a[1], &status) {
            return e;
        }
    }
    if a[3] != 0 {
        if let Err(e) = machine.write_obj(a[3], &rusage) {
            return e;
        }
    }
    rc as i64
}

fn errno() -> i64 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_block_layout() {
        assert_eq!(std::mem::size_of::<HcArgs>(), 56);
    }

    #[test]
    fn port_window() {
        assert!(is_hypercall_port(PORT_BASE));
        assert!(is_hypercall_port(PORT_BASE + HC_EXIT_GROUP));
        assert!(!is_hypercall_port(PORT_BASE + MAX_HYPERCALL));
        assert!(!is_hypercall_port(0x3f8));
    }

    #[test]
    fn decode_mirrors_syscall_numbers() {
        assert_eq!(Hypercall::from_num(1), Some(Hypercall::Write));
        assert_eq!(Hypercall::from_num(9), Some(Hypercall::Mmap));
        assert_eq!(Hypercall::from_num(60), Some(Hypercall::Exit));
        assert_eq!(Hypercall::from_num(231), Some(Hypercall::ExitGroup));
        assert_eq!(Hypercall::from_num(435), Some(Hypercall::Clone3));
        assert_eq!(Hypercall::from_num(500), Some(Hypercall::GuestInterrupt));
        assert_eq!(Hypercall::from_num(2), Some(Hypercall::Open));
        assert_eq!(Hypercall::from_num(4), None);
        assert_eq!(Hypercall::from_num(511), None);
    }
}
