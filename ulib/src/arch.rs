//! The i386 JOS kernel.
//!
//! System calls trap through `int 0x30` with the number in `%eax` and the
//! arguments in `%edx`, `%ecx`, `%ebx`, `%edi` and `%esi`. The self view is
//! read straight from memory: the kernel maps it read-only into every
//! environment.
//!
//! The fault trampoline `_pgfault_upcall` is written in assembly and linked
//! with the program. It calls through `_pgfault_handler`, which
//! [`Jos::install_pgfault_handler`] points at the registered handler.

use crate::{
    env::{Env, EnvStatus, Envid},
    syscall::{Exokernel, PgfaultHandler, SyscallNumber},
};
use abyss::{
    addressing::Va,
    memlayout::{UENVS, UVPD, UVPT},
    paging::{Pde, Pte},
    spinlock::SpinLock,
    trap::UTrapframe,
};
use core::sync::atomic::{AtomicUsize, Ordering};

unsafe extern "C" {
    fn _pgfault_upcall();
}

/// Read by the trampoline: the function it calls with the fault record.
#[allow(non_upper_case_globals)]
#[unsafe(no_mangle)]
static _pgfault_handler: AtomicUsize = AtomicUsize::new(0);

static HANDLER: SpinLock<Option<PgfaultHandler<Jos>>> = SpinLock::new(None);

extern "C" fn dispatch(utf: *const UTrapframe) {
    let guard = HANDLER.lock();
    let handler = *guard;
    guard.unlock();
    if let Some(handler) = handler {
        // SAFETY: the trampoline passes the record it found on the exception
        // stack.
        handler(&Jos, unsafe { &*utf });
    }
}

/// Layout of `struct Env` in the kernel's environment array.
#[allow(dead_code)]
#[repr(C)]
struct RawEnv {
    tf: [u32; 17],
    link: u32,
    id: i32,
    parent_id: i32,
    env_type: u32,
    status: u32,
    runs: u32,
    cpunum: i32,
    pgdir: u32,
    pgfault_upcall: u32,
    ipc_recving: u32,
    ipc_dstva: u32,
    ipc_value: u32,
    ipc_from: i32,
    ipc_perm: i32,
}

/// The running kernel.
#[derive(Clone, Copy)]
pub struct Jos;

impl Exokernel for Jos {
    fn syscall(&self, no: SyscallNumber, args: [u32; 5]) -> i32 {
        let ret: u32;
        // SAFETY: the kernel preserves every register except %eax. %esi is
        // reserved by the compiler, so it is saved around the trap.
        unsafe {
            core::arch::asm!(
                "push esi",
                "mov esi, [edi + 16]",
                "mov edi, [edi + 12]",
                "int 0x30",
                "pop esi",
                inlateout("eax") u32::from(no) => ret,
                in("edx") args[0],
                in("ecx") args[1],
                in("ebx") args[2],
                inlateout("edi") args.as_ptr() => _,
            );
        }
        ret as i32
    }

    fn uvpt(&self, pn: usize) -> Pte {
        // SAFETY: UVPT is mapped read-only in every environment; the caller
        // checked that the covering page table exists.
        Pte(unsafe { core::ptr::read_volatile((UVPT.into_usize() as *const u32).add(pn)) })
    }

    fn uvpd(&self, pdx: usize) -> Pde {
        // SAFETY: the page directory is always mapped at UVPD.
        Pde(unsafe { core::ptr::read_volatile((UVPD.into_usize() as *const u32).add(pdx)) })
    }

    fn envs(&self, envx: usize) -> Env {
        // SAFETY: the environment array is always mapped at UENVS.
        let raw = unsafe { &*(UENVS.into_usize() as *const RawEnv).add(envx) };
        Env {
            id: Envid(raw.id),
            parent_id: Envid(raw.parent_id),
            status: EnvStatus::try_from(raw.status).unwrap_or(EnvStatus::Free),
            runs: raw.runs,
            pgfault_upcall: raw.pgfault_upcall,
        }
    }

    fn upcall_entry(&self) -> Va {
        Va::from_u32(_pgfault_upcall as usize as u32)
    }

    unsafe fn memmove(&self, dst: Va, src: Va, len: usize) {
        unsafe {
            core::ptr::copy(
                src.into_usize() as *const u8,
                dst.into_usize() as *mut u8,
                len,
            )
        }
    }

    fn install_pgfault_handler(&self, handler: PgfaultHandler<Self>) {
        let mut guard = HANDLER.lock();
        *guard = Some(handler);
        guard.unlock();
        _pgfault_handler.store(dispatch as usize, Ordering::SeqCst);
    }
}
