//! The system call interface of the exokernel.
//!
//! The exokernel exports a handful of primitives for building address spaces
//! and environments. Everything else, including `fork`, is built on top of
//! them in user space. An environment reaches the kernel in two ways:
//!
//! - **System calls**: a trap carrying a [`SyscallNumber`] and up to five
//!   32-bit arguments. The return value is non-negative on success and a
//!   negated [`KernelError`] code otherwise.
//! - **The read-only self view**: the kernel maps the environment's own page
//!   directory and page tables at `UVPT`/`UVPD` and the environment array at
//!   `UENVS`, so user code can inspect its mappings without trapping.
//!
//! [`Exokernel`] abstracts both. The required methods are the raw trap and
//! the raw reads of the self view; the `sys_*` methods are the typed wrappers
//! every user program uses.

use crate::{
    KernelError,
    env::{Env, EnvStatus, Envid},
    error::check,
};
use abyss::{
    addressing::Va,
    paging::{Pde, Pte, PteFlags},
    trap::UTrapframe,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum SyscallNumber {
    /// Prints a string on the console.
    Cputs = 0,
    /// Reads a character from the console without blocking.
    Cgetc = 1,
    /// Returns the caller's environment id.
    Getenvid = 2,
    /// Destroys an environment.
    EnvDestroy = 3,
    /// Allocates a zeroed page and maps it.
    PageAlloc = 4,
    /// Maps a page of one environment into another.
    PageMap = 5,
    /// Unmaps a page.
    PageUnmap = 6,
    /// Creates a blank child environment.
    Exofork = 7,
    /// Sets the scheduling state of an environment.
    EnvSetStatus = 8,
    /// Sets the page fault upcall of an environment.
    EnvSetPgfaultUpcall = 9,
    /// Gives up the processor.
    Yield = 10,
}

/// A handler for page faults delivered to user space.
///
/// The handler runs on the exception stack with the fault record the kernel
/// pushed there. Returning from it resumes the faulting instruction.
pub type PgfaultHandler<K> = fn(&K, &UTrapframe);

/// The machine as seen from a user environment.
pub trait Exokernel {
    /// Traps into the kernel with system call `no` and returns the raw
    /// result register.
    fn syscall(&self, no: SyscallNumber, args: [u32; 5]) -> i32;

    /// Reads the page table entry of virtual page `pn` through `UVPT`.
    ///
    /// The page directory entry covering `pn` must be present; check it with
    /// [`Exokernel::uvpd`] first.
    fn uvpt(&self, pn: usize) -> Pte;

    /// Reads page directory entry `pdx` through `UVPD`.
    fn uvpd(&self, pdx: usize) -> Pde;

    /// Reads slot `envx` of the environment array at `UENVS`.
    fn envs(&self, envx: usize) -> Env;

    /// Address of the assembly trampoline that the kernel enters on a page
    /// fault.
    fn upcall_entry(&self) -> Va;

    /// Copies `len` bytes from `src` to `dst` inside the caller's own address
    /// space.
    ///
    /// # Safety
    /// Both ranges must be mapped in the caller's address space, `src`
    /// readable and `dst` writable.
    unsafe fn memmove(&self, dst: Va, src: Va, len: usize);

    /// Publishes `handler` to the fault trampoline.
    ///
    /// The i386 target stores it where the trampoline reads it; hosted
    /// models dispatch through [`LibOs::pgfault_upcall`] and keep the default.
    ///
    /// [`LibOs::pgfault_upcall`]: crate::LibOs::pgfault_upcall
    fn install_pgfault_handler(&self, _handler: PgfaultHandler<Self>)
    where
        Self: Sized,
    {
    }

    /// Prints `s` on the console.
    fn sys_cputs(&self, s: &str) {
        self.syscall(
            SyscallNumber::Cputs,
            [s.as_ptr() as usize as u32, s.len() as u32, 0, 0, 0],
        );
    }

    /// Reads a character from the console, or `0` if none is pending.
    fn sys_cgetc(&self) -> i32 {
        self.syscall(SyscallNumber::Cgetc, [0; 5])
    }

    /// Returns the caller's environment id.
    fn sys_getenvid(&self) -> Envid {
        Envid(self.syscall(SyscallNumber::Getenvid, [0; 5]))
    }

    /// Destroys `envid`, which must be the caller or one of its children.
    fn sys_env_destroy(&self, envid: Envid) -> Result<(), KernelError> {
        let args = [envid.0 as u32, 0, 0, 0, 0];
        check(self.syscall(SyscallNumber::EnvDestroy, args)).map(|_| ())
    }

    /// Gives up the processor.
    fn sys_yield(&self) {
        self.syscall(SyscallNumber::Yield, [0; 5]);
    }

    /// Allocates a zeroed page and maps it at `va` in `envid` with `perm`.
    ///
    /// If a page is already mapped at `va`, it is unmapped first.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `envid` is neither the caller nor its
    ///   child.
    /// - [`KernelError::InvalidArgument`] if `va` is at or above `UTOP`, is
    ///   unaligned, or `perm` is not acceptable.
    /// - [`KernelError::NoMemory`] if no frame or page table is available.
    fn sys_page_alloc(&self, envid: Envid, va: Va, perm: PteFlags) -> Result<(), KernelError> {
        let args = [envid.0 as u32, va.into_u32(), perm.bits(), 0, 0];
        check(self.syscall(SyscallNumber::PageAlloc, args)).map(|_| ())
    }

    /// Maps the page at `srcva` in `srcenv` at `dstva` in `dstenv` with
    /// `perm`. Both mappings then share one frame.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if either environment is not accessible.
    /// - [`KernelError::InvalidArgument`] if an address is at or above
    ///   `UTOP` or unaligned, `srcva` is not mapped, `perm` is not acceptable,
    ///   or `perm` asks for write access to a read-only source.
    /// - [`KernelError::NoMemory`] if a page table cannot be allocated.
    fn sys_page_map(
        &self,
        srcenv: Envid,
        srcva: Va,
        dstenv: Envid,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let args = [
            srcenv.0 as u32,
            srcva.into_u32(),
            dstenv.0 as u32,
            dstva.into_u32(),
            perm.bits(),
        ];
        check(self.syscall(SyscallNumber::PageMap, args)).map(|_| ())
    }

    /// Unmaps the page at `va` in `envid`. Unmapping an unmapped page
    /// succeeds.
    fn sys_page_unmap(&self, envid: Envid, va: Va) -> Result<(), KernelError> {
        let args = [envid.0 as u32, va.into_u32(), 0, 0, 0];
        check(self.syscall(SyscallNumber::PageUnmap, args)).map(|_| ())
    }

    /// Creates a child with an empty address space and the caller's register
    /// state, left not runnable.
    ///
    /// # Returns
    /// - `Ok(child)` in the parent.
    /// - `Ok(Envid::CURRENT)` in the child, once it is resumed.
    fn sys_exofork(&self) -> Result<Envid, KernelError> {
        check(self.syscall(SyscallNumber::Exofork, [0; 5])).map(|id| Envid(id as i32))
    }

    /// Sets the scheduling state of `envid`.
    ///
    /// Only [`EnvStatus::Runnable`] and [`EnvStatus::NotRunnable`] are
    /// accepted.
    fn sys_env_set_status(&self, envid: Envid, status: EnvStatus) -> Result<(), KernelError> {
        let args = [envid.0 as u32, status.into(), 0, 0, 0];
        check(self.syscall(SyscallNumber::EnvSetStatus, args)).map(|_| ())
    }

    /// Sets the address the kernel enters when `envid` takes a page fault.
    fn sys_env_set_pgfault_upcall(&self, envid: Envid, upcall: Va) -> Result<(), KernelError> {
        let args = [envid.0 as u32, upcall.into_u32(), 0, 0, 0];
        check(self.syscall(SyscallNumber::EnvSetPgfaultUpcall, args)).map(|_| ())
    }
}
