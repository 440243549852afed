//! User programs on the machine.
//!
//! A [`Process`] is a user program running in one environment. It owns the
//! environment's [`LibOs`], whose kernel handle is an [`EnvHandle`]: every
//! system call it makes traps into the machine on behalf of that environment,
//! and its self view (`uvpt`, `uvpd`, `envs`) reads the environment's own
//! page tables.
//!
//! Programs are ordinary host closures. They reach their memory only through
//! [`Process::read`] and [`Process::write`] (and the word-sized variants),
//! which go through the MMU checks of the machine. An access that faults is
//! reflected to the program's page fault handler exactly as the kernel would
//! do it, and retried once the handler returns.
//!
//! Since host code cannot be forked, the continuation of a child is supplied
//! explicitly: after `fork` returned the child's id to the parent,
//! [`Process::resume_child`] produces the child's [`Process`], in which
//! `fork` has just returned `0`.

use crate::{
    machine::{Kernel, Machine},
    trap::{Killed, PageFault},
};
use abyss::{
    addressing::Va,
    paging::{Pde, Pte},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use ulib::{Env, EnvStatus, Envid, Exokernel, KernelError, LibOs, SyscallNumber};

/// Where the machine enters a program on a page fault.
///
/// It stands for the assembly trampoline of a real program; the machine only
/// needs it to be non-zero.
pub const PGFAULT_UPCALL: Va = Va::from_u32(0x0080_0040);

/// How many times the same fault may be taken in a row before the program is
/// considered stuck.
const MAX_REFAULTS: usize = 3;

/// The kernel as seen from one environment.
#[derive(Clone)]
pub struct EnvHandle {
    machine: Arc<Machine>,
    envid: Envid,
}

impl EnvHandle {
    /// A handle trapping into `machine` as `envid`.
    pub fn new(machine: Arc<Machine>, envid: Envid) -> Self {
        Self { machine, envid }
    }

    /// The environment this handle traps as.
    #[inline]
    pub fn envid(&self) -> Envid {
        self.envid
    }

    /// The machine.
    #[inline]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    fn with_env<R>(&self, default: R, f: impl FnOnce(&Kernel, &crate::env::Env) -> R) -> R {
        self.machine.with_kernel(|k| match k.envs.get(self.envid) {
            Some(env) => f(k, env),
            None => default,
        })
    }
}

impl Exokernel for EnvHandle {
    fn syscall(&self, no: SyscallNumber, args: [u32; 5]) -> i32 {
        self.machine.syscall(self.envid, no, args)
    }

    fn uvpt(&self, pn: usize) -> Pte {
        let va = Va::from_pgnum(pn);
        self.with_env(Pte::EMPTY, |k, env| env.pgdir.pte(&k.mem, va))
    }

    fn uvpd(&self, pdx: usize) -> Pde {
        self.with_env(Pde::EMPTY, |k, env| env.pgdir.pde(&k.mem, pdx))
    }

    fn envs(&self, envx: usize) -> Env {
        self.machine.with_kernel(|k| k.envs.record(envx))
    }

    fn upcall_entry(&self) -> Va {
        PGFAULT_UPCALL
    }

    unsafe fn memmove(&self, dst: Va, src: Va, len: usize) {
        let mut buf = vec![0; len];
        let moved = self.machine.with_kernel(|k| {
            k.copy_from_user(self.envid, src, &mut buf)?;
            k.copy_to_user(self.envid, dst, &buf)
        });
        if let Err(fault) = moved {
            panic!(
                "memmove {:08x} <- {:08x}: fault at {:08x} ({:?})",
                dst.into_u32(),
                src.into_u32(),
                fault.va.into_u32(),
                fault.err
            );
        }
    }

    /// Host strings do not live in user memory, so they are handed to the
    /// console directly instead of through `Cputs`.
    fn sys_cputs(&self, s: &str) {
        self.machine.with_kernel(|k| {
            if k.envs.get(self.envid).is_some() {
                k.console_write(s);
            }
        })
    }
}

/// How a program ended other than by returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The kernel destroyed the environment while it was handling a fault.
    Killed,
    /// The program panicked, for example in its page fault handler.
    Panicked(String),
}

impl core::fmt::Display for Exit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Exit::Killed => write!(f, "killed by the kernel"),
            Exit::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// A user program running in an environment.
pub struct Process {
    lib: LibOs<EnvHandle>,
}

impl Process {
    pub(crate) fn new(handle: EnvHandle, binaryname: &'static str) -> Self {
        Self {
            lib: LibOs::new(handle, binaryname),
        }
    }

    /// The environment this program runs in.
    #[inline]
    pub fn envid(&self) -> Envid {
        self.lib.kernel().envid()
    }

    /// The machine.
    #[inline]
    pub fn machine(&self) -> &Arc<Machine> {
        self.lib.kernel().machine()
    }

    /// The program's library state.
    #[inline]
    pub fn lib(&self) -> &LibOs<EnvHandle> {
        &self.lib
    }

    /// The program's library state, mutably.
    #[inline]
    pub fn lib_mut(&mut self) -> &mut LibOs<EnvHandle> {
        &mut self.lib
    }

    /// Calls [`LibOs::fork`].
    pub fn fork(&mut self) -> Result<Envid, KernelError> {
        self.lib.fork()
    }

    /// Runs `child` from the point where it returns from `fork`.
    ///
    /// The child starts with a copy of this program's library state, as the
    /// copy-on-write image of its memory would give it, and then completes
    /// its half of [`LibOs::fork`].
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `child` is not a runnable child of this
    ///   program.
    /// - [`KernelError::InvalidArgument`] if `child` was already resumed.
    pub fn resume_child(&self, child: Envid) -> Result<Process, KernelError> {
        let parent = self.envid();
        self.machine().with_kernel(|k| match k.envs.get_mut(child) {
            Some(env) if env.parent_id == parent && env.status == EnvStatus::Runnable => {
                if env.exofork_pending {
                    env.runs += 1;
                    Ok(())
                } else {
                    Err(KernelError::InvalidArgument)
                }
            }
            _ => Err(KernelError::BadEnv),
        })?;
        let mut lib = self
            .lib
            .inherited_by(EnvHandle::new(self.machine().clone(), child));
        if !lib.fork()?.is_current() {
            return Err(KernelError::Unspecified);
        }
        Ok(Process { lib })
    }

    /// Performs a memory access, reflecting faults to the page fault handler
    /// until it succeeds.
    fn access<R>(&self, mut op: impl FnMut(&mut Kernel, Envid) -> Result<R, PageFault>) -> R {
        let envid = self.envid();
        let mut last: Option<(PageFault, usize)> = None;
        loop {
            let outcome = self.machine().with_kernel(|k| match op(k, envid) {
                Ok(r) => Ok(Ok(r)),
                Err(fault) => k.deliver_pgfault(envid, fault).map(|utf| Err((fault, utf))),
            });
            let (fault, utf) = match outcome {
                Ok(Ok(r)) => return r,
                Ok(Err(delivered)) => delivered,
                Err(Killed) => panic::resume_unwind(Box::new(Killed)),
            };
            let repeats = match last {
                Some((prev, n)) if prev == fault => n + 1,
                _ => 1,
            };
            if repeats > MAX_REFAULTS {
                panic!(
                    "page fault at {:08x} ({:?}) is not resolved by the handler",
                    fault.va.into_u32(),
                    fault.err
                );
            }
            last = Some((fault, repeats));
            self.lib.pgfault_upcall(&utf);
            self.machine().with_kernel(|k| k.upcall_return(envid));
        }
    }

    /// Reads `buf.len()` bytes at `va`.
    pub fn read(&self, va: Va, buf: &mut [u8]) {
        self.access(|k, envid| k.copy_from_user(envid, va, buf))
    }

    /// Writes `buf` at `va`.
    pub fn write(&self, va: Va, buf: &[u8]) {
        self.access(|k, envid| k.copy_to_user(envid, va, buf))
    }

    /// Reads the 32-bit word at `va`.
    pub fn read_u32(&self, va: Va) -> u32 {
        let mut word = [0; 4];
        self.read(va, &mut word);
        u32::from_le_bytes(word)
    }

    /// Writes the 32-bit word at `va`.
    pub fn write_u32(&self, va: Va, value: u32) {
        self.write(va, &value.to_le_bytes())
    }

    /// Runs the program body `f`, then exits.
    ///
    /// A panic in `f` ends only this program: its environment is destroyed
    /// and the panic is reported as [`Exit::Panicked`]. If the kernel
    /// destroys the environment while reflecting a fault, the result is
    /// [`Exit::Killed`].
    pub fn run<R>(mut self, f: impl FnOnce(&mut Process) -> R) -> Result<R, Exit> {
        let envid = self.envid();
        match panic::catch_unwind(AssertUnwindSafe(|| f(&mut self))) {
            Ok(r) => {
                // The program may have destroyed itself already.
                let _ = self.lib.exit();
                Ok(r)
            }
            Err(payload) if payload.is::<Killed>() => Err(Exit::Killed),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Box<dyn Any>".to_string());
                warning!("[{envid}] user panic in {}: {msg}", self.lib.binaryname());
                self.machine().with_kernel(|k| k.kill(envid));
                Err(Exit::Panicked(msg))
            }
        }
    }
}
