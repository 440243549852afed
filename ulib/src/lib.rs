//! The user-space library of the exokernel.
//!
//! The exokernel only multiplexes the hardware: it hands out physical pages,
//! lets environments map them, creates blank environments and forwards page
//! faults back to user space. Operating system abstractions are built here,
//! in the address space of each environment. The most important of them is
//! [`LibOs::fork`], a UNIX-style `fork` with copy-on-write implemented
//! entirely on top of the kernel's page mapping primitives.
//!
//! The library talks to the kernel through the [`Exokernel`] trait. On the
//! bare-metal i386 target it is implemented by `arch::Jos`, which traps with
//! `int 0x30` and reads the self view directly; on a development host it is
//! implemented by the `exokernel` crate's machine model.
#![cfg_attr(not(test), no_std)]

pub mod env;
pub mod error;
pub mod fork;
pub mod libos;
pub mod pgfault;
pub mod syscall;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod arch;

#[cfg(test)]
mod testing;

pub use env::{Env, EnvStatus, Envid};
pub use error::KernelError;
pub use libos::LibOs;
pub use syscall::{Exokernel, PgfaultHandler, SyscallNumber};
