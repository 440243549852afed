//! The abyss of the exokernel: definitions both sides of the system call
//! boundary agree on.
//!
//! This crate contains the i386 paging structures, the fixed virtual memory
//! layout, the fault record that the kernel pushes on the user exception
//! stack, and the console and locking primitives shared by the kernel model
//! and the user library.
//!
//! Nothing here allocates or talks to hardware, so the crate builds both for
//! the bare-metal i386 target and for a development host.
#![cfg_attr(not(test), no_std)]

use core::sync::atomic::AtomicBool;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod memlayout;
pub mod paging;
pub mod spinlock;
pub mod trap;

/// Mutes `info!`, `warning!` and `debug!` when set.
pub static QUITE: AtomicBool = AtomicBool::new(false);
