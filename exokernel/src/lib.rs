//! # A host model of the exokernel
//!
//! This crate runs the kernel side of the exokernel on a development host so
//! that the user library in `ulib`, and [`LibOs::fork`] in particular, can be
//! exercised without i386 hardware. It models exactly what user space can
//! observe:
//!
//! - [`mm`]: physical page frames with reference counts.
//! - [`page_table`]: two-level i386 page tables stored in those frames.
//! - [`env`]: the environment table, with JOS-style identifiers.
//! - [`syscall`]: the system calls, with the kernel's argument and
//!   permission checks.
//! - [`trap`]: MMU checks on user memory accesses and reflection of page
//!   faults onto the user exception stack.
//! - [`sched`]: the run queue.
//! - [`user`]: user programs, whose library talks to the machine through an
//!   [`EnvHandle`].
//!
//! A [`Machine`] ties these together behind a kernel lock, so programs in
//! different environments may run on different host threads.
//!
//! ```
//! use exokernel::{Machine, MachineConfig, ProgramImage};
//!
//! let machine = Machine::new(MachineConfig::builder().quiet(true).build());
//! let image = ProgramImage::new("hello").data(&[0; 4]);
//! let mut parent = machine.spawn(&image).unwrap();
//! let x = image.data_start();
//!
//! parent.write_u32(x, 1);
//! let child = parent.fork().unwrap();
//! let child = parent.resume_child(child).unwrap();
//! parent.write_u32(x, 2);
//! child.write_u32(x, 3);
//! assert_eq!(parent.read_u32(x), 2);
//! assert_eq!(child.read_u32(x), 3);
//! ```
//!
//! [`LibOs::fork`]: ulib::LibOs::fork

#[macro_use]
extern crate abyss;

pub mod config;
pub mod env;
pub mod loader;
pub mod machine;
pub mod mm;
pub mod page_table;
pub mod sched;
pub mod syscall;
mod test_driver;
pub mod trap;
pub mod user;

pub use config::{MachineConfig, MachineConfigBuilder};
pub use loader::ProgramImage;
pub use machine::{Kernel, Machine};
pub use test_driver::{TestCase, TestDriver};
pub use user::{EnvHandle, Exit, Process};

use std::{cell::RefCell, sync::Arc};

thread_local! {
    static CURRENT: RefCell<Option<Arc<Machine>>> = const { RefCell::new(None) };
}

/// Installs `machine` as the current machine of this thread.
pub fn set_current(machine: Option<Arc<Machine>>) {
    CURRENT.with(|current| *current.borrow_mut() = machine);
}

/// Runs `f` with the current machine of this thread.
///
/// # Panics
/// Panics if no machine is installed. The [`TestDriver`] installs one for
/// each test case.
pub fn with_current<R>(f: impl FnOnce(&Arc<Machine>) -> R) -> R {
    let machine = current();
    f(&machine)
}

/// The current machine of this thread.
///
/// # Panics
/// Panics if no machine is installed.
pub fn current() -> Arc<Machine> {
    match CURRENT.with(|current| current.borrow().clone()) {
        Some(machine) => machine,
        None => panic!("no machine is running on this thread"),
    }
}
