//! Per-environment library state.
//!
//! On an exokernel most of what a conventional kernel keeps per process lives
//! in the environment's own memory, owned by the user library. [`LibOs`]
//! gathers that state: the kernel handle, the cached pointer to the
//! environment's own record (`thisenv`), the registered page fault handler,
//! and the program name used in diagnostics.
//!
//! Because it lives in ordinary user memory, the state is duplicated by
//! `fork` together with the rest of the address space. A child therefore starts
//! with a copy of its parent's [`LibOs`], which still names the *parent* as
//! `thisenv` until the child refreshes it.

use crate::{
    KernelError,
    env::{Env, Envid},
    syscall::{Exokernel, PgfaultHandler},
};

/// The user library's view of the running environment.
pub struct LibOs<K: Exokernel> {
    pub(crate) kernel: K,
    pub(crate) thisenv: usize,
    pub(crate) binaryname: &'static str,
    pub(crate) pgfault_handler: Option<PgfaultHandler<K>>,
}

impl<K: Exokernel> LibOs<K> {
    /// Initializes the library for a freshly started program.
    ///
    /// This is what runs before the program's `umain`: it looks up the
    /// environment's own record so that [`LibOs::thisenv`] is usable.
    pub fn new(kernel: K, binaryname: &'static str) -> Self {
        let thisenv = kernel.sys_getenvid().envx();
        Self {
            kernel,
            thisenv,
            binaryname,
            pgfault_handler: None,
        }
    }

    /// Returns the library state a child observes when it first runs.
    ///
    /// The child's address space is a copy-on-write image of the parent's, so
    /// every field is the parent's value, `thisenv` included. Only `kernel`
    /// differs: it is the handle through which the child traps.
    pub fn inherited_by(&self, kernel: K) -> Self {
        Self {
            kernel,
            thisenv: self.thisenv,
            binaryname: self.binaryname,
            pgfault_handler: self.pgfault_handler,
        }
    }

    /// The kernel handle.
    #[inline]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// The name of the running program.
    #[inline]
    pub fn binaryname(&self) -> &'static str {
        self.binaryname
    }

    /// Reads the environment record that `thisenv` points to.
    pub fn thisenv(&self) -> Env {
        self.kernel.envs(self.thisenv)
    }

    /// Returns the registered page fault handler, if any.
    #[inline]
    pub fn pgfault_handler(&self) -> Option<PgfaultHandler<K>> {
        self.pgfault_handler
    }

    /// Destroys the calling environment.
    pub fn exit(&self) -> Result<(), KernelError> {
        self.kernel.sys_env_destroy(Envid::CURRENT)
    }

    /// Returns a writer that prints through `sys_cputs`.
    pub fn console(&self) -> Console<'_, K> {
        Console(&self.kernel)
    }
}

/// Console output of a user environment.
///
/// ```ignore
/// use core::fmt::Write;
///
/// writeln!(libos.console(), "i am environment {}", libos.thisenv().id).ok();
/// ```
pub struct Console<'a, K: Exokernel>(&'a K);

impl<K: Exokernel> core::fmt::Write for Console<'_, K> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.0.sys_cputs(s);
        Ok(())
    }
}
