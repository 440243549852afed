//! User-level page fault handling support.
//!
//! The kernel does not resolve page faults of user environments. When an
//! environment faults, the kernel switches to the environment's exception
//! stack (the page ending at [`UXSTACKTOP`]), pushes a [`UTrapframe`] there,
//! and jumps to the environment's registered upcall. The upcall is a small
//! assembly trampoline that calls the handler registered here and then
//! restores the trap-time registers to resume the faulting instruction.

use crate::{
    KernelError, LibOs,
    env::Envid,
    syscall::{Exokernel, PgfaultHandler},
};
use abyss::{addressing::PAGE_SIZE, memlayout::UXSTACKTOP, paging::PteFlags, trap::UTrapframe};

impl<K: Exokernel> LibOs<K> {
    /// Sets the page fault handler function.
    ///
    /// The first time a handler is registered, this allocates the one-page
    /// exception stack below [`UXSTACKTOP`] and tells the kernel to enter the
    /// trampoline on page faults. Later calls only replace the handler.
    ///
    /// # Errors
    /// Returns the kernel error if the exception stack cannot be allocated or
    /// the upcall cannot be registered. The handler is left unchanged.
    pub fn set_pgfault_handler(&mut self, handler: PgfaultHandler<K>) -> Result<(), KernelError> {
        if self.pgfault_handler.is_none() {
            self.kernel.sys_page_alloc(
                Envid::CURRENT,
                UXSTACKTOP - PAGE_SIZE,
                PteFlags::P | PteFlags::U | PteFlags::W,
            )?;
            self.kernel
                .sys_env_set_pgfault_upcall(Envid::CURRENT, self.kernel.upcall_entry())?;
        }
        self.pgfault_handler = Some(handler);
        self.kernel.install_pgfault_handler(handler);
        Ok(())
    }

    /// Runs the registered handler for the fault described by `utf`.
    ///
    /// This is the Rust half of the trampoline.
    ///
    /// # Panics
    /// Panics if no handler is registered; the kernel only enters the
    /// trampoline after [`LibOs::set_pgfault_handler`] succeeded.
    pub fn pgfault_upcall(&self, utf: &UTrapframe) {
        match self.pgfault_handler {
            Some(handler) => handler(&self.kernel, utf),
            None => panic!(
                "page fault at {:08x} (err {:?}) with no handler registered",
                utf.fault_va, utf.err()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        LibOs,
        env::Envid,
        testing::{Call, FakeKernel, UPCALL},
    };
    use abyss::{addressing::PAGE_SIZE, memlayout::UXSTACKTOP, paging::PteFlags, trap::UTrapframe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn count(_: &FakeKernel, utf: &UTrapframe) {
        SEEN.store(utf.fault_va as usize, Ordering::SeqCst);
    }

    #[test]
    fn first_registration_sets_up_exception_stack() {
        let mut lib = LibOs::new(FakeKernel::parent(), "pgfault");
        lib.kernel().calls.borrow_mut().clear();
        lib.set_pgfault_handler(count).unwrap();
        lib.set_pgfault_handler(count).unwrap();
        assert_eq!(
            *lib.kernel().calls.borrow(),
            vec![
                Call::PageAlloc(
                    Envid::CURRENT,
                    UXSTACKTOP - PAGE_SIZE,
                    PteFlags::P | PteFlags::U | PteFlags::W
                ),
                Call::SetUpcall(Envid::CURRENT, UPCALL),
            ]
        );

        lib.pgfault_upcall(&UTrapframe {
            fault_va: 0xdead_b000,
            ..Default::default()
        });
        assert_eq!(SEEN.load(Ordering::SeqCst), 0xdead_b000);
    }

    #[test]
    fn failed_registration_keeps_no_handler() {
        let mut lib = LibOs::new(FakeKernel::parent(), "pgfault");
        lib.kernel().fail_call(lib.kernel().calls.borrow().len());
        assert!(lib.set_pgfault_handler(count).is_err());
        assert!(lib.pgfault_handler().is_none());
    }

    #[test]
    #[should_panic(expected = "no handler registered")]
    fn upcall_without_handler() {
        let lib = LibOs::new(FakeKernel::parent(), "pgfault");
        lib.pgfault_upcall(&UTrapframe::default());
    }
}
