//! # `fork` with Copy-On-Write, in user space.
//!
//! The exokernel has no `fork` system call. It only offers primitives to
//! create a blank environment ([`Exokernel::sys_exofork`]) and to share
//! pages between address spaces ([`Exokernel::sys_page_map`]). A parent
//! builds its child out of these, and resolves the resulting copy-on-write
//! faults itself.
//!
//! ### Copy-On-Write
//!
//! Instead of copying every page at fork time, the parent maps each of its
//! writable pages into the child and marks the mapping in *both* address
//! spaces read-only with the software [`PteFlags::COW`] bit. Read-only pages
//! are simply shared. The first write to a COW page, by either side, faults
//! into [`pgfault`], which gives the writer a private writable copy and
//! leaves the other side's mapping untouched. Pages that are never written
//! are never copied.
//!
//! The exception stack is the one page that is never shared: the fault
//! handler runs on it, so it must be writable without faulting. The child
//! receives a fresh one.
//!
//! In short, `fork` works as follows:
//! 1. Register [`pgfault`] as the page fault handler.
//! 2. Create the child with [`Exokernel::sys_exofork`].
//! 3. Walk the parent's page tables through the self view and call
//!    [`duppage`] on every present page below `UTOP`, except the exception
//!    stack.
//! 4. Give the child its own exception stack and fault upcall.
//! 5. Mark the child runnable.

use crate::{
    KernelError, LibOs,
    env::{EnvStatus, Envid},
    syscall::Exokernel,
};
use abyss::{
    addressing::{NPTENTRIES, PAGE_SIZE, Va},
    memlayout::{PFTEMP, UTOP_PDX, UXSTACKTOP, is_exception_stack},
    paging::{Pte, PteFlags},
    trap::{PFErrorCode, UTrapframe},
};

/// Why a page fault could not be resolved as a copy-on-write fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowFaultError {
    /// The faulting access was not a write.
    NotWrite {
        /// Faulting address.
        va: Va,
        /// Error code of the fault.
        err: PFErrorCode,
    },
    /// The faulting page is not marked copy-on-write.
    NotCopyOnWrite {
        /// Faulting address.
        va: Va,
        /// Page table entry of the faulting page.
        pte: Pte,
    },
    /// A kernel primitive failed while installing the private copy.
    Kernel {
        /// The primitive that failed.
        step: &'static str,
        /// Faulting address.
        va: Va,
        /// The error the kernel reported.
        error: KernelError,
    },
}

impl CowFaultError {
    fn kernel(step: &'static str, va: Va) -> impl Fn(KernelError) -> Self {
        move |error| Self::Kernel { step, va, error }
    }
}

impl core::fmt::Display for CowFaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CowFaultError::NotWrite { va, err } => {
                write!(f, "fault at {va:08x} is not a write (err {:?})", err)
            }
            CowFaultError::NotCopyOnWrite { va, pte } => {
                write!(f, "page at {va:08x} is not copy-on-write ({:?})", pte)
            }
            CowFaultError::Kernel { step, va, error } => {
                write!(f, "{step} failed while copying {va:08x}: {error}")
            }
        }
    }
}

/// Installs a private writable copy of the copy-on-write page that `utf`
/// faulted on.
///
/// ### Steps:
/// 1. Check that the fault is a write to a page marked [`PteFlags::COW`].
/// 2. Allocate a new page at [`PFTEMP`] and copy the faulting page into it.
/// 3. Unmap the shared page and map the new page at the faulting address,
///    writable.
/// 4. Unmap [`PFTEMP`].
///
/// Only the faulting environment's mapping changes. The frame it used to
/// share stays mapped, read-only COW, in every other environment.
///
/// ### Returns
/// - `Ok(())` once the faulting page is privately writable.
/// - `Err(CowFaultError)` describing the rejected fault or failed primitive.
///   A rejected fault leaves the address space untouched.
pub fn resolve_cow_fault<K: Exokernel + ?Sized>(
    kernel: &K,
    utf: &UTrapframe,
) -> Result<(), CowFaultError> {
    let addr = utf.fault_va().page_down();
    let err = utf.err();
    if !err.contains(PFErrorCode::WRITE_ACCESS) {
        return Err(CowFaultError::NotWrite { va: addr, err });
    }
    let pte = if kernel.uvpd(addr.pdx()).is_present() {
        kernel.uvpt(addr.pgnum())
    } else {
        Pte::EMPTY
    };
    if !pte.is_present() || !pte.flags().contains(PteFlags::COW) {
        return Err(CowFaultError::NotCopyOnWrite { va: addr, pte });
    }

    let failed = |step| CowFaultError::kernel(step, addr);
    let perm = PteFlags::P | PteFlags::U | PteFlags::W;
    kernel
        .sys_page_alloc(Envid::CURRENT, PFTEMP, perm)
        .map_err(failed("sys_page_alloc"))?;
    // SAFETY: PFTEMP was just mapped writable and `addr` is present.
    unsafe { kernel.memmove(PFTEMP, addr, PAGE_SIZE) };
    kernel
        .sys_page_unmap(Envid::CURRENT, addr)
        .map_err(failed("sys_page_unmap"))?;
    kernel
        .sys_page_map(Envid::CURRENT, PFTEMP, Envid::CURRENT, addr, perm)
        .map_err(failed("sys_page_map"))?;
    kernel
        .sys_page_unmap(Envid::CURRENT, PFTEMP)
        .map_err(failed("sys_page_unmap"))
}

/// Custom page fault handler: if the faulting page is copy-on-write, map in
/// our own private writable copy.
///
/// # Panics
/// Panics if the fault is not a write to a copy-on-write page, or if the
/// kernel refuses one of the steps of [`resolve_cow_fault`]. Either way the
/// faulting environment cannot make progress.
pub fn pgfault<K: Exokernel + ?Sized>(kernel: &K, utf: &UTrapframe) {
    if let Err(e) = resolve_cow_fault(kernel, utf) {
        panic!("pgfault: {e}");
    }
}

/// Maps our virtual page `pn` into the target `envid` at the same virtual
/// address.
///
/// | Our PTE              | Child mapping | Our mapping afterwards |
/// |----------------------|---------------|------------------------|
/// | writable             | `P U COW`     | `P U COW`              |
/// | copy-on-write        | `P U COW`     | `P U COW`              |
/// | read-only            | `P U`         | unchanged              |
///
/// The child's mapping is installed before ours is downgraded, so no frame is
/// ever writable in one address space while read-only shared in the other.
/// Our mapping is re-installed even when it already is copy-on-write.
///
/// ### Parameters
/// - `kernel`: The caller's kernel handle.
/// - `envid`: The child being populated.
/// - `pn`: A present virtual page below `UTOP`.
pub fn duppage<K: Exokernel + ?Sized>(
    kernel: &K,
    envid: Envid,
    pn: usize,
) -> Result<(), KernelError> {
    let va = Va::from_pgnum(pn);
    let flags = kernel.uvpt(pn).flags();
    if flags.intersects(PteFlags::W | PteFlags::COW) {
        let perm = PteFlags::P | PteFlags::U | PteFlags::COW;
        kernel.sys_page_map(Envid::CURRENT, va, envid, va, perm)?;
        kernel.sys_page_map(Envid::CURRENT, va, Envid::CURRENT, va, perm)
    } else {
        kernel.sys_page_map(Envid::CURRENT, va, envid, va, PteFlags::P | PteFlags::U)
    }
}

impl<K: Exokernel> LibOs<K> {
    /// User-level fork with copy-on-write.
    ///
    /// ### Behavior
    /// - The parent receives the child's id.
    /// - The child receives [`Envid::CURRENT`] (`0`), after pointing
    ///   `thisenv` at its own record.
    /// - Until either side writes, both share every frame. Writes are never
    ///   visible to the other side.
    ///
    /// ### Errors
    /// - If the handler cannot be registered or the child cannot be created,
    ///   the kernel error is returned and nothing is left behind.
    /// - If populating the child fails, the half-built child is destroyed
    ///   before the error is returned. It was never runnable.
    pub fn fork(&mut self) -> Result<Envid, KernelError> {
        self.set_pgfault_handler(pgfault::<K>)?;
        let child = self.kernel.sys_exofork()?;
        if child.is_current() {
            self.thisenv = self.kernel.sys_getenvid().envx();
            return Ok(Envid::CURRENT);
        }
        match self.populate(child) {
            Ok(()) => Ok(child),
            Err(e) => {
                let me = self.thisenv().id;
                abyss::warning!("[{me}] fork: destroying half-built child {child}: {e}");
                if let Err(reap) = self.kernel.sys_env_destroy(child) {
                    abyss::warning!("[{me}] fork: cannot destroy child {child}: {reap}");
                }
                Err(e)
            }
        }
    }

    /// Copies our address space into `child` and makes it runnable.
    fn populate(&self, child: Envid) -> Result<(), KernelError> {
        for pdx in 0..UTOP_PDX {
            if !self.kernel.uvpd(pdx).is_present() {
                continue;
            }
            for ptx in 0..NPTENTRIES {
                let va = Va::from_indices(pdx, ptx, 0);
                if is_exception_stack(va) || !self.kernel.uvpt(va.pgnum()).is_present() {
                    continue;
                }
                duppage(&self.kernel, child, va.pgnum())?;
            }
        }
        self.kernel.sys_page_alloc(
            child,
            UXSTACKTOP - PAGE_SIZE,
            PteFlags::P | PteFlags::U | PteFlags::W,
        )?;
        let upcall = Va::from_u32(self.thisenv().pgfault_upcall);
        self.kernel.sys_env_set_pgfault_upcall(child, upcall)?;
        self.kernel.sys_env_set_status(child, EnvStatus::Runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CHILD, Call, FakeKernel, PARENT, UPCALL};
    use abyss::memlayout::{USTACKTOP, UTEXT};

    const TEXT: Va = UTEXT;
    const DATA: Va = Va::from_u32(0x0080_1000);
    const STACK: Va = Va::from_u32(0xeebf_d000);

    fn cow() -> PteFlags {
        PteFlags::P | PteFlags::U | PteFlags::COW
    }

    fn rw() -> PteFlags {
        PteFlags::P | PteFlags::U | PteFlags::W
    }

    fn parent_image() -> FakeKernel {
        let kernel = FakeKernel::parent();
        kernel.map(TEXT, PteFlags::P | PteFlags::U, b"text");
        kernel.map(DATA, rw(), b"data");
        kernel.map(USTACKTOP - PAGE_SIZE, rw(), b"stack");
        kernel
    }

    #[test]
    fn duppage_writable_maps_child_before_parent() {
        let kernel = parent_image();
        duppage(&kernel, CHILD, DATA.pgnum()).unwrap();
        assert_eq!(
            *kernel.calls.borrow(),
            vec![
                Call::PageMap(Envid::CURRENT, DATA, CHILD, DATA, cow()),
                Call::PageMap(Envid::CURRENT, DATA, Envid::CURRENT, DATA, cow()),
            ]
        );
        assert_eq!(kernel.flags(DATA), Some(cow()));
        assert_eq!(kernel.child_flags(DATA), Some(cow()));
        assert_eq!(kernel.frame(DATA), kernel.child_frame(DATA));
    }

    #[test]
    fn duppage_readonly_is_shared_plainly() {
        let kernel = parent_image();
        duppage(&kernel, CHILD, TEXT.pgnum()).unwrap();
        let shared = Call::PageMap(Envid::CURRENT, TEXT, CHILD, TEXT, PteFlags::P | PteFlags::U);
        assert_eq!(*kernel.calls.borrow(), vec![shared]);
        assert_eq!(kernel.flags(TEXT), Some(PteFlags::P | PteFlags::U));
    }

    #[test]
    fn duppage_reasserts_existing_cow() {
        let kernel = FakeKernel::parent();
        kernel.map(DATA, cow(), b"shared");
        duppage(&kernel, CHILD, DATA.pgnum()).unwrap();
        assert_eq!(kernel.calls.borrow().len(), 2);
        assert_eq!(kernel.child_flags(DATA), Some(cow()));
        assert_eq!(kernel.flags(DATA), Some(cow()));
    }

    #[test]
    fn fork_builds_child_in_order() {
        let mut lib = LibOs::new(parent_image(), "forktest");
        lib.kernel().calls.borrow_mut().clear();
        assert_eq!(lib.fork(), Ok(CHILD));

        let uxstack = UXSTACKTOP - PAGE_SIZE;
        assert_eq!(
            *lib.kernel().calls.borrow(),
            vec![
                Call::PageAlloc(Envid::CURRENT, uxstack, rw()),
                Call::SetUpcall(Envid::CURRENT, UPCALL),
                Call::Exofork,
                Call::PageMap(Envid::CURRENT, TEXT, CHILD, TEXT, PteFlags::P | PteFlags::U),
                Call::PageMap(Envid::CURRENT, DATA, CHILD, DATA, cow()),
                Call::PageMap(Envid::CURRENT, DATA, Envid::CURRENT, DATA, cow()),
                Call::PageMap(Envid::CURRENT, STACK, CHILD, STACK, cow()),
                Call::PageMap(Envid::CURRENT, STACK, Envid::CURRENT, STACK, cow()),
                Call::PageAlloc(CHILD, uxstack, rw()),
                Call::SetUpcall(CHILD, UPCALL),
                Call::SetStatus(CHILD, EnvStatus::Runnable),
            ]
        );
        // The exception stack stays private and writable.
        assert_eq!(lib.kernel().flags(uxstack), Some(rw()));
        let kernel = lib.kernel();
        assert_ne!(kernel.frame(uxstack), kernel.child_frame(uxstack));
    }

    #[test]
    fn second_fork_keeps_handler_setup() {
        let mut lib = LibOs::new(parent_image(), "forktest");
        lib.fork().unwrap();
        lib.kernel().calls.borrow_mut().clear();
        lib.fork().unwrap();
        assert_eq!(lib.kernel().calls.borrow()[0], Call::Exofork);
    }

    #[test]
    fn child_refreshes_thisenv() {
        let mut parent = LibOs::new(parent_image(), "forktest");
        parent.set_pgfault_handler(pgfault::<FakeKernel>).unwrap();
        assert_eq!(parent.thisenv().id, PARENT);
        let mut child = parent.inherited_by(FakeKernel::child());
        // A child starts out with its parent's cached record.
        assert_eq!(child.thisenv().id, PARENT);
        assert_eq!(child.fork(), Ok(Envid::CURRENT));
        assert_eq!(child.thisenv().id, CHILD);
        assert!(!child.kernel().calls.borrow().contains(&Call::PageAlloc(
            Envid::CURRENT,
            UXSTACKTOP - PAGE_SIZE,
            rw()
        )));
    }

    #[test]
    fn exofork_failure_creates_nothing() {
        let mut lib = LibOs::new(parent_image(), "forktest");
        lib.set_pgfault_handler(pgfault::<FakeKernel>).unwrap();
        let exofork = lib.kernel().calls.borrow().len();
        lib.kernel().fail_call(exofork);
        assert_eq!(lib.fork(), Err(KernelError::NoMemory));
        assert_eq!(lib.kernel().calls.borrow().len(), exofork + 1);
    }

    #[test]
    fn populate_failure_destroys_child() {
        let mut lib = LibOs::new(parent_image(), "forktest");
        lib.set_pgfault_handler(pgfault::<FakeKernel>).unwrap();
        // Exofork, text, then the child side of the data page fails.
        let failing = lib.kernel().calls.borrow().len() + 2;
        lib.kernel().fail_call(failing);
        assert_eq!(lib.fork(), Err(KernelError::NoMemory));
        let calls = lib.kernel().calls.borrow();
        assert_eq!(calls.last(), Some(&Call::Destroy(CHILD)));
        assert!(!calls.iter().any(|c| matches!(c, Call::SetStatus(..))));
        // Our data page was never downgraded.
        assert_eq!(lib.kernel().flags(DATA), Some(rw()));
    }

    #[test]
    fn failed_reap_keeps_populate_error() {
        let mut lib = LibOs::new(parent_image(), "forktest");
        lib.set_pgfault_handler(pgfault::<FakeKernel>).unwrap();
        // Exofork, text, then the child side of the data page fails, and so
        // does the destroy that follows.
        let failing = lib.kernel().calls.borrow().len() + 2;
        lib.kernel().fail_call(failing);
        let reap = failing + 1;
        lib.kernel().fail_call_with(reap, KernelError::BadEnv);
        assert_eq!(lib.fork(), Err(KernelError::NoMemory));
        let calls = lib.kernel().calls.borrow();
        assert_eq!(calls.len(), failing + 2);
        assert_eq!(calls.last(), Some(&Call::Destroy(CHILD)));
    }

    fn write_fault(va: Va) -> UTrapframe {
        UTrapframe {
            fault_va: va.into_u32(),
            err: (PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER).bits(),
            ..Default::default()
        }
    }

    #[test]
    fn cow_fault_installs_private_copy() {
        let kernel = parent_image();
        duppage(&kernel, CHILD, DATA.pgnum()).unwrap();
        kernel.calls.borrow_mut().clear();

        resolve_cow_fault(&kernel, &write_fault(DATA + 0x10)).unwrap();
        assert_eq!(
            *kernel.calls.borrow(),
            vec![
                Call::PageAlloc(Envid::CURRENT, PFTEMP, rw()),
                Call::PageUnmap(Envid::CURRENT, DATA),
                Call::PageMap(Envid::CURRENT, PFTEMP, Envid::CURRENT, DATA, rw()),
                Call::PageUnmap(Envid::CURRENT, PFTEMP),
            ]
        );
        assert_eq!(kernel.flags(DATA), Some(rw()));
        assert_eq!(kernel.flags(PFTEMP), None);
        assert_ne!(kernel.frame(DATA), kernel.child_frame(DATA));
        assert_eq!(&kernel.contents(DATA)[..4], b"data");
        assert_eq!(kernel.child_flags(DATA), Some(cow()));
    }

    #[test]
    fn read_fault_is_rejected() {
        let kernel = parent_image();
        duppage(&kernel, CHILD, DATA.pgnum()).unwrap();
        kernel.calls.borrow_mut().clear();
        let mut utf = write_fault(DATA);
        utf.err = PFErrorCode::USER.bits();
        assert!(matches!(
            resolve_cow_fault(&kernel, &utf),
            Err(CowFaultError::NotWrite { .. })
        ));
        assert!(kernel.calls.borrow().is_empty());
    }

    #[test]
    fn write_to_readonly_page_is_rejected() {
        let kernel = parent_image();
        assert!(matches!(
            resolve_cow_fault(&kernel, &write_fault(TEXT)),
            Err(CowFaultError::NotCopyOnWrite { va: TEXT, .. })
        ));
        // Nothing mapped there at all.
        assert!(matches!(
            resolve_cow_fault(&kernel, &write_fault(Va::from_u32(0x1000_0000))),
            Err(CowFaultError::NotCopyOnWrite { .. })
        ));
        assert!(kernel.calls.borrow().is_empty());
        assert_eq!(kernel.flags(TEXT), Some(PteFlags::P | PteFlags::U));
    }

    #[test]
    #[should_panic(expected = "is not copy-on-write")]
    fn pgfault_panics_on_illegitimate_fault() {
        let kernel = parent_image();
        pgfault(&kernel, &write_fault(TEXT));
    }

    #[test]
    #[should_panic(expected = "sys_page_alloc failed")]
    fn pgfault_panics_when_kernel_refuses() {
        let kernel = parent_image();
        duppage(&kernel, CHILD, DATA.pgnum()).unwrap();
        kernel.fail_call(kernel.calls.borrow().len());
        pgfault(&kernel, &write_fault(DATA));
    }
}
