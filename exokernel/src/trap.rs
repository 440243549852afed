//! User memory access and page fault delivery.
//!
//! User programs on the machine touch their memory through
//! [`Kernel::copy_from_user`] and [`Kernel::copy_to_user`], which translate
//! every address through the environment's page directory and check the
//! permissions an i386 MMU would check. An access the MMU would refuse
//! produces a [`PageFault`] instead of touching anything.
//!
//! A fault is reflected to the environment like the JOS kernel does it:
//! [`Kernel::deliver_pgfault`] pushes a [`UTrapframe`] on the environment's
//! exception stack and hands it to the registered upcall. An environment with
//! no upcall, or with an exception stack it cannot write, is destroyed.

use crate::machine::Kernel;
use abyss::{
    addressing::{PAGE_SIZE, Pa, Va},
    memlayout::UXSTACKTOP,
    paging::PteFlags,
    trap::{PFErrorCode, UTrapframe},
};
use ulib::Envid;

/// A page fault raised by a user memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub va: Va,
    /// What the MMU reports about the access.
    pub err: PFErrorCode,
}

/// The environment was destroyed while handling its fault.
///
/// Raised as a panic payload by the user runner so that the program stops
/// where it faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Killed;

/// The kind of a user memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A load.
    Read,
    /// A store.
    Write,
}

impl Kernel {
    /// Translates the user address `va` of `envid` for `access`.
    ///
    /// # Errors
    /// The [`PageFault`] the MMU would raise. The error code always carries
    /// [`PFErrorCode::USER`], [`PFErrorCode::WRITE_ACCESS`] for stores, and
    /// [`PFErrorCode::PRESENT`] when the page is mapped but the access is not
    /// permitted.
    pub fn translate(&self, envid: Envid, va: Va, access: Access) -> Result<Pa, PageFault> {
        let mut err = PFErrorCode::USER;
        if access == Access::Write {
            err |= PFErrorCode::WRITE_ACCESS;
        }
        let pte = self
            .envs
            .get(envid)
            .map(|env| env.pgdir.pte(&self.mem, va))
            .unwrap_or(abyss::paging::Pte::EMPTY);
        let Some(pa) = pte.pa() else {
            return Err(PageFault { va, err });
        };
        let flags = pte.flags();
        let writable = flags.contains(PteFlags::W);
        if !flags.contains(PteFlags::U) || (access == Access::Write && !writable) {
            return Err(PageFault {
                va,
                err: err | PFErrorCode::PRESENT,
            });
        }
        Ok(pa + va.offset())
    }

    /// Checks every page of `[va, va + len)`, returning the first fault.
    pub(crate) fn check_range(
        &self,
        envid: Envid,
        va: Va,
        len: usize,
        access: Access,
    ) -> Result<(), PageFault> {
        if len == 0 {
            return Ok(());
        }
        let mut page = va.page_down();
        let end = va + len;
        while page < end {
            self.translate(envid, page.max(va), access)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies user memory at `va` into `buf`.
    ///
    /// Nothing is copied if any byte of the range faults.
    pub fn copy_from_user(&self, envid: Envid, va: Va, buf: &mut [u8]) -> Result<(), PageFault> {
        self.check_range(envid, va, buf.len(), Access::Read)?;
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let pa = self.translate(envid, at, Access::Read)?;
            let n = (PAGE_SIZE - at.offset()).min(buf.len() - done);
            let page = self.mem.page(pa.page_down());
            buf[done..done + n].copy_from_slice(&page[pa.offset()..pa.offset() + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `va`.
    ///
    /// Nothing is copied if any byte of the range faults.
    pub fn copy_to_user(&mut self, envid: Envid, va: Va, buf: &[u8]) -> Result<(), PageFault> {
        self.check_range(envid, va, buf.len(), Access::Write)?;
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let pa = self.translate(envid, at, Access::Write)?;
            let n = (PAGE_SIZE - at.offset()).min(buf.len() - done);
            let page = self.mem.page_mut(pa.page_down());
            page[pa.offset()..pa.offset() + n].copy_from_slice(&buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Reflects `fault` to the user-level handler of `envid`.
    ///
    /// ### Steps:
    /// 1. Destroy the environment if it registered no upcall.
    /// 2. Place a [`UTrapframe`] below the records already on the exception
    ///    stack, leaving one empty word between nested records.
    /// 3. Destroy the environment if that slot is not a writable part of its
    ///    exception stack.
    /// 4. Write the record and return it; the caller runs the upcall with it
    ///    and then calls [`Kernel::upcall_return`].
    ///
    /// ### Returns
    /// - `Ok(UTrapframe)` the record pushed on the exception stack.
    /// - `Err(Killed)` if the environment was destroyed instead.
    pub fn deliver_pgfault(
        &mut self,
        envid: Envid,
        fault: PageFault,
    ) -> Result<UTrapframe, Killed> {
        let (upcall, depth) = match self.envs.get(envid) {
            Some(env) => (env.pgfault_upcall, env.xstack_depth),
            None => return Err(Killed),
        };
        if upcall == Va::ZERO {
            info!(
                "[{envid}] user fault va {:08x} ip {:08x}",
                fault.va.into_u32(),
                0
            );
            self.kill(envid);
            return Err(Killed);
        }

        let top = UXSTACKTOP.into_usize() - depth * (UTrapframe::SIZE + 4);
        let frame = top
            .checked_sub(UTrapframe::SIZE)
            .and_then(Va::new)
            .filter(|va| *va >= UXSTACKTOP - PAGE_SIZE);
        let utf = UTrapframe {
            fault_va: fault.va.into_u32(),
            err: fault.err.bits(),
            esp: top as u32,
            ..Default::default()
        };
        let pushed = match frame {
            Some(frame) => self.copy_to_user(envid, frame, &utf.to_bytes()).ok(),
            None => None,
        };
        if pushed.is_none() {
            info!(
                "[{envid}] user_mem_check assertion failure for va {:08x}",
                top.saturating_sub(UTrapframe::SIZE)
            );
            self.kill(envid);
            return Err(Killed);
        }
        if let Some(env) = self.envs.get_mut(envid) {
            env.pgfaults += 1;
            env.xstack_depth += 1;
        }
        Ok(utf)
    }

    /// Pops the record of the innermost fault of `envid` off its exception
    /// stack once the upcall returned.
    pub fn upcall_return(&mut self, envid: Envid) {
        if let Some(env) = self.envs.get_mut(envid) {
            env.xstack_depth = env.xstack_depth.saturating_sub(1);
        }
    }

    /// Destroys `envid` on its own behalf.
    pub(crate) fn kill(&mut self, envid: Envid) {
        self.destroy_env(envid, envid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::memlayout::UTEXT;
    use ulib::EnvStatus;

    fn kernel_with_env() -> (Kernel, Envid) {
        abyss::QUITE.store(true, core::sync::atomic::Ordering::SeqCst);
        let mut kernel = Kernel::new(64);
        let id = kernel.envs.alloc(&mut kernel.mem, Envid(0)).unwrap();
        kernel.envs.get_mut(id).unwrap().status = EnvStatus::Runnable;
        (kernel, id)
    }

    fn map(kernel: &mut Kernel, id: Envid, va: Va, perm: PteFlags) {
        let usage = crate::mm::FrameUse::Page(id, va);
        let pa = kernel.mem.alloc(usage).unwrap();
        let pgdir = kernel.envs.get(id).unwrap().pgdir;
        pgdir
            .insert(&mut kernel.mem, pa, va, perm | PteFlags::U)
            .unwrap();
    }

    #[test]
    fn copies_across_pages() {
        let (mut kernel, id) = kernel_with_env();
        map(&mut kernel, id, UTEXT, PteFlags::W);
        map(&mut kernel, id, UTEXT + PAGE_SIZE, PteFlags::W);
        let at = UTEXT + (PAGE_SIZE - 2);
        kernel.copy_to_user(id, at, b"fork").unwrap();
        let mut buf = [0; 4];
        kernel.copy_from_user(id, at, &mut buf).unwrap();
        assert_eq!(&buf, b"fork");
    }

    #[test]
    fn faults_report_the_mmu_error_code() {
        let (mut kernel, id) = kernel_with_env();
        map(&mut kernel, id, UTEXT, PteFlags::empty());
        assert_eq!(
            kernel.copy_to_user(id, UTEXT + 8, b"x"),
            Err(PageFault {
                va: UTEXT + 8,
                err: PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
            })
        );
        let mut buf = [0; 8];
        assert_eq!(
            kernel.copy_from_user(id, UTEXT + PAGE_SIZE - 4, &mut buf),
            Err(PageFault {
                va: UTEXT + PAGE_SIZE,
                err: PFErrorCode::USER,
            })
        );
        // The range is checked before anything is written.
        map(&mut kernel, id, UTEXT + 2 * PAGE_SIZE, PteFlags::W);
        let straddle = UTEXT + 3 * PAGE_SIZE - 1;
        assert!(kernel.copy_to_user(id, straddle, b"ab").is_err());
        let mut byte = [0xff];
        kernel.copy_from_user(id, straddle, &mut byte).unwrap();
        assert_eq!(byte, [0]);
    }

    #[test]
    fn fault_without_upcall_kills() {
        let (mut kernel, id) = kernel_with_env();
        let fault = PageFault {
            va: UTEXT,
            err: PFErrorCode::USER,
        };
        assert_eq!(kernel.deliver_pgfault(id, fault), Err(Killed));
        assert!(kernel.envs.get(id).is_none());
        assert_eq!(kernel.mem.in_use(), 0);
    }

    #[test]
    fn nested_faults_stack_up() {
        let (mut kernel, id) = kernel_with_env();
        map(&mut kernel, id, UXSTACKTOP - PAGE_SIZE, PteFlags::W);
        kernel.envs.get_mut(id).unwrap().pgfault_upcall = UTEXT;
        let fault = PageFault {
            va: Va::from_u32(0x1234),
            err: PFErrorCode::USER | PFErrorCode::WRITE_ACCESS,
        };
        let first = kernel.deliver_pgfault(id, fault).unwrap();
        let second = kernel.deliver_pgfault(id, fault).unwrap();
        assert_eq!(first.esp as usize, UXSTACKTOP.into_usize());
        assert_eq!(
            second.esp as usize,
            UXSTACKTOP.into_usize() - UTrapframe::SIZE - 4
        );
        let mut raw = [0; UTrapframe::SIZE];
        kernel
            .copy_from_user(id, UXSTACKTOP - UTrapframe::SIZE, &mut raw)
            .unwrap();
        assert_eq!(UTrapframe::from_bytes(&raw), Some(first));
        kernel.upcall_return(id);
        kernel.upcall_return(id);
        let env = kernel.envs.get(id).unwrap();
        assert_eq!((env.pgfaults, env.xstack_depth), (2, 0));
    }

    #[test]
    fn unwritable_exception_stack_kills() {
        let (mut kernel, id) = kernel_with_env();
        map(&mut kernel, id, UXSTACKTOP - PAGE_SIZE, PteFlags::COW);
        kernel.envs.get_mut(id).unwrap().pgfault_upcall = UTEXT;
        let fault = PageFault {
            va: UTEXT,
            err: PFErrorCode::USER,
        };
        assert_eq!(kernel.deliver_pgfault(id, fault), Err(Killed));
        assert!(kernel.envs.get(id).is_none());
    }
}
