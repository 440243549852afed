//! System call dispatch.
//!
//! Every system call runs with the kernel lock held, so each primitive is
//! atomic with respect to all others. Arguments arrive as the raw 32-bit
//! words of the trap and are validated the way the JOS kernel validates
//! them:
//!
//! - Environment arguments go through [`EnvTable::envid2env`] with the
//!   permission check: only the caller and its immediate children may be
//!   named.
//! - Addresses must be page-aligned and below `UTOP`.
//! - Permissions must include `P | U`, stay within [`PteFlags::SYSCALL`],
//!   and never combine `W` with `COW`.
//!
//! [`EnvTable::envid2env`]: crate::env::EnvTable::envid2env

use crate::{machine::Kernel, mm::FrameUse, trap::Access};
use abyss::{addressing::Va, memlayout::UTOP, paging::PteFlags};
use ulib::{EnvStatus, Envid, KernelError, SyscallNumber};

fn user_va(raw: u32) -> Result<Va, KernelError> {
    let va = Va::from_u32(raw);
    if va < UTOP && va.is_page_aligned() {
        Ok(va)
    } else {
        Err(KernelError::InvalidArgument)
    }
}

fn user_perm(raw: u32) -> Result<PteFlags, KernelError> {
    if raw & !PteFlags::SYSCALL.bits() != 0 {
        return Err(KernelError::InvalidArgument);
    }
    let perm = PteFlags::from_bits_truncate(raw);
    if !perm.contains(PteFlags::P | PteFlags::U) || perm.contains(PteFlags::W | PteFlags::COW) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(perm)
}

impl Kernel {
    /// Runs system call `no` for `caller`.
    ///
    /// # Returns
    /// The non-negative result on success; the error is negated into the raw
    /// return register by the caller.
    pub fn syscall(&mut self, caller: Envid, no: u32, args: [u32; 5]) -> Result<u32, KernelError> {
        let no = SyscallNumber::try_from(no).map_err(|_| KernelError::InvalidArgument)?;
        let ret = self.dispatch(caller, no, args);
        #[cfg(feature = "trace_syscalls")]
        debug!("[{caller}] {no:?}({args:x?}) = {ret:?}");
        ret
    }

    fn dispatch(
        &mut self,
        caller: Envid,
        no: SyscallNumber,
        args: [u32; 5],
    ) -> Result<u32, KernelError> {
        let [a1, a2, a3, a4, a5] = args;
        match no {
            SyscallNumber::Cputs => self.sys_cputs(caller, Va::from_u32(a1), a2 as usize),
            SyscallNumber::Cgetc => Ok(0),
            SyscallNumber::Getenvid => {
                let me = self.envs.envid2env(Envid::CURRENT, caller, false)?;
                Ok(me.0 as u32)
            }
            SyscallNumber::EnvDestroy => self.sys_env_destroy(caller, Envid(a1 as i32)),
            SyscallNumber::PageAlloc => self.sys_page_alloc(caller, Envid(a1 as i32), a2, a3),
            SyscallNumber::PageMap => {
                self.sys_page_map(caller, Envid(a1 as i32), a2, Envid(a3 as i32), a4, a5)
            }
            SyscallNumber::PageUnmap => self.sys_page_unmap(caller, Envid(a1 as i32), a2),
            SyscallNumber::Exofork => self.sys_exofork(caller),
            SyscallNumber::EnvSetStatus => self.sys_env_set_status(caller, Envid(a1 as i32), a2),
            SyscallNumber::EnvSetPgfaultUpcall => {
                let env = self.envs.envid2env(Envid(a1 as i32), caller, true)?;
                if let Some(env) = self.envs.get_mut(env) {
                    env.pgfault_upcall = Va::from_u32(a2);
                }
                Ok(0)
            }
            SyscallNumber::Yield => self.sys_yield(caller),
        }
    }

    fn sys_cputs(&mut self, caller: Envid, va: Va, len: usize) -> Result<u32, KernelError> {
        let mut buf = vec![];
        let copied = match self.check_range(caller, va, len, Access::Read) {
            Ok(()) => {
                buf.resize(len, 0);
                self.copy_from_user(caller, va, &mut buf)
            }
            Err(fault) => Err(fault),
        };
        if let Err(fault) = copied {
            info!(
                "[{caller}] user_mem_check assertion failure for va {:08x}",
                fault.va.into_u32()
            );
            return Err(KernelError::Fault);
        }
        self.console_write(&String::from_utf8_lossy(&buf));
        Ok(0)
    }

    fn sys_env_destroy(&mut self, caller: Envid, envid: Envid) -> Result<u32, KernelError> {
        let env = self.envs.envid2env(envid, caller, true)?;
        if env == caller {
            info!("[{caller}] exiting gracefully");
        } else {
            info!("[{caller}] destroying {env}");
        }
        self.destroy_env(env, caller);
        Ok(0)
    }

    /// Sends the caller to the back of the run queue. Programs run on their
    /// own host thread, so nothing is switched to.
    fn sys_yield(&mut self, caller: Envid) -> Result<u32, KernelError> {
        let me = self.envs.envid2env(Envid::CURRENT, caller, false)?;
        if self.envs.get(me).map(|env| env.status) == Some(EnvStatus::Runnable) {
            self.runq.retain(|queued| queued != me);
            self.runq.push(me);
        }
        Ok(0)
    }

    fn sys_page_alloc(
        &mut self,
        caller: Envid,
        envid: Envid,
        va: u32,
        perm: u32,
    ) -> Result<u32, KernelError> {
        let env = self.envs.envid2env(envid, caller, true)?;
        let va = user_va(va)?;
        let perm = user_perm(perm)?;
        let pgdir = self.envs.get(env).ok_or(KernelError::BadEnv)?.pgdir;
        let pa = self.mem.alloc(FrameUse::Page(env, va))?;
        if let Err(e) = pgdir.insert(&mut self.mem, pa, va, perm) {
            self.mem.free(pa);
            return Err(e);
        }
        Ok(0)
    }

    fn sys_page_map(
        &mut self,
        caller: Envid,
        srcenv: Envid,
        srcva: u32,
        dstenv: Envid,
        dstva: u32,
        perm: u32,
    ) -> Result<u32, KernelError> {
        let src = self.envs.envid2env(srcenv, caller, true)?;
        let dst = self.envs.envid2env(dstenv, caller, true)?;
        let srcva = user_va(srcva)?;
        let dstva = user_va(dstva)?;
        let perm = user_perm(perm)?;
        let src = self.envs.get(src).ok_or(KernelError::BadEnv)?.pgdir;
        let dst = self.envs.get(dst).ok_or(KernelError::BadEnv)?.pgdir;
        let (pa, pte) = src
            .lookup(&self.mem, srcva)
            .ok_or(KernelError::InvalidArgument)?;
        if perm.contains(PteFlags::W) && !pte.flags().contains(PteFlags::W) {
            return Err(KernelError::InvalidArgument);
        }
        dst.insert(&mut self.mem, pa, dstva, perm)?;
        Ok(0)
    }

    fn sys_page_unmap(&mut self, caller: Envid, envid: Envid, va: u32) -> Result<u32, KernelError> {
        let env = self.envs.envid2env(envid, caller, true)?;
        let va = user_va(va)?;
        let pgdir = self.envs.get(env).ok_or(KernelError::BadEnv)?.pgdir;
        pgdir.remove(&mut self.mem, va);
        Ok(0)
    }

    /// Creates a child with an empty address space that resumes where its
    /// parent trapped.
    ///
    /// The child's copy of this trap returns `0`. On the machine the child
    /// continues from the same call when it first traps into `sys_exofork`
    /// itself, which is why a pending child gets `0` here without creating
    /// anything.
    fn sys_exofork(&mut self, caller: Envid) -> Result<u32, KernelError> {
        let me = self.envs.get_mut(caller).ok_or(KernelError::BadEnv)?;
        if me.exofork_pending {
            me.exofork_pending = false;
            return Ok(0);
        }
        let child = self.envs.alloc(&mut self.mem, caller)?;
        if let Some(env) = self.envs.get_mut(child) {
            env.exofork_pending = true;
        }
        Ok(child.0 as u32)
    }

    fn sys_env_set_status(
        &mut self,
        caller: Envid,
        envid: Envid,
        status: u32,
    ) -> Result<u32, KernelError> {
        let status = match EnvStatus::try_from(status) {
            Ok(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => status,
            _ => return Err(KernelError::InvalidArgument),
        };
        let env = self.envs.envid2env(envid, caller, true)?;
        if status == EnvStatus::Runnable {
            self.make_runnable(env);
        } else if let Some(stopped) = self.envs.get_mut(env) {
            stopped.status = status;
            self.runq.retain(|queued| queued != env);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::memlayout::{UTEXT, UXSTACKTOP};

    const ALLOC: u32 = SyscallNumber::PageAlloc as u32;
    const MAP: u32 = SyscallNumber::PageMap as u32;

    fn rw() -> u32 {
        (PteFlags::P | PteFlags::U | PteFlags::W).bits()
    }

    fn boot() -> (Kernel, Envid) {
        abyss::QUITE.store(true, core::sync::atomic::Ordering::SeqCst);
        let mut kernel = Kernel::new(64);
        let root = kernel.envs.alloc(&mut kernel.mem, Envid(0)).unwrap();
        (kernel, root)
    }

    fn call(
        kernel: &mut Kernel,
        caller: Envid,
        no: SyscallNumber,
        args: [u32; 5],
    ) -> Result<u32, KernelError> {
        kernel.syscall(caller, no.into(), args)
    }

    fn exofork(kernel: &mut Kernel, caller: Envid) -> Envid {
        let id = call(kernel, caller, SyscallNumber::Exofork, [0; 5]).unwrap();
        Envid(id as i32)
    }

    #[test]
    fn address_and_permission_checks() {
        let (mut kernel, root) = boot();
        let text = UTEXT.into_u32();
        let pwt = (PteFlags::P | PteFlags::U | PteFlags::PWT).bits();
        let writable_cow = rw() | PteFlags::COW.bits();
        for (va, perm) in [
            (text + 4, rw()),
            (UTOP.into_u32(), rw()),
            (text, PteFlags::P.bits()),
            (text, pwt),
            (text, writable_cow),
        ] {
            assert_eq!(
                kernel.syscall(root, ALLOC, [0, va, perm, 0, 0]),
                Err(KernelError::InvalidArgument),
                "va {va:08x} perm {perm:x}"
            );
        }
        assert_eq!(kernel.syscall(root, ALLOC, [0, text, rw(), 0, 0]), Ok(0));
        assert_eq!(
            kernel.syscall(root, 99, [0; 5]),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn page_map_respects_source_permissions() {
        let (mut kernel, root) = boot();
        let text = UTEXT.into_u32();
        let ro = (PteFlags::P | PteFlags::U).bits();
        kernel.syscall(root, ALLOC, [0, text, ro, 0, 0]).unwrap();
        // Unmapped source.
        assert_eq!(
            kernel.syscall(root, MAP, [0, text + 0x1000, 0, text + 0x2000, ro]),
            Err(KernelError::InvalidArgument)
        );
        // Write access to a read-only source.
        assert_eq!(
            kernel.syscall(root, MAP, [0, text, 0, text + 0x2000, rw()]),
            Err(KernelError::InvalidArgument)
        );
        let cow = (PteFlags::P | PteFlags::U | PteFlags::COW).bits();
        let shared = [0, text, 0, text + 0x2000, cow];
        assert_eq!(kernel.syscall(root, MAP, shared), Ok(0));
        let pgdir = kernel.envs.get(root).unwrap().pgdir;
        assert_eq!(
            pgdir.lookup(&kernel.mem, UTEXT).map(|(pa, _)| pa),
            pgdir.lookup(&kernel.mem, UTEXT + 0x2000).map(|(pa, _)| pa)
        );
    }

    #[test]
    fn only_children_may_be_manipulated() {
        let (mut kernel, root) = boot();
        let child = exofork(&mut kernel, root);
        let grandchild = exofork(&mut kernel, child);
        // The child's first exofork resumed it; its second one creates.
        assert_eq!(grandchild, Envid::CURRENT);
        let grandchild = exofork(&mut kernel, child);
        assert_eq!(kernel.envs.get(grandchild).unwrap().parent_id, child);

        let text = UTEXT.into_u32();
        assert_eq!(
            kernel.syscall(root, ALLOC, [grandchild.0 as u32, text, rw(), 0, 0]),
            Err(KernelError::BadEnv)
        );
        assert_eq!(
            kernel.syscall(child, ALLOC, [root.0 as u32, text, rw(), 0, 0]),
            Err(KernelError::BadEnv)
        );
        assert_eq!(
            kernel.syscall(root, ALLOC, [child.0 as u32, text, rw(), 0, 0]),
            Ok(0)
        );
    }

    #[test]
    fn exofork_creates_a_blank_stopped_child() {
        let (mut kernel, root) = boot();
        let child = exofork(&mut kernel, root);
        let env = kernel.envs.get(child).unwrap();
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.pgdir.mapped_pages(&kernel.mem), 0);
        assert!(kernel.runq.is_empty());

        let status = |s: EnvStatus| [child.0 as u32, s.into(), 0, 0, 0];
        let dying = status(EnvStatus::Dying);
        assert_eq!(
            call(&mut kernel, root, SyscallNumber::EnvSetStatus, dying),
            Err(KernelError::InvalidArgument)
        );
        let runnable = status(EnvStatus::Runnable);
        assert_eq!(
            call(&mut kernel, root, SyscallNumber::EnvSetStatus, runnable),
            Ok(0)
        );
        assert_eq!(kernel.runq.pop(), Some(child));
    }

    #[test]
    fn run_queue_follows_status_changes() {
        let (mut kernel, root) = boot();
        let child = exofork(&mut kernel, root);
        let status = |s: EnvStatus| [child.0 as u32, s.into(), 0, 0, 0];
        let runnable = status(EnvStatus::Runnable);
        call(&mut kernel, root, SyscallNumber::EnvSetStatus, runnable).unwrap();
        call(&mut kernel, root, SyscallNumber::EnvSetStatus, runnable).unwrap();
        assert_eq!(kernel.runq.len(), 1);

        let stopped = status(EnvStatus::NotRunnable);
        call(&mut kernel, root, SyscallNumber::EnvSetStatus, stopped).unwrap();
        assert!(kernel.runq.is_empty());

        call(&mut kernel, root, SyscallNumber::EnvSetStatus, runnable).unwrap();
        let destroy = [child.0 as u32, 0, 0, 0, 0];
        call(&mut kernel, root, SyscallNumber::EnvDestroy, destroy).unwrap();
        assert!(kernel.runq.is_empty());
    }

    #[test]
    fn destroy_frees_the_address_space() {
        let (mut kernel, root) = boot();
        let child = exofork(&mut kernel, root);
        let xstack = (UXSTACKTOP - 0x1000).into_u32();
        let alloc = [child.0 as u32, xstack, rw(), 0, 0];
        kernel.syscall(root, ALLOC, alloc).unwrap();
        let before = kernel.mem.in_use();
        let destroy = [child.0 as u32, 0, 0, 0, 0];
        assert_eq!(
            call(&mut kernel, root, SyscallNumber::EnvDestroy, destroy),
            Ok(0)
        );
        // Directory, page table and page.
        assert_eq!(kernel.mem.in_use(), before - 3);
        assert_eq!(
            call(&mut kernel, root, SyscallNumber::EnvDestroy, destroy),
            Err(KernelError::BadEnv)
        );
    }

    #[test]
    fn cputs_reads_user_memory() {
        let (mut kernel, root) = boot();
        let text = UTEXT.into_u32();
        kernel.syscall(root, ALLOC, [0, text, rw(), 0, 0]).unwrap();
        kernel.copy_to_user(root, UTEXT, b"hello").unwrap();
        let hello = [text, 5, 0, 0, 0];
        assert_eq!(call(&mut kernel, root, SyscallNumber::Cputs, hello), Ok(0));
        assert_eq!(kernel.console, "hello");
        let unmapped = [text + 0x1000, 5, 0, 0, 0];
        assert_eq!(
            call(&mut kernel, root, SyscallNumber::Cputs, unmapped),
            Err(KernelError::Fault)
        );
    }
}
