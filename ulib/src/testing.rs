//! A recording kernel for unit tests.

use crate::{
    KernelError,
    env::{Env, EnvStatus, Envid},
    syscall::{Exokernel, SyscallNumber},
};
use abyss::{
    addressing::{NPTENTRIES, PAGE_SIZE, Pa, Va},
    paging::{Pde, PdeFlags, Pte, PteFlags},
};
use std::{cell::RefCell, collections::BTreeMap, vec::Vec};

pub const PARENT: Envid = Envid(0x1000);
pub const CHILD: Envid = Envid(0x1001);
pub const UPCALL: Va = Va::from_u32(0x0080_0020);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Getenvid,
    Destroy(Envid),
    PageAlloc(Envid, Va, PteFlags),
    PageMap(Envid, Va, Envid, Va, PteFlags),
    PageUnmap(Envid, Va),
    Exofork,
    SetStatus(Envid, EnvStatus),
    SetUpcall(Envid, Va),
    Other(SyscallNumber),
}

type Space = BTreeMap<usize, (usize, PteFlags)>;

/// Two address spaces, ours and the child's, over a shared frame pool.
pub struct FakeKernel {
    me: Envid,
    pub calls: RefCell<Vec<Call>>,
    space: RefCell<Space>,
    child_space: RefCell<Space>,
    frames: RefCell<Vec<[u8; PAGE_SIZE]>>,
    upcalls: RefCell<BTreeMap<i32, u32>>,
    failing: RefCell<BTreeMap<usize, KernelError>>,
}

impl FakeKernel {
    fn with_id(me: Envid) -> Self {
        Self {
            me,
            calls: RefCell::new(Vec::new()),
            space: RefCell::new(BTreeMap::new()),
            child_space: RefCell::new(BTreeMap::new()),
            frames: RefCell::new(Vec::new()),
            upcalls: RefCell::new(BTreeMap::new()),
            failing: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn parent() -> Self {
        Self::with_id(PARENT)
    }

    /// The child, resumed right after its `sys_exofork` trap.
    pub fn child() -> Self {
        Self::with_id(CHILD)
    }

    /// Makes the `n`-th system call, counted from zero, fail with
    /// `NoMemory`.
    pub fn fail_call(&self, n: usize) {
        self.fail_call_with(n, KernelError::NoMemory);
    }

    /// Makes the `n`-th system call, counted from zero, fail with `error`.
    pub fn fail_call_with(&self, n: usize, error: KernelError) {
        self.failing.borrow_mut().insert(n, error);
    }

    pub fn map(&self, va: Va, flags: PteFlags, contents: &[u8]) {
        let frame = self.alloc_frame();
        let mut frames = self.frames.borrow_mut();
        frames[frame][..contents.len()].copy_from_slice(contents);
        self.space.borrow_mut().insert(va.pgnum(), (frame, flags));
    }

    pub fn flags(&self, va: Va) -> Option<PteFlags> {
        self.space.borrow().get(&va.pgnum()).map(|(_, f)| *f)
    }

    pub fn frame(&self, va: Va) -> Option<usize> {
        self.space.borrow().get(&va.pgnum()).map(|(n, _)| *n)
    }

    pub fn child_flags(&self, va: Va) -> Option<PteFlags> {
        self.child_space.borrow().get(&va.pgnum()).map(|(_, f)| *f)
    }

    pub fn child_frame(&self, va: Va) -> Option<usize> {
        self.child_space.borrow().get(&va.pgnum()).map(|(n, _)| *n)
    }

    pub fn contents(&self, va: Va) -> [u8; PAGE_SIZE] {
        let frame = self.frame(va).expect("page is not mapped");
        self.frames.borrow()[frame]
    }

    fn alloc_frame(&self) -> usize {
        let mut frames = self.frames.borrow_mut();
        frames.push([0; PAGE_SIZE]);
        frames.len() - 1
    }

    fn space_of(&self, envid: i32) -> &RefCell<Space> {
        if envid == 0 || envid == self.me.0 {
            &self.space
        } else {
            assert_eq!(envid, CHILD.0, "unexpected environment {envid:x}");
            &self.child_space
        }
    }

    fn decode(no: SyscallNumber, a: [u32; 5]) -> Call {
        let env = |i: usize| Envid(a[i] as i32);
        let va = |i: usize| Va::from_u32(a[i]);
        let perm = |i: usize| PteFlags::from_bits_truncate(a[i]);
        match no {
            SyscallNumber::Getenvid => Call::Getenvid,
            SyscallNumber::EnvDestroy => Call::Destroy(env(0)),
            SyscallNumber::PageAlloc => Call::PageAlloc(env(0), va(1), perm(2)),
            SyscallNumber::PageMap => Call::PageMap(env(0), va(1), env(2), va(3), perm(4)),
            SyscallNumber::PageUnmap => Call::PageUnmap(env(0), va(1)),
            SyscallNumber::Exofork => Call::Exofork,
            SyscallNumber::EnvSetStatus => {
                Call::SetStatus(env(0), EnvStatus::try_from(a[1]).unwrap())
            }
            SyscallNumber::EnvSetPgfaultUpcall => Call::SetUpcall(env(0), va(1)),
            other => Call::Other(other),
        }
    }
}

impl Exokernel for FakeKernel {
    fn syscall(&self, no: SyscallNumber, args: [u32; 5]) -> i32 {
        let call = Self::decode(no, args);
        let index = {
            let mut calls = self.calls.borrow_mut();
            calls.push(call.clone());
            calls.len() - 1
        };
        if let Some(error) = self.failing.borrow().get(&index) {
            return error.into_i32();
        }
        match call {
            Call::Getenvid => self.me.0,
            Call::Exofork => {
                if self.me == CHILD {
                    0
                } else {
                    CHILD.0
                }
            }
            Call::PageAlloc(env, va, perm) => {
                let frame = self.alloc_frame();
                let mut space = self.space_of(env.0).borrow_mut();
                space.insert(va.pgnum(), (frame, perm));
                0
            }
            Call::PageMap(src, srcva, dst, dstva, perm) => {
                assert!(
                    !perm.contains(PteFlags::W | PteFlags::COW),
                    "W and COW requested together"
                );
                let src_page = srcva.pgnum();
                let mapped = self.space_of(src.0).borrow().get(&src_page).copied();
                let Some((frame, _)) = mapped else {
                    return KernelError::InvalidArgument.into_i32();
                };
                let mut space = self.space_of(dst.0).borrow_mut();
                space.insert(dstva.pgnum(), (frame, perm));
                0
            }
            Call::PageUnmap(env, va) => {
                self.space_of(env.0).borrow_mut().remove(&va.pgnum());
                0
            }
            Call::SetUpcall(env, va) => {
                let id = if env.is_current() { self.me } else { env };
                self.upcalls.borrow_mut().insert(id.0, va.into_u32());
                0
            }
            Call::Destroy(_) | Call::SetStatus(..) | Call::Other(_) => 0,
        }
    }

    fn uvpt(&self, pn: usize) -> Pte {
        match self.space.borrow().get(&pn) {
            Some((frame, flags)) => Pte::new(Pa::from_frame_number(frame + 1), *flags).unwrap(),
            None => Pte::EMPTY,
        }
    }

    fn uvpd(&self, pdx: usize) -> Pde {
        let range = pdx * NPTENTRIES..(pdx + 1) * NPTENTRIES;
        if self.space.borrow().range(range).next().is_some() {
            let flags = PdeFlags::P | PdeFlags::W | PdeFlags::U;
            Pde::new(Pa::from_frame_number(0x100 + pdx), flags).unwrap()
        } else {
            Pde::EMPTY
        }
    }

    fn envs(&self, envx: usize) -> Env {
        let id = Envid(0x1000 | envx as i32);
        Env {
            id,
            parent_id: if id == CHILD { PARENT } else { Envid(0) },
            status: EnvStatus::Runnable,
            runs: 1,
            pgfault_upcall: self.upcalls.borrow().get(&id.0).copied().unwrap_or(0),
        }
    }

    fn upcall_entry(&self) -> Va {
        UPCALL
    }

    unsafe fn memmove(&self, dst: Va, src: Va, len: usize) {
        assert_eq!(len, PAGE_SIZE);
        let src = self.frame(src).expect("source not mapped");
        let dst = self.frame(dst).expect("destination not mapped");
        let mut frames = self.frames.borrow_mut();
        let page = frames[src];
        frames[dst] = page;
    }
}
