//! The machine: physical memory, environments and the kernel lock.
//!
//! A [`Machine`] owns a [`Kernel`] behind a [`SpinLock`]. Every system call
//! and every user memory access takes the lock for its whole duration, so
//! environments running on different host threads observe the primitives as
//! atomic, as they would on a uniprocessor kernel.

use crate::{
    config::MachineConfig,
    env::{Env, EnvTable},
    loader::ProgramImage,
    mm::PhysicalMemory,
    sched::RunQueue,
    user::{EnvHandle, Process},
};
use abyss::{
    addressing::{Pa, Va},
    kprint::Console,
    paging::Pte,
    spinlock::SpinLock,
};
use core::sync::atomic::Ordering;
use std::sync::Arc;
use ulib::{EnvStatus, Envid, KernelError, SyscallNumber};

/// State protected by the kernel lock.
pub struct Kernel {
    pub(crate) mem: PhysicalMemory,
    pub(crate) envs: EnvTable,
    pub(crate) console: String,
    pub(crate) runq: RunQueue,
}

impl Kernel {
    /// Boots a kernel with `frames` page frames and no environment.
    pub fn new(frames: usize) -> Self {
        Self {
            mem: PhysicalMemory::new(frames),
            envs: EnvTable::new(),
            console: String::new(),
            runq: RunQueue::new(),
        }
    }

    /// Marks `id` runnable and queues it unless it already was runnable.
    pub(crate) fn make_runnable(&mut self, id: Envid) {
        if let Some(env) = self.envs.get_mut(id) {
            if env.status != EnvStatus::Runnable {
                env.status = EnvStatus::Runnable;
                self.runq.push(id);
            }
        }
    }

    /// Frees `id` on behalf of `by` and drops it from the run queue.
    pub(crate) fn destroy_env(&mut self, id: Envid, by: Envid) -> Option<Env> {
        let env = self.envs.destroy(&mut self.mem, id, by)?;
        self.runq.retain(|queued| queued != id);
        Some(env)
    }

    /// Appends user output to the console.
    pub(crate) fn console_write(&mut self, s: &str) {
        self.console.push_str(s);
        if !abyss::QUITE.load(Ordering::SeqCst) {
            abyss::print!("{s}");
        }
    }
}

struct HostConsole;

impl Console for HostConsole {
    fn write_str(&self, s: &str) {
        eprint!("{s}");
    }
}

static HOST_CONSOLE: HostConsole = HostConsole;

/// A machine running the exokernel.
pub struct Machine {
    kernel: SpinLock<Kernel>,
    config: MachineConfig,
}

impl Machine {
    /// Boots a machine.
    ///
    /// Kernel messages go to the host's standard error.
    pub fn new(config: MachineConfig) -> Arc<Self> {
        abyss::QUITE.store(config.quiet, Ordering::SeqCst);
        abyss::kprint::set_console(&HOST_CONSOLE);
        Arc::new(Self {
            kernel: SpinLock::new(Kernel::new(config.frames)),
            config,
        })
    }

    /// The configuration this machine booted with.
    pub fn config(&self) -> MachineConfig {
        self.config
    }

    /// Runs `f` with the kernel lock held.
    ///
    /// `f` must not panic: a guard dropped during unwinding aborts the
    /// process.
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        let mut guard = self.kernel.lock();
        let r = f(&mut guard);
        guard.unlock();
        r
    }

    /// Traps into the kernel on behalf of `caller`.
    pub fn syscall(&self, caller: Envid, no: SyscallNumber, args: [u32; 5]) -> i32 {
        match self.with_kernel(|k| k.syscall(caller, no.into(), args)) {
            Ok(ret) => ret as i32,
            Err(e) => e.into_i32(),
        }
    }

    /// Creates a runnable environment executing `image` and returns the
    /// program running in it.
    ///
    /// # Errors
    /// [`KernelError::NoFreeEnv`] or [`KernelError::NoMemory`].
    pub fn spawn(self: &Arc<Self>, image: &ProgramImage) -> Result<Process, KernelError> {
        let id = self.with_kernel(|k| {
            let id = k.load(image)?;
            k.make_runnable(id);
            Ok::<_, KernelError>(id)
        })?;
        Ok(Process::new(EnvHandle::new(self.clone(), id), image.name()))
    }

    /// Picks the next runnable environment in round-robin order.
    ///
    /// The picked environment goes to the back of the queue. Environments
    /// stopped since they were queued are dropped from it.
    pub fn schedule(&self) -> Option<Envid> {
        self.with_kernel(|k| {
            while let Some(id) = k.runq.pop() {
                if let Some(env) = k.envs.get_mut(id) {
                    if env.status == EnvStatus::Runnable {
                        env.runs += 1;
                        k.runq.push(id);
                        return Some(id);
                    }
                }
            }
            None
        })
    }

    /// Number of environments waiting in the run queue.
    pub fn runnable_count(&self) -> usize {
        self.with_kernel(|k| k.runq.len())
    }

    /// The user-visible record of `id`, if it is alive.
    pub fn env(&self, id: Envid) -> Option<ulib::Env> {
        self.with_kernel(|k| k.envs.get(id).map(|env| env.record()))
    }

    /// Number of page faults delivered to `id`, zero if it does not exist.
    pub fn pgfault_count(&self, id: Envid) -> usize {
        self.with_kernel(|k| k.envs.get(id).map(|env| env.pgfaults).unwrap_or(0))
    }

    /// The page table entry of the page containing `va` in `id`.
    pub fn pte_of(&self, id: Envid, va: Va) -> Pte {
        self.with_kernel(|k| {
            k.envs
                .get(id)
                .map(|env| env.pgdir.pte(&k.mem, va))
                .unwrap_or(Pte::EMPTY)
        })
    }

    /// The frame mapped at the page containing `va` in `id`.
    pub fn frame_of(&self, id: Envid, va: Va) -> Option<Pa> {
        self.pte_of(id, va).pa()
    }

    /// Number of allocated frames.
    pub fn frames_in_use(&self) -> usize {
        self.with_kernel(|k| k.mem.in_use())
    }

    /// Number of live environments.
    pub fn env_count(&self) -> usize {
        self.with_kernel(|k| k.envs.len())
    }

    /// Everything user programs printed so far.
    pub fn console_output(&self) -> String {
        self.with_kernel(|k| k.console.clone())
    }

    /// Starts recording frame allocations.
    pub fn track_alloc(&self) {
        self.with_kernel(|k| k.mem.track_alloc())
    }

    /// Panics if a frame allocated since [`Machine::track_alloc`] is still in
    /// use.
    pub fn validate_alloc(&self) {
        if let Some(report) = self.with_kernel(|k| k.mem.leaks()) {
            panic!("{report}");
        }
    }

    /// Destroys every environment.
    pub fn reap_all(&self) {
        self.with_kernel(|k| {
            for id in k.envs.ids() {
                k.destroy_env(id, Envid(0));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss::memlayout::UTEXT;
    use ulib::Exokernel;

    fn boot() -> Arc<Machine> {
        Machine::new(MachineConfig::builder().frames(128).quiet(true).build())
    }

    #[test]
    fn spawn_and_schedule() {
        let machine = boot();
        let a = machine.spawn(&ProgramImage::new("a")).unwrap();
        let b = machine.spawn(&ProgramImage::new("b")).unwrap();
        assert_eq!(machine.env_count(), 2);
        assert_eq!(machine.runnable_count(), 2);
        // `a` is destroyed while still queued.
        machine.with_kernel(|k| k.kill(a.envid()));
        assert_eq!(machine.runnable_count(), 1);
        assert_eq!(machine.schedule(), Some(b.envid()));
        assert_eq!(machine.schedule(), Some(b.envid()));
        assert_eq!(machine.env(b.envid()).map(|env| env.runs), Some(2));
        assert_eq!(machine.runnable_count(), 1);
    }

    #[test]
    fn yield_moves_the_caller_back() {
        let machine = boot();
        let a = machine.spawn(&ProgramImage::new("a")).unwrap();
        let b = machine.spawn(&ProgramImage::new("b")).unwrap();
        a.lib().kernel().sys_yield();
        assert_eq!(machine.schedule(), Some(b.envid()));
        assert_eq!(machine.schedule(), Some(a.envid()));
        // Nothing is ever typed on the console of the machine.
        assert_eq!(a.lib().kernel().sys_cgetc(), 0);
        assert_eq!(machine.runnable_count(), 2);
    }

    #[test]
    fn run_queue_does_not_grow_with_exited_children() {
        let machine = boot();
        let image = ProgramImage::new("parent").data(&[1; 8]);
        let mut parent = machine.spawn(&image).unwrap();
        for _ in 0..50 {
            let child = parent.fork().unwrap();
            let child = parent.resume_child(child).unwrap();
            assert_eq!(machine.runnable_count(), 2);
            child.run(|c| c.lib().exit()).unwrap().unwrap();
            assert_eq!(machine.runnable_count(), 1);
        }
        assert_eq!(machine.schedule(), Some(parent.envid()));
    }

    #[test]
    fn syscalls_return_negated_errors() {
        let machine = boot();
        let p = machine.spawn(&ProgramImage::new("p")).unwrap();
        assert_eq!(
            machine.syscall(p.envid(), SyscallNumber::Getenvid, [0; 5]),
            p.envid().0
        );
        assert_eq!(
            machine.syscall(p.envid(), SyscallNumber::EnvDestroy, [0x7000, 0, 0, 0, 0]),
            KernelError::BadEnv.into_i32()
        );
    }

    #[test]
    fn reap_all_frees_every_frame() {
        let machine = boot();
        machine.track_alloc();
        let p = machine
            .spawn(&ProgramImage::new("p").text(b"code").bss(3 * 4096))
            .unwrap();
        assert!(machine.frame_of(p.envid(), UTEXT).is_some());
        assert!(machine.frames_in_use() > 0);
        machine.reap_all();
        assert_eq!(machine.env_count(), 0);
        assert_eq!(machine.frames_in_use(), 0);
        machine.validate_alloc();
        assert_eq!(machine.pte_of(p.envid(), UTEXT), Pte::EMPTY);
    }
}
