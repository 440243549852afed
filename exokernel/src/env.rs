//! The environment table.
//!
//! The kernel keeps [`NENV`] environment slots. An environment is named by an
//! [`Envid`] whose low bits are the slot and whose high bits are a
//! generation that advances every time the slot is reused, so a stale
//! identifier never reaches the slot's next occupant.

use crate::{mm::PhysicalMemory, page_table::PageDirectory};
use abyss::addressing::Va;
use arrayvec::ArrayVec;
use ulib::{
    EnvStatus, Envid, KernelError,
    env::{Env as EnvRecord, NENV},
};

/// An environment, as the kernel sees it.
#[derive(Debug, Clone)]
pub struct Env {
    /// Unique identifier.
    pub id: Envid,
    /// Identifier of the creator, `Envid(0)` for environments the machine
    /// spawned.
    pub parent_id: Envid,
    /// Scheduling state.
    pub status: EnvStatus,
    /// Number of times the environment was scheduled.
    pub runs: u32,
    /// The address space.
    pub pgdir: PageDirectory,
    /// Where page faults are delivered, or zero if nowhere.
    pub pgfault_upcall: Va,
    /// Set on a child created by `sys_exofork` until the child's own first
    /// `sys_exofork` returns zero to it.
    pub exofork_pending: bool,
    /// Number of fault records currently on the exception stack.
    pub xstack_depth: usize,
    /// Number of page faults delivered so far.
    pub pgfaults: usize,
}

impl Env {
    /// The user-visible record of this environment.
    pub fn record(&self) -> EnvRecord {
        EnvRecord {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            runs: self.runs,
            pgfault_upcall: self.pgfault_upcall.into_u32(),
        }
    }
}

#[derive(Default)]
struct Slot {
    last_id: Envid,
    env: Option<Env>,
}

/// All environment slots.
pub struct EnvTable {
    slots: Vec<Slot>,
    free: ArrayVec<usize, NENV>,
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvTable {
    /// Creates a table with every slot free.
    pub fn new() -> Self {
        Self {
            slots: (0..NENV).map(|_| Slot::default()).collect(),
            // Hand out slot 0 first.
            free: (0..NENV).rev().collect(),
        }
    }

    /// Allocates and initializes a new environment with an empty address
    /// space, created by `parent`.
    ///
    /// The environment starts [`EnvStatus::NotRunnable`].
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if every slot is taken.
    /// - [`KernelError::NoMemory`] if the page directory cannot be
    ///   allocated.
    pub fn alloc(&mut self, mem: &mut PhysicalMemory, parent: Envid) -> Result<Envid, KernelError> {
        let slot = *self.free.last().ok_or(KernelError::NoFreeEnv)?;
        let id = Envid::next_generation(self.slots[slot].last_id, slot);
        let pgdir = PageDirectory::new(mem, id)?;
        self.free.pop();
        self.slots[slot] = Slot {
            last_id: id,
            env: Some(Env {
                id,
                parent_id: parent,
                status: EnvStatus::NotRunnable,
                runs: 0,
                pgdir,
                pgfault_upcall: Va::ZERO,
                exofork_pending: false,
                xstack_depth: 0,
                pgfaults: 0,
            }),
        };
        info!("[{parent}] new env {id}");
        Ok(id)
    }

    /// Returns the live environment named exactly by `id`.
    pub fn get(&self, id: Envid) -> Option<&Env> {
        self.slots
            .get(id.envx())?
            .env
            .as_ref()
            .filter(|env| env.id == id)
    }

    /// Returns the live environment named exactly by `id`, mutably.
    pub fn get_mut(&mut self, id: Envid) -> Option<&mut Env> {
        self.slots
            .get_mut(id.envx())?
            .env
            .as_mut()
            .filter(|env| env.id == id)
    }

    /// Resolves `envid` on behalf of `caller`.
    ///
    /// `Envid(0)` names the caller. When `checkperm` is set, the target must
    /// be the caller itself or one of its immediate children.
    ///
    /// # Errors
    /// [`KernelError::BadEnv`] if the environment does not exist or the
    /// caller may not manipulate it.
    pub fn envid2env(
        &self,
        envid: Envid,
        caller: Envid,
        checkperm: bool,
    ) -> Result<Envid, KernelError> {
        if envid.is_current() {
            let env = self.get(caller).ok_or(KernelError::BadEnv)?;
            return Ok(env.id);
        }
        let env = self.get(envid).ok_or(KernelError::BadEnv)?;
        if checkperm && env.id != caller && env.parent_id != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(env.id)
    }

    /// Frees environment `id` and its address space. `by` is the
    /// environment on whose behalf this happens, for the log.
    ///
    /// Returns the freed environment, or `None` if `id` does not exist.
    pub fn destroy(&mut self, mem: &mut PhysicalMemory, id: Envid, by: Envid) -> Option<Env> {
        let slot = self.slots.get_mut(id.envx())?;
        if slot.env.as_ref().map(|env| env.id) != Some(id) {
            return None;
        }
        let mut env = slot.env.take()?;
        env.status = EnvStatus::Free;
        env.pgdir.free(mem);
        self.free.push(id.envx());
        info!("[{by}] free env {id}");
        Some(env)
    }

    /// The record of slot `envx` in the read-only environment array.
    pub fn record(&self, envx: usize) -> EnvRecord {
        self.slots
            .get(envx)
            .and_then(|slot| slot.env.as_ref())
            .map(Env::record)
            .unwrap_or(EnvRecord::FREE)
    }

    /// Identifiers of all live environments, by slot.
    pub fn ids(&self) -> Vec<Envid> {
        self.slots
            .iter()
            .filter_map(|slot| slot.env.as_ref().map(|env| env.id))
            .collect()
    }

    /// Number of live environments.
    pub fn len(&self) -> usize {
        NENV - self.free.len()
    }

    /// Returns `true` if no environment is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
