//! Environments, the exokernel's unit of protection.
//!
//! An environment owns an address space and a single thread of control. The
//! kernel exposes a read-only array of [`Env`] records at `UENVS`; an
//! environment finds its own record at index [`Envid::envx`] of its id.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Log2 of the number of environment slots.
pub const LOG2NENV: u32 = 10;

/// Number of environment slots.
pub const NENV: usize = 1 << LOG2NENV;

/// Shift of the generation counter inside an [`Envid`].
pub const ENVGENSHIFT: u32 = 12;

/// An environment identifier.
///
/// ```text
/// +1+---------------21-----------------+--------10--------+
/// |0|          Uniqueifier             |   Environment    |
/// | |                                  |      Index       |
/// +------------------------------------+------------------+
///                                       \--- ENVX(eid) --/
/// ```
///
/// The environment index is the slot in the environment array. The
/// uniqueifier distinguishes environments that used the same slot at
/// different times. Identifiers are always positive; the value `0` names the
/// calling environment in every system call.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Envid(pub i32);

impl Envid {
    /// Names the calling environment.
    pub const CURRENT: Envid = Envid(0);

    /// The slot index of this identifier.
    #[inline]
    pub const fn envx(self) -> usize {
        (self.0 as u32 as usize) & (NENV - 1)
    }

    /// Returns `true` if this is [`Envid::CURRENT`].
    #[inline]
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }

    /// Computes the identifier handed out for `slot` when its previous
    /// occupant was `prev`.
    ///
    /// The generation advances by one on every reuse and never produces a
    /// non-positive identifier.
    pub const fn next_generation(prev: Envid, slot: usize) -> Envid {
        let mut generation = prev.0.wrapping_add(1 << ENVGENSHIFT) & !((NENV as i32) - 1);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        Envid(generation | slot as i32)
    }
}

impl core::fmt::Debug for Envid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Envid({:08x})", self.0)
    }
}

impl core::fmt::Display for Envid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EnvStatus {
    /// The slot is unused.
    Free = 0,
    /// The environment is being torn down.
    Dying = 1,
    /// The environment may be scheduled.
    Runnable = 2,
    /// The environment is on a processor.
    Running = 3,
    /// The environment exists but must not be scheduled.
    NotRunnable = 4,
}

/// The user-visible record of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Env {
    /// Unique identifier.
    pub id: Envid,
    /// Identifier of the creator, or `Envid(0)` for the first environment.
    pub parent_id: Envid,
    /// Scheduling state.
    pub status: EnvStatus,
    /// Number of times the environment has been scheduled.
    pub runs: u32,
    /// Entry point for page faults, or `0` if none is registered.
    pub pgfault_upcall: u32,
}

impl Env {
    /// The record of an unused slot.
    pub const FREE: Env = Env {
        id: Envid(0),
        parent_id: Envid(0),
        status: EnvStatus::Free,
        runs: 0,
        pgfault_upcall: 0,
    };
}
