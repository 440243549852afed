//! Memory layout shared by the kernel and user environments.
//!
//! ```text
//!  4 Gig -------->  +------------------------------+
//!                   |                              |
//!                   :     kernel, not visible      :
//!                   |                              |
//!  KERNBASE ----->  +------------------------------+ 0xf0000000
//!                   |     memory-mapped I/O        |
//!  ULIM, MMIOBASE ->+------------------------------+ 0xef800000
//!                   |  Cur. page table (user R-)   |
//!  UVPT ---->       +------------------------------+ 0xef400000
//!                   |          RO PAGES            |
//!  UPAGES ---->     +------------------------------+ 0xef000000
//!                   |           RO ENVS            |
//!  UTOP,UENVS ----> +------------------------------+ 0xeec00000
//!  UXSTACKTOP -/    |     User Exception Stack     | RW/RW
//!                   +------------------------------+ 0xeebff000
//!                   |       Empty Memory (*)       |
//!                   +------------------------------+ 0xeebfe000
//!  USTACKTOP  --->  |      Normal User Stack       | RW/RW
//!                   +------------------------------+ 0xeebfd000
//!                   |                              |
//!                   :      Program Data & Heap     :
//!                   |                              |
//!  UTEXT -------->  +------------------------------+ 0x00800000
//!  PFTEMP ------->  |       Empty Memory (*)       |
//!                   |                              |
//!  UTEMP -------->  +------------------------------+ 0x00400000
//!                   |       Empty Memory (*)       |
//!  0 ------------>  +------------------------------+
//! ```
//!
//! Everything below [`UTOP`] belongs to the environment and may be changed
//! through system calls. The read-only windows between [`UTOP`] and [`ULIM`]
//! are how an environment observes its own state without trapping: the
//! linear page table at [`UVPT`], the page directory at [`UVPD`], and the
//! environment array at [`UENVS`].

use crate::addressing::{PAGE_SIZE, PDX_SHIFT, PT_SIZE, Va};

/// All physical memory is mapped at this address in the kernel.
pub const KERNBASE: Va = Va::from_u32(0xf000_0000);

/// Start of the memory-mapped I/O region.
pub const MMIOBASE: Va = Va::from_u32(0xef80_0000);

/// Top of user-readable memory.
pub const ULIM: Va = MMIOBASE;

/// User read-only virtual page table.
///
/// The page directory maps itself at this address, so the page table entry
/// of virtual page `pn` is the `pn`-th word of this window.
pub const UVPT: Va = Va::from_u32(0xef40_0000);

/// User read-only view of the page directory.
///
/// This is where the self-mapping places the page directory itself inside
/// the [`UVPT`] window.
pub const UVPD: Va = Va::from_u32(0xef40_0000 + ((0xef40_0000 >> 12) << 2));

/// Read-only copies of the page structures.
pub const UPAGES: Va = Va::from_u32(0xef00_0000);

/// Read-only copies of the global environment structures.
pub const UENVS: Va = Va::from_u32(0xeec0_0000);

/// Top of the user-mappable region.
///
/// Environments may only install mappings strictly below this address.
pub const UTOP: Va = UENVS;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: Va = UTOP;

/// Top of the normal user stack.
///
/// The page just below [`UXSTACKTOP`]'s page is left unmapped as a guard.
pub const USTACKTOP: Va = Va::from_u32(0xeec0_0000 - 2 * PAGE_SIZE as u32);

/// Where user programs generally begin.
pub const UTEXT: Va = Va::from_u32(2 * PT_SIZE as u32);

/// Used for temporary page mappings.
pub const UTEMP: Va = Va::from_u32(PT_SIZE as u32);

/// Scratch slot used by the user-level copy-on-write handler.
pub const PFTEMP: Va = Va::from_u32((PT_SIZE * 2 - PAGE_SIZE) as u32);

/// Returns `true` if the page containing `va` is the user exception stack.
#[inline]
pub const fn is_exception_stack(va: Va) -> bool {
    va.into_usize() >= UXSTACKTOP.into_usize() - PAGE_SIZE
        && va.into_usize() < UXSTACKTOP.into_usize()
}

/// Number of page directory entries that cover user-mappable memory.
pub const UTOP_PDX: usize = UTOP.into_usize() >> PDX_SHIFT;
