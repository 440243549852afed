//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for the 32-bit virtual and physical
//! addresses of the i386 machine that the exokernel runs on. User
//! environments see their address space through a two-level page table:
//! the top 10 bits of a virtual address select a page directory entry
//! ([`Va::pdx`]), the next 10 bits select a page table entry ([`Va::ptx`]),
//! and the low 12 bits are the offset within a 4 KiB page.
//!
//! ```text
//! +--------10------+-------10-------+---------12----------+
//! | Page Directory |   Page Table   | Offset within Page  |
//! |      Index     |      Index     |                     |
//! +----------------+----------------+---------------------+
//!  \--- PDX(va) --/ \--- PTX(va) --/
//!  \---------- PGNUM(va) ----------/
//! ```
//!
//! The module defines two primary types for memory addresses: [`Va`] for
//! virtual address and [`Pa`] for physical address. Both of them support
//! arithmetic with byte offsets, which allows straightforward address
//! computations such as `va + PAGE_SIZE`.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x0080_2123).unwrap();
//! assert_eq!(va.page_down(), Va::new(0x0080_2000).unwrap());
//! assert_eq!(va.pgnum(), 0x802);
//! assert_eq!(va.pdx(), 2);
//! assert_eq!((va.page_down() + PAGE_SIZE).ptx(), 3);
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB
/// (kilobytes). Every mapping installed by the kernel covers exactly one page,
/// and every address passed to a page-level system call must be a multiple of
/// this value.
///
/// ## Example:
/// ```ignore
/// let next_page = address + PAGE_SIZE;
/// ```
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
///
/// This value corresponds to the log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Number of entries in a page directory.
pub const NPDENTRIES: usize = 1024;

/// Number of entries in a page table.
pub const NPTENTRIES: usize = 1024;

/// Bytes mapped by a single page directory entry (4 MiB).
pub const PT_SIZE: usize = PAGE_SIZE * NPTENTRIES;

/// The shift amount to get the page directory index from an address.
pub const PDX_SHIFT: usize = 22;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents a physical address in memory. Physical addresses are only
/// ever seen by the kernel and inside page table entries; user code
/// names memory through [`Va`].
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    ///
    /// Frame zero is never handed out, so this value doubles as "no frame".
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address fits in 32 bits.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is valid.
    /// - `None` if the address is outside the 4 GiB physical address space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= u32::MAX as usize {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Creates a physical address from a raw 32-bit word.
    #[inline]
    pub const fn from_u32(addr: u32) -> Self {
        Self(addr as usize)
    }

    /// Creates the physical address of the `n`-th page frame.
    #[inline]
    pub const fn from_frame_number(n: usize) -> Self {
        Self(n << PAGE_SHIFT)
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast the physical address into a raw 32-bit word.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0 as u32
    }

    /// Returns the index of the page frame that contains this address.
    #[inline]
    pub const fn frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// The `Va` (Virtual Address) struct is a wrapper around the `usize` type,
/// which represents an address in the 32-bit address space of a user
/// environment. Besides ordinary arithmetic, it knows how to split itself into
/// the indices used by the two-level page table.
///
/// ## Example:
/// ```
/// # use abyss::addressing::Va;
/// let va = Va::new(0xeebf_f000).unwrap();
/// assert!(va.is_page_aligned());
/// ```
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address if the address fits in 32 bits.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the virtual address.
    ///
    /// # Returns
    /// - `Some(Va)` if the address is valid.
    /// - `None` if the address is outside the 4 GiB address space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= u32::MAX as usize {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Creates a virtual address from a raw 32-bit word.
    ///
    /// Every 32-bit word is a valid address, so this never fails. It is the
    /// constructor used for the fixed layout constants and for addresses
    /// decoded from system call arguments.
    #[inline]
    pub const fn from_u32(addr: u32) -> Self {
        Self(addr as usize)
    }

    /// Creates the address of the first byte of virtual page `pn`.
    #[inline]
    pub const fn from_pgnum(pn: usize) -> Self {
        Self(pn << PAGE_SHIFT)
    }

    /// Creates the address named by a page directory index, a page table
    /// index and an offset.
    #[inline]
    pub const fn from_indices(pdx: usize, ptx: usize, offset: usize) -> Self {
        let va = (pdx << PDX_SHIFT) | (ptx << PAGE_SHIFT) | (offset & PAGE_MASK);
        Self(va)
    }

    /// Cast the virtual address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Cast the virtual address into a raw 32-bit word.
    ///
    /// This is the representation carried in system call arguments and in
    /// the user trap frame.
    #[inline]
    pub const fn into_u32(self) -> u32 {
        self.0 as u32
    }

    /// Align down the virtual address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up the virtual address to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns `true` if the address is the first byte of a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// The virtual page number of this address.
    ///
    /// This is the index of the address's page table entry inside the
    /// linear page table exposed at `UVPT`.
    #[inline]
    pub const fn pgnum(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// The page directory index of this address.
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDX_SHIFT) & (NPDENTRIES - 1)
    }

    /// The page table index of this address.
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (NPTENTRIES - 1)
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<$t> for $t {
            type Output = usize;

            fn sub(self, other: $t) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
        impl core::fmt::LowerHex for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

impl_arith!(Pa);
impl_arith!(Va);

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}

impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}

impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_into_indices() {
        let va = Va::from_u32(0xeebf_e123);
        assert_eq!(va.pdx(), 0x3ba);
        assert_eq!(va.ptx(), 0x3fe);
        assert_eq!(va.offset(), 0x123);
        assert_eq!(Va::from_indices(va.pdx(), va.ptx(), va.offset()), va);
        assert_eq!(Va::from_pgnum(va.pgnum()), va.page_down());
    }

    #[test]
    fn alignment() {
        let va = Va::from_u32(0x0080_0001);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_down().into_u32(), 0x0080_0000);
        assert_eq!(va.page_up().into_u32(), 0x0080_1000);
        assert!(Va::new(0x1_0000_0000).is_none());
    }

    #[test]
    fn frame_numbers() {
        let pa = Pa::from_frame_number(7);
        assert_eq!(pa.into_u32(), 0x7000);
        assert_eq!((pa + 0x10).frame_number(), 7);
        assert_eq!((pa + 0x10).offset(), 0x10);
    }
}
