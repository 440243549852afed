//! Entries of the two-level i386 page table and their permissions.
//!
//! A page table entry is a single 32-bit word: the upper 20 bits hold the
//! physical frame address and the lower 12 bits hold flags. Three of the flag
//! bits ([`PteFlags::AVAIL`]) are ignored by the hardware and left to
//! software; user environments use one of them, [`PteFlags::COW`], to tag
//! pages that are shared copy-on-write after a `fork`.
use crate::addressing::{PAGE_MASK, Pa};

bitflags::bitflags! {
    /// Flags for a page table entry.
    pub struct PteFlags: u32 {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry.
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry.
        const U = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry.
        const D = 1 << 6;
        /// Page size; must be 0 in a page table entry.
        const PS = 1 << 7;
        /// Global; if CR4.PGE = 1, determines whether the translation is global.
        const G = 1 << 8;
        /// Bits ignored by the hardware and available to software.
        const AVAIL = 0xe00;
        /// Copy-on-write; the page is shared and must be copied before the first write.
        ///
        /// This bit is taken from [`PteFlags::AVAIL`] and is never combined
        /// with [`PteFlags::W`] in an installed mapping.
        const COW = 0x800;
        /// The flags that a user environment may pass to a page-level system call.
        const SYSCALL = Self::AVAIL.bits | Self::P.bits | Self::W.bits | Self::U.bits;
    }
}

bitflags::bitflags! {
    /// Flags for a page directory entry.
    pub struct PdeFlags: u32 {
        /// Present; must be 1 to reference a page table.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-MByte region controlled by this entry.
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-MByte region controlled by this entry.
        const U = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Page size; if 1, the entry maps a 4-MByte page.
        const PS = 1 << 7;
        /// Bits ignored by the hardware and available to software.
        const AVAIL = 0xe00;
    }
}

/// Errors that can occur while editing a page table entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not a multiple of the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or is not present.
    NotExist,
}

/// Page Table Entry (PTE).
///
/// A present entry maps one 4 KiB virtual page to a physical frame with the
/// permissions given by its [`PteFlags`]. The all-zero word is the empty entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// The empty entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry mapping `pa` with `flags`.
    ///
    /// # Returns
    /// - `Ok(Pte)` if the address is page aligned.
    /// - `Err(PageTableMappingError::Unaligned)` otherwise.
    #[inline]
    pub fn new(pa: Pa, flags: PteFlags) -> Result<Self, PageTableMappingError> {
        if pa.offset() != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            Ok(Self(pa.into_u32() | flags.bits()))
        }
    }

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the entry is present, containing the physical address.
    /// - `None` if the entry is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Some(Pa::from_u32(self.0 & !(PAGE_MASK as u32)))
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if the entry maps a page.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    /// Set the flags for this entry, keeping its frame address.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & !(PAGE_MASK as u32)) | flags.bits();
        self
    }

    /// Clears the entry.
    ///
    /// # Returns
    /// - `Some(Pa)` holding the frame the entry used to map.
    /// - `None` if the entry was not present.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

/// Page Directory Entry (PDE).
///
/// A present entry references the page table that maps a 4 MiB region of
/// the address space.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(pub u32);

impl core::fmt::Debug for Pde {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pde({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pde {
    /// The empty entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry referencing the page table at `pa`.
    #[inline]
    pub fn new(pa: Pa, flags: PdeFlags) -> Result<Self, PageTableMappingError> {
        if pa.offset() != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            Ok(Self(pa.into_u32() | flags.bits()))
        }
    }

    /// Get the physical address of the page table referenced by this entry.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Some(Pa::from_u32(self.0 & !(PAGE_MASK as u32)))
        } else {
            None
        }
    }

    /// Get the flags associated with this entry.
    #[inline]
    pub const fn flags(&self) -> PdeFlags {
        PdeFlags::from_bits_truncate(self.0)
    }

    /// Returns `true` if the entry references a page table.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & PdeFlags::P.bits() != 0
    }

    /// Clears the entry, returning the page table it referenced.
    #[inline]
    pub fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_is_a_software_bit() {
        assert!(PteFlags::AVAIL.contains(PteFlags::COW));
        assert!(PteFlags::SYSCALL.contains(PteFlags::COW | PteFlags::W));
        assert!(!PteFlags::SYSCALL.contains(PteFlags::A));
        assert_eq!(PteFlags::SYSCALL.bits(), 0xe07);
    }

    #[test]
    fn entry_fields() {
        let flags = PteFlags::P | PteFlags::U | PteFlags::W;
        let mut pte = Pte::new(Pa::from_u32(0x0012_3000), flags).unwrap();
        assert_eq!(pte.pa(), Some(Pa::from_u32(0x0012_3000)));
        pte.set_flags(PteFlags::P | PteFlags::U | PteFlags::COW);
        assert_eq!(pte.0, 0x0012_3805);
        assert_eq!(pte.clear(), Some(Pa::from_u32(0x0012_3000)));
        assert_eq!(pte, Pte::EMPTY);
        assert_eq!(
            Pte::new(Pa::from_u32(0x10), PteFlags::P),
            Err(PageTableMappingError::Unaligned)
        );
    }
}
