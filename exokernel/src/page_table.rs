//! Two-level page tables.
//!
//! An address space is a page directory of 1024 [`Pde`]s, each referencing a
//! page table of 1024 [`Pte`]s. Both levels live in frames of
//! [`PhysicalMemory`]; a [`PageDirectory`] is only the physical address of
//! its directory frame, so it is `Copy` and every operation borrows the
//! memory explicitly.
//!
//! Mapping a frame takes a reference to it and unmapping drops the
//! reference. A frame shared copy-on-write between a parent and its child is
//! therefore referenced twice and survives until both sides have replaced or
//! dropped their mapping.
//!
//! - [`PageDirectory::insert`] maps a frame, replacing the previous mapping.
//! - [`PageDirectory::remove`] unmaps a page.
//! - [`PageDirectory::lookup`] and [`PageDirectory::pte`] read the tables,
//!   which is also how the user self view at `UVPT` is answered.
//! - [`PageDirectory::free`] tears the whole address space down.

use crate::mm::{FrameUse, PhysicalMemory};
use abyss::{
    addressing::{NPTENTRIES, Pa, Va},
    memlayout::UTOP_PDX,
    paging::{PageTableMappingError, Pde, PdeFlags, Pte, PteFlags},
};
use ulib::{Envid, KernelError};

/// Page table indices of a page-aligned virtual address.
///
/// On i386 the top 10 bits of an address select the page directory entry,
/// the next 10 bits the page table entry, and the low 12 bits the byte in the
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtIndices {
    /// The virtual address.
    pub va: Va,
    /// Page Directory Index.
    pub pdx: usize,
    /// Page Table Index.
    pub ptx: usize,
}

impl PtIndices {
    /// Extracts page table indices from a given virtual address ([`Va`]).
    ///
    /// # Returns
    /// - `Ok(Self)`: If `va` is page-aligned.
    /// - `Err(PageTableMappingError::Unaligned)`: If `va` is not page-aligned.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if va.is_page_aligned() {
            Ok(Self {
                va,
                pdx: va.pdx(),
                ptx: va.ptx(),
            })
        } else {
            Err(PageTableMappingError::Unaligned)
        }
    }
}

/// The page directory of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirectory {
    pa: Pa,
    owner: Envid,
}

impl PageDirectory {
    /// Allocates an empty page directory for `owner`.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] if no frame is available.
    pub fn new(mem: &mut PhysicalMemory, owner: Envid) -> Result<Self, KernelError> {
        let pa = mem.alloc(FrameUse::PageDirectory(owner))?;
        mem.incref(pa);
        Ok(Self { pa, owner })
    }

    /// Get physical address of this page directory.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Reads page directory entry `pdx`.
    pub fn pde(&self, mem: &PhysicalMemory, pdx: usize) -> Pde {
        Pde(mem.read_u32(self.pa, pdx))
    }

    fn set_pde(&self, mem: &mut PhysicalMemory, pdx: usize, pde: Pde) {
        mem.write_u32(self.pa, pdx, pde.0);
    }

    /// Walk through the page directory to find the page table entry for
    /// `va`.
    ///
    /// # Returns
    /// - `Ok(Pte)` if `va` is mapped.
    /// - `Err(PageTableMappingError::Unaligned)` if `va` is not page-aligned.
    /// - `Err(PageTableMappingError::NotExist)` if no page is mapped at `va`.
    pub fn walk(&self, mem: &PhysicalMemory, va: Va) -> Result<Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pt = self
            .pde(mem, indices.pdx)
            .pa()
            .ok_or(PageTableMappingError::NotExist)?;
        let pte = Pte(mem.read_u32(pt, indices.ptx));
        if pte.is_present() {
            Ok(pte)
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Returns the page table entry of the page containing `va`, or
    /// [`Pte::EMPTY`] if its page table does not exist.
    pub fn pte(&self, mem: &PhysicalMemory, va: Va) -> Pte {
        self.walk(mem, va.page_down()).unwrap_or(Pte::EMPTY)
    }

    /// Returns the frame mapped at the page containing `va` and its entry.
    pub fn lookup(&self, mem: &PhysicalMemory, va: Va) -> Option<(Pa, Pte)> {
        let pte = self.pte(mem, va);
        pte.pa().map(|pa| (pa, pte))
    }

    /// Finds the page table covering `indices`, creating it if `create` is
    /// set.
    fn walk_mut(
        &self,
        mem: &mut PhysicalMemory,
        indices: &PtIndices,
        create: bool,
    ) -> Result<Option<Pa>, KernelError> {
        if let Some(pt) = self.pde(mem, indices.pdx).pa() {
            return Ok(Some(pt));
        }
        if !create {
            return Ok(None);
        }
        let pt = mem.alloc(FrameUse::PageTable(self.owner))?;
        mem.incref(pt);
        let pde = Pde::new(pt, PdeFlags::P | PdeFlags::W | PdeFlags::U)
            .map_err(|_| KernelError::Unspecified)?;
        self.set_pde(mem, indices.pdx, pde);
        Ok(Some(pt))
    }

    /// Maps the frame at `pa` at `va` with `perm | P`.
    ///
    /// A page already mapped at `va` is removed first. Re-inserting the frame
    /// that is already mapped there only changes the permissions.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] if `va` is not page-aligned.
    /// - [`KernelError::NoMemory`] if the page table cannot be allocated.
    pub fn insert(
        &self,
        mem: &mut PhysicalMemory,
        pa: Pa,
        va: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let indices = PtIndices::from_va(va).map_err(|_| KernelError::InvalidArgument)?;
        let pte = Pte::new(pa, perm | PteFlags::P).map_err(|_| KernelError::InvalidArgument)?;
        let pt = self
            .walk_mut(mem, &indices, true)?
            .ok_or(KernelError::NoMemory)?;
        // Take the new reference before dropping the old one so that
        // re-inserting the same frame does not free it.
        mem.incref(pa);
        self.remove(mem, va);
        mem.write_u32(pt, indices.ptx, pte.0);
        Ok(())
    }

    /// Unmaps the page at `va`, dropping the reference to its frame.
    ///
    /// Unmapping an unmapped page does nothing.
    pub fn remove(&self, mem: &mut PhysicalMemory, va: Va) {
        let Ok(indices) = PtIndices::from_va(va) else {
            return;
        };
        let Ok(Some(pt)) = self.walk_mut(mem, &indices, false) else {
            return;
        };
        let mut pte = Pte(mem.read_u32(pt, indices.ptx));
        if let Some(pa) = pte.clear() {
            mem.write_u32(pt, indices.ptx, pte.0);
            mem.decref(pa);
        }
    }

    /// Number of present pages below `UTOP`.
    pub fn mapped_pages(&self, mem: &PhysicalMemory) -> usize {
        (0..UTOP_PDX)
            .filter_map(|pdx| self.pde(mem, pdx).pa())
            .map(|pt| {
                (0..NPTENTRIES)
                    .filter(|ptx| Pte(mem.read_u32(pt, *ptx)).is_present())
                    .count()
            })
            .sum()
    }

    /// Clears all entries from the page directory and deallocates it.
    ///
    /// Every mapped page is unmapped, every page table is freed, and finally
    /// the directory frame itself is released.
    pub fn free(self, mem: &mut PhysicalMemory) {
        for pdx in 0..UTOP_PDX {
            let Some(pt) = self.pde(mem, pdx).pa() else {
                continue;
            };
            for ptx in 0..NPTENTRIES {
                self.remove(mem, Va::from_indices(pdx, ptx, 0));
            }
            self.set_pde(mem, pdx, Pde::EMPTY);
            mem.decref(pt);
        }
        mem.decref(self.pa);
    }
}
