//! Physical memory.
//!
//! Memory is an array of 4 KiB frames. Every frame carries a reference
//! count: the number of page table entries (or page directory pointers) that
//! name it. A frame returns to the free list when its count drops to zero,
//! which is what lets copy-on-write sharing reclaim the original page once
//! the last sharer installed a private copy.
//!
//! Frame zero is reserved so that the physical address `0` never names a
//! real page.

use abyss::addressing::{PAGE_SIZE, Pa, Va};
use std::collections::BTreeMap;
use ulib::{Envid, KernelError};

/// What a frame is used for. Recorded while allocation tracking is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUse {
    /// The page directory of an environment.
    PageDirectory(Envid),
    /// A page table of an environment.
    PageTable(Envid),
    /// A user page, first mapped by the given environment at the given
    /// address.
    Page(Envid, Va),
}

struct Frame {
    refcnt: u32,
    data: Option<Box<[u8; PAGE_SIZE]>>,
}

/// The machine's physical memory.
pub struct PhysicalMemory {
    frames: Vec<Frame>,
    free: Vec<usize>,
    tracked: Option<BTreeMap<usize, FrameUse>>,
}

impl PhysicalMemory {
    /// Creates a memory of `nframes` frames, all free except frame zero.
    pub fn new(nframes: usize) -> Self {
        let frames = (0..nframes.max(1))
            .map(|_| Frame {
                refcnt: 0,
                data: None,
            })
            .collect();
        // Hand out low frames first.
        let free = (1..nframes).rev().collect();
        Self {
            frames,
            free,
            tracked: None,
        }
    }

    /// Allocates a zeroed frame with a reference count of zero.
    ///
    /// The caller either maps the frame, which takes a reference, or gives it
    /// back with [`PhysicalMemory::free`].
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] if every frame is in use.
    pub fn alloc(&mut self, usage: FrameUse) -> Result<Pa, KernelError> {
        let n = self.free.pop().ok_or(KernelError::NoMemory)?;
        let frame = &mut self.frames[n];
        match frame.data.as_mut() {
            Some(data) => data.fill(0),
            None => frame.data = Some(Box::new([0; PAGE_SIZE])),
        }
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.insert(n, usage);
        }
        Ok(Pa::from_frame_number(n))
    }

    /// Returns an unreferenced frame to the free list.
    pub fn free(&mut self, pa: Pa) {
        let n = pa.frame_number();
        assert_eq!(
            self.frames[n].refcnt, 0,
            "freeing frame {pa:?} that is still referenced"
        );
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.remove(&n);
        }
        self.free.push(n);
    }

    /// Takes a reference to the frame at `pa`.
    pub fn incref(&mut self, pa: Pa) {
        self.frames[pa.frame_number()].refcnt += 1;
    }

    /// Drops a reference to the frame at `pa`, freeing it when it was the
    /// last one.
    pub fn decref(&mut self, pa: Pa) {
        let frame = &mut self.frames[pa.frame_number()];
        frame.refcnt -= 1;
        if frame.refcnt == 0 {
            self.free(pa);
        }
    }

    /// Number of references to the frame at `pa`.
    pub fn refcnt(&self, pa: Pa) -> u32 {
        self.frames[pa.frame_number()].refcnt
    }

    /// Number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.frames.len() - 1 - self.free.len()
    }

    /// The contents of the frame at `pa`.
    pub fn page(&self, pa: Pa) -> &[u8; PAGE_SIZE] {
        const ZERO: [u8; PAGE_SIZE] = [0; PAGE_SIZE];
        let frame = &self.frames[pa.frame_number()];
        frame.data.as_deref().unwrap_or(&ZERO)
    }

    /// The contents of the frame at `pa`, mutably.
    ///
    /// # Panics
    /// Panics if the frame was never allocated.
    pub fn page_mut(&mut self, pa: Pa) -> &mut [u8; PAGE_SIZE] {
        match self.frames[pa.frame_number()].data.as_deref_mut() {
            Some(data) => data,
            None => panic!("frame {pa:?} was never allocated"),
        }
    }

    /// Reads the `index`-th 32-bit word of the frame at `pa`.
    pub fn read_u32(&self, pa: Pa, index: usize) -> u32 {
        let page = self.page(pa);
        let b = &page[index * 4..index * 4 + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Writes the `index`-th 32-bit word of the frame at `pa`.
    pub fn write_u32(&mut self, pa: Pa, index: usize, value: u32) {
        let word = &mut self.page_mut(pa)[index * 4..index * 4 + 4];
        word.copy_from_slice(&value.to_le_bytes());
    }

    /// Starts recording every allocation that is not freed again.
    pub fn track_alloc(&mut self) {
        self.tracked = Some(BTreeMap::new());
    }

    /// Reports the frames allocated since [`PhysicalMemory::track_alloc`]
    /// that are still in use.
    pub fn leaks(&self) -> Option<LeakReport> {
        match self.tracked.as_ref() {
            Some(tracked) if !tracked.is_empty() => Some(LeakReport(tracked.clone())),
            _ => None,
        }
    }

    /// Panics if a frame allocated since [`PhysicalMemory::track_alloc`] is
    /// still in use.
    pub fn validate_alloc(&self) {
        if let Some(report) = self.leaks() {
            panic!("{report}");
        }
    }
}

/// Frames that were allocated while tracking and never freed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakReport(BTreeMap<usize, FrameUse>);

impl LeakReport {
    /// Number of non-freed frames.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false` for a report returned by [`PhysicalMemory::leaks`].
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl core::fmt::Display for LeakReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "Grader: Validating frame allocation state failed: Detecting {} non-freed frames.",
            self.0.len()
        )?;
        writeln!(f, "List of non-freed frames:")?;
        for (idx, (n, usage)) in self.0.iter().take(10).enumerate() {
            writeln!(f, "  {idx}: {:?}, used as {usage:?}", Pa::from_frame_number(*n))?;
        }
        if self.0.len() > 10 {
            write!(f, "... and {:?} more frames.", self.0.len() - 10)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounted_frames() {
        let mut mem = PhysicalMemory::new(4);
        let owner = FrameUse::Page(Envid(0x1000), Va::ZERO);
        let a = mem.alloc(owner).unwrap();
        assert_eq!(a, Pa::from_frame_number(1));
        mem.page_mut(a)[7] = 0xaa;
        mem.incref(a);
        mem.incref(a);
        mem.decref(a);
        assert_eq!(mem.in_use(), 1);
        mem.decref(a);
        assert_eq!(mem.in_use(), 0);
        // Reallocated frames come back zeroed.
        let b = mem.alloc(owner).unwrap();
        assert_eq!(b, a);
        assert_eq!(mem.page(b)[7], 0);
    }

    #[test]
    fn out_of_frames() {
        let mut mem = PhysicalMemory::new(3);
        let owner = FrameUse::PageTable(Envid(0x1000));
        mem.alloc(owner).unwrap();
        mem.alloc(owner).unwrap();
        assert_eq!(mem.alloc(owner), Err(KernelError::NoMemory));
    }

    #[test]
    #[should_panic(expected = "Detecting 1 non-freed frames")]
    fn leak_is_reported() {
        let mut mem = PhysicalMemory::new(8);
        mem.track_alloc();
        let a = mem.alloc(FrameUse::PageDirectory(Envid(0x1000))).unwrap();
        let b = mem.alloc(FrameUse::PageDirectory(Envid(0x1001))).unwrap();
        mem.free(a);
        let _ = b;
        mem.validate_alloc();
    }
}
