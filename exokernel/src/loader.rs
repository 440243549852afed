//! Program images.
//!
//! A [`ProgramImage`] describes the initial address space of a program the
//! machine spawns: read-only text at `UTEXT`, initialized data, zeroed bss
//! and one page of user stack below `USTACKTOP`. Segments are laid out one
//! after another, each starting on a page boundary.
//!
//! ```
//! use exokernel::ProgramImage;
//!
//! let image = ProgramImage::new("counter")
//!     .text(b"\x90\x90\xc3")
//!     .data(&1u32.to_le_bytes())
//!     .bss(0x2000);
//! assert_eq!(image.data_start().into_usize(), 0x0080_1000);
//! assert_eq!(image.bss_start().into_usize(), 0x0080_2000);
//! ```

use crate::{machine::Kernel, mm::FrameUse};
use abyss::{
    addressing::{PAGE_SIZE, Va},
    memlayout::{USTACKTOP, UTEXT},
    paging::PteFlags,
};
use ulib::{Envid, KernelError};

/// The initial memory image of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    name: &'static str,
    text: Vec<u8>,
    data: Vec<u8>,
    bss: usize,
}

impl ProgramImage {
    /// Starts an empty image for the program `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            text: Vec::new(),
            data: Vec::new(),
            bss: 0,
        }
    }

    /// Sets the contents of the text segment.
    pub fn text(mut self, text: &[u8]) -> Self {
        self.text = text.to_vec();
        self
    }

    /// Sets the contents of the data segment.
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    /// Sets the size of the bss segment.
    pub fn bss(mut self, len: usize) -> Self {
        self.bss = len;
        self
    }

    /// The program name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Where the text segment is loaded.
    pub fn text_start(&self) -> Va {
        UTEXT
    }

    /// Where the data segment is loaded.
    pub fn data_start(&self) -> Va {
        (self.text_start() + self.text.len()).page_up()
    }

    /// Where the bss segment is loaded.
    pub fn bss_start(&self) -> Va {
        (self.data_start() + self.data.len()).page_up()
    }

    /// Lowest address of the initial user stack page.
    pub fn stack_bottom(&self) -> Va {
        USTACKTOP - PAGE_SIZE
    }

    fn segments(&self) -> [(Va, &[u8], usize, PteFlags); 4] {
        let ro = PteFlags::P | PteFlags::U;
        let rw = ro | PteFlags::W;
        let (text, data) = (self.text.as_slice(), self.data.as_slice());
        [
            (self.text_start(), text, text.len(), ro),
            (self.data_start(), data, data.len(), rw),
            (self.bss_start(), &[][..], self.bss, rw),
            (self.stack_bottom(), &[][..], PAGE_SIZE, rw),
        ]
    }
}

impl Kernel {
    /// Creates an environment running `image`, left not runnable.
    ///
    /// # Errors
    /// [`KernelError::NoFreeEnv`] or [`KernelError::NoMemory`]; nothing is
    /// left behind.
    pub fn load(&mut self, image: &ProgramImage) -> Result<Envid, KernelError> {
        let id = self.envs.alloc(&mut self.mem, Envid(0))?;
        if let Err(e) = self.load_segments(id, image) {
            self.destroy_env(id, Envid(0));
            return Err(e);
        }
        Ok(id)
    }

    fn load_segments(&mut self, id: Envid, image: &ProgramImage) -> Result<(), KernelError> {
        let pgdir = self.envs.get(id).ok_or(KernelError::BadEnv)?.pgdir;
        for (start, contents, len, perm) in image.segments() {
            for offset in (0..len).step_by(PAGE_SIZE) {
                let va = start + offset;
                let pa = self.mem.alloc(FrameUse::Page(id, va))?;
                if let Some(chunk) = contents.get(offset..) {
                    let n = chunk.len().min(PAGE_SIZE);
                    self.mem.page_mut(pa)[..n].copy_from_slice(&chunk[..n]);
                }
                if let Err(e) = pgdir.insert(&mut self.mem, pa, va, perm) {
                    self.mem.free(pa);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let image = ProgramImage::new("empty");
        assert_eq!(image.data_start(), UTEXT);
        assert_eq!(image.bss_start(), UTEXT);

        let image = ProgramImage::new("big")
            .text(&[0; PAGE_SIZE + 1])
            .data(&[1; 3]);
        assert_eq!(image.data_start(), UTEXT + 2 * PAGE_SIZE);
        assert_eq!(image.bss_start(), UTEXT + 3 * PAGE_SIZE);
    }

    #[test]
    fn load_maps_every_segment() {
        abyss::QUITE.store(true, core::sync::atomic::Ordering::SeqCst);
        let mut kernel = Kernel::new(64);
        let image = ProgramImage::new("hello")
            .text(b"text")
            .data(b"data")
            .bss(PAGE_SIZE + 1);
        let id = kernel.load(&image).unwrap();
        let pgdir = kernel.envs.get(id).unwrap().pgdir;
        // text, data, two bss pages and the stack.
        assert_eq!(pgdir.mapped_pages(&kernel.mem), 5);
        assert_eq!(
            pgdir.pte(&kernel.mem, UTEXT).flags(),
            PteFlags::P | PteFlags::U
        );
        let mut buf = [0; 4];
        let data = image.data_start();
        kernel.copy_from_user(id, data, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        let bss = image.bss_start() + PAGE_SIZE;
        kernel.copy_to_user(id, bss, b"z").unwrap();
        kernel.copy_to_user(id, USTACKTOP - 4, b"top!").unwrap();
    }

    #[test]
    fn failed_load_leaves_nothing() {
        abyss::QUITE.store(true, core::sync::atomic::Ordering::SeqCst);
        let mut kernel = Kernel::new(5);
        let image = ProgramImage::new("huge").bss(16 * PAGE_SIZE);
        assert_eq!(kernel.load(&image), Err(KernelError::NoMemory));
        assert_eq!(kernel.mem.in_use(), 0);
        assert!(kernel.envs.is_empty());
    }
}
