//! Page fault records delivered to user environments.
//!
//! When a user environment faults and has registered a page fault upcall,
//! the kernel does not handle the fault itself. Instead it pushes a
//! [`UTrapframe`] onto the environment's exception stack (the page just below
//! `UXSTACKTOP`) and resumes the environment at its upcall entry. The layout
//! of the record, from the lowest address up, is:
//!
//! ```text
//!                     <-- UXSTACKTOP
//! trap-time esp
//! trap-time eflags
//! trap-time eip
//! trap-time eax       start of struct PushRegs
//! trap-time ecx
//! trap-time edx
//! trap-time ebx
//! trap-time esp
//! trap-time ebp
//! trap-time esi
//! trap-time edi       end of struct PushRegs
//! tf_err (error code)
//! fault_va            <-- %esp when the handler is run
//! ```

bitflags::bitflags! {
    /// Page fault error code pushed by the processor.
    pub struct PFErrorCode: u32 {
        /// The fault was caused by a page-level protection violation.
        ///
        /// If clear, the fault was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access causing the fault originated in user mode.
        const USER = 1 << 2;
    }
}

/// General purpose registers, in the order `pushal` stores them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored by `popal`.
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Fault record pushed on the user exception stack.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: u32,
    /// Raw error code; see [`UTrapframe::err`].
    pub err: u32,
    /// Trap-time general purpose registers.
    pub regs: PushRegs,
    /// Trap-time instruction pointer.
    pub eip: u32,
    /// Trap-time flags register.
    pub eflags: u32,
    /// Trap-time stack pointer.
    pub esp: u32,
}

impl UTrapframe {
    /// Size of the record on the exception stack, in bytes.
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Number of 32-bit words in the record.
    const WORDS: usize = Self::SIZE / 4;

    /// The faulting address.
    #[inline]
    pub const fn fault_va(&self) -> crate::addressing::Va {
        crate::addressing::Va::from_u32(self.fault_va)
    }

    /// The decoded error code.
    #[inline]
    pub const fn err(&self) -> PFErrorCode {
        PFErrorCode::from_bits_truncate(self.err)
    }

    fn words(&self) -> [u32; Self::WORDS] {
        let r = &self.regs;
        [
            self.fault_va,
            self.err,
            r.edi,
            r.esi,
            r.ebp,
            r.oesp,
            r.ebx,
            r.edx,
            r.ecx,
            r.eax,
            self.eip,
            self.eflags,
            self.esp,
        ]
    }

    /// Serializes the record the way it sits on the exception stack.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Reads a record back from exception stack bytes.
    ///
    /// # Returns
    /// - `None` if `bytes` is shorter than [`UTrapframe::SIZE`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::SIZE)?;
        let mut w = [0u32; Self::WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self {
            fault_va: w[0],
            err: w[1],
            regs: PushRegs {
                edi: w[2],
                esi: w[3],
                ebp: w[4],
                oesp: w[5],
                ebx: w[6],
                edx: w[7],
                ecx: w[8],
                eax: w[9],
            },
            eip: w[10],
            eflags: w[11],
            esp: w[12],
        })
    }
}
