//! Errors returned by the kernel.

/// Represents the errors the exokernel reports to user environments.
///
/// A system call that fails returns the negated error code in `%eax`; this
/// enum is the typed view of those codes. The variants and their numbering
/// follow the kernel's ABI, so they must not be reordered.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Unspecified or unknown problem. (E_UNSPECIFIED)
    Unspecified,
    /// Environment doesn't exist or otherwise cannot be used in the requested
    /// action. (E_BAD_ENV)
    BadEnv,
    /// Invalid parameter. (E_INVAL)
    InvalidArgument,
    /// Request failed due to memory shortage. (E_NO_MEM)
    NoMemory,
    /// Attempt to create a new environment beyond the maximum allowed.
    /// (E_NO_FREE_ENV)
    NoFreeEnv,
    /// Memory fault. (E_FAULT)
    Fault,
}

impl KernelError {
    /// Converts the [`KernelError`] into the negative code carried in the
    /// return register of a system call.
    pub const fn into_i32(self) -> i32 {
        match self {
            KernelError::Unspecified => -1,
            KernelError::BadEnv => -2,
            KernelError::InvalidArgument => -3,
            KernelError::NoMemory => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::Fault => -6,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            KernelError::Unspecified => "unspecified error",
            KernelError::BadEnv => "bad environment",
            KernelError::InvalidArgument => "invalid parameter",
            KernelError::NoMemory => "out of memory",
            KernelError::NoFreeEnv => "out of environments",
            KernelError::Fault => "segmentation fault",
        })
    }
}

/// The given `i32` does not indicate a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: i32,
}

impl TryFrom<i32> for KernelError {
    type Error = TryFromError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Unspecified),
            -2 => Ok(Self::BadEnv),
            -3 => Ok(Self::InvalidArgument),
            -4 => Ok(Self::NoMemory),
            -5 => Ok(Self::NoFreeEnv),
            -6 => Ok(Self::Fault),
            e => Err(TryFromError { e }),
        }
    }
}

/// Splits a raw system call return value into success and failure.
///
/// Non-negative values are passed through. Negative values that the kernel
/// does not define are reported as [`KernelError::Unspecified`].
pub fn check(ret: i32) -> Result<u32, KernelError> {
    if ret >= 0 {
        Ok(ret as u32)
    } else {
        let error = KernelError::try_from(ret).unwrap_or(KernelError::Unspecified);
        Err(error)
    }
}
