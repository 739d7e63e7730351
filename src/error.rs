//! Error taxonomy shared by every driver in the subsystem.
//!
//! Driver `init` paths propagate these with `?`. The `read`/`write` data
//! plane never does: it reports progress as a byte count and returns short
//! (possibly zero) on failure.

/// Subsystem-wide error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller-supplied null/empty/out-of-range argument.
    BadArgument,
    /// Allocation failure (host heap or DMA window).
    OutOfMemory,
    /// No matching driver code, VFS node, or resource.
    NoSuchResource,
    /// Queue-pair id not present on the controller.
    NoSuchQueue,
    /// Controller has no free I/O queue ids left.
    OutOfIds,
    /// Capability or command-set mismatch during controller bring-up.
    ControllerUnsupported,
    /// Non-zero 15-bit status field from an NVMe completion.
    CommandStatus(u16),
    /// Superblock signature mismatch: the partition is not ext2.
    NotExt2,
    /// Required or write feature bit this implementation does not support.
    FilesystemUnsupported,
    /// A downstream read/write moved fewer bytes than requested.
    ShortCount,
    /// Write attempted on a read-only resource.
    ReadOnly,
}

impl Error {
    /// POSIX-style negative code, for hosts that speak errno.
    pub fn to_errno(self) -> i32 {
        match self {
            Error::BadArgument => -22,             // EINVAL
            Error::OutOfMemory => -12,             // ENOMEM
            Error::NoSuchResource => -19,          // ENODEV
            Error::NoSuchQueue => -19,             // ENODEV
            Error::OutOfIds => -16,                // EBUSY
            Error::ControllerUnsupported => -95,   // ENOTSUP
            Error::CommandStatus(_) => -5,         // EIO
            Error::NotExt2 => -22,                 // EINVAL
            Error::FilesystemUnsupported => -95,   // ENOTSUP
            Error::ShortCount => -5,               // EIO
            Error::ReadOnly => -30,                // EROFS
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
