//! Kernel-wide error type.
//!
//! Every fallible kernel path reports one of these kinds and propagates it
//! with `?`. Syscall wrappers flatten any kind into a `-1` return; the kinds
//! exist so subsystems can react differently (e.g. a pipe read retries on
//! `WaitForIo` but aborts on `ProcIsKilled`) and so panics are reserved for
//! broken invariants rather than ordinary failures.

use core::fmt;

pub type Result<T> = core::result::Result<T, KernelError>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// Physical page allocator exhausted.
    OutOfMemory,
    /// Data-block bitmap exhausted.
    OutOfBlocks,
    /// No free slot in a fixed-size table (files, inodes, processes).
    OutOfSlots,

    /// Virtual address at or above the usable user range.
    VaOutOfRange,
    /// Page walk found no valid leaf.
    PteNotPresent,
    /// Leaf is not user-accessible.
    PteNotUser,
    /// Leaf lacks the W bit.
    PteNotWritable,
    /// `copy_in_str` ran out of buffer before a NUL byte.
    NotNullTerminated,

    /// Bad or unopened file descriptor.
    BadFd,
    /// Operation not permitted for the open mode or file type.
    PermissionDenied,
    /// Path lookup failed.
    LookupFailed,
    /// `dirlink` found the name already present.
    DirNamePresent,
    /// Unlink of `.`, `..`, or a non-empty directory.
    DirNotEmpty,
    /// chdir target is not a directory.
    NotADirectory,

    /// Mapping a file block failed while copying.
    BMapFailed,
    /// Inode write starts past the end of the file.
    OffsetTooLarge,
    /// Inode write would exceed the maximum file size.
    LenTooLarge,

    /// ELF magic or program headers rejected, or the argv build overflowed
    /// the user stack.
    ExecFailed,

    /// `wait` with no children.
    NoChildAvailable,
    /// No process with the requested pid.
    PidNotFound,

    /// The far end of the pipe is closed.
    NotOpened,
    /// The current process was killed while blocked.
    ProcIsKilled,

    /// Syscall argument out of range.
    BadArg,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_compare_by_kind() {
        assert_eq!(KernelError::OutOfMemory, KernelError::OutOfMemory);
        assert_ne!(KernelError::OutOfMemory, KernelError::OutOfBlocks);
    }
}
