use zerocopy::{AsBytes, FromBytes};

/// Metadata returned by the fstat system call. User programs share this
/// layout.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct Stat {
    /// Device number of the file system.
    pub dev: i32,

    /// Inode number.
    pub ino: u32,

    /// Type of file: 0 none, 1 directory, 2 file, 3 device.
    pub typ: i16,

    /// Number of links to the file.
    pub nlink: i16,

    pub _padding: u32,

    /// Size of the file in bytes.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_has_no_implicit_padding() {
        assert_eq!(core::mem::size_of::<Stat>(), 24);
    }
}
