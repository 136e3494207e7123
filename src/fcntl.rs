use bitflags::bitflags;

bitflags! {
    /// Open-mode flags, combined by bitwise or. User programs share these
    /// values.
    pub struct FcntlFlags: i32 {
        const O_RDONLY = 0x000;
        const O_WRONLY = 0x001;
        const O_RDWR = 0x002;
        const O_CREATE = 0x200;
        const O_TRUNC = 0x400;
    }
}

impl FcntlFlags {
    /// Does the mode permit reading?
    pub fn readable(self) -> bool {
        !self.intersects(FcntlFlags::O_WRONLY)
    }

    /// Does the mode permit writing?
    pub fn writable(self) -> bool {
        self.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_is_the_absence_of_write_bits() {
        let m = FcntlFlags::O_RDONLY;
        assert!(m.readable());
        assert!(!m.writable());
    }

    #[test]
    fn write_only_forbids_reading() {
        let m = FcntlFlags::O_WRONLY;
        assert!(!m.readable());
        assert!(m.writable());
    }

    #[test]
    fn read_write_allows_both() {
        let m = FcntlFlags::O_RDWR;
        assert!(m.readable());
        assert!(m.writable());
    }

    #[test]
    fn create_and_truncate_compose_with_modes() {
        let m = FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY;
        assert!(m.contains(FcntlFlags::O_CREATE));
        assert!(m.writable());
        let m = FcntlFlags::from_bits_truncate(0x400 | 0x2);
        assert!(m.contains(FcntlFlags::O_TRUNC));
        assert!(m.readable() && m.writable());
    }
}
