use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::Buf;
use crate::fs::Dinode;
use crate::param::BSIZE;

const FSMAGIC: u32 = 0x10203040;

/// Disk layout:
/// [ boot block | super block | log | inode blocks | free bit map
///                                                 | data blocks ]
///
/// mkfs computes the super block and builds an initial file system. The
/// super block describes the disk layout.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct Superblock {
    /// Must be FSMAGIC.
    magic: u32,

    /// Size of file system image (blocks).
    pub size: u32,

    /// Number of data blocks.
    pub nblocks: u32,

    /// Number of inodes.
    pub ninodes: u32,

    /// Number of log blocks.
    pub nlog: u32,

    /// Block number of first log block.
    pub logstart: u32,

    /// Block number of first inode block.
    pub inodestart: u32,

    /// Block number of first free map block.
    pub bmapstart: u32,
}

/// Inodes per block.
pub const IPB: usize = BSIZE / core::mem::size_of::<Dinode>();

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl Superblock {
    /// Read the super block from its buffer.
    pub fn new(buf: &Buf) -> Self {
        let (sb, _) = LayoutVerified::<&[u8], Superblock>::new_from_prefix(&buf.data()[..])
            .expect("Superblock::new");
        let result = *sb;
        assert_eq!(result.magic, FSMAGIC, "invalid file system");
        result
    }

    /// Block containing inode i.
    pub const fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    /// Block of the free map containing the bit for block b.
    pub const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sb() -> Superblock {
        Superblock {
            magic: FSMAGIC,
            size: 2000,
            nblocks: 1900,
            ninodes: 200,
            nlog: 30,
            logstart: 2,
            inodestart: 33,
            bmapstart: 46,
        }
    }

    #[test]
    fn sixteen_inodes_fit_in_a_block() {
        assert_eq!(core::mem::size_of::<Dinode>(), 64);
        assert_eq!(IPB, 16);
    }

    #[test]
    fn inode_blocks_follow_inodestart() {
        let sb = sb();
        assert_eq!(sb.iblock(0), 33);
        assert_eq!(sb.iblock(15), 33);
        assert_eq!(sb.iblock(16), 34);
    }

    #[test]
    fn bitmap_blocks_follow_bmapstart() {
        let sb = sb();
        assert_eq!(sb.bblock(0), 46);
        assert_eq!(sb.bblock(BPB - 1), 46);
        assert_eq!(sb.bblock(BPB), 47);
    }
}
