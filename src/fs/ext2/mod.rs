//! ext2 on-disk structures.
//!
//! Fixed-offset little-endian parsing of the superblock, block-group
//! descriptors, inodes, and directory entries, plus the shared per-handle
//! state the super/file/directory drivers all carry. The drivers live in
//! [`superblock`] and [`node`]; the block-pointer traversal engine is in
//! [`walk`].

pub mod node;
pub mod superblock;
pub mod walk;

use alloc::vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::vfs;

pub const EXT2_SIGNATURE: u16 = 0xEF53;
pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const GROUP_DESC_SIZE: usize = 32;
pub const ROOT_INODE: u32 = 2;
pub const DIRECT_POINTERS: usize = 12;

// File type bits of `type_perms`.
pub const TYPE_MASK: u16 = 0xF000;
pub const TYPE_DIRECTORY: u16 = 0x4000;
pub const TYPE_REGULAR: u16 = 0x8000;

// Handle attribute bits.
pub const ATTR_CACHE: u64 = 1 << 0;
pub const ATTR_WRITE: u64 = 1 << 1;
pub const ATTR_64BIT_SIZES: u64 = 1 << 2;

bitflags! {
    /// Features the implementation must understand to mount at all.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RequiredFeatures: u32 {
        const COMPRESSION = 1 << 0;
        const DIRENT_TYPE = 1 << 1;
        const JOURNAL_REPLAY = 1 << 2;
        const JOURNAL_DEVICE = 1 << 3;
    }
}

bitflags! {
    /// Features required only to write.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WriteFeatures: u32 {
        const SPARSE_SUPER = 1 << 0;
        const LARGE_FILE = 1 << 1;
        const DIR_BTREE = 1 << 2;
    }
}

fn le16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn le32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

// =============================================================================
// Superblock
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct SuperBlock {
    pub total_inodes: u32,
    pub total_blocks: u32,
    pub total_resv_blocks: u32,
    pub total_unallocated_blocks: u32,
    pub total_unallocated_inodes: u32,
    /// Block number containing the superblock.
    pub superblock: u32,
    pub log2_block_size: u32,
    pub log2_frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    pub last_mount: u32,
    pub last_written: u32,
    pub mount_count: u16,
    pub mounts_per_check: u16,
    pub sig: u16,
    pub state: u16,
    pub err_handle: u16,
    pub ver_min: u16,
    pub last_check: u32,
    pub interval_forced_check: u32,
    pub os_id: u32,
    pub ver_maj: u32,
    pub uid_superuser: u16,
    pub gid_superuser: u16,
    pub first_non_resv_inode: u32,
    pub inode_size: u16,
    pub superblock_group: u16,
    pub opt_features: u32,
    pub required_features: u32,
    pub write_features: u32,
}

impl SuperBlock {
    pub fn parse(raw: &[u8]) -> Result<SuperBlock> {
        if raw.len() < 104 {
            return Err(Error::BadArgument);
        }
        Ok(SuperBlock {
            total_inodes: le32(raw, 0),
            total_blocks: le32(raw, 4),
            total_resv_blocks: le32(raw, 8),
            total_unallocated_blocks: le32(raw, 12),
            total_unallocated_inodes: le32(raw, 16),
            superblock: le32(raw, 20),
            log2_block_size: le32(raw, 24),
            log2_frag_size: le32(raw, 28),
            blocks_per_group: le32(raw, 32),
            frags_per_group: le32(raw, 36),
            inodes_per_group: le32(raw, 40),
            last_mount: le32(raw, 44),
            last_written: le32(raw, 48),
            mount_count: le16(raw, 52),
            mounts_per_check: le16(raw, 54),
            sig: le16(raw, 56),
            state: le16(raw, 58),
            err_handle: le16(raw, 60),
            ver_min: le16(raw, 62),
            last_check: le32(raw, 64),
            interval_forced_check: le32(raw, 68),
            os_id: le32(raw, 72),
            ver_maj: le32(raw, 76),
            uid_superuser: le16(raw, 80),
            gid_superuser: le16(raw, 82),
            first_non_resv_inode: le32(raw, 84),
            inode_size: le16(raw, 88),
            superblock_group: le16(raw, 90),
            opt_features: le32(raw, 92),
            required_features: le32(raw, 96),
            write_features: le32(raw, 100),
        })
    }

    pub fn block_size(&self) -> usize {
        1024usize << self.log2_block_size
    }

    /// Revision-0 filesystems use fixed 128-byte inodes.
    pub fn inode_record_size(&self) -> usize {
        if self.ver_maj >= 1 && self.inode_size != 0 {
            self.inode_size as usize
        } else {
            128
        }
    }

    pub fn required(&self) -> RequiredFeatures {
        RequiredFeatures::from_bits_truncate(self.required_features)
    }

    pub fn write_required(&self) -> WriteFeatures {
        WriteFeatures::from_bits_truncate(self.write_features)
    }
}

// =============================================================================
// Block group descriptors
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct GroupDesc {
    pub usage_bmp_block: u32,
    pub usage_bmp_inode: u32,
    pub inode_table_start: u32,
    pub unallocated_blocks: u16,
    pub unallocated_inodes: u16,
    pub directory_count: u16,
}

impl GroupDesc {
    pub fn parse(raw: &[u8]) -> GroupDesc {
        GroupDesc {
            usage_bmp_block: le32(raw, 0),
            usage_bmp_inode: le32(raw, 4),
            inode_table_start: le32(raw, 8),
            unallocated_blocks: le16(raw, 12),
            unallocated_inodes: le16(raw, 14),
            directory_count: le16(raw, 16),
        }
    }
}

// =============================================================================
// Inodes
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct Inode {
    pub type_perms: u16,
    pub uid: u16,
    pub size_low: u32,
    pub last_access: u32,
    pub creation: u32,
    pub last_mod: u32,
    pub deletion: u32,
    pub gid: u16,
    pub hard_link_count: u16,
    pub sectors_used: u32,
    pub flags: u32,
    pub os_specific0: u32,
    pub dbp: [u32; DIRECT_POINTERS],
    pub sibp: u32,
    pub dibp: u32,
    pub tibp: u32,
    pub gen_number: u32,
    pub ext_acl: u32,
    /// File: upper 32 bits of size. Directory: ACL.
    pub ext_dynamic: u32,
    pub frag_block_addr: u32,
}

impl Inode {
    pub fn parse(raw: &[u8]) -> Result<Inode> {
        if raw.len() < 128 {
            return Err(Error::BadArgument);
        }
        let mut dbp = [0u32; DIRECT_POINTERS];
        for (i, slot) in dbp.iter_mut().enumerate() {
            *slot = le32(raw, 40 + i * 4);
        }
        Ok(Inode {
            type_perms: le16(raw, 0),
            uid: le16(raw, 2),
            size_low: le32(raw, 4),
            last_access: le32(raw, 8),
            creation: le32(raw, 12),
            last_mod: le32(raw, 16),
            deletion: le32(raw, 20),
            gid: le16(raw, 24),
            hard_link_count: le16(raw, 26),
            sectors_used: le32(raw, 28),
            flags: le32(raw, 32),
            os_specific0: le32(raw, 36),
            dbp,
            sibp: le32(raw, 88),
            dibp: le32(raw, 92),
            tibp: le32(raw, 96),
            gen_number: le32(raw, 100),
            ext_acl: le32(raw, 104),
            ext_dynamic: le32(raw, 108),
            frag_block_addr: le32(raw, 112),
        })
    }

    /// Serialize the classic 128-byte record into `out` (which may be a
    /// larger on-disk inode; trailing bytes are left untouched).
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.type_perms.to_le_bytes());
        out[2..4].copy_from_slice(&self.uid.to_le_bytes());
        out[4..8].copy_from_slice(&self.size_low.to_le_bytes());
        out[8..12].copy_from_slice(&self.last_access.to_le_bytes());
        out[12..16].copy_from_slice(&self.creation.to_le_bytes());
        out[16..20].copy_from_slice(&self.last_mod.to_le_bytes());
        out[20..24].copy_from_slice(&self.deletion.to_le_bytes());
        out[24..26].copy_from_slice(&self.gid.to_le_bytes());
        out[26..28].copy_from_slice(&self.hard_link_count.to_le_bytes());
        out[28..32].copy_from_slice(&self.sectors_used.to_le_bytes());
        out[32..36].copy_from_slice(&self.flags.to_le_bytes());
        out[36..40].copy_from_slice(&self.os_specific0.to_le_bytes());
        for (i, ptr) in self.dbp.iter().enumerate() {
            out[40 + i * 4..44 + i * 4].copy_from_slice(&ptr.to_le_bytes());
        }
        out[88..92].copy_from_slice(&self.sibp.to_le_bytes());
        out[92..96].copy_from_slice(&self.dibp.to_le_bytes());
        out[96..100].copy_from_slice(&self.tibp.to_le_bytes());
        out[100..104].copy_from_slice(&self.gen_number.to_le_bytes());
        out[104..108].copy_from_slice(&self.ext_acl.to_le_bytes());
        out[108..112].copy_from_slice(&self.ext_dynamic.to_le_bytes());
        out[112..116].copy_from_slice(&self.frag_block_addr.to_le_bytes());
    }

    pub fn is_directory(&self) -> bool {
        self.type_perms & TYPE_MASK == TYPE_DIRECTORY
    }

    pub fn is_regular(&self) -> bool {
        self.type_perms & TYPE_MASK == TYPE_REGULAR
    }
}

// =============================================================================
// Directory entries
// =============================================================================

/// Borrowed view of one on-disk directory entry.
pub struct DirEnt<'a> {
    pub inode: u32,
    pub total_size: u16,
    pub file_type: u8,
    pub name: &'a [u8],
}

/// Parse the entry at `off`; `None` when the record would not fit or ends
/// the block (`total_size == 0`).
pub fn parse_dirent(block: &[u8], off: usize) -> Option<DirEnt<'_>> {
    if off + 8 > block.len() {
        return None;
    }
    let total_size = le16(block, off + 4);
    if total_size == 0 {
        return None;
    }
    let name_len = block[off + 6] as usize;
    if off + 8 + name_len > block.len() {
        return None;
    }
    Some(DirEnt {
        inode: le32(block, off),
        total_size,
        file_type: block[off + 7],
        name: &block[off + 8..off + 8 + name_len],
    })
}

// =============================================================================
// Shared driver-handle state
// =============================================================================

/// State common to the super, directory, and file handles: an open
/// partition file, an owned copy of the handle's inode, and the handle
/// attributes.
pub struct BasicState {
    pub partition: Mutex<vfs::File>,
    pub node: Mutex<Inode>,
    pub inode: u32,
    pub block_size: usize,
    pub attributes: AtomicU64,
}

impl BasicState {
    pub fn new(partition: vfs::File, node: Inode, inode: u32, block_size: usize) -> BasicState {
        BasicState {
            partition: Mutex::new(partition),
            node: Mutex::new(node),
            inode,
            block_size,
            attributes: AtomicU64::new(0),
        }
    }

    pub fn attr(&self, bit: u64) -> bool {
        self.attributes.load(Ordering::Relaxed) & bit != 0
    }

    pub fn set_attr(&self, bit: u64, on: bool) {
        if on {
            self.attributes.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.attributes.fetch_and(!bit, Ordering::Relaxed);
        }
    }
}

/// Iterate a directory's entries through the block walk; the callback
/// returns `false` to stop early.
pub fn list_directory(basic: &BasicState, cb: &mut dyn FnMut(&DirEnt) -> bool) {
    let block_size = basic.block_size;
    let mut block = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        let delta = walk::read_inode_data(basic, &mut block, offset);
        if delta == 0 {
            return;
        }

        let mut i = 0usize;
        while let Some(ent) = parse_dirent(&block[..delta], i) {
            let skip = ent.total_size as usize;
            if !cb(&ent) {
                return;
            }
            i += skip;
        }

        offset += delta as u64;
    }
}

/// Resolve `name` inside the directory handle; 0 when absent.
pub fn get_inode_in_dir(basic: &BasicState, name: &str) -> u32 {
    let mut found = 0u32;
    list_directory(basic, &mut |ent| {
        if ent.inode != 0 && ent.name == name.as_bytes() {
            found = ent.inode;
            return false;
        }
        true
    });
    found
}
