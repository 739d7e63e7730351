//! ext2 superblock driver.
//!
//! Mount-time validation, the block-group descriptor table, inode table
//! IO, and block allocation. File and directory handles keep an `Arc` back
//! to the [`SuperState`] built here; `locate` hands the VFS a heap-owned
//! `(super, inode copy, inode number)` tuple that seeds the next handle's
//! init.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::{self, Whence};

use super::{
    get_inode_in_dir, BasicState, GroupDesc, Inode, RequiredFeatures, SuperBlock, WriteFeatures,
    ATTR_64BIT_SIZES, ATTR_WRITE, EXT2_SIGNATURE, GROUP_DESC_SIZE, ROOT_INODE, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};

// Control channel layout, trailing bytes first: `.. CMD_ATTRS CMD_SET`.
pub const CNTRL_CMDSET_DRIVER: u8 = 0;
pub const CNTRL_ATTR_DELETE: u8 = 1 << 0;

/// Result of `locate`: everything the file/directory driver needs to
/// initialize a handle.
pub struct LocateArgs {
    pub super_state: Arc<SuperState>,
    pub node: Inode,
    pub inode: u32,
}

pub struct SuperState {
    pub partition_path: String,
    pub basic: BasicState,
    pub sb: SuperBlock,
    pub inode_size: usize,
    descriptors: Mutex<Vec<GroupDesc>>,
}

impl SuperState {
    pub fn descriptor(&self, group: usize) -> Option<GroupDesc> {
        self.descriptors.lock().get(group).copied()
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors.lock().len()
    }

    fn inode_location(&self, inode: u32) -> Result<i64> {
        if inode == 0 {
            return Err(Error::BadArgument);
        }
        let group = ((inode - 1) / self.sb.inodes_per_group) as usize;
        let index = ((inode - 1) % self.sb.inodes_per_group) as u64;
        let desc = self.descriptor(group).ok_or(Error::BadArgument)?;
        let table = desc.inode_table_start as u64 * self.basic.block_size as u64;
        Ok((table + self.inode_size as u64 * index) as i64)
    }

    /// Read one inode record out of its group's table.
    pub fn read_inode(&self, inode: u32) -> Result<Inode> {
        let location = self.inode_location(inode)?;
        let mut raw = vec![0u8; self.inode_size];

        let mut part = self.basic.partition.lock();
        vfs::seek(&mut part, location, Whence::Set)?;
        if vfs::read(&mut raw, &mut part) != raw.len() {
            return Err(Error::ShortCount);
        }
        Inode::parse(&raw)
    }

    /// Write an inode record back, preserving any extended bytes past the
    /// classic 128.
    pub fn write_inode(&self, inode: u32, node: &Inode) -> Result<()> {
        let location = self.inode_location(inode)?;
        let mut raw = vec![0u8; self.inode_size];

        let mut part = self.basic.partition.lock();
        vfs::seek(&mut part, location, Whence::Set)?;
        if vfs::read(&mut raw, &mut part) != raw.len() {
            return Err(Error::ShortCount);
        }
        node.encode(&mut raw);
        vfs::seek(&mut part, location, Whence::Set)?;
        if vfs::write(&raw, &mut part) != raw.len() {
            return Err(Error::ShortCount);
        }
        Ok(())
    }

    /// Allocate `count` data blocks near `inode`'s group. Returns packed
    /// `block | (run_length << 32)` entries describing the allocated runs,
    /// after marking the bits in the group's block-usage bitmap on disk.
    pub fn allocate_blocks(&self, inode: u32, count: u32) -> Option<Vec<u64>> {
        if inode == 0 || count == 0 {
            return None;
        }

        let mut descriptors = self.descriptors.lock();
        let group_count = descriptors.len();
        let home_group = ((inode - 1) / self.sb.inodes_per_group) as usize;

        // First group at or after the inode's own with enough free blocks.
        let use_group = (0..group_count)
            .map(|i| (home_group + i) % group_count)
            .find(|&g| descriptors[g].unallocated_blocks as u32 >= count)?;
        let desc = descriptors[use_group];

        let block_size = self.basic.block_size;
        let mut bitmap = vec![0u8; block_size];
        let bitmap_pos = desc.usage_bmp_block as i64 * block_size as i64;

        let mut part = self.basic.partition.lock();
        vfs::seek(&mut part, bitmap_pos, Whence::Set).ok()?;
        if vfs::read(&mut bitmap, &mut part) != block_size {
            return None;
        }

        // Data blocks start past the inode table.
        let base_block = desc.inode_table_start as u64
            + ((block_size as u64 * 8 * self.inode_size as u64) + block_size as u64 - 1)
                / block_size as u64;

        let mut remaining = count;
        let mut runs: Vec<u64> = Vec::new();
        let words = block_size / 8;

        for word_idx in 0..words {
            if remaining == 0 {
                break;
            }
            let off = word_idx * 8;
            let mut word = u64::from_le_bytes(bitmap[off..off + 8].try_into().unwrap());
            let range_start = base_block + (word_idx as u64) * 64;

            if word == 0 {
                let take = remaining.min(64);
                word = if take == 64 { u64::MAX } else { (1u64 << take) - 1 };
                runs.push(range_start | ((take as u64) << 32));
                remaining -= take;
            } else if word != u64::MAX {
                while remaining > 0 && word != u64::MAX {
                    let bit = (!word).trailing_zeros() as u64;
                    word |= 1u64 << bit;
                    runs.push((range_start + bit) | (1u64 << 32));
                    remaining -= 1;
                }
            }

            bitmap[off..off + 8].copy_from_slice(&word.to_le_bytes());
        }

        if runs.is_empty() {
            return None;
        }

        vfs::seek(&mut part, bitmap_pos, Whence::Set).ok()?;
        if vfs::write(&bitmap, &mut part) != block_size {
            return None;
        }

        let taken = (count - remaining) as u16;
        descriptors[use_group].unallocated_blocks =
            desc.unallocated_blocks.saturating_sub(taken);

        Some(runs)
    }

    /// Single-block allocation used by the traversal's hole callback.
    pub fn allocate_one(&self, inode: u32) -> Option<u32> {
        let runs = self.allocate_blocks(inode, 1)?;
        Some((runs[0] & 0xFFFF_FFFF) as u32)
    }
}

/// Driver state attached to the super resource.
pub struct SuperDriverState {
    pub state: Arc<SuperState>,
}

fn check_super(sb: &SuperBlock, basic: &BasicState) -> Result<()> {
    if sb.state != 1 {
        kwarn!(
            "ext2: filesystem has errors, {}",
            if sb.err_handle == 2 {
                "remounting read-only"
            } else {
                "ignoring"
            }
        );
        if sb.err_handle == 2 {
            basic.set_attr(ATTR_WRITE, false);
        }
        if sb.err_handle == 3 {
            kerror!("ext2: filesystem has errors and the error policy is to fail");
            return Err(Error::FilesystemUnsupported);
        }
    }

    let required = sb.required();
    if required.contains(RequiredFeatures::COMPRESSION) {
        kerror!("ext2: compressed filesystems are not supported");
        return Err(Error::FilesystemUnsupported);
    }
    if required.contains(RequiredFeatures::DIRENT_TYPE) {
        kdebug!("ext2: directory entries carry a type field");
    }
    if required.contains(RequiredFeatures::JOURNAL_REPLAY) {
        kerror!("ext2: journal replay is not supported");
        return Err(Error::FilesystemUnsupported);
    }
    if required.contains(RequiredFeatures::JOURNAL_DEVICE) {
        kerror!("ext2: journal devices are not supported");
        return Err(Error::FilesystemUnsupported);
    }

    let write = sb.write_required();
    if write.contains(WriteFeatures::SPARSE_SUPER) {
        kwarn!("ext2: sparse superblocks not supported, disabling write");
        basic.set_attr(ATTR_WRITE, false);
    }
    if write.contains(WriteFeatures::LARGE_FILE) {
        basic.set_attr(ATTR_64BIT_SIZES, true);
    }
    if write.contains(WriteFeatures::DIR_BTREE) {
        kwarn!("ext2: btree directories not supported, disabling write");
        basic.set_attr(ATTR_WRITE, false);
    }

    Ok(())
}

fn init_ext2_super(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let path = args.downcast_ref::<String>().ok_or(Error::BadArgument)?;

    let mut partition = vfs::open(path, 0)?;

    let mut raw = vec![0u8; SUPERBLOCK_SIZE];
    vfs::seek(&mut partition, SUPERBLOCK_OFFSET as i64, Whence::Set)?;
    if vfs::read(&mut raw, &mut partition) != raw.len() {
        return Err(Error::ShortCount);
    }

    let sb = SuperBlock::parse(&raw)?;
    if sb.sig != EXT2_SIGNATURE {
        kerror!("ext2: signature mismatch on {}", path);
        return Err(Error::NotExt2);
    }

    let block_size = sb.block_size();
    let basic = BasicState::new(partition, Inode::default(), ROOT_INODE, block_size);
    // Writable until the feature checks say otherwise.
    basic.set_attr(ATTR_WRITE, true);
    check_super(&sb, &basic)?;

    let a = (sb.total_blocks as u64 + sb.blocks_per_group as u64 - 1) / sb.blocks_per_group as u64;
    let b = (sb.total_inodes as u64 + sb.inodes_per_group as u64 - 1) / sb.inodes_per_group as u64;
    let block_groups = a.min(b) as usize;

    let mut table_raw = vec![0u8; block_groups * GROUP_DESC_SIZE];
    {
        let mut part = basic.partition.lock();
        vfs::seek(
            &mut part,
            (sb.superblock as i64 + 1) * block_size as i64,
            Whence::Set,
        )?;
        if vfs::read(&mut table_raw, &mut part) != table_raw.len() {
            kerror!("ext2: failed to read the descriptor table");
            return Err(Error::ShortCount);
        }
    }
    let descriptors: Vec<GroupDesc> = (0..block_groups)
        .map(|i| GroupDesc::parse(&table_raw[i * GROUP_DESC_SIZE..]))
        .collect();

    let inode_size = sb.inode_record_size();
    let state = Arc::new(SuperState {
        partition_path: path.clone(),
        basic,
        sb,
        inode_size,
        descriptors: Mutex::new(descriptors),
    });

    let root = state.read_inode(ROOT_INODE)?;
    *state.basic.node.lock() = root;

    kinfo!(
        "ext2: mounted {} ({} byte blocks, {} groups)",
        path,
        block_size,
        block_groups
    );

    res.set_state(Box::new(SuperDriverState { state }));
    Ok(())
}

fn uninit_ext2_super(_res: &Resource) -> Result<()> {
    Ok(())
}

fn stat_ext2_super(res: &Resource, name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = &res
        .state::<SuperDriverState>()
        .ok_or(Error::BadArgument)?
        .state;

    let Some(name) = name else {
        let root = state.basic.node.lock();
        stat.st_mode = root.type_perms as u32;
        stat.st_blksize = state.basic.block_size as u64;
        stat.st_ino = ROOT_INODE as u64;
        return Ok(());
    };

    let inode_number = get_inode_in_dir(&state.basic, name);
    if inode_number == 0 {
        return Err(Error::NoSuchResource);
    }
    let inode = state.read_inode(inode_number)?;
    stat.st_mode = inode.type_perms as u32;
    stat.st_size = inode.size_low as u64;
    stat.st_ino = inode_number as u64;
    Ok(())
}

fn locate_ext2_super(res: &Resource, name: &str) -> Option<Box<dyn Any + Send>> {
    let state = &res.state::<SuperDriverState>()?.state;

    let inode = get_inode_in_dir(&state.basic, name);
    if inode == 0 {
        return None;
    }
    let node = state.read_inode(inode).ok()?;
    Some(Box::new(LocateArgs {
        super_state: state.clone(),
        node,
        inode,
    }))
}

/// Free-form command channel. The command buffer carries its selector in
/// the trailing bytes: `.. CMD_ATTRS CMD_SET`. Command set 0 is
/// driver-specific: attrs bit 0 clear allocates `(attrs >> 1) + 1` blocks
/// for the inode in the leading four bytes, set deletes the inode.
fn control_ext2_super(res: &Resource, command: &[u8]) -> Option<Box<dyn Any + Send>> {
    if command.len() < 6 {
        return None;
    }
    let state = &res.state::<SuperDriverState>()?.state;

    let cmd_set = command[command.len() - 1];
    let cmd_attrs = command[command.len() - 2];

    match cmd_set {
        CNTRL_CMDSET_DRIVER => {
            let inode = u32::from_le_bytes(command[0..4].try_into().ok()?);
            let count = (cmd_attrs >> 1) as u32 + 1;

            if cmd_attrs & CNTRL_ATTR_DELETE == 0 {
                let runs = state.allocate_blocks(inode, count)?;
                Some(Box::new(runs))
            } else {
                kerror!("ext2: inode deletion is unimplemented");
                None
            }
        }
        _ => None,
    }
}

pub static EXT2_SUPER_DRIVER: DriverDef = DriverDef {
    init: init_ext2_super,
    uninit: uninit_ext2_super,
    stat: stat_ext2_super,
    locate: locate_ext2_super,
    control: control_ext2_super,
    ..DriverDef::empty("ext2")
};
