//! ext2 file and directory drivers.
//!
//! Both are thin handles over the traversal engine: a file reads and
//! writes its inode's data range, a directory resolves and lists names.
//! Handles are created from the locate arguments the super (or a parent
//! directory) produced and keep the super state alive through an `Arc`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::{self, File};

use super::superblock::{LocateArgs, SuperState};
use super::{get_inode_in_dir, walk, BasicState};

pub struct NodeState {
    pub super_state: Arc<SuperState>,
    pub basic: BasicState,
}

fn init_node(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let args = args.downcast_ref::<LocateArgs>().ok_or(Error::BadArgument)?;
    let super_state = args.super_state.clone();

    // Every handle opens the partition independently so its cursor is its
    // own.
    let partition = vfs::open(&super_state.partition_path, 0)?;

    let basic = BasicState::new(
        partition,
        args.node.clone(),
        args.inode,
        super_state.basic.block_size,
    );
    basic.attributes.store(
        super_state.basic.attributes.load(Ordering::Relaxed),
        Ordering::Relaxed,
    );

    res.set_state(Box::new(NodeState {
        super_state,
        basic,
    }));
    Ok(())
}

fn uninit_node(_res: &Resource) -> Result<()> {
    Ok(())
}

// =============================================================================
// File driver
// =============================================================================

fn read_file(buffer: &mut [u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<NodeState>() else {
        return 0;
    };

    let size = state.basic.node.lock().size_low as u64;
    let offset = file.offset.max(0) as u64;
    if offset >= size {
        return 0;
    }
    let len = buffer.len().min((size - offset) as usize);

    walk::read_inode_data(&state.basic, &mut buffer[..len], offset)
}

fn write_file(buffer: &[u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<NodeState>() else {
        return 0;
    };

    walk::write_inode_data(state, buffer, file.offset.max(0) as u64)
}

fn stat_file(res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res.state::<NodeState>().ok_or(Error::BadArgument)?;
    let node = state.basic.node.lock();

    stat.st_mode = node.type_perms as u32;
    stat.st_size = node.size_low as u64;
    stat.st_ino = state.basic.inode as u64;
    stat.st_nlink = node.hard_link_count as u32;
    stat.st_uid = node.uid;
    stat.st_gid = node.gid;
    stat.st_mtime = node.last_mod as u64;
    stat.st_blksize = state.basic.block_size as u64;
    stat.st_blocks = node.sectors_used as u64;
    Ok(())
}

pub static EXT2_FILE_DRIVER: DriverDef = DriverDef {
    init: init_node,
    uninit: uninit_node,
    read: read_file,
    write: write_file,
    stat: stat_file,
    ..DriverDef::empty("ext2_file")
};

// =============================================================================
// Directory driver
// =============================================================================

fn stat_directory(res: &Resource, name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res.state::<NodeState>().ok_or(Error::BadArgument)?;

    let Some(name) = name else {
        let node = state.basic.node.lock();
        stat.st_mode = node.type_perms as u32;
        stat.st_ino = state.basic.inode as u64;
        return Ok(());
    };

    let inode_number = get_inode_in_dir(&state.basic, name);
    if inode_number == 0 {
        return Err(Error::NoSuchResource);
    }
    let inode = state.super_state.read_inode(inode_number)?;
    stat.st_mode = inode.type_perms as u32;
    stat.st_size = inode.size_low as u64;
    stat.st_ino = inode_number as u64;
    Ok(())
}

fn locate_directory(res: &Resource, name: &str) -> Option<Box<dyn Any + Send>> {
    let state = res.state::<NodeState>()?;

    let inode = get_inode_in_dir(&state.basic, name);
    if inode == 0 {
        return None;
    }
    let node = state.super_state.read_inode(inode).ok()?;
    Some(Box::new(LocateArgs {
        super_state: state.super_state.clone(),
        node,
        inode,
    }))
}

pub static EXT2_DIR_DRIVER: DriverDef = DriverDef {
    init: init_node,
    uninit: uninit_node,
    stat: stat_directory,
    locate: locate_directory,
    ..DriverDef::empty("ext2_dir")
};
