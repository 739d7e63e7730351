//! Block-pointer traversal.
//!
//! One engine walks an inode's direct and singly/doubly/triply-indirect
//! pointer tree for a byte range, invoking a per-block callback with
//! `(block, bytes_traversed, offset_within_block, want)`. Three scratch
//! blocks cache the indirect tables; each is reloaded only when its index
//! changes, and a scratch that holds unflushed pointer updates is written
//! back before a different table is loaded into it and again at exit.
//! Skipping that flush corrupts the filesystem silently.
//!
//! Holes: with a create callback installed, a zero pointer triggers exactly
//! one allocation per newly touched block and the owning table (scratch or
//! inode) is updated; without one the traversal stops at the hole.

use alloc::vec;
use alloc::vec::Vec;

use super::{BasicState, Inode, DIRECT_POINTERS};
use crate::vfs::{self, File, Whence};

/// Per-block callback: `(partition, block, traversed, jank, want)`,
/// returning the bytes it processed.
pub type VisitFn<'a> = dyn FnMut(&mut File, u32, usize, usize, usize) -> usize + 'a;

/// Hole callback: allocate one block, returning its number.
pub type CreateFn<'a> = dyn FnMut() -> Option<u32> + 'a;

struct Scratch {
    buf: Vec<u8>,
    backing: u32,
    loaded: bool,
    dirty: bool,
}

impl Scratch {
    fn new(block_size: usize) -> Scratch {
        Scratch {
            buf: vec![0u8; block_size],
            backing: 0,
            loaded: false,
            dirty: false,
        }
    }

    fn entry(&self, index: usize) -> u32 {
        let off = index * 4;
        u32::from_le_bytes(self.buf[off..off + 4].try_into().unwrap())
    }

    fn set_entry(&mut self, index: usize, value: u32) {
        let off = index * 4;
        self.buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.dirty = true;
    }

    fn flush(&mut self, part: &mut File) -> bool {
        if !self.dirty || self.backing == 0 {
            self.dirty = false;
            return true;
        }
        let block_size = self.buf.len();
        if vfs::seek(part, self.backing as i64 * block_size as i64, Whence::Set).is_err() {
            return false;
        }
        let ok = vfs::write(&self.buf, part) == block_size;
        self.dirty = false;
        ok
    }

    /// Point the scratch at `block`. A freshly allocated table is
    /// zero-filled and marked dirty instead of read.
    fn load(&mut self, part: &mut File, block: u32, fresh: bool) -> bool {
        let block_size = self.buf.len();
        if fresh {
            self.buf.fill(0);
            self.dirty = true;
        } else {
            if vfs::seek(part, block as i64 * block_size as i64, Whence::Set).is_err() {
                return false;
            }
            if vfs::read(&mut self.buf, part) != block_size {
                return false;
            }
            self.dirty = false;
        }
        self.backing = block;
        self.loaded = true;
        true
    }
}

/// Resolve-or-allocate one scratch entry.
fn scratch_block(
    scratch: &mut Scratch,
    index: usize,
    create: &mut Option<&mut CreateFn<'_>>,
) -> Option<(u32, bool)> {
    let blk = scratch.entry(index);
    if blk != 0 {
        return Some((blk, false));
    }
    let alloc = create.as_mut()?;
    let fresh = alloc()?;
    scratch.set_entry(index, fresh);
    Some((fresh, true))
}

/// Walk `[offset, offset + size)` of `node`, calling `visit` per block.
/// Returns the bytes traversed and whether the inode copy was mutated
/// (pointer roots or size) and needs writing back.
pub fn walk_inode_data(
    part: &mut File,
    node: &mut Inode,
    block_size: usize,
    offset: u64,
    size: usize,
    visit: &mut VisitFn<'_>,
    mut create: Option<&mut CreateFn<'_>>,
) -> (usize, bool) {
    if size == 0 {
        return (0, false);
    }

    let ptr_count = (block_size / 4) as u64;
    let mut node_dirty = false;

    let mut singly = Scratch::new(block_size);
    let mut doubly = Scratch::new(block_size);
    let mut triply = Scratch::new(block_size);
    let mut last_doubly_idx: u64 = 0;
    let mut last_triply_idx: u64 = 0;

    if node.sibp != 0 && !singly.load(part, node.sibp, false) {
        return (0, false);
    }
    if node.dibp != 0 && !doubly.load(part, node.dibp, false) {
        return (0, false);
    }
    if node.tibp != 0 && !triply.load(part, node.tibp, false) {
        return (0, false);
    }

    let mut traversed = 0usize;
    'walk: while traversed < size {
        let pos = offset + traversed as u64;
        let block_idx = pos / block_size as u64;
        let jank = (pos % block_size as u64) as usize;
        let want = (block_size - jank).min(size - traversed);

        let block;
        if block_idx < DIRECT_POINTERS as u64 {
            let slot = block_idx as usize;
            let mut blk = node.dbp[slot];
            if blk == 0 {
                let Some(created) = create.as_mut().and_then(|c| c()) else {
                    break 'walk;
                };
                node.dbp[slot] = created;
                node_dirty = true;
                blk = created;
            }
            block = blk;
        } else {
            let rel = block_idx - DIRECT_POINTERS as u64;
            let singly_idx = (rel % ptr_count) as usize;
            let doubly_idx = rel / ptr_count;
            let triply_idx = rel / (ptr_count * ptr_count);

            if triply_idx >= 1 && triply_idx != last_triply_idx {
                if !triply.loaded {
                    let Some(created) = create.as_mut().and_then(|c| c()) else {
                        break 'walk;
                    };
                    node.tibp = created;
                    node_dirty = true;
                    if !triply.load(part, created, true) {
                        break 'walk;
                    }
                }
                let t_slot = ((triply_idx - 1) % ptr_count) as usize;
                let Some((d_block, d_fresh)) = scratch_block(&mut triply, t_slot, &mut create)
                else {
                    break 'walk;
                };
                if !doubly.flush(part) || !doubly.load(part, d_block, d_fresh) {
                    break 'walk;
                }
            }

            if doubly_idx >= 1 && doubly_idx != last_doubly_idx {
                if !doubly.loaded {
                    let Some(created) = create.as_mut().and_then(|c| c()) else {
                        break 'walk;
                    };
                    node.dibp = created;
                    node_dirty = true;
                    if !doubly.load(part, created, true) {
                        break 'walk;
                    }
                }
                let d_slot = ((doubly_idx - 1) % ptr_count) as usize;
                let Some((s_block, s_fresh)) = scratch_block(&mut doubly, d_slot, &mut create)
                else {
                    break 'walk;
                };
                if !singly.flush(part) || !singly.load(part, s_block, s_fresh) {
                    break 'walk;
                }
            }

            if doubly_idx == 0 && !singly.loaded {
                let Some(created) = create.as_mut().and_then(|c| c()) else {
                    break 'walk;
                };
                node.sibp = created;
                node_dirty = true;
                if !singly.load(part, created, true) {
                    break 'walk;
                }
            }

            let Some((blk, _)) = scratch_block(&mut singly, singly_idx, &mut create) else {
                break 'walk;
            };
            block = blk;

            last_doubly_idx = doubly_idx;
            last_triply_idx = triply_idx;
        }

        let processed = visit(part, block, traversed, jank, want);
        traversed += processed;
        if processed < want {
            break;
        }
    }

    singly.flush(part);
    doubly.flush(part);
    triply.flush(part);

    (traversed, node_dirty)
}

/// Read `buffer.len()` bytes starting at `offset` of the handle's inode.
pub fn read_inode_data(basic: &BasicState, buffer: &mut [u8], offset: u64) -> usize {
    if buffer.is_empty() {
        return 0;
    }

    let mut part = basic.partition.lock();
    let mut node = basic.node.lock().clone();
    let block_size = basic.block_size;
    let buffer_len = buffer.len();

    let mut visit = |part: &mut File, block: u32, traversed: usize, jank: usize, want: usize| {
        let pos = block as i64 * block_size as i64 + jank as i64;
        if vfs::seek(part, pos, Whence::Set).is_err() {
            return 0;
        }
        vfs::read(&mut buffer[traversed..traversed + want], part)
    };

    let (read, _) = walk_inode_data(
        &mut part,
        &mut node,
        block_size,
        offset,
        buffer_len,
        &mut visit,
        None,
    );
    read
}

/// Write `buffer` at `offset` of the node handle's inode, allocating
/// blocks through the super driver for any hole touched. Returns the bytes
/// written.
pub fn write_inode_data(state: &super::node::NodeState, buffer: &[u8], offset: u64) -> usize {
    let basic = &state.basic;
    if buffer.is_empty() || !basic.attr(super::ATTR_WRITE) {
        return 0;
    }

    let super_state = &state.super_state;
    let inode_number = basic.inode;
    let block_size = basic.block_size;

    let mut part = basic.partition.lock();
    let mut node = basic.node.lock().clone();

    let written;
    let node_dirty;
    {
        let mut visit =
            |part: &mut File, block: u32, traversed: usize, jank: usize, want: usize| {
                let pos = block as i64 * block_size as i64 + jank as i64;
                if vfs::seek(part, pos, Whence::Set).is_err() {
                    return 0;
                }
                vfs::write(&buffer[traversed..traversed + want], part)
            };
        let mut create = || super_state.allocate_one(inode_number);

        let (n, dirty) = walk_inode_data(
            &mut part,
            &mut node,
            block_size,
            offset,
            buffer.len(),
            &mut visit,
            Some(&mut create),
        );
        written = n;
        node_dirty = dirty;
    }

    let end = offset + written as u64;
    let grew = node.is_regular() && end > node.size_low as u64;
    if grew {
        node.size_low = end as u32;
    }

    if node_dirty || grew {
        *basic.node.lock() = node.clone();
        if super_state.write_inode(inode_number, &node).is_err() {
            kerror!("ext2: inode {} writeback failed", inode_number);
        }
    }

    written
}
