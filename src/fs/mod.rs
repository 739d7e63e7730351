//! Filesystem drivers layered over the block devices.

pub mod ext2;
pub mod initramfs;
