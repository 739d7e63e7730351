//! Vesta block-storage subsystem.
//!
//! NVMe controller, namespace and partition drivers plus the filesystem
//! layering (ext2, initramfs, RAM buffers) that consumes them. The hosting
//! kernel links this crate, hands it a DMA window and MMIO mapping services
//! through [`hal`], and gets back VFS-visible block devices and mounts.
//!
//! The crate is `no_std` + `alloc`; the hosted test suite under `tests/`
//! drives the full stack against an in-process controller model.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[macro_use]
pub mod logger;

pub mod error;
pub mod hal;
pub mod resource;
pub mod ring;
pub mod vfs;

pub mod drivers;
pub mod fs;

pub use error::Error;

/// One-time subsystem bring-up. Driver tables are static, so this only has
/// to reset the VFS namespace and announce itself; device discovery happens
/// when the host feeds PCI headers to [`resource::init_pci_resource`].
pub fn init() {
    vfs::init();
    kinfo!("storage: subsystem initialized");
}
