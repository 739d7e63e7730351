//! Host abstraction layer: DMA memory, HHDM translation, and MMIO access.
//!
//! The hosting kernel owns physical memory and the page tables. It gives
//! this crate a physically contiguous, identity-translatable window for DMA
//! ([`init_dma_region`]) and, if the default direct-pointer MMIO access is
//! not appropriate, an [`MmioOps`] table ([`set_mmio_ops`]). The hosted test
//! suite installs an `MmioOps` that routes register traffic into a software
//! controller model.

use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use linked_list_allocator::Heap;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// MMIO access
// =============================================================================

/// Raw register access routines. Every controller register and doorbell
/// store in the subsystem goes through the installed table, preserving
/// volatile whole-register semantics at each call site.
pub struct MmioOps {
    pub read32: fn(usize) -> u32,
    pub write32: fn(usize, u32),
    pub read64: fn(usize) -> u64,
    pub write64: fn(usize, u64),
    /// Map a device register window (strong-uncached) and return its
    /// virtual base.
    pub map_device: fn(PhysAddr, usize) -> Option<usize>,
}

fn direct_read32(addr: usize) -> u32 {
    unsafe { ptr::read_volatile(addr as *const u32) }
}

fn direct_write32(addr: usize, value: u32) {
    unsafe { ptr::write_volatile(addr as *mut u32, value) }
}

fn direct_read64(addr: usize) -> u64 {
    unsafe { ptr::read_volatile(addr as *const u64) }
}

fn direct_write64(addr: usize, value: u64) {
    unsafe { ptr::write_volatile(addr as *mut u64, value) }
}

fn direct_map_device(phys: PhysAddr, _size: usize) -> Option<usize> {
    // The host is expected to have the BAR window mapped uncached inside
    // the direct map already.
    Some(phys_to_virt(phys) as usize)
}

static DIRECT_MMIO: MmioOps = MmioOps {
    read32: direct_read32,
    write32: direct_write32,
    read64: direct_read64,
    write64: direct_write64,
    map_device: direct_map_device,
};

static MMIO_OPS: AtomicPtr<MmioOps> =
    AtomicPtr::new(&DIRECT_MMIO as *const MmioOps as *mut MmioOps);

pub fn set_mmio_ops(ops: &'static MmioOps) {
    MMIO_OPS.store(ops as *const MmioOps as *mut MmioOps, Ordering::Release);
}

fn mmio() -> &'static MmioOps {
    unsafe { &*MMIO_OPS.load(Ordering::Acquire) }
}

pub fn mmio_read32(addr: usize) -> u32 {
    (mmio().read32)(addr)
}

pub fn mmio_write32(addr: usize, value: u32) {
    (mmio().write32)(addr, value)
}

pub fn mmio_read64(addr: usize) -> u64 {
    (mmio().read64)(addr)
}

pub fn mmio_write64(addr: usize, value: u64) {
    (mmio().write64)(addr, value)
}

pub fn map_device(phys: PhysAddr, size: usize) -> Option<usize> {
    (mmio().map_device)(phys, size)
}

// =============================================================================
// DMA window
// =============================================================================

static DMA_HEAP: Mutex<Heap> = Mutex::new(Heap::empty());
/// virt = phys + HHDM_OFFSET inside the DMA window.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Install the host-provided DMA window.
///
/// # Safety
///
/// `virt_base..virt_base+size` must be exclusively owned, writable,
/// physically contiguous starting at `phys_base`, and stay mapped for the
/// lifetime of the subsystem.
pub unsafe fn init_dma_region(virt_base: *mut u8, phys_base: PhysAddr, size: usize) {
    HHDM_OFFSET.store(virt_base as u64 - phys_base.as_u64(), Ordering::Release);
    DMA_HEAP.lock().init(virt_base, size);
    kinfo!(
        "hal: DMA window {:#x}..{:#x} (phys {:#x})",
        virt_base as usize,
        virt_base as usize + size,
        phys_base.as_u64()
    );
}

pub fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    (phys.as_u64() + HHDM_OFFSET.load(Ordering::Acquire)) as *mut u8
}

pub fn virt_to_phys(virt: *const u8) -> PhysAddr {
    PhysAddr::new(virt as u64 - HHDM_OFFSET.load(Ordering::Acquire))
}

/// An owned run of physically contiguous, zeroed DMA pages.
pub struct DmaPages {
    virt: NonNull<u8>,
    phys: PhysAddr,
    pages: usize,
}

// The pages are exclusively owned and only shared through &self accessors.
unsafe impl Send for DmaPages {}
unsafe impl Sync for DmaPages {}

impl DmaPages {
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    pub fn virt(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len()) }
    }
}

impl Drop for DmaPages {
    fn drop(&mut self) {
        let layout = dma_layout(self.pages);
        unsafe { DMA_HEAP.lock().deallocate(self.virt, layout) };
    }
}

fn dma_layout(pages: usize) -> Layout {
    Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap_or(Layout::new::<u8>())
}

/// Allocate `pages` zeroed, contiguous DMA pages.
pub fn phys_alloc(pages: usize) -> Result<DmaPages> {
    if pages == 0 {
        return Err(Error::BadArgument);
    }
    let layout = dma_layout(pages);
    let virt = DMA_HEAP
        .lock()
        .allocate_first_fit(layout)
        .map_err(|_| Error::OutOfMemory)?;
    unsafe { ptr::write_bytes(virt.as_ptr(), 0, pages * PAGE_SIZE) };
    let phys = virt_to_phys(virt.as_ptr());
    Ok(DmaPages { virt, phys, pages })
}
