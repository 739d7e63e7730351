//! Fixed-capacity ring of fixed-size objects over caller-supplied memory.
//!
//! The NVMe queue pairs build both of their hardware rings out of this
//! primitive: the submission side uses `allocate`/`write`/`free` for slot
//! reservation, the completion side drives the cursor directly. Slot
//! reservation is atomic, so multiple producers can submit on one ring; a
//! slot is never handed out again until `free` releases it.

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct Ring {
    base: *mut u8,
    obj_size: usize,
    objs: usize,
    idx: AtomicUsize,
    in_use: Vec<AtomicBool>,
}

// base points into DMA memory owned by the queue pair embedding the ring.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Build a ring over `objs * obj_size` bytes at `base`. The memory is
    /// not touched; callers zero it when the device expects that.
    pub fn new(base: *mut u8, objs: usize, obj_size: usize) -> Ring {
        let mut in_use = Vec::with_capacity(objs);
        in_use.resize_with(objs, || AtomicBool::new(false));
        Ring {
            base,
            obj_size,
            objs,
            idx: AtomicUsize::new(0),
            in_use,
        }
    }

    pub fn capacity(&self) -> usize {
        self.objs
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Reserve one slot and return its position, or `None` if every slot is
    /// currently reserved. The cursor advances monotonically so consecutive
    /// reservations walk the ring in order.
    pub fn allocate(&self) -> Option<usize> {
        for _ in 0..self.objs {
            let pos = self.idx.fetch_add(1, Ordering::AcqRel) % self.objs;
            if self.in_use[pos]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(pos);
            }
        }
        None
    }

    /// Copy one object into a reserved slot.
    pub fn write(&self, pos: usize, obj: &[u8]) {
        debug_assert!(pos < self.objs);
        debug_assert!(obj.len() == self.obj_size);
        unsafe {
            ptr::copy_nonoverlapping(obj.as_ptr(), self.slot_ptr(pos), self.obj_size);
        }
    }

    /// Raw pointer to a slot.
    pub fn slot_ptr(&self, pos: usize) -> *mut u8 {
        debug_assert!(pos < self.objs);
        unsafe { self.base.add(pos * self.obj_size) }
    }

    /// Release a reserved slot for reuse.
    pub fn free(&self, pos: usize) {
        debug_assert!(pos < self.objs);
        self.in_use[pos].store(false, Ordering::Release);
    }
}
