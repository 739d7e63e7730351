//! Submission/completion queue pairs.
//!
//! A queue pair owns the physically contiguous pages both hardware rings
//! live in, stamps correlation IDs into submissions, and polls phase-tagged
//! completions. Completions may arrive out of submission order; matching is
//! always by CID. A completion consumed while waiting for a different CID
//! is parked in a per-slot mailbox so its own waiter picks it up later.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use spin::Mutex;
use x86_64::PhysAddr;

use crate::hal::{self, DmaPages};
use crate::ring::Ring;

use super::regs::ControllerRegs;

pub const SQ_ENTRY_SIZE: usize = 64;
pub const CQ_ENTRY_SIZE: usize = 16;

/// Admin ring lengths: one page of submissions, one page of completions.
pub const ADMIN_SQ_LEN: usize = hal::PAGE_SIZE / SQ_ENTRY_SIZE;
pub const ADMIN_CQ_LEN: usize = hal::PAGE_SIZE / CQ_ENTRY_SIZE;

// =============================================================================
// Queue identifiers and the CID codec
// =============================================================================

/// Queue selector: the controller-wide admin pair, or an I/O pair 0..=63.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueId {
    Admin,
    Io(u8),
}

impl QueueId {
    /// Doorbell register index: admin occupies 0, I/O queue `id` is
    /// `id + 1`.
    pub fn doorbell_index(self) -> u32 {
        match self {
            QueueId::Admin => 0,
            QueueId::Io(id) => id as u32 + 1,
        }
    }
}

/// Correlation ID layout: bit 15 flags the admin queue with the slot in the
/// low byte; I/O CIDs carry the queue id in bits 0..6 and the slot in bits
/// 6..14. The controller echoes the value verbatim.
pub fn encode_cid(queue: QueueId, slot: usize) -> u16 {
    match queue {
        QueueId::Admin => (1 << 15) | (slot as u16 & 0xFF),
        QueueId::Io(id) => (id as u16 & 0x3F) | ((slot as u16 & 0xFF) << 6),
    }
}

pub fn decode_cid(cid: u16) -> (QueueId, usize) {
    if cid & (1 << 15) != 0 {
        (QueueId::Admin, (cid & 0xFF) as usize)
    } else {
        (QueueId::Io((cid & 0x3F) as u8), ((cid >> 6) & 0xFF) as usize)
    }
}

// =============================================================================
// Wire entries
// =============================================================================

/// 64-byte submission entry. CDW0 packs opcode, FUSE/PSDT, and the CID.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SqEntry {
    pub cdw0: u32,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SqEntry {
    pub fn new(opcode: u8) -> SqEntry {
        SqEntry {
            cdw0: opcode as u32,
            ..SqEntry::default()
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdw0 as u8
    }

    pub fn cid(&self) -> u16 {
        (self.cdw0 >> 16) as u16
    }

    pub fn set_cid(&mut self, cid: u16) {
        self.cdw0 = (self.cdw0 & 0xFFFF) | ((cid as u32) << 16);
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const SqEntry as *const u8, SQ_ENTRY_SIZE) }
    }
}

/// 16-byte completion entry. Bit 0 of the status word is the phase tag; the
/// remaining 15 bits are the status field.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct CqEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub cid: u16,
    pub status_phase: u16,
}

impl CqEntry {
    pub fn phase(&self) -> u8 {
        (self.status_phase & 1) as u8
    }

    pub fn status(&self) -> u16 {
        self.status_phase >> 1
    }
}

// =============================================================================
// Queue pair
// =============================================================================

struct CqCursor {
    head: usize,
    phase: u8,
    /// Completions consumed on behalf of other submission slots.
    mailbox: Vec<Option<CqEntry>>,
}

pub struct QueuePair {
    pub id: QueueId,
    /// Backing pages for both rings; freed with the pair.
    dma: DmaPages,
    sq: Ring,
    sq_phys: PhysAddr,
    cq_base: *mut CqEntry,
    cq_phys: PhysAddr,
    cq_len: usize,
    sq_db: usize,
    cq_db: usize,
    cq: Mutex<CqCursor>,
}

// cq_base points into the owned DMA pages; ring access is internally
// synchronized.
unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// Lay both rings out in `dma` (submissions first), zero them, and set
    /// the expected phase to 1.
    pub fn new(
        id: QueueId,
        mut dma: DmaPages,
        sub_len: usize,
        comp_len: usize,
        regs: &ControllerRegs,
        dstrd: u32,
    ) -> Arc<QueuePair> {
        let sq_bytes = sub_len * SQ_ENTRY_SIZE;
        debug_assert!(sq_bytes + comp_len * CQ_ENTRY_SIZE <= dma.len());

        dma.as_mut_slice().fill(0);

        let sq_base = dma.virt();
        let cq_base = unsafe { dma.virt().add(sq_bytes) } as *mut CqEntry;
        let sq_phys = dma.phys();
        let cq_phys = PhysAddr::new(dma.phys().as_u64() + sq_bytes as u64);

        let n = id.doorbell_index();
        let mut mailbox = Vec::with_capacity(sub_len);
        mailbox.resize_with(sub_len, || None);

        Arc::new(QueuePair {
            id,
            sq: Ring::new(sq_base, sub_len, SQ_ENTRY_SIZE),
            sq_phys,
            cq_base,
            cq_phys,
            cq_len: comp_len,
            sq_db: regs.sq_tail_doorbell(n, dstrd),
            cq_db: regs.cq_head_doorbell(n, dstrd),
            cq: Mutex::new(CqCursor {
                head: 0,
                phase: 1,
                mailbox,
            }),
            dma,
        })
    }

    pub fn sq_phys(&self) -> PhysAddr {
        self.sq_phys
    }

    pub fn cq_phys(&self) -> PhysAddr {
        self.cq_phys
    }

    pub fn sq_len(&self) -> usize {
        self.sq.capacity()
    }

    pub fn cq_len(&self) -> usize {
        self.cq_len
    }

    /// Stamp the correlation ID, publish the entry, ring the tail doorbell.
    /// The entry store is fenced before the doorbell store.
    pub fn submit(&self, cmd: &mut SqEntry) {
        let slot = loop {
            if let Some(slot) = self.sq.allocate() {
                break slot;
            }
            core::hint::spin_loop();
        };

        cmd.set_cid(encode_cid(self.id, slot));
        self.sq.write(slot, cmd.as_bytes());
        fence(Ordering::SeqCst);
        hal::mmio_write32(self.sq_db, slot as u32 + 1);
    }

    /// Busy-poll until the completion carrying `cid` shows up. Foreign
    /// fresh completions encountered on the way are consumed into the
    /// mailbox for their own waiters. Returns the 15-bit status field.
    pub fn poll(&self, cid: u16, mut out: Option<&mut CqEntry>) -> u16 {
        let (_, slot) = decode_cid(cid);

        loop {
            {
                let mut cur = self.cq.lock();

                if let Some(entry) = cur.mailbox.get_mut(slot).and_then(|m| m.take()) {
                    return self.finish(slot, entry, out.as_deref_mut());
                }

                let entry = unsafe { ptr::read_volatile(self.cq_base.add(cur.head)) };
                if entry.phase() == cur.phase {
                    // Fresh entry: consume it, advancing the head one slot
                    // and flipping the phase when the advance wraps.
                    cur.head += 1;
                    if cur.head == self.cq_len {
                        cur.head = 0;
                        cur.phase ^= 1;
                    }
                    hal::mmio_write32(self.cq_db, cur.head as u32);

                    if entry.cid == cid {
                        return self.finish(slot, entry, out.as_deref_mut());
                    }
                    let (_, other) = decode_cid(entry.cid);
                    if let Some(m) = cur.mailbox.get_mut(other) {
                        *m = Some(entry);
                    }
                }
            }
            core::hint::spin_loop();
        }
    }

    fn finish(&self, slot: usize, entry: CqEntry, out: Option<&mut CqEntry>) -> u16 {
        if let Some(out) = out {
            *out = entry;
        }
        self.sq.free(slot);
        entry.status()
    }
}
