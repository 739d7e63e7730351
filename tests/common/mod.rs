//! Shared test harness: an in-process NVMe controller model wired into the
//! crate's MMIO table, plus builders for ext2 images and MBR disks.
//!
//! Each mock controller claims a 16 KiB-aligned address window; register
//! traffic routed through the installed `MmioOps` lands in its register
//! file, and doorbell stores execute queued commands synchronously against
//! a `Vec<u8>` disk. Completions can optionally be held and released in an
//! arbitrary order to exercise CID matching.

#![allow(dead_code)]

use std::alloc::Layout;
use std::sync::{Mutex, Once};

use x86_64::PhysAddr;

use vesta_storage::drivers::nvme::queue::{CqEntry, SqEntry};
use vesta_storage::drivers::nvme::regs::*;
use vesta_storage::fs::ext2::Inode;
use vesta_storage::hal::{self, MmioOps};
use vesta_storage::logger;

pub const DMA_WINDOW_SIZE: usize = 32 * 1024 * 1024;

static SETUP: Once = Once::new();

fn log_sink(level: logger::LogLevel, args: core::fmt::Arguments) {
    eprintln!("[{:5}] {}", level.as_str(), args);
}

/// Process-wide bring-up: logging, the DMA window (identity-translated),
/// and the mock MMIO dispatcher.
pub fn setup() {
    SETUP.call_once(|| {
        logger::set_sink(log_sink);
        logger::set_level(logger::LogLevel::Debug);

        let layout = Layout::from_size_align(DMA_WINDOW_SIZE, 4096).unwrap();
        let window = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!window.is_null());
        unsafe {
            hal::init_dma_region(window, PhysAddr::new(window as u64), DMA_WINDOW_SIZE);
        }

        hal::set_mmio_ops(&MOCK_MMIO);
        vesta_storage::init();
    });
}

// =============================================================================
// Mock controller
// =============================================================================

#[derive(Clone)]
pub struct MockNamespace {
    pub nsid: u32,
    pub lba_size: usize,
    pub meta_size: u16,
    pub nvm_set: u8,
    pub data: Vec<u8>,
}

impl MockNamespace {
    pub fn new(nsid: u32, lba_size: usize, data: Vec<u8>) -> MockNamespace {
        MockNamespace {
            nsid,
            lba_size,
            meta_size: 0,
            nvm_set: 0,
            data,
        }
    }

    fn nsze(&self) -> u64 {
        (self.data.len() / self.lba_size) as u64
    }
}

#[derive(Clone)]
pub struct MockConfig {
    pub cap: u64,
    pub vs: u32,
    pub cntlid: u16,
    pub version: u32,
    pub ctratt: u32,
    pub controller_type: u8,
    pub mdts: u8,
    /// DW0 the Set Features (number of queues) completion reports.
    pub num_queues_dw0: u32,
    /// Command-set vector reported at index 0 of the CNS 0x1C page.
    pub iocs_vector: u64,
    pub namespaces: Vec<MockNamespace>,
    /// Park completions until `release_pending` instead of posting.
    pub hold_completions: bool,
}

impl MockConfig {
    /// CAP: MQES=255, DSTRD=0, CSS = plain NVM, MPSMIN=0.
    pub fn nvm() -> MockConfig {
        MockConfig {
            cap: 255 | (1u64 << 37),
            vs: 0x0001_0400,
            cntlid: 0,
            version: 0x0001_0400,
            ctratt: 0,
            controller_type: 1,
            mdts: 0,
            num_queues_dw0: 0x003F_003F,
            iocs_vector: 0x1,
            namespaces: Vec::new(),
            hold_completions: false,
        }
    }

    /// Same, but with I/O command-set selection (CAP.CSS bit 6).
    pub fn iocss() -> MockConfig {
        let mut cfg = MockConfig::nvm();
        cfg.cap = 255 | (1u64 << 43);
        cfg
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CmdRecord {
    pub qid: u16,
    pub opcode: u8,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
}

struct DevSq {
    base: u64,
    len: usize,
    head: usize,
    cqid: u16,
}

struct DevCq {
    base: u64,
    len: usize,
    tail: usize,
    phase: u8,
}

pub struct MockInner {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    admin_sq: Option<DevSq>,
    admin_cq: Option<DevCq>,
    io_sqs: Vec<(u16, DevSq)>,
    io_cqs: Vec<(u16, DevCq)>,
    pending: Vec<(u16, CqEntry)>,
    pub config: MockConfig,
    pub log: Vec<CmdRecord>,
}

pub struct MockController {
    base: usize,
    inner: Mutex<MockInner>,
}

static CONTROLLERS: Mutex<Vec<&'static MockController>> = Mutex::new(Vec::new());

impl MockController {
    pub fn new(config: MockConfig) -> &'static MockController {
        // The driver masks the low 14 bits off BAR0, so the register
        // window must be 16 KiB aligned.
        let layout = Layout::from_size_align(0x4000, 0x4000).unwrap();
        let window = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!window.is_null());

        let ctrl = Box::leak(Box::new(MockController {
            base: window as usize,
            inner: Mutex::new(MockInner {
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                admin_sq: None,
                admin_cq: None,
                io_sqs: Vec::new(),
                io_cqs: Vec::new(),
                pending: Vec::new(),
                config,
                log: Vec::new(),
            }),
        }));

        CONTROLLERS.lock().unwrap().push(ctrl);
        ctrl
    }

    pub fn pci_header(&self) -> vesta_storage::resource::PciHeader {
        let mut header = vesta_storage::resource::PciHeader {
            vendor_id: 0x1b36,
            device_id: 0x0010,
            class: 0x01,
            subclass: 0x08,
            prog_if: 0x02,
            ..Default::default()
        };
        header.bar[0] = self.base as u32;
        header.bar[1] = (self.base as u64 >> 32) as u32;
        header
    }

    pub fn cc(&self) -> u32 {
        self.inner.lock().unwrap().cc
    }

    pub fn csts(&self) -> u32 {
        self.inner.lock().unwrap().csts
    }

    pub fn aqa(&self) -> u32 {
        self.inner.lock().unwrap().aqa
    }

    pub fn io_command_log(&self) -> Vec<CmdRecord> {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .copied()
            .filter(|r| r.qid != 0)
            .collect()
    }

    pub fn set_hold_completions(&self, hold: bool) {
        self.inner.lock().unwrap().config.hold_completions = hold;
    }

    /// Post parked completions, optionally in reverse arrival order.
    pub fn release_pending(&self, reverse: bool) {
        let mut inner = self.inner.lock().unwrap();
        let mut pending = std::mem::take(&mut inner.pending);
        if reverse {
            pending.reverse();
        }
        for (cqid, entry) in pending {
            inner.post(cqid, entry);
        }
    }

    pub fn disk_snapshot(&self, nsid: u32) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner
            .config
            .namespaces
            .iter()
            .find(|ns| ns.nsid == nsid)
            .map(|ns| ns.data.clone())
            .unwrap_or_default()
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + REGISTER_WINDOW_SIZE
    }

    fn read32(&self, off: usize) -> u32 {
        let inner = self.inner.lock().unwrap();
        match off {
            REG_CAP => inner.config.cap as u32,
            o if o == REG_CAP + 4 => (inner.config.cap >> 32) as u32,
            REG_VS => inner.config.vs,
            REG_CC => inner.cc,
            REG_CSTS => inner.csts,
            REG_AQA => inner.aqa,
            REG_ASQ => inner.asq as u32,
            REG_ACQ => inner.acq as u32,
            _ => 0,
        }
    }

    fn read64(&self, off: usize) -> u64 {
        let inner = self.inner.lock().unwrap();
        match off {
            REG_CAP => inner.config.cap,
            REG_ASQ => inner.asq,
            REG_ACQ => inner.acq,
            _ => 0,
        }
    }

    fn write32(&self, off: usize, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        match off {
            REG_CC => inner.write_cc(value),
            REG_AQA => inner.aqa = value,
            REG_ASQ => inner.asq = (inner.asq & !0xFFFF_FFFF) | value as u64,
            o if o == REG_ASQ + 4 => {
                inner.asq = (inner.asq & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            REG_ACQ => inner.acq = (inner.acq & !0xFFFF_FFFF) | value as u64,
            o if o == REG_ACQ + 4 => {
                inner.acq = (inner.acq & 0xFFFF_FFFF) | ((value as u64) << 32)
            }
            o if o >= REG_DOORBELL_BASE => inner.doorbell(o - REG_DOORBELL_BASE, value),
            _ => {}
        }
    }

    fn write64(&self, off: usize, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        match off {
            REG_ASQ => inner.asq = value,
            REG_ACQ => inner.acq = value,
            _ => {}
        }
    }
}

impl MockInner {
    fn dstrd(&self) -> u32 {
        masked_read(self.config.cap, CAP_DSTRD_OFFSET, CAP_DSTRD_MASK) as u32
    }

    fn write_cc(&mut self, value: u32) {
        let was_enabled = self.cc & 1 != 0;
        let enabled = value & 1 != 0;
        self.cc = value;

        if enabled && !was_enabled {
            let sq_len = (self.aqa & 0xFFF) as usize + 1;
            let cq_len = ((self.aqa >> 16) & 0xFFF) as usize + 1;
            self.admin_sq = Some(DevSq {
                base: self.asq,
                len: sq_len,
                head: 0,
                cqid: 0,
            });
            self.admin_cq = Some(DevCq {
                base: self.acq,
                len: cq_len,
                tail: 0,
                phase: 1,
            });
            self.csts |= 1;
        } else if !enabled && was_enabled {
            self.admin_sq = None;
            self.admin_cq = None;
            self.io_sqs.clear();
            self.io_cqs.clear();
            self.pending.clear();
            self.csts &= !1;
        }
    }

    fn doorbell(&mut self, rel: usize, value: u32) {
        let stride = 4usize << self.dstrd();
        let index = rel / stride;
        let qid = (index / 2) as u16;
        if index % 2 == 1 {
            // Completion head update: consumed entries need no bookkeeping
            // in the model.
            return;
        }
        self.run_sq(qid, value as usize);
    }

    fn run_sq(&mut self, qid: u16, tail: usize) {
        loop {
            let (base, len, head) = {
                let sq = match self.sq(qid) {
                    Some(sq) => sq,
                    None => return,
                };
                (sq.base, sq.len, sq.head)
            };
            if head == tail % len {
                break;
            }

            let cmd =
                unsafe { core::ptr::read_volatile((base as usize + head * 64) as *const SqEntry) };
            let new_head = (head + 1) % len;
            if let Some(sq) = self.sq(qid) {
                sq.head = new_head;
            }

            self.log.push(CmdRecord {
                qid,
                opcode: cmd.opcode(),
                nsid: cmd.nsid,
                cdw10: cmd.cdw10,
                cdw11: cmd.cdw11,
                cdw12: cmd.cdw12,
            });

            let (dw0, status) = if qid == 0 {
                self.admin_command(&cmd)
            } else {
                self.nvm_command(&cmd)
            };

            let cqid = if qid == 0 {
                0
            } else {
                self.sq(qid).map(|sq| sq.cqid).unwrap_or(0)
            };

            let entry = CqEntry {
                dw0,
                dw1: 0,
                sq_head: new_head as u16,
                sq_id: qid,
                cid: cmd.cid(),
                status_phase: status << 1,
            };

            if self.config.hold_completions {
                self.pending.push((cqid, entry));
            } else {
                self.post(cqid, entry);
            }
        }
    }

    fn sq(&mut self, qid: u16) -> Option<&mut DevSq> {
        if qid == 0 {
            self.admin_sq.as_mut()
        } else {
            self.io_sqs.iter_mut().find(|(id, _)| *id == qid).map(|(_, q)| q)
        }
    }

    fn cq(&mut self, cqid: u16) -> Option<&mut DevCq> {
        if cqid == 0 {
            self.admin_cq.as_mut()
        } else {
            self.io_cqs
                .iter_mut()
                .find(|(id, _)| *id == cqid)
                .map(|(_, q)| q)
        }
    }

    fn post(&mut self, cqid: u16, mut entry: CqEntry) {
        let Some(cq) = self.cq(cqid) else { return };
        entry.status_phase |= cq.phase as u16;
        unsafe {
            core::ptr::write_volatile(
                (cq.base as usize + cq.tail * 16) as *mut CqEntry,
                entry,
            );
        }
        cq.tail += 1;
        if cq.tail == cq.len {
            cq.tail = 0;
            cq.phase ^= 1;
        }
    }

    fn admin_command(&mut self, cmd: &SqEntry) -> (u32, u16) {
        match cmd.opcode() {
            // Identify
            0x06 => {
                let cns = cmd.cdw10 & 0xFF;
                let buf = cmd.prp1 as usize as *mut u8;
                let page = unsafe { core::slice::from_raw_parts_mut(buf, 4096) };
                page.fill(0);
                match cns {
                    // Identify Controller
                    0x01 => {
                        page[77] = self.config.mdts;
                        page[78..80].copy_from_slice(&self.config.cntlid.to_le_bytes());
                        page[80..84].copy_from_slice(&self.config.version.to_le_bytes());
                        page[96..100].copy_from_slice(&self.config.ctratt.to_le_bytes());
                        page[111] = self.config.controller_type;
                        (0, 0)
                    }
                    // Identify Namespace
                    0x00 => {
                        let Some(ns) = self
                            .config
                            .namespaces
                            .iter()
                            .find(|ns| ns.nsid == cmd.nsid)
                        else {
                            return (0, 0x0B); // invalid namespace
                        };
                        page[0..8].copy_from_slice(&ns.nsze().to_le_bytes());
                        page[8..16].copy_from_slice(&ns.nsze().to_le_bytes());
                        page[26] = 0; // format 0, metadata separate
                        page[100] = ns.nvm_set;
                        let lbaf: u32 = ((ns.lba_size.trailing_zeros()) << 16)
                            | ns.meta_size as u32;
                        page[128..132].copy_from_slice(&lbaf.to_le_bytes());
                        (0, 0)
                    }
                    // Active NSIDs for a command set
                    0x07 => {
                        for (i, ns) in self.config.namespaces.iter().enumerate() {
                            page[i * 4..i * 4 + 4].copy_from_slice(&ns.nsid.to_le_bytes());
                        }
                        (0, 0)
                    }
                    // I/O command set vectors
                    0x1C => {
                        page[0..8].copy_from_slice(&self.config.iocs_vector.to_le_bytes());
                        (0, 0)
                    }
                    _ => (0, 0x02),
                }
            }
            // Set Features
            0x09 => match cmd.cdw10 & 0xFF {
                0x07 => (self.config.num_queues_dw0, 0),
                0x19 => (cmd.cdw11 & 0xFF, 0),
                _ => (0, 0x02),
            },
            // Create I/O Completion Queue
            0x05 => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                let len = ((cmd.cdw10 >> 16) & 0xFFFF) as usize + 1;
                self.io_cqs.push((
                    qid,
                    DevCq {
                        base: cmd.prp1,
                        len,
                        tail: 0,
                        phase: 1,
                    },
                ));
                (0, 0)
            }
            // Create I/O Submission Queue
            0x01 => {
                let qid = (cmd.cdw10 & 0xFFFF) as u16;
                let len = ((cmd.cdw10 >> 16) & 0xFFFF) as usize + 1;
                let cqid = ((cmd.cdw11 >> 16) & 0xFFFF) as u16;
                self.io_sqs.push((
                    qid,
                    DevSq {
                        base: cmd.prp1,
                        len,
                        head: 0,
                        cqid,
                    },
                ));
                (0, 0)
            }
            _ => (0, 0x01),
        }
    }

    fn nvm_command(&mut self, cmd: &SqEntry) -> (u32, u16) {
        let Some(ns) = self
            .config
            .namespaces
            .iter_mut()
            .find(|ns| ns.nsid == cmd.nsid)
        else {
            return (0, 0x0B);
        };

        let slba = cmd.cdw10 as u64 | ((cmd.cdw11 as u64) << 32);
        let nlb = (cmd.cdw12 & 0xFFFF) as usize + 1;
        let bytes = nlb * ns.lba_size;
        let offset = slba as usize * ns.lba_size;

        if offset + bytes > ns.data.len() {
            return (0, 0x80); // LBA out of range
        }

        match cmd.opcode() {
            0x02 => {
                let dst = cmd.prp1 as usize as *mut u8;
                unsafe {
                    core::ptr::copy_nonoverlapping(ns.data[offset..].as_ptr(), dst, bytes);
                }
                (0, 0)
            }
            0x01 => {
                let src = cmd.prp1 as usize as *const u8;
                unsafe {
                    core::ptr::copy_nonoverlapping(src, ns.data[offset..].as_mut_ptr(), bytes);
                }
                (0, 0)
            }
            _ => (0, 0x01),
        }
    }
}

// =============================================================================
// MMIO dispatch
// =============================================================================

fn find(addr: usize) -> Option<&'static MockController> {
    CONTROLLERS
        .lock()
        .unwrap()
        .iter()
        .copied()
        .find(|c| c.contains(addr))
}

fn mock_read32(addr: usize) -> u32 {
    find(addr).map_or(0, |c| c.read32(addr - c.base))
}

fn mock_write32(addr: usize, value: u32) {
    if let Some(c) = find(addr) {
        c.write32(addr - c.base, value);
    }
}

fn mock_read64(addr: usize) -> u64 {
    find(addr).map_or(0, |c| c.read64(addr - c.base))
}

fn mock_write64(addr: usize, value: u64) {
    if let Some(c) = find(addr) {
        c.write64(addr - c.base, value);
    }
}

fn mock_map_device(phys: PhysAddr, _size: usize) -> Option<usize> {
    Some(phys.as_u64() as usize)
}

static MOCK_MMIO: MmioOps = MmioOps {
    read32: mock_read32,
    write32: mock_write32,
    read64: mock_read64,
    write64: mock_write64,
    map_device: mock_map_device,
};

// =============================================================================
// Disk image builders
// =============================================================================

/// Deterministic non-trivial fill.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

/// Wrap `partition` in an MBR disk: one type-0x83 primary entry at
/// `start_lba`.
pub fn mbr_disk(partition: &[u8], start_lba: u64, lba_size: usize, total_lbas: u64) -> Vec<u8> {
    let mut disk = vec![0u8; total_lbas as usize * lba_size];
    let part_lbas = (partition.len() + lba_size - 1) / lba_size;

    disk[510] = 0x55;
    disk[511] = 0xAA;
    let entry = 446;
    disk[entry] = 0x00; // attributes
    disk[entry + 4] = 0x83; // Linux
    disk[entry + 8..entry + 12].copy_from_slice(&(start_lba as u32).to_le_bytes());
    disk[entry + 12..entry + 16].copy_from_slice(&(part_lbas as u32).to_le_bytes());

    let off = start_lba as usize * lba_size;
    disk[off..off + partition.len()].copy_from_slice(partition);
    disk
}

// =============================================================================
// ext2 image builder
// =============================================================================

pub const EXT2_FIRST_FILE_INODE: u32 = 12;
pub const EXT2_INODES: u32 = 128;
pub const EXT2_INODE_SIZE: usize = 128;

pub struct Ext2Image {
    pub bytes: Vec<u8>,
    pub block_size: usize,
    pub inode_table_block: u32,
    pub first_data_block: u32,
}

impl Ext2Image {
    pub fn inode_offset(&self, inode: u32) -> usize {
        self.inode_table_block as usize * self.block_size
            + (inode as usize - 1) * EXT2_INODE_SIZE
    }

    /// Punch a hole: zero direct pointer `idx` of `inode` (the block stays
    /// allocated in the bitmap, which is fine for the traversal tests).
    pub fn punch_direct_pointer(&mut self, inode: u32, idx: usize) {
        let off = self.inode_offset(inode) + 40 + idx * 4;
        self.bytes[off..off + 4].fill(0);
    }

    pub fn read_inode(&self, inode: u32) -> Inode {
        let off = self.inode_offset(inode);
        Inode::parse(&self.bytes[off..off + EXT2_INODE_SIZE]).unwrap()
    }
}

struct BlockAllocator {
    next: u32,
}

impl BlockAllocator {
    fn take(&mut self) -> u32 {
        let b = self.next;
        self.next += 1;
        b
    }
}

fn put_inode(bytes: &mut [u8], inode_table: u32, block_size: usize, ino: u32, node: &Inode) {
    let off = inode_table as usize * block_size + (ino as usize - 1) * EXT2_INODE_SIZE;
    node.encode(&mut bytes[off..off + EXT2_INODE_SIZE]);
}

/// Lay out one directory data block: `.`/`..` plus `entries`, with the
/// final record stretched to the end of the block.
fn put_dir_block(
    bytes: &mut [u8],
    block: u32,
    block_size: usize,
    self_ino: u32,
    parent_ino: u32,
    entries: &[(String, u32, u8)],
) {
    let mut all: Vec<(String, u32, u8)> = vec![
        (".".to_string(), self_ino, 2),
        ("..".to_string(), parent_ino, 2),
    ];
    all.extend(entries.iter().cloned());

    let base = block as usize * block_size;
    let mut off = 0usize;
    for (i, (name, ino, ftype)) in all.iter().enumerate() {
        let rec = if i == all.len() - 1 {
            block_size - off
        } else {
            8 + (name.len() + 3) / 4 * 4
        };
        let o = base + off;
        bytes[o..o + 4].copy_from_slice(&ino.to_le_bytes());
        bytes[o + 4..o + 6].copy_from_slice(&(rec as u16).to_le_bytes());
        bytes[o + 6] = name.len() as u8;
        bytes[o + 7] = *ftype;
        bytes[o + 8..o + 8 + name.len()].copy_from_slice(name.as_bytes());
        off += rec;
    }
}

/// Write one regular file: data blocks plus singly/doubly-indirect tables
/// as needed.
fn put_file(
    bytes: &mut [u8],
    alloc: &mut BlockAllocator,
    inode_table: u32,
    block_size: usize,
    ino: u32,
    data: &[u8],
) {
    let ptrs = block_size / 4;
    let mut node = Inode {
        type_perms: 0x8000 | 0o644,
        size_low: data.len() as u32,
        hard_link_count: 1,
        ..Inode::default()
    };

    let block_count = (data.len() + block_size - 1) / block_size;
    let mut data_blocks = Vec::with_capacity(block_count);
    for chunk in 0..block_count {
        let blk = alloc.take();
        let src = &data[chunk * block_size..data.len().min((chunk + 1) * block_size)];
        let dst = blk as usize * block_size;
        bytes[dst..dst + src.len()].copy_from_slice(src);
        data_blocks.push(blk);
    }

    for (slot, blk) in data_blocks.iter().take(12).enumerate() {
        node.dbp[slot] = *blk;
    }

    if block_count > 12 {
        let singly = alloc.take();
        node.sibp = singly;
        for (j, blk) in data_blocks[12..block_count.min(12 + ptrs)].iter().enumerate() {
            let o = singly as usize * block_size + j * 4;
            bytes[o..o + 4].copy_from_slice(&blk.to_le_bytes());
        }
    }

    if block_count > 12 + ptrs {
        let doubly = alloc.take();
        node.dibp = doubly;
        let rest = &data_blocks[12 + ptrs..];
        for (si, chunk) in rest.chunks(ptrs).enumerate() {
            let singly = alloc.take();
            let o = doubly as usize * block_size + si * 4;
            bytes[o..o + 4].copy_from_slice(&singly.to_le_bytes());
            for (j, blk) in chunk.iter().enumerate() {
                let so = singly as usize * block_size + j * 4;
                bytes[so..so + 4].copy_from_slice(&blk.to_le_bytes());
            }
        }
    }

    put_inode(bytes, inode_table, block_size, ino, &node);
}

/// Build a one-group ext2 image. File names may carry one directory level
/// (`"etc/issue"`); directories are created as needed. Inodes are handed
/// out from [`EXT2_FIRST_FILE_INODE`] in encounter order (a nested file's
/// directory takes its inode first).
pub fn build_ext2(block_size: usize, total_blocks: usize, files: &[(&str, &[u8])]) -> Ext2Image {
    assert!(block_size == 1024, "builder is specific to 1 KiB blocks");
    let mut bytes = vec![0u8; total_blocks * block_size];

    let sb_block = 1u32;
    let bgdt_block = sb_block + 1;
    let block_bitmap = bgdt_block + 1;
    let inode_bitmap = block_bitmap + 1;
    let inode_table = inode_bitmap + 1;
    let table_blocks = (EXT2_INODES as usize * EXT2_INODE_SIZE / block_size) as u32;
    let first_data = inode_table + table_blocks;

    let mut alloc = BlockAllocator { next: first_data };

    // Inode assignment pass.
    let mut next_ino = EXT2_FIRST_FILE_INODE;
    let mut root_files: Vec<(&str, &[u8], u32)> = Vec::new();
    // (dir name, dir inode, children: (name, data, inode))
    let mut dirs: Vec<(String, u32, Vec<(String, &[u8], u32)>)> = Vec::new();
    for (name, data) in files.iter().copied() {
        match name.split_once('/') {
            None => {
                root_files.push((name, data, next_ino));
                next_ino += 1;
            }
            Some((dir, rest)) => {
                let di = match dirs.iter().position(|(n, _, _)| n == dir) {
                    Some(i) => i,
                    None => {
                        dirs.push((dir.to_string(), next_ino, Vec::new()));
                        next_ino += 1;
                        dirs.len() - 1
                    }
                };
                dirs[di].2.push((rest.to_string(), data, next_ino));
                next_ino += 1;
            }
        }
    }

    // Root directory.
    let root_block = alloc.take();
    let mut root_entries: Vec<(String, u32, u8)> = root_files
        .iter()
        .map(|(n, _, ino)| (n.to_string(), *ino, 1))
        .collect();
    root_entries.extend(dirs.iter().map(|(n, ino, _)| (n.clone(), *ino, 2)));
    put_dir_block(&mut bytes, root_block, block_size, 2, 2, &root_entries);

    let mut root = Inode {
        type_perms: 0x4000 | 0o755,
        size_low: block_size as u32,
        hard_link_count: 2 + dirs.len() as u16,
        ..Inode::default()
    };
    root.dbp[0] = root_block;
    put_inode(&mut bytes, inode_table, block_size, 2, &root);

    // Subdirectories.
    for (_, dir_ino, children) in &dirs {
        let dir_block = alloc.take();
        let entries: Vec<(String, u32, u8)> = children
            .iter()
            .map(|(n, _, ino)| (n.clone(), *ino, 1))
            .collect();
        put_dir_block(&mut bytes, dir_block, block_size, *dir_ino, 2, &entries);

        let mut node = Inode {
            type_perms: 0x4000 | 0o755,
            size_low: block_size as u32,
            hard_link_count: 2,
            ..Inode::default()
        };
        node.dbp[0] = dir_block;
        put_inode(&mut bytes, inode_table, block_size, *dir_ino, &node);
    }

    // Files.
    for (_, data, ino) in &root_files {
        put_file(&mut bytes, &mut alloc, inode_table, block_size, *ino, data);
    }
    for (_, _, children) in &dirs {
        for (_, data, ino) in children {
            put_file(&mut bytes, &mut alloc, inode_table, block_size, *ino, data);
        }
    }

    assert!(
        (alloc.next as usize) < total_blocks,
        "image too small: needs {} blocks",
        alloc.next
    );

    // Superblock.
    {
        let sb = 1024usize;
        let le32 = |bytes: &mut Vec<u8>, off: usize, v: u32| {
            bytes[sb + off..sb + off + 4].copy_from_slice(&v.to_le_bytes())
        };
        let le16 = |bytes: &mut Vec<u8>, off: usize, v: u16| {
            bytes[sb + off..sb + off + 2].copy_from_slice(&v.to_le_bytes())
        };

        le32(&mut bytes, 0, EXT2_INODES); // total inodes
        le32(&mut bytes, 4, total_blocks as u32);
        le32(&mut bytes, 12, (total_blocks as u32).saturating_sub(alloc.next));
        le32(&mut bytes, 16, EXT2_INODES - EXT2_FIRST_FILE_INODE - files.len() as u32);
        le32(&mut bytes, 20, sb_block); // block holding the superblock
        le32(&mut bytes, 24, 0); // log2(block size) - 10
        le32(&mut bytes, 32, total_blocks as u32); // blocks per group
        le32(&mut bytes, 40, EXT2_INODES); // inodes per group
        le16(&mut bytes, 56, 0xEF53);
        le16(&mut bytes, 58, 1); // clean
        le16(&mut bytes, 60, 1); // errors: ignore
        le32(&mut bytes, 76, 1); // major version
        le32(&mut bytes, 84, 11); // first non-reserved inode
        le16(&mut bytes, 88, EXT2_INODE_SIZE as u16);
    }

    // One block-group descriptor.
    {
        let off = bgdt_block as usize * block_size;
        bytes[off..off + 4].copy_from_slice(&block_bitmap.to_le_bytes());
        bytes[off + 4..off + 8].copy_from_slice(&inode_bitmap.to_le_bytes());
        bytes[off + 8..off + 12].copy_from_slice(&inode_table.to_le_bytes());
        let free = (total_blocks as u32).saturating_sub(alloc.next) as u16;
        bytes[off + 12..off + 14].copy_from_slice(&free.to_le_bytes());
    }

    Ext2Image {
        bytes,
        block_size,
        inode_table_block: inode_table,
        first_data_block: first_data,
    }
}

// =============================================================================
// VFS-backed RAM drive
// =============================================================================

/// Mount an ext2 super driver from `dev` at `at`.
pub fn mount_ext2(dev: &str, at: &str) -> std::sync::Arc<vesta_storage::resource::Resource> {
    use vesta_storage::resource::{init_resource, DriverGroup, FS_INDEX_EXT2};

    let res = init_resource(DriverGroup::FsSuper, FS_INDEX_EXT2, &String::from(dev)).unwrap();
    vesta_storage::vfs::mount(at, res.clone()).unwrap();
    res
}

/// Publish a RAM-file device node at `path` holding `image`.
pub fn ram_drive(path: &str, image: &[u8]) -> std::sync::Arc<vesta_storage::resource::Resource> {
    use vesta_storage::resource::{init_resource, DriverGroup, FS_INDEX_BUFFER};
    use vesta_storage::vfs;

    let size = image.len();
    let res = init_resource(DriverGroup::FsFile, FS_INDEX_BUFFER, &size).unwrap();
    vfs::create(
        path,
        vfs::NodeInfo {
            kind: vfs::NodeType::Device,
            mode: 0o600,
            resource: res.clone(),
        },
    )
    .unwrap();

    let mut file = vfs::open(path, 0).unwrap();
    assert_eq!(vfs::write(image, &mut file), image.len());
    res
}
