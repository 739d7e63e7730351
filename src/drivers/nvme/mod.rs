//! NVMe controller driver.
//!
//! Owns the controller lifecycle: reset, admin queue bring-up, enable,
//! identification, command-set negotiation, and namespace enumeration.
//! I/O queue pairs are provisioned here on behalf of namespace resources;
//! the per-controller queue table is a fixed 64-slot array indexed by queue
//! id with a 64-bit free-id bitmap, both guarded by `qpair_lock`.

pub mod namespace;
pub mod queue;
pub mod regs;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, Once};
use x86_64::PhysAddr;

use crate::error::{Error, Result};
use crate::hal::{self, DmaPages, PAGE_SIZE};
use crate::resource::{self, DriverDef, DriverGroup, PciHeader, Resource};
use crate::vfs;

use namespace::NamespaceArgs;
use queue::{CqEntry, QueueId, QueuePair, SqEntry, ADMIN_CQ_LEN, ADMIN_SQ_LEN};
use regs::*;

/// QEMU NVMe controller.
static NVME_PCI_CODES: [u32; 1] = [0x1b36_0010];

/// Controller flag bit 0: admin queue created and controller reached Ready.
const FLAG_INITIALIZED: u32 = 1 << 0;

// Admin opcodes used below.
const ADMIN_CREATE_SQ: u8 = 0x01;
const ADMIN_CREATE_CQ: u8 = 0x05;
const ADMIN_IDENTIFY: u8 = 0x06;
const ADMIN_SET_FEATURES: u8 = 0x09;

const FEATURE_NUM_QUEUES: u32 = 0x07;
const FEATURE_IO_COMMAND_SET: u32 = 0x19;

const IDENTIFY_CNS_CONTROLLER: u32 = 0x01;
const IDENTIFY_CNS_CS_NS_LIST: u32 = 0x07;
const IDENTIFY_CNS_IOCS: u32 = 0x1C;

/// Fields parsed out of Identify Controller.
#[derive(Clone, Copy, Debug, Default)]
pub struct ControllerInfo {
    pub controller_id: u16,
    pub controller_version: u32,
    pub controller_type: u8,
    pub ctratt: u32,
    pub max_transfer_size: usize,
}

struct QueueTable {
    /// Set bit = free I/O queue id.
    id_bmp: u64,
    entries: [Option<Arc<QueuePair>>; 64],
}

pub struct ControllerState {
    regs: ControllerRegs,
    dstrd: u32,
    mpsmin: u32,
    flags: AtomicU32,
    admin: Mutex<Option<Arc<QueuePair>>>,
    qpairs: Mutex<QueueTable>,
    info: Once<ControllerInfo>,
    max_ioqpair_count: AtomicUsize,
    rr_next: AtomicUsize,
}

impl ControllerState {
    pub fn new(regs: ControllerRegs) -> Arc<ControllerState> {
        let cap = regs.cap();
        Arc::new(ControllerState {
            regs,
            dstrd: masked_read(cap, CAP_DSTRD_OFFSET, CAP_DSTRD_MASK) as u32,
            mpsmin: masked_read(cap, CAP_MPSMIN_OFFSET, CAP_MPSMIN_MASK) as u32,
            flags: AtomicU32::new(0),
            admin: Mutex::new(None),
            qpairs: Mutex::new(QueueTable {
                id_bmp: u64::MAX,
                entries: core::array::from_fn(|_| None),
            }),
            info: Once::new(),
            max_ioqpair_count: AtomicUsize::new(2),
            rr_next: AtomicUsize::new(0),
        })
    }

    pub fn regs(&self) -> &ControllerRegs {
        &self.regs
    }

    pub fn info(&self) -> ControllerInfo {
        self.info.get().copied().unwrap_or_default()
    }

    pub fn max_ioqpair_count(&self) -> usize {
        self.max_ioqpair_count.load(Ordering::Relaxed)
    }

    pub fn initialized(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_INITIALIZED != 0
    }

    pub fn admin_queue(&self) -> Option<Arc<QueuePair>> {
        self.admin.lock().clone()
    }

    fn lookup(&self, queue: QueueId) -> Option<Arc<QueuePair>> {
        match queue {
            QueueId::Admin => self.admin.lock().clone(),
            QueueId::Io(id) => self.qpairs.lock().entries.get(id as usize)?.clone(),
        }
    }

    // =========================================================================
    // Command plumbing
    // =========================================================================

    /// Stamp and submit `cmd` on `queue`.
    pub fn submit_command(&self, queue: QueueId, cmd: &mut SqEntry) -> Result<()> {
        let pair = self.lookup(queue).ok_or(Error::NoSuchQueue)?;
        pair.submit(cmd);
        Ok(())
    }

    /// Poll the completion matching `cmd`'s CID; returns the 15-bit status.
    pub fn poll_completion(&self, cmd: &SqEntry, out: Option<&mut CqEntry>) -> Result<u16> {
        let (queue, _) = queue::decode_cid(cmd.cid());
        let pair = self.lookup(queue).ok_or(Error::NoSuchQueue)?;
        Ok(pair.poll(cmd.cid(), out))
    }

    /// Submit on the admin queue, wait, and fail on non-zero status.
    fn run_admin(&self, cmd: &mut SqEntry) -> Result<CqEntry> {
        self.submit_command(QueueId::Admin, cmd)?;
        let mut ret = CqEntry::default();
        let status = self.poll_completion(cmd, Some(&mut ret))?;
        if status != 0 {
            return Err(Error::CommandStatus(status));
        }
        Ok(ret)
    }

    // =========================================================================
    // Queue-pair management
    // =========================================================================

    /// Allocate the lowest free I/O queue id and build a pair over `dma`.
    pub fn create_qpair(
        &self,
        dma: DmaPages,
        sub_len: usize,
        comp_len: usize,
    ) -> Result<Arc<QueuePair>> {
        if sub_len == 0 || comp_len == 0 {
            return Err(Error::BadArgument);
        }

        let mut table = self.qpairs.lock();
        if table.id_bmp == 0 {
            return Err(Error::OutOfIds);
        }

        let id = table.id_bmp.trailing_zeros() as usize;
        if id >= self.max_ioqpair_count() || id >= 64 {
            return Err(Error::OutOfIds);
        }
        table.id_bmp &= !(1u64 << id);

        let pair = QueuePair::new(
            QueueId::Io(id as u8),
            dma,
            sub_len,
            comp_len,
            &self.regs,
            self.dstrd,
        );
        table.entries[id] = Some(pair.clone());
        Ok(pair)
    }

    /// Tell the controller about a host-side pair: Create I/O Completion
    /// Queue first, then Create I/O Submission Queue.
    pub fn create_io_qpair(
        &self,
        pair: &Arc<QueuePair>,
        nvm_set: u8,
        command_set: u8,
        irq: u32,
    ) -> Result<()> {
        let QueueId::Io(id) = pair.id else {
            return Err(Error::BadArgument);
        };
        let real_id = id as u32 + 1;

        let mut cmd = SqEntry::new(ADMIN_CREATE_CQ);
        cmd.prp1 = pair.cq_phys().as_u64();
        cmd.cdw10 = real_id | (((pair.cq_len() - 1) as u32) << 16);
        cmd.cdw11 = 1 | (((irq > 31) as u32) << 1) | ((irq & 0xFFFF) << 16);
        cmd.cdw12 = nvm_set as u32;
        self.run_admin(&mut cmd)?;

        let mut cmd = SqEntry::new(ADMIN_CREATE_SQ);
        cmd.prp1 = pair.sq_phys().as_u64();
        cmd.cdw10 = real_id | (((pair.sq_len() - 1) as u32) << 16);
        cmd.cdw11 = 1 | (real_id << 16);
        cmd.cdw12 = command_set as u32;
        self.run_admin(&mut cmd)?;

        Ok(())
    }

    /// Drop a pair from the table and return its id to the bitmap. Any
    /// in-flight submissions must have completed; the DMA pages go away
    /// with the last reference.
    pub fn delete_qpair(&self, pair: &Arc<QueuePair>) -> Result<()> {
        let QueueId::Io(id) = pair.id else {
            return Err(Error::BadArgument);
        };
        let mut table = self.qpairs.lock();
        if table.entries[id as usize].take().is_none() {
            return Err(Error::NoSuchQueue);
        }
        table.id_bmp |= 1u64 << id;
        Ok(())
    }

    /// Forget every I/O pair, e.g. ahead of a controller reset.
    pub fn delete_all_qpairs(&self) {
        let mut table = self.qpairs.lock();
        table.entries = core::array::from_fn(|_| None);
        table.id_bmp = u64::MAX;
    }

    /// Round-robin pick of an existing I/O queue for namespaces that could
    /// not get a dedicated pair.
    pub fn next_shared_io_queue(&self) -> Option<QueueId> {
        let table = self.qpairs.lock();
        let live: Vec<u8> = table
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i as u8))
            .collect();
        if live.is_empty() {
            return None;
        }
        let pick = self.rr_next.fetch_add(1, Ordering::Relaxed) % live.len();
        Some(QueueId::Io(live[pick]))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Reset sequence: disable, rebuild the admin pair over two fresh DMA
    /// pages, select the command-set configuration, enable.
    pub fn reset(&self) -> Result<()> {
        let regs = &self.regs;

        regs.update_cc(0, CC_EN_OFFSET, 1);
        while regs.ready() {
            core::hint::spin_loop();
        }

        if self.initialized() {
            self.delete_all_qpairs();
        }

        let dma = hal::phys_alloc(2)?;
        regs.set_asq(dma.phys());
        regs.set_acq(PhysAddr::new(dma.phys().as_u64() + PAGE_SIZE as u64));

        let aqa = ((ADMIN_SQ_LEN - 1) as u32) | (((ADMIN_CQ_LEN - 1) as u32) << 16);
        regs.set_aqa(aqa);

        let admin = QueuePair::new(
            QueueId::Admin,
            dma,
            ADMIN_SQ_LEN,
            ADMIN_CQ_LEN,
            regs,
            self.dstrd,
        );
        *self.admin.lock() = Some(admin);
        self.qpairs.lock().id_bmp = u64::MAX;

        let cap_css = masked_read(regs.cap(), CAP_CSS_OFFSET, CAP_CSS_MASK) as u8;
        let css = if cap_css & CAP_CSS_ADMIN_ONLY != 0 {
            CC_CSS_ADMIN_ONLY
        } else if cap_css & CAP_CSS_IOCSS != 0 {
            CC_CSS_IO_SETS
        } else {
            CC_CSS_NVM
        };
        regs.update_cc(css, CC_CSS_OFFSET, CC_CSS_MASK);
        regs.update_cc(0, CC_MPS_OFFSET, CC_MPS_MASK);
        regs.update_cc(0, CC_AMS_OFFSET, CC_AMS_MASK);
        regs.update_cc(6, CC_IOSQES_OFFSET, CC_IOSQES_MASK);
        regs.update_cc(4, CC_IOCQES_OFFSET, CC_IOCQES_MASK);

        regs.update_cc(1, CC_EN_OFFSET, 1);
        while !regs.ready() {
            if regs.fatal() {
                kerror!("nvme: controller reported fatal status during enable");
                return Err(Error::ControllerUnsupported);
            }
            core::hint::spin_loop();
        }

        self.flags.fetch_or(FLAG_INITIALIZED, Ordering::Release);
        Ok(())
    }

    /// Identify Controller (CNS 0x01): pick the fields the subsystem needs
    /// out of the 4 KiB return buffer.
    pub fn identify_controller(&self) -> Result<()> {
        if !self.initialized() {
            return Err(Error::BadArgument);
        }

        let buf = hal::phys_alloc(1)?;
        let mut cmd = SqEntry::new(ADMIN_IDENTIFY);
        cmd.prp1 = buf.phys().as_u64();
        cmd.cdw10 = IDENTIFY_CNS_CONTROLLER;
        self.run_admin(&mut cmd)?;

        let data = buf.as_slice();
        let mdts = data[77];
        let controller_id = u16::from_le_bytes([data[78], data[79]]);
        let controller_version = u32::from_le_bytes([data[80], data[81], data[82], data[83]]);
        let ctratt = u32::from_le_bytes([data[96], data[97], data[98], data[99]]);
        let controller_type = data[111];

        let max_transfer_size = if mdts == 0 {
            128 * 1024
        } else {
            (PAGE_SIZE << self.mpsmin) << mdts
        };

        self.info.call_once(|| ControllerInfo {
            controller_id,
            controller_version,
            controller_type,
            ctratt,
            max_transfer_size,
        });

        kinfo!(
            "nvme: controller {:#06x} version {:#010x} type {}",
            controller_id,
            controller_version,
            controller_type
        );
        Ok(())
    }

    /// Set Features (number of queues): ask for 63 of each; the grant in
    /// DW0 is 0-based per side.
    pub fn setup_io_queues(&self) -> Result<()> {
        let mut cmd = SqEntry::new(ADMIN_SET_FEATURES);
        cmd.cdw10 = FEATURE_NUM_QUEUES;
        cmd.cdw11 = 63 | (63 << 16);
        let ret = self.run_admin(&mut cmd)?;

        let sub = (ret.dw0 & 0xFFFF) as usize + 1;
        let comp = ((ret.dw0 >> 16) & 0xFFFF) as usize + 1;
        self.max_ioqpair_count
            .store(sub.min(comp), Ordering::Relaxed);

        kdebug!(
            "nvme: controller granted {} submission / {} completion queues",
            sub,
            comp
        );
        Ok(())
    }

    /// Negotiate the I/O command set. Returns the 64-bit enabled-set mask
    /// (bit per command set identifier).
    pub fn set_command_set(&self) -> Result<u64> {
        if !self.initialized() {
            return Err(Error::BadArgument);
        }

        let cap_css = masked_read(self.regs.cap(), CAP_CSS_OFFSET, CAP_CSS_MASK) as u8;

        if cap_css & CAP_CSS_IOCSS != 0 {
            let buf = hal::phys_alloc(1)?;
            let mut cmd = SqEntry::new(ADMIN_IDENTIFY);
            cmd.prp1 = buf.phys().as_u64();
            cmd.cdw10 = IDENTIFY_CNS_IOCS | ((self.info().controller_id as u32) << 16);
            self.run_admin(&mut cmd)?;

            let data = buf.as_slice();
            let mut chosen = None;
            for i in 0..PAGE_SIZE / 8 {
                let vector = u64::from_le_bytes(data[i * 8..i * 8 + 8].try_into().unwrap());
                if vector != 0 {
                    chosen = Some((i, vector));
                    break;
                }
            }
            let Some((index, vector)) = chosen else {
                kwarn!("nvme: controller reports no enabled command-set vector");
                return Ok(0);
            };

            let mut cmd = SqEntry::new(ADMIN_SET_FEATURES);
            cmd.cdw10 = FEATURE_IO_COMMAND_SET;
            cmd.cdw11 = index as u32 & 0xFF;
            let ret = self.run_admin(&mut cmd)?;
            if ret.dw0 & 0xFF != index as u32 {
                kwarn!(
                    "nvme: command-set selection not honored (wanted {}, got {})",
                    index,
                    ret.dw0 & 0xFF
                );
            }

            return Ok(vector);
        }

        if cap_css & CAP_CSS_ADMIN_ONLY != 0 {
            // Admin-only controller: nothing to do I/O against.
            return Ok(0);
        }

        // Plain NVM command set.
        Ok(0x1)
    }

    /// Walk every enabled command set, list its active namespaces (CNS
    /// 0x07), and spin up a namespace resource for each NSID.
    pub fn enumerate_command_sets(self: Arc<Self>, mask: u64) -> Result<()> {
        let mut sets = mask;
        while sets != 0 {
            let cs = sets.trailing_zeros() as u8;
            sets &= !(1u64 << cs);

            let buf = hal::phys_alloc(1)?;
            let mut cmd = SqEntry::new(ADMIN_IDENTIFY);
            cmd.prp1 = buf.phys().as_u64();
            cmd.cdw10 = IDENTIFY_CNS_CS_NS_LIST | ((self.info().controller_id as u32) << 16);
            cmd.cdw11 = (cs as u32) << 24;
            cmd.nsid = 0;
            self.run_admin(&mut cmd)?;

            let data = buf.as_slice();
            for i in 0..512 {
                let nsid = u32::from_le_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
                if nsid == 0 {
                    break;
                }

                let args = NamespaceArgs {
                    controller: self.clone(),
                    nsid,
                    command_set: cs,
                };
                if let Err(err) = resource::init_resource(
                    DriverGroup::Dev,
                    resource::DEV_INDEX_NVME_NAMESPACE,
                    &args,
                ) {
                    kerror!("nvme: namespace {} init failed: {:?}", nsid, err);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Driver registration
// =============================================================================

/// Driver state attached to the controller resource.
pub struct NvmeDriverState {
    pub controller: Arc<ControllerState>,
}

fn init_nvme(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let header = args.downcast_ref::<PciHeader>().ok_or(Error::BadArgument)?;

    let mut bar = (header.bar[0] as u64) & !0x3FFF;
    bar |= (header.bar[1] as u64) << 32;
    let base = hal::map_device(PhysAddr::new(bar), REGISTER_WINDOW_SIZE)
        .ok_or(Error::OutOfMemory)?;

    let controller = ControllerState::new(ControllerRegs::new(base));
    controller.reset()?;
    controller.identify_controller()?;
    controller.setup_io_queues()?;

    let sets = controller.set_command_set()?;

    res.set_state(alloc::boxed::Box::new(NvmeDriverState {
        controller: controller.clone(),
    }));

    let mut path = heapless::String::<64>::new();
    let _ = write!(path, "/dev/nvme{}", controller.info().controller_id);
    vfs::create(
        path.as_str(),
        vfs::NodeInfo {
            kind: vfs::NodeType::Device,
            mode: 0o600,
            resource: res.clone(),
        },
    )?;

    controller.enumerate_command_sets(sets)?;

    Ok(())
}

fn uninit_nvme(_res: &Resource) -> Result<()> {
    Ok(())
}

pub static NVME_DRIVER: DriverDef = DriverDef {
    init: init_nvme,
    uninit: uninit_nvme,
    pci_codes: &NVME_PCI_CODES,
    ..DriverDef::empty("nvme")
};
