//! NVMe namespace driver.
//!
//! One resource per NSID. Init identifies the namespace format, provisions
//! a dedicated I/O queue pair (falling back to round-robin over existing
//! pairs when ids or memory run out), and publishes the namespace as a
//! block device. Reads and writes are chopped into single-DMA-page LBA
//! commands against the namespace's queue; unaligned writes go through a
//! read-modify-write of the affected LBAs.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt::Write as _;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::hal::{self, DmaPages, PAGE_SIZE};
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::{self, File};

use super::queue::{QueueId, SqEntry};
use super::ControllerState;

const NVM_WRITE: u8 = 0x01;
const NVM_READ: u8 = 0x02;
const IDENTIFY_CNS_NAMESPACE: u32 = 0x00;
const ADMIN_IDENTIFY: u8 = 0x06;

/// Arguments handed to `init` by the controller's namespace enumeration.
pub struct NamespaceArgs {
    pub controller: Arc<ControllerState>,
    pub nsid: u32,
    pub command_set: u8,
}

/// Per-command DMA buffers: one page of data, one page of metadata.
struct IoBuffers {
    data: DmaPages,
    meta: DmaPages,
}

pub struct NamespaceState {
    controller: Arc<ControllerState>,
    pub nsid: u32,
    pub command_set: u8,
    pub nsze: u64,
    pub ncap: u64,
    pub lba_size: usize,
    pub meta_size: usize,
    pub nvm_set: u8,
    pub meta_follows_lba: bool,
    /// The I/O queue this namespace issues against; assigned at init.
    pub ioqpair: QueueId,
    io: Mutex<IoBuffers>,
}

fn init_namespace(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let args = args.downcast_ref::<NamespaceArgs>().ok_or(Error::BadArgument)?;
    let controller = args.controller.clone();

    // Identify Namespace for this command set.
    let buf = hal::phys_alloc(1)?;
    let mut cmd = SqEntry::new(ADMIN_IDENTIFY);
    cmd.prp1 = buf.phys().as_u64();
    cmd.cdw10 = IDENTIFY_CNS_NAMESPACE;
    cmd.cdw11 = (args.command_set as u32) << 24;
    cmd.nsid = args.nsid;
    controller.submit_command(QueueId::Admin, &mut cmd)?;
    let status = controller.poll_completion(&cmd, None)?;
    if status != 0 {
        return Err(Error::CommandStatus(status));
    }

    let data = buf.as_slice();

    // Byte 26: low nibble plus bits 5:6 form the format index, bit 4 says
    // metadata is interleaved at the end of each LBA.
    let flbas = data[26] as u64;
    let format_idx =
        (super::regs::masked_read(flbas, 0, 0xF) | (super::regs::masked_read(flbas, 5, 0b11) << 4))
            as usize;
    let meta_follows_lba = super::regs::masked_read(flbas, 4, 1) != 0;

    let lbaf_off = 128 + 4 * format_idx;
    let lbaf = u32::from_le_bytes(data[lbaf_off..lbaf_off + 4].try_into().unwrap());
    let lba_exp = super::regs::masked_read(lbaf as u64, 16, 0xFF) as u32;
    let lba_size = 1usize << lba_exp;
    let meta_size = super::regs::masked_read(lbaf as u64, 0, 0xFFFF) as usize;

    let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let ncap = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let nvm_set = data[100];

    // Try a dedicated queue pair: one page of submissions, one of
    // completions. Fall back to sharing when ids or memory run out.
    let ioqpair = match hal::phys_alloc(2)
        .and_then(|dma| controller.create_qpair(dma, PAGE_SIZE / 64, PAGE_SIZE / 16))
    {
        Ok(pair) => {
            controller.create_io_qpair(&pair, nvm_set, args.command_set, 0)?;
            pair.id
        }
        Err(err) => {
            kwarn!(
                "nvme: namespace {} falling back to a shared queue ({:?})",
                args.nsid,
                err
            );
            controller
                .next_shared_io_queue()
                .ok_or(Error::NoSuchQueue)?
        }
    };

    let state = NamespaceState {
        controller: controller.clone(),
        nsid: args.nsid,
        command_set: args.command_set,
        nsze,
        ncap,
        lba_size,
        meta_size,
        nvm_set,
        meta_follows_lba,
        ioqpair,
        io: Mutex::new(IoBuffers {
            data: hal::phys_alloc(1)?,
            meta: hal::phys_alloc(1)?,
        }),
    };

    kinfo!(
        "nvme: namespace {} ({} LBAs of {} bytes, queue {:?})",
        args.nsid,
        nsze,
        lba_size,
        ioqpair
    );

    res.set_state(alloc::boxed::Box::new(state));

    let mut path = heapless::String::<64>::new();
    let _ = write!(
        path,
        "/dev/nvme{}n{}",
        controller.info().controller_id,
        args.nsid
    );
    vfs::create(
        path.as_str(),
        vfs::NodeInfo {
            kind: vfs::NodeType::Device,
            mode: 0o600,
            resource: res.clone(),
        },
    )?;

    if let Err(err) = crate::drivers::partition::scan_drive(path.as_str()) {
        kwarn!("nvme: partition scan of {} failed: {:?}", path, err);
    }

    Ok(())
}

fn uninit_namespace(_res: &Resource) -> Result<()> {
    Ok(())
}

fn read_namespace(buffer: &mut [u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<NamespaceState>() else {
        return 0;
    };

    let io = state.io.lock();
    let lba_size = state.lba_size as u64;
    let lbas_per_page = PAGE_SIZE / state.lba_size;
    let mut read = 0usize;

    while read < buffer.len() {
        let pos = file.offset as u64 + read as u64;
        let lba = pos / lba_size;
        let jank = (pos - lba * lba_size) as usize;
        let remaining = buffer.len() - read;

        let mut nlb = (remaining + jank + state.lba_size - 1) / state.lba_size;
        if nlb > lbas_per_page {
            nlb = lbas_per_page;
        }

        let mut cmd = SqEntry::new(NVM_READ);
        cmd.nsid = state.nsid;
        cmd.prp1 = io.data.phys().as_u64();
        cmd.mptr = io.meta.phys().as_u64();
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (nlb - 1) as u32;

        if state.controller.submit_command(state.ioqpair, &mut cmd).is_err() {
            break;
        }
        match state.controller.poll_completion(&cmd, None) {
            Ok(0) => {}
            _ => break,
        }

        let available = nlb * state.lba_size - jank;
        let copy_size = remaining.min(available);
        buffer[read..read + copy_size]
            .copy_from_slice(&io.data.as_slice()[jank..jank + copy_size]);
        read += copy_size;
    }

    read
}

fn write_namespace(buffer: &[u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<NamespaceState>() else {
        return 0;
    };

    let mut io = state.io.lock();
    let lba_size = state.lba_size as u64;
    let lbas_per_page = PAGE_SIZE / state.lba_size;
    let mut written = 0usize;

    while written < buffer.len() {
        let pos = file.offset as u64 + written as u64;
        let lba = pos / lba_size;
        let jank = (pos - lba * lba_size) as usize;
        let remaining = buffer.len() - written;

        let mut nlb = (remaining + jank + state.lba_size - 1) / state.lba_size;
        if nlb > lbas_per_page {
            nlb = lbas_per_page;
        }

        let copy_size = remaining.min(nlb * state.lba_size - jank);

        let mut cmd = SqEntry::new(NVM_READ);
        cmd.nsid = state.nsid;
        cmd.prp1 = io.data.phys().as_u64();
        cmd.mptr = io.meta.phys().as_u64();
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        cmd.cdw12 = (nlb - 1) as u32;

        // A partial head or tail LBA would clobber neighboring bytes;
        // bring the affected LBAs in first and overlay.
        if jank != 0 || copy_size % state.lba_size != 0 {
            if state.controller.submit_command(state.ioqpair, &mut cmd).is_err() {
                break;
            }
            match state.controller.poll_completion(&cmd, None) {
                Ok(0) => {}
                _ => break,
            }
        }

        io.data.as_mut_slice()[jank..jank + copy_size]
            .copy_from_slice(&buffer[written..written + copy_size]);

        cmd.cdw0 = (cmd.cdw0 & !0xFF) | NVM_WRITE as u32;
        if state.controller.submit_command(state.ioqpair, &mut cmd).is_err() {
            break;
        }
        match state.controller.poll_completion(&cmd, None) {
            Ok(0) => {}
            _ => break,
        }

        written += copy_size;
    }

    written
}

fn stat_namespace(res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res.state::<NamespaceState>().ok_or(Error::BadArgument)?;
    stat.st_blksize = state.lba_size as u64;
    stat.st_blocks = state.nsze;
    stat.st_size = state.lba_size as u64 * state.nsze;
    stat.st_mode = 0x6000 | 0o600;
    Ok(())
}

pub static NAMESPACE_DRIVER: DriverDef = DriverDef {
    init: init_namespace,
    uninit: uninit_namespace,
    read: read_namespace,
    write: write_namespace,
    stat: stat_namespace,
    ..DriverDef::empty("nvme_namespace")
};
