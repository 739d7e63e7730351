//! Partition driver.
//!
//! A partition resource is an offset window into a parent block device:
//! read and write seek the backing drive to `file.offset + start_lba *
//! lba_size` and delegate. [`scan_drive`] reads the drive's MBR and
//! instantiates one resource per primary entry, published as `<drive>pN`.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::any::Any;
use core::fmt::Write as _;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::resource::{self, DriverDef, DriverGroup, Resource, Stat};
use crate::vfs::{self, File, Whence};

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_ENTRY_TABLE: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

/// Arguments for one partition resource.
pub struct PartitionArgs {
    pub drive_path: String,
    pub lba_start: u64,
    pub size_in_lbas: u64,
    pub lba_size: usize,
    pub attrs: u64,
    pub partition_number: u32,
}

pub struct PartitionState {
    drive: Mutex<File>,
    pub lba_start: u64,
    pub size_in_lbas: u64,
    pub lba_size: usize,
    pub attrs: u64,
    pub partition_number: u32,
}

fn init_partition(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let args = args.downcast_ref::<PartitionArgs>().ok_or(Error::BadArgument)?;

    let drive = vfs::open(&args.drive_path, 0)?;

    res.set_state(alloc::boxed::Box::new(PartitionState {
        drive: Mutex::new(drive),
        lba_start: args.lba_start,
        size_in_lbas: args.size_in_lbas,
        lba_size: args.lba_size,
        attrs: args.attrs,
        partition_number: args.partition_number,
    }));

    let mut path = heapless::String::<80>::new();
    let _ = write!(path, "{}p{}", args.drive_path, args.partition_number);
    vfs::create(
        path.as_str(),
        vfs::NodeInfo {
            kind: vfs::NodeType::Device,
            mode: 0o600,
            resource: res.clone(),
        },
    )?;

    kinfo!(
        "partition: {} ({} LBAs at {})",
        path,
        args.size_in_lbas,
        args.lba_start
    );
    Ok(())
}

fn uninit_partition(_res: &Resource) -> Result<()> {
    Ok(())
}

fn read_partition(buffer: &mut [u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<PartitionState>() else {
        return 0;
    };

    let mut drive = state.drive.lock();
    let base = state.lba_start * state.lba_size as u64;
    if vfs::seek(&mut drive, file.offset + base as i64, Whence::Set).is_err() {
        return 0;
    }
    vfs::read(buffer, &mut drive)
}

fn write_partition(buffer: &[u8], file: &mut File, res: &Resource) -> usize {
    if buffer.is_empty() {
        return 0;
    }
    let Some(state) = res.state::<PartitionState>() else {
        return 0;
    };

    let mut drive = state.drive.lock();
    let base = state.lba_start * state.lba_size as u64;
    if vfs::seek(&mut drive, file.offset + base as i64, Whence::Set).is_err() {
        return 0;
    }
    vfs::write(buffer, &mut drive)
}

fn stat_partition(res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res.state::<PartitionState>().ok_or(Error::BadArgument)?;
    stat.st_blksize = state.lba_size as u64;
    stat.st_blocks = state.size_in_lbas;
    stat.st_size = state.lba_size as u64 * state.size_in_lbas;
    stat.st_mode = 0x6000 | 0o600;
    Ok(())
}

pub static PARTITION_DRIVER: DriverDef = DriverDef {
    init: init_partition,
    uninit: uninit_partition,
    read: read_partition,
    write: write_partition,
    stat: stat_partition,
    ..DriverDef::empty("partition")
};

/// Read the drive's first sector and instantiate a partition resource per
/// valid primary MBR entry. Returns how many partitions were registered.
pub fn scan_drive(drive_path: &str) -> Result<usize> {
    let drive_stat = vfs::stat(drive_path)?;
    let lba_size = if drive_stat.st_blksize != 0 {
        drive_stat.st_blksize as usize
    } else {
        512
    };

    let mut drive = vfs::open(drive_path, 0)?;
    let mut sector = [0u8; 512];
    if vfs::read(&mut sector, &mut drive) != sector.len() {
        return Err(Error::ShortCount);
    }
    vfs::close(drive);

    if sector[510..512] != MBR_SIGNATURE {
        kdebug!("partition: {} carries no MBR", drive_path);
        return Ok(0);
    }

    let mut found = 0usize;
    for entry in 0..4 {
        let off = MBR_ENTRY_TABLE + entry * MBR_ENTRY_SIZE;
        let attrs = sector[off];
        let ptype = sector[off + 4];
        let lba_start =
            u32::from_le_bytes(sector[off + 8..off + 12].try_into().unwrap()) as u64;
        let size_in_lbas =
            u32::from_le_bytes(sector[off + 12..off + 16].try_into().unwrap()) as u64;

        if ptype == 0 || size_in_lbas == 0 {
            continue;
        }

        let args = PartitionArgs {
            drive_path: drive_path.to_string(),
            lba_start,
            size_in_lbas,
            lba_size,
            attrs: attrs as u64,
            partition_number: entry as u32 + 1,
        };
        match resource::init_resource(DriverGroup::Dev, resource::DEV_INDEX_PARTITION, &args) {
            Ok(_) => found += 1,
            Err(err) => kerror!(
                "partition: {}p{} init failed: {:?}",
                drive_path,
                entry + 1,
                err
            ),
        }
    }

    Ok(found)
}
