//! Read-only initramfs: binary CPIO archives.
//!
//! The archive is a run of records, each a 26-byte all-`u16` header (magic
//! 0o070707) followed by the pathname and file data, both padded to even
//! offsets. The super driver answers `stat`/`locate` by scanning records;
//! the file driver reads one record's data slice.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;

use crate::error::{Error, Result};
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::File;

pub const CPIO_MAGIC: u16 = 0o070707;
pub const CPIO_HEADER_SIZE: usize = 26;

#[derive(Clone, Copy, Debug, Default)]
pub struct CpioHeader {
    pub magic: u16,
    pub device: u16,
    pub inode: u16,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub nlink: u16,
    pub rdev: u16,
    pub mod_time: [u16; 2],
    pub namesize: u16,
    pub filesize: [u16; 2],
}

impl CpioHeader {
    pub fn parse(raw: &[u8]) -> Option<CpioHeader> {
        if raw.len() < CPIO_HEADER_SIZE {
            return None;
        }
        let f = |o: usize| u16::from_le_bytes([raw[o], raw[o + 1]]);
        let header = CpioHeader {
            magic: f(0),
            device: f(2),
            inode: f(4),
            mode: f(6),
            uid: f(8),
            gid: f(10),
            nlink: f(12),
            rdev: f(14),
            mod_time: [f(16), f(18)],
            namesize: f(20),
            filesize: [f(22), f(24)],
        };
        if header.magic != CPIO_MAGIC {
            return None;
        }
        Some(header)
    }

    pub fn file_size(&self) -> usize {
        ((self.filesize[0] as usize) << 16) | self.filesize[1] as usize
    }

    pub fn mod_time(&self) -> u64 {
        ((self.mod_time[0] as u64) << 16) | self.mod_time[1] as u64
    }

    /// Name field size, padded to keep the data at an even offset.
    pub fn padded_name_size(&self) -> usize {
        let n = self.namesize as usize;
        n + (n & 1)
    }

    pub fn padded_file_size(&self) -> usize {
        let n = self.file_size();
        n + (n & 1)
    }

    pub fn record_size(&self) -> usize {
        CPIO_HEADER_SIZE + self.padded_name_size() + self.padded_file_size()
    }

    fn fill_stat(&self, stat: &mut Stat) {
        stat.st_uid = self.uid;
        stat.st_gid = self.gid;
        stat.st_mode = self.mode as u32;
        stat.st_dev = self.device as u64;
        stat.st_ino = self.inode as u64;
        stat.st_nlink = self.nlink as u32;
        stat.st_rdev = self.rdev as u64;
        stat.st_size = self.file_size() as u64;
        stat.st_mtime = self.mod_time();
    }
}

/// Find the record whose pathname equals `name` (leading slashes are
/// ignored, the archive stores relative paths). Returns the record slice.
fn find_file<'a>(image: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let target = name.trim_start_matches('/').as_bytes();
    let mut offset = 0usize;

    while offset < image.len() {
        let header = CpioHeader::parse(&image[offset..])?;
        let name_off = offset + CPIO_HEADER_SIZE;
        // namesize counts the terminating NUL.
        let name_len = (header.namesize as usize).saturating_sub(1);
        let stored = image.get(name_off..name_off + name_len)?;

        if stored == b"TRAILER!!!" {
            break;
        }
        if stored == target {
            return image.get(offset..offset + header.record_size());
        }

        offset += header.record_size();
    }

    None
}

/// The super driver owns the archive slice.
struct InitramfsSuperState {
    image: &'static [u8],
}

/// The file driver gets one record of it.
struct InitramfsFileState {
    record: &'static [u8],
}

// =============================================================================
// Super driver
// =============================================================================

fn init_super(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let image = args
        .downcast_ref::<&'static [u8]>()
        .copied()
        .ok_or(Error::BadArgument)?;

    if CpioHeader::parse(image).is_none() {
        kerror!("initramfs: image does not start with a CPIO record");
        return Err(Error::BadArgument);
    }

    res.set_state(Box::new(InitramfsSuperState { image }));
    Ok(())
}

fn uninit_super(_res: &Resource) -> Result<()> {
    Ok(())
}

fn stat_super(res: &Resource, name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res
        .state::<InitramfsSuperState>()
        .ok_or(Error::BadArgument)?;

    let Some(name) = name else {
        // The archive root behaves as a directory.
        stat.st_mode = 0x4000 | 0o555;
        return Ok(());
    };

    let record = find_file(state.image, name).ok_or(Error::NoSuchResource)?;
    let header = CpioHeader::parse(record).ok_or(Error::NoSuchResource)?;
    header.fill_stat(stat);
    Ok(())
}

fn locate_super(res: &Resource, name: &str) -> Option<Box<dyn Any + Send>> {
    let state = res.state::<InitramfsSuperState>()?;
    let record = find_file(state.image, name)?;
    Some(Box::new(record))
}

pub static INITRAMFS_SUPER_DRIVER: DriverDef = DriverDef {
    init: init_super,
    uninit: uninit_super,
    stat: stat_super,
    locate: locate_super,
    ..DriverDef::empty("initramfs")
};

// =============================================================================
// File driver
// =============================================================================

fn init_file(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let record = args
        .downcast_ref::<&'static [u8]>()
        .copied()
        .ok_or(Error::BadArgument)?;
    CpioHeader::parse(record).ok_or(Error::BadArgument)?;
    res.set_state(Box::new(InitramfsFileState { record }));
    Ok(())
}

fn uninit_file(_res: &Resource) -> Result<()> {
    Ok(())
}

fn read_file(buffer: &mut [u8], file: &mut File, res: &Resource) -> usize {
    let Some(state) = res.state::<InitramfsFileState>() else {
        return 0;
    };
    let Some(header) = CpioHeader::parse(state.record) else {
        return 0;
    };

    let data_off = CPIO_HEADER_SIZE + header.padded_name_size();
    let size = header.file_size();
    let Some(data) = state.record.get(data_off..data_off + size) else {
        return 0;
    };

    // Short reads past the end come back zero-filled.
    let offset = file.offset.max(0) as usize;
    for (i, out) in buffer.iter_mut().enumerate() {
        *out = data.get(offset + i).copied().unwrap_or(0);
    }
    buffer.len()
}

fn stat_file(res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res
        .state::<InitramfsFileState>()
        .ok_or(Error::BadArgument)?;
    let header = CpioHeader::parse(state.record).ok_or(Error::BadArgument)?;
    header.fill_stat(stat);
    Ok(())
}

pub static INITRAMFS_FILE_DRIVER: DriverDef = DriverDef {
    init: init_file,
    uninit: uninit_file,
    read: read_file,
    stat: stat_file,
    ..DriverDef::empty("initramfs_file")
};

// The archive is flat; nothing ever instantiates a directory handle, but
// the group tables stay index-aligned.
pub static INITRAMFS_DIR_DRIVER: DriverDef = DriverDef::empty("initramfs_dir");
