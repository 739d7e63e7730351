//! RAM-backed file driver.
//!
//! A fixed-size in-memory buffer exposed through the standard driver
//! contract, handy for scratch files the VFS hands out before any real
//! storage exists. The directory and super entries exist only to keep the
//! filesystem group tables index-aligned.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::any::Any;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::File;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

struct BufferState {
    data: Mutex<Vec<u8>>,
}

fn init_buffer(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let size = args
        .downcast_ref::<usize>()
        .copied()
        .unwrap_or(DEFAULT_BUFFER_SIZE);

    res.set_state(alloc::boxed::Box::new(BufferState {
        data: Mutex::new(vec![0u8; size]),
    }));
    Ok(())
}

fn uninit_buffer(_res: &Resource) -> Result<()> {
    Ok(())
}

fn clamp(len: usize, offset: i64, wanted: usize) -> usize {
    if offset < 0 || offset as usize >= len {
        return 0;
    }
    wanted.min(len - offset as usize)
}

fn read_buffer(buffer: &mut [u8], file: &mut File, res: &Resource) -> usize {
    let Some(state) = res.state::<BufferState>() else {
        return 0;
    };
    let data = state.data.lock();
    let given = clamp(data.len(), file.offset, buffer.len());
    if given > 0 {
        let start = file.offset as usize;
        buffer[..given].copy_from_slice(&data[start..start + given]);
    }
    given
}

fn write_buffer(buffer: &[u8], file: &mut File, res: &Resource) -> usize {
    let Some(state) = res.state::<BufferState>() else {
        return 0;
    };
    let mut data = state.data.lock();
    let given = clamp(data.len(), file.offset, buffer.len());
    if given > 0 {
        let start = file.offset as usize;
        data[start..start + given].copy_from_slice(&buffer[..given]);
    }
    given
}

fn stat_buffer(res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    let state = res.state::<BufferState>().ok_or(Error::BadArgument)?;
    stat.st_size = state.data.lock().len() as u64;
    stat.st_mode = 0x8000 | 0o600;
    Ok(())
}

pub static BUFFER_FILE_DRIVER: DriverDef = DriverDef {
    init: init_buffer,
    uninit: uninit_buffer,
    read: read_buffer,
    write: write_buffer,
    stat: stat_buffer,
    ..DriverDef::empty("buffer")
};

// Placeholders keeping the per-filesystem index shared across the three
// filesystem groups.
pub static BUFFER_DIR_DRIVER: DriverDef = DriverDef::empty("buffer_dir");
pub static BUFFER_SUPER_DRIVER: DriverDef = DriverDef::empty("buffer_super");
