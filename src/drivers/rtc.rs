//! CMOS real-time-clock stub.
//!
//! Reads the CMOS clock registers and hands the caller a packed
//! [`RtcDateTime`]. Bound by ACPI HID hash like the UART; `read` fills the
//! caller's buffer with the current timestamp record.

use alloc::sync::Arc;
use core::any::Any;

use crate::error::Result;
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::File;

/// HID hash the firmware scan reports for PNP0B00 RTC devices.
pub const RTC_HID_HASH: u64 = 0x504E_5030_4230_3000;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RtcDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub pad: u8,
}

#[cfg(target_arch = "x86_64")]
fn cmos_read(reg: u8) -> u8 {
    use x86_64::instructions::port::Port;
    let mut index: Port<u8> = Port::new(0x70);
    let mut data: Port<u8> = Port::new(0x71);
    unsafe {
        // Keep NMI disabled while the index register is selected.
        index.write(reg | 0x80);
        data.read()
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn cmos_read(_reg: u8) -> u8 {
    0
}

fn bcd_to_bin(v: u8) -> u8 {
    (v & 0x0F) + ((v >> 4) * 10)
}

fn read_clock() -> RtcDateTime {
    // Wait out an in-progress update so the registers are stable.
    for _ in 0..1_000_000 {
        if cmos_read(0x0A) & 0x80 == 0 {
            break;
        }
    }

    let reg_b = cmos_read(0x0B);
    let bcd = reg_b & 0x04 == 0;
    let conv = |v: u8| if bcd { bcd_to_bin(v) } else { v };

    RtcDateTime {
        second: conv(cmos_read(0x00)),
        minute: conv(cmos_read(0x02)),
        hour: conv(cmos_read(0x04)),
        day: conv(cmos_read(0x07)),
        month: conv(cmos_read(0x08)),
        year: 2000 + conv(cmos_read(0x09)) as u16,
        pad: 0,
    }
}

fn init_rtc(_res: &Arc<Resource>, _args: &dyn Any) -> Result<()> {
    Ok(())
}

fn read_rtc(buffer: &mut [u8], _file: &mut File, _res: &Resource) -> usize {
    let now = read_clock();
    let raw = unsafe {
        core::slice::from_raw_parts(
            &now as *const RtcDateTime as *const u8,
            core::mem::size_of::<RtcDateTime>(),
        )
    };
    let n = buffer.len().min(raw.len());
    buffer[..n].copy_from_slice(&raw[..n]);
    n
}

fn stat_rtc(_res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    stat.st_mode = 0x2000 | 0o444;
    stat.st_size = core::mem::size_of::<RtcDateTime>() as u64;
    Ok(())
}

pub static RTC_DRIVER: DriverDef = DriverDef {
    init: init_rtc,
    read: read_rtc,
    stat: stat_rtc,
    acpi_codes: &[RTC_HID_HASH],
    ..DriverDef::empty("rtc")
};
