//! 16550 UART character-device stub.
//!
//! Wraps `uart_16550::SerialPort` behind the driver contract so a console
//! exists in the registry. Bound by ACPI HID hash; the init argument is the
//! port base.

use alloc::sync::Arc;
use core::any::Any;

use spin::Mutex;
use uart_16550::SerialPort;

use crate::error::Result;
use crate::resource::{DriverDef, Resource, Stat};
use crate::vfs::File;

/// HID hash the firmware scan reports for PNP0501 serial ports.
pub const UART_HID_HASH: u64 = 0x504E_5030_3530_3100;

pub const DEFAULT_PORT_BASE: u16 = 0x3F8;

struct UartState {
    port: Mutex<SerialPort>,
}

fn init_uart(res: &Arc<Resource>, args: &dyn Any) -> Result<()> {
    let base = args
        .downcast_ref::<u16>()
        .copied()
        .unwrap_or(DEFAULT_PORT_BASE);

    let mut port = unsafe { SerialPort::new(base) };
    port.init();

    res.set_state(alloc::boxed::Box::new(UartState {
        port: Mutex::new(port),
    }));
    Ok(())
}

fn uninit_uart(_res: &Resource) -> Result<()> {
    Ok(())
}

fn write_uart(buffer: &[u8], _file: &mut File, res: &Resource) -> usize {
    let Some(state) = res.state::<UartState>() else {
        return 0;
    };
    let mut port = state.port.lock();
    for &byte in buffer {
        port.send(byte);
    }
    buffer.len()
}

fn stat_uart(_res: &Resource, _name: Option<&str>, stat: &mut Stat) -> Result<()> {
    stat.st_mode = 0x2000 | 0o622;
    Ok(())
}

pub static UART_DRIVER: DriverDef = DriverDef {
    init: init_uart,
    uninit: uninit_uart,
    write: write_uart,
    stat: stat_uart,
    acpi_codes: &[UART_HID_HASH],
    ..DriverDef::empty("uart")
};
