//! Resource registry: polymorphic driver tables and their instances.
//!
//! A driver is a record of plain function pointers ([`DriverDef`]) declared
//! in a static per-group table. A [`Resource`] is one instance of a driver:
//! a monotonic id, a reference into the table, and an owned opaque state the
//! driver attaches during `init`. PCI and ACPI discovery resolve drivers by
//! scanning each definition's match codes.
//!
//! No vtable entry is ever absent: operations a driver does not implement
//! point at the shared no-op stubs, so dispatch never has to null-check.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use crate::error::{Error, Result};
use crate::vfs::{File, NodeType};
use crate::{drivers, fs};

// =============================================================================
// Driver contract
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverGroup {
    FsSuper,
    FsDir,
    FsFile,
    DevAcpi,
    DevPci,
    Dev,
}

/// File/dir/file-system driver tables keep one index per filesystem, shared
/// across the three groups.
pub const FS_INDEX_EXT2: usize = 0;
pub const FS_INDEX_INITRAMFS: usize = 1;
pub const FS_INDEX_BUFFER: usize = 2;

/// Indices into the plain device group.
pub const DEV_INDEX_NVME_NAMESPACE: usize = 0;
pub const DEV_INDEX_PARTITION: usize = 1;

/// Opaque, driver-owned per-resource state.
pub type DriverState = Box<dyn Any + Send + Sync>;

/// stat() output filled by driver `stat` entries.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u16,
    pub st_gid: u16,
    pub st_rdev: u64,
    pub st_size: u64,
    pub st_blksize: u64,
    pub st_blocks: u64,
    pub st_mtime: u64,
}

/// PCI configuration header as delivered by the host's bus scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct PciHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub header_type: u8,
    pub bar: [u32; 6],
    pub interrupt_line: u8,
}

/// One driver: function table plus discovery match codes.
#[derive(Clone, Copy)]
pub struct DriverDef {
    pub name: &'static str,
    pub init: fn(&Arc<Resource>, &dyn Any) -> Result<()>,
    pub uninit: fn(&Resource) -> Result<()>,
    pub read: fn(&mut [u8], &mut File, &Resource) -> usize,
    pub write: fn(&[u8], &mut File, &Resource) -> usize,
    pub seek: fn(&mut File, &Resource) -> Result<()>,
    pub rename: fn(&str, &str, &Resource) -> Result<()>,
    pub stat: fn(&Resource, Option<&str>, &mut Stat) -> Result<()>,
    pub control: fn(&Resource, &[u8]) -> Option<Box<dyn Any + Send>>,
    pub create: fn(&Resource, &str, u32, NodeType) -> Result<()>,
    pub remove: fn(&Resource, &str) -> Result<()>,
    pub locate: fn(&Resource, &str) -> Option<Box<dyn Any + Send>>,
    pub pci_codes: &'static [u32],
    pub acpi_codes: &'static [u64],
}

impl DriverDef {
    /// All-stub definition; drivers spell out only what they implement.
    pub const fn empty(name: &'static str) -> DriverDef {
        DriverDef {
            name,
            init: stubs::init,
            uninit: stubs::uninit,
            read: stubs::read,
            write: stubs::write,
            seek: stubs::seek,
            rename: stubs::rename,
            stat: stubs::stat,
            control: stubs::control,
            create: stubs::create,
            remove: stubs::remove,
            locate: stubs::locate,
            pci_codes: &[],
            acpi_codes: &[],
        }
    }
}

/// Shared no-op driver entries.
pub mod stubs {
    use super::*;

    pub fn init(_res: &Arc<Resource>, _args: &dyn Any) -> Result<()> {
        Ok(())
    }

    pub fn uninit(_res: &Resource) -> Result<()> {
        Ok(())
    }

    pub fn read(_buf: &mut [u8], _file: &mut File, _res: &Resource) -> usize {
        0
    }

    pub fn write(_buf: &[u8], _file: &mut File, _res: &Resource) -> usize {
        0
    }

    pub fn seek(_file: &mut File, _res: &Resource) -> Result<()> {
        Ok(())
    }

    pub fn rename(_from: &str, _to: &str, _res: &Resource) -> Result<()> {
        Ok(())
    }

    pub fn stat(_res: &Resource, _name: Option<&str>, _stat: &mut Stat) -> Result<()> {
        Ok(())
    }

    pub fn control(_res: &Resource, _cmd: &[u8]) -> Option<Box<dyn Any + Send>> {
        None
    }

    pub fn create(_res: &Resource, _path: &str, _mode: u32, _kind: NodeType) -> Result<()> {
        Ok(())
    }

    pub fn remove(_res: &Resource, _path: &str) -> Result<()> {
        Ok(())
    }

    pub fn locate(_res: &Resource, _name: &str) -> Option<Box<dyn Any + Send>> {
        None
    }
}

// =============================================================================
// Driver tables
// =============================================================================

static FS_SUPER_TABLE: [&DriverDef; 3] = [
    &fs::ext2::superblock::EXT2_SUPER_DRIVER,
    &fs::initramfs::INITRAMFS_SUPER_DRIVER,
    &drivers::buffer::BUFFER_SUPER_DRIVER,
];

static FS_DIR_TABLE: [&DriverDef; 3] = [
    &fs::ext2::node::EXT2_DIR_DRIVER,
    &fs::initramfs::INITRAMFS_DIR_DRIVER,
    &drivers::buffer::BUFFER_DIR_DRIVER,
];

static FS_FILE_TABLE: [&DriverDef; 3] = [
    &fs::ext2::node::EXT2_FILE_DRIVER,
    &fs::initramfs::INITRAMFS_FILE_DRIVER,
    &drivers::buffer::BUFFER_FILE_DRIVER,
];

static DEV_ACPI_TABLE: [&DriverDef; 2] = [&drivers::rtc::RTC_DRIVER, &drivers::uart::UART_DRIVER];

static DEV_PCI_TABLE: [&DriverDef; 1] = [&drivers::nvme::NVME_DRIVER];

static DEV_TABLE: [&DriverDef; 2] = [
    &drivers::nvme::namespace::NAMESPACE_DRIVER,
    &drivers::partition::PARTITION_DRIVER,
];

fn group_table(group: DriverGroup) -> &'static [&'static DriverDef] {
    match group {
        DriverGroup::FsSuper => &FS_SUPER_TABLE,
        DriverGroup::FsDir => &FS_DIR_TABLE,
        DriverGroup::FsFile => &FS_FILE_TABLE,
        DriverGroup::DevAcpi => &DEV_ACPI_TABLE,
        DriverGroup::DevPci => &DEV_PCI_TABLE,
        DriverGroup::Dev => &DEV_TABLE,
    }
}

// =============================================================================
// Resources
// =============================================================================

pub struct Resource {
    pub id: u64,
    pub group: DriverGroup,
    pub index: usize,
    pub driver: &'static DriverDef,
    state: Once<DriverState>,
}

impl Resource {
    /// Attach the driver state; called exactly once from the driver's
    /// `init`.
    pub fn set_state(&self, state: DriverState) {
        self.state.call_once(|| state);
    }

    /// Borrow the driver state downcast to its concrete type.
    pub fn state<T: 'static>(&self) -> Option<&T> {
        self.state.get()?.downcast_ref::<T>()
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Instantiate driver `(group, index)`, handing `args` to its `init`. The
/// resource is dropped again if `init` fails.
pub fn init_resource(group: DriverGroup, index: usize, args: &dyn Any) -> Result<Arc<Resource>> {
    let table = group_table(group);
    let def = *table.get(index).ok_or(Error::BadArgument)?;

    let res = Arc::new(Resource {
        id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        group,
        index,
        driver: def,
        state: Once::new(),
    });

    kdebug!("resource: init {} ({:?} index {})", res.id, group, index);

    if let Err(err) = (def.init)(&res, args) {
        kerror!("resource: driver {} init failed: {:?}", def.name, err);
        return Err(err);
    }

    Ok(res)
}

fn find_code(group: DriverGroup, target: u64) -> Option<usize> {
    group_table(group).iter().position(|def| match group {
        DriverGroup::DevAcpi => def.acpi_codes.iter().any(|&c| c == target),
        _ => def.pci_codes.iter().any(|&c| c as u64 == target),
    })
}

/// Bind a scanned PCI function to the first driver whose codes carry its
/// `(vendor << 16) | device`.
pub fn init_pci_resource(header: &PciHeader) -> Result<Arc<Resource>> {
    if header.vendor_id == 0xFFFF && header.device_id == 0xFFFF {
        kwarn!("resource: skipping empty PCI function");
        return Err(Error::NoSuchResource);
    }

    let target = ((header.vendor_id as u32) << 16) | header.device_id as u32;
    let index = find_code(DriverGroup::DevPci, target as u64).ok_or(Error::NoSuchResource)?;

    kinfo!(
        "resource: PCI {:04x}:{:04x} matches driver index {}",
        header.vendor_id,
        header.device_id,
        index
    );

    init_resource(DriverGroup::DevPci, index, header)
}

/// Bind a firmware-enumerated device by its 64-bit HID hash.
pub fn init_acpi_resource(hid_hash: u64, args: &dyn Any) -> Result<Arc<Resource>> {
    if hid_hash == 0 {
        kwarn!("resource: skipping empty ACPI device");
        return Err(Error::NoSuchResource);
    }

    let index = find_code(DriverGroup::DevAcpi, hid_hash).ok_or(Error::NoSuchResource)?;
    init_resource(DriverGroup::DevAcpi, index, args)
}

/// Tear a resource down. The caller drops its `Arc` afterwards; the state
/// box goes with the resource.
pub fn uninit_resource(res: &Resource) -> Result<()> {
    kdebug!("resource: uninit {}", res.id);
    (res.driver.uninit)(res)
}
