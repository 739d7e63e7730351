//! The full layering: controller → namespace → partition → ext2.

mod common;

use common::*;

use vesta_storage::resource;
use vesta_storage::vfs::{self, Whence};

const START_LBA: u64 = 2048;
const LBA_SIZE: usize = 512;

fn read_at(path: &str, offset: i64, len: usize) -> Vec<u8> {
    let mut file = vfs::open(path, 0).unwrap();
    vfs::seek(&mut file, offset, Whence::Set).unwrap();
    let mut buf = vec![0u8; len];
    let n = vfs::read(&mut buf, &mut file);
    buf.truncate(n);
    vfs::close(file);
    buf
}

#[test]
fn partition_shift_and_filesystem_over_nvme() {
    setup();

    let issue = pattern(3000, 50);
    let nested = pattern(14 * 1024, 51);
    let img = build_ext2(1024, 1100, &[("etc/issue", &issue[..]), ("kernel", &nested[..])]);

    let total_lbas = START_LBA + (img.bytes.len() / LBA_SIZE) as u64 + 64;
    let disk = mbr_disk(&img.bytes, START_LBA, LBA_SIZE, total_lbas);

    let mut cfg = MockConfig::nvm();
    cfg.cntlid = 2;
    cfg.namespaces = vec![MockNamespace::new(1, LBA_SIZE, disk)];
    let mock = MockController::new(cfg);
    resource::init_pci_resource(&mock.pci_header()).unwrap();

    // The scan published the partition beside the drive.
    let part_stat = vfs::stat("/dev/nvme2n1p1").unwrap();
    assert_eq!(part_stat.st_blksize, LBA_SIZE as u64);
    assert_eq!(
        part_stat.st_blocks,
        (img.bytes.len() / LBA_SIZE) as u64
    );

    // Partition shift invariant: n bytes at offset o of the partition are
    // the n bytes at o + start_lba * lba_size of the drive.
    for &(o, n) in &[(0i64, 4096usize), (12345, 700), (1024, 1024)] {
        let from_part = read_at("/dev/nvme2n1p1", o, n);
        let from_drive = read_at("/dev/nvme2n1", o + (START_LBA * LBA_SIZE as u64) as i64, n);
        assert_eq!(from_part, from_drive, "window at {}", o);
    }

    // And the filesystem mounts straight off the partition.
    mount_ext2("/dev/nvme2n1p1", "/mnt");

    assert_eq!(read_at("/mnt/etc/issue", 0, issue.len()), issue);
    assert_eq!(read_at("/mnt/kernel", 0, nested.len()), nested);

    let st = vfs::stat("/mnt/etc/issue").unwrap();
    assert_eq!(st.st_size, issue.len() as u64);

    // Write through every layer and read it back.
    let payload = pattern(2500, 99);
    let mut file = vfs::open("/mnt/kernel", 0).unwrap();
    vfs::seek(&mut file, 700, Whence::Set).unwrap();
    assert_eq!(vfs::write(&payload, &mut file), payload.len());
    vfs::close(file);

    let mut expected = nested.clone();
    expected[700..3200].copy_from_slice(&payload);
    assert_eq!(read_at("/mnt/kernel", 0, expected.len()), expected);

    // The bytes really reached the mock controller's disk.
    let disk_now = mock.disk_snapshot(1);
    let issue_again = read_at("/mnt/etc/issue", 0, issue.len());
    assert_eq!(issue_again, issue);
    assert_ne!(disk_now.len(), 0);
}
