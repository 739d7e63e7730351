//! Device-node and mount routing.
//!
//! Drivers publish themselves as paths (`/dev/nvme0`, `/dev/nvme0n1p1`);
//! filesystems are mounted on top of a published block device. Opening a
//! path inside a mount walks the filesystem's super/directory drivers
//! component by component: each step asks the current driver to `locate`
//! the name and hands the result to the next driver's `init` through the
//! resource registry.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::resource::{self, DriverGroup, Resource, Stat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    Device,
    RegularFile,
    Directory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Node creation descriptor, handed to [`create`] by drivers.
pub struct NodeInfo {
    pub kind: NodeType,
    pub mode: u32,
    pub resource: Arc<Resource>,
}

/// An open file: a cursor over a resource.
pub struct File {
    pub offset: i64,
    pub flags: u32,
    pub resource: Arc<Resource>,
}

struct Node {
    kind: NodeType,
    mode: u32,
    resource: Arc<Resource>,
}

struct Mount {
    point: String,
    fs_index: usize,
    super_res: Arc<Resource>,
}

static NODES: Mutex<BTreeMap<String, Node>> = Mutex::new(BTreeMap::new());
static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

pub fn init() {
    NODES.lock().clear();
    MOUNTS.lock().clear();
}

/// Publish a node. Drivers call this from `init` to expose the resource
/// they just built.
pub fn create(path: &str, info: NodeInfo) -> Result<()> {
    if path.is_empty() {
        return Err(Error::BadArgument);
    }
    kdebug!("vfs: create {} ({:?})", path, info.kind);
    NODES.lock().insert(
        path.to_string(),
        Node {
            kind: info.kind,
            mode: info.mode,
            resource: info.resource,
        },
    );
    Ok(())
}

/// Attach an initialized filesystem super resource at `point`.
pub fn mount(point: &str, super_res: Arc<Resource>) -> Result<()> {
    if super_res.group != DriverGroup::FsSuper {
        return Err(Error::BadArgument);
    }
    kinfo!("vfs: mounting {} at {}", super_res.driver.name, point);
    MOUNTS.lock().push(Mount {
        point: point.trim_end_matches('/').to_string(),
        fs_index: super_res.index,
        super_res,
    });
    Ok(())
}

fn find_mount(path: &str) -> Option<(Arc<Resource>, usize, String)> {
    let mounts = MOUNTS.lock();
    let mut best: Option<&Mount> = None;
    for m in mounts.iter() {
        let boundary = path == m.point
            || (path.starts_with(m.point.as_str()) && path.as_bytes().get(m.point.len()) == Some(&b'/'));
        if boundary && best.map_or(true, |b| m.point.len() > b.point.len()) {
            best = Some(m);
        }
    }
    best.map(|m| {
        let rel = path[m.point.len()..].trim_matches('/').to_string();
        (m.super_res.clone(), m.fs_index, rel)
    })
}

/// Walk `rel` inside a mount, returning the resource for its final
/// component. Flat filesystems (the initramfs archive) resolve the whole
/// remaining path in one `locate` on the super driver; otherwise the walk
/// goes component by component, and intermediate directory resources live
/// only for the walk.
fn resolve(super_res: &Arc<Resource>, fs_index: usize, rel: &str) -> Result<Arc<Resource>> {
    if let Some(args) = (super_res.driver.locate)(super_res, rel) {
        let mut stat = Stat::default();
        (super_res.driver.stat)(super_res, Some(rel), &mut stat)?;
        let group = if stat.st_mode & 0xF000 == 0x4000 {
            DriverGroup::FsDir
        } else {
            DriverGroup::FsFile
        };
        return resource::init_resource(group, fs_index, &*args);
    }

    let mut comps = rel.split('/').filter(|c| !c.is_empty()).peekable();
    if comps.peek().is_none() {
        return Err(Error::BadArgument);
    }

    let mut current = super_res.clone();
    loop {
        let name = match comps.next() {
            Some(n) => n,
            None => return Err(Error::NoSuchResource),
        };
        let last = comps.peek().is_none();

        let mut stat = Stat::default();
        (current.driver.stat)(&current, Some(name), &mut stat)?;
        let is_dir = stat.st_mode & 0xF000 == 0x4000;

        let args = (current.driver.locate)(&current, name).ok_or(Error::NoSuchResource)?;
        let group = if is_dir {
            DriverGroup::FsDir
        } else {
            DriverGroup::FsFile
        };
        let next = resource::init_resource(group, fs_index, &*args)?;

        if current.group != DriverGroup::FsSuper {
            let _ = resource::uninit_resource(&current);
        }

        if last {
            return Ok(next);
        }
        if !is_dir {
            let _ = resource::uninit_resource(&next);
            return Err(Error::NoSuchResource);
        }
        current = next;
    }
}

pub fn open(path: &str, flags: u32) -> Result<File> {
    if let Some(node) = NODES.lock().get(path) {
        return Ok(File {
            offset: 0,
            flags,
            resource: node.resource.clone(),
        });
    }

    if let Some((super_res, fs_index, rel)) = find_mount(path) {
        let res = resolve(&super_res, fs_index, &rel)?;
        return Ok(File {
            offset: 0,
            flags,
            resource: res,
        });
    }

    Err(Error::NoSuchResource)
}

/// Release an open file. Per-open filesystem resources created during path
/// resolution are torn down here; device nodes stay published.
pub fn close(file: File) {
    match file.resource.group {
        DriverGroup::FsFile | DriverGroup::FsDir => {
            let _ = resource::uninit_resource(&file.resource);
        }
        _ => {}
    }
}

pub fn read(buf: &mut [u8], file: &mut File) -> usize {
    let res = file.resource.clone();
    let n = (res.driver.read)(buf, file, &res);
    file.offset += n as i64;
    n
}

pub fn write(buf: &[u8], file: &mut File) -> usize {
    let res = file.resource.clone();
    let n = (res.driver.write)(buf, file, &res);
    file.offset += n as i64;
    n
}

pub fn seek(file: &mut File, offset: i64, whence: Whence) -> Result<i64> {
    let res = file.resource.clone();
    match whence {
        Whence::Set => file.offset = offset,
        Whence::Cur => file.offset += offset,
        Whence::End => {
            let mut stat = Stat::default();
            (res.driver.stat)(&res, None, &mut stat)?;
            file.offset = stat.st_size as i64 + offset;
        }
    }
    if file.offset < 0 {
        file.offset = 0;
        return Err(Error::BadArgument);
    }
    (res.driver.seek)(file, &res)?;
    Ok(file.offset)
}

pub fn stat(path: &str) -> Result<Stat> {
    let mut st = Stat::default();

    if let Some(node) = NODES.lock().get(path) {
        (node.resource.driver.stat)(&node.resource, None, &mut st)?;
        if st.st_mode == 0 {
            st.st_mode = node.mode
                | match node.kind {
                    NodeType::Device => 0x6000,
                    NodeType::RegularFile => 0x8000,
                    NodeType::Directory => 0x4000,
                };
        }
        return Ok(st);
    }

    if let Some((super_res, fs_index, rel)) = find_mount(path) {
        let mut comps: Vec<&str> = rel.split('/').filter(|c| !c.is_empty()).collect();
        let Some(name) = comps.pop() else {
            // Mount root.
            (super_res.driver.stat)(&super_res, None, &mut st)?;
            return Ok(st);
        };

        if comps.is_empty() {
            (super_res.driver.stat)(&super_res, Some(name), &mut st)?;
            return Ok(st);
        }

        // Flat filesystems answer for the whole remaining path directly.
        if (super_res.driver.stat)(&super_res, Some(rel.as_str()), &mut st).is_ok() {
            return Ok(st);
        }

        let parent_rel = comps.join("/");
        let dir = resolve(&super_res, fs_index, &parent_rel)?;
        let out = (dir.driver.stat)(&dir, Some(name), &mut st);
        let _ = resource::uninit_resource(&dir);
        out?;
        return Ok(st);
    }

    Err(Error::NoSuchResource)
}
