// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use subvol_types::{BTRFS_FIRST_FREE_OBJECTID, BTRFS_SUPER_MAGIC, FilesystemId};

use crate::driver::Driver;
use crate::error::{Disposition, Result, WalkError, disposition};

/// Where a walk starts
#[derive(Debug)]
pub enum Location<H> {
    /// A path, relative to the working directory unless absolute. `"."` is
    /// the working directory itself.
    Path(PathBuf),
    /// An open directory. The walk takes ownership of it.
    Handle(H),
}

impl<H> From<PathBuf> for Location<H> {
    fn from(path: PathBuf) -> Self {
        Location::Path(path)
    }
}

impl<H> From<&std::path::Path> for Location<H> {
    fn from(path: &std::path::Path) -> Self {
        Location::Path(path.to_path_buf())
    }
}

impl<H> From<&str> for Location<H> {
    fn from(path: &str) -> Self {
        Location::Path(PathBuf::from(path))
    }
}

/// A starting location resolved to its filesystem and subvolume
#[derive(Debug)]
pub struct Resolved<H> {
    pub handle: H,
    pub subvolume_id: u64,
    pub filesystem: FilesystemId,
    /// Whether the location is the root directory of its subvolume.
    pub is_subvolume_root: bool,
}

fn describe<H>(location: &Location<H>) -> String {
    match location {
        Location::Path(path) => path.display().to_string(),
        Location::Handle(_) => "<handle>".to_string(),
    }
}

/// Open `location` and identify it. Any failure here is fatal to the walk.
pub fn resolve<D: Driver>(driver: &D, location: Location<D::Handle>) -> Result<Resolved<D::Handle>> {
    let what = describe(&location);
    let root_error = |op: &'static str, errno| match disposition(errno) {
        Disposition::Vanished => WalkError::NotFound(what.clone()),
        Disposition::Denied => WalkError::PermissionDenied(what.clone()),
        Disposition::Unsupported | Disposition::Fatal => WalkError::io(op, errno),
    };

    let handle = match location {
        Location::Path(path) => driver
            .open(None, &path)
            .map_err(|errno| root_error("open", errno))?,
        Location::Handle(handle) => handle,
    };

    let fs = driver
        .stat_filesystem(&handle)
        .map_err(|errno| root_error("statfs", errno))?;
    let filesystem = match fs.fsid {
        Some(fsid) if fs.magic == BTRFS_SUPER_MAGIC => fsid,
        _ => return Err(WalkError::NotBtrfs(what.clone())),
    };

    let subvolume_id = driver
        .subvolume_id(&handle)
        .map_err(|errno| root_error("subvolume id lookup", errno))?;
    let stat = driver
        .stat(&handle)
        .map_err(|errno| root_error("stat", errno))?;

    tracing::debug!("Resolved {what} to subvolume {subvolume_id} on {filesystem}");

    Ok(Resolved {
        handle,
        subvolume_id,
        filesystem,
        is_subvolume_root: stat.is_dir && stat.ino == BTRFS_FIRST_FREE_OBJECTID,
    })
}
