// SPDX-License-Identifier: GPL-3.0-only

//! Queries about a single subvolume

use std::os::fd::OwnedFd;

use subvol_types::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID, BTRFS_SUPER_MAGIC,
    Subvolume,
};

use crate::driver::{Driver, FsStat};
use crate::error::{Disposition, Result, WalkError, disposition};
use crate::native::NativeDriver;
use crate::resolve::Location;

/// Inspects the subvolume containing a directory
#[derive(Debug)]
pub struct SubvolumeInspector<D: Driver = NativeDriver> {
    driver: D,
    handle: D::Handle,
    what: String,
    fs: FsStat,
}

impl SubvolumeInspector<NativeDriver> {
    /// Open `location` on the running system.
    pub fn new(location: impl Into<Location<OwnedFd>>) -> Result<Self> {
        Self::with_driver(NativeDriver::new(), location.into())
    }
}

impl<D: Driver> SubvolumeInspector<D> {
    pub fn with_driver(driver: D, location: Location<D::Handle>) -> Result<Self> {
        let (handle, what) = match location {
            Location::Path(path) => {
                let what = path.display().to_string();
                let handle = driver
                    .open(None, &path)
                    .map_err(|errno| location_error(&what, "open", errno))?;
                (handle, what)
            }
            Location::Handle(handle) => (handle, "<handle>".to_string()),
        };

        let fs = driver
            .stat_filesystem(&handle)
            .map_err(|errno| location_error(&what, "statfs", errno))?;

        Ok(Self {
            driver,
            handle,
            what,
            fs,
        })
    }

    fn require_btrfs(&self) -> Result<()> {
        if self.fs.magic != BTRFS_SUPER_MAGIC {
            return Err(WalkError::NotBtrfs(self.what.clone()));
        }
        Ok(())
    }

    /// Whether the location is the root directory of a subvolume. Anything
    /// outside Btrfs is not.
    pub fn is_subvolume(&self) -> Result<bool> {
        if self.fs.magic != BTRFS_SUPER_MAGIC {
            return Ok(false);
        }
        let stat = self
            .driver
            .stat(&self.handle)
            .map_err(|errno| location_error(&self.what, "stat", errno))?;
        Ok(stat.is_dir && stat.ino == BTRFS_FIRST_FREE_OBJECTID)
    }

    /// Id of the subvolume containing the location.
    pub fn subvolume_id(&self) -> Result<u64> {
        self.require_btrfs()?;
        self.driver
            .subvolume_id(&self.handle)
            .map_err(|errno| location_error(&self.what, "subvolume id lookup", errno))
    }

    /// Path of subvolume `id` relative to the top-level subvolume, or of
    /// the containing subvolume when `id` is 0. Needs privilege.
    pub fn subvolume_path(&self, id: u64) -> Result<String> {
        let mut id = match id {
            0 => self.subvolume_id()?,
            id => {
                self.require_btrfs()?;
                check_id(id)?;
                id
            }
        };

        let mut components = Vec::new();
        while id != BTRFS_FS_TREE_OBJECTID {
            let backref = self
                .driver
                .query_backref(&self.handle, id)
                .map_err(|errno| lookup_error(id, "root tree search", errno))?
                .ok_or(WalkError::NoSuchSubvolume(id))?;

            let dir_path = self
                .driver
                .lookup_dir_path(&self.handle, backref.parent_id, backref.dir_id)
                .map_err(|errno| lookup_error(id, "inode lookup", errno))?;

            components.push(format!("{dir_path}{}", backref.name));
            id = backref.parent_id;
        }

        components.reverse();
        Ok(components.join("/"))
    }

    /// Metadata of subvolume `id`. With `id` 0 the location must be a
    /// subvolume root and no privilege is needed; any other id is read from
    /// the root tree.
    pub fn subvolume_info(&self, id: u64) -> Result<Subvolume> {
        self.require_btrfs()?;

        if id == 0 {
            if !self.is_subvolume()? {
                return Err(WalkError::NotSubvolume(self.what.clone()));
            }
            return self
                .driver
                .query_own_info(&self.handle)
                .map_err(|errno| location_error(&self.what, "subvolume info", errno));
        }

        check_id(id)?;
        self.driver
            .query_info(&self.handle, id)
            .map_err(|errno| lookup_error(id, "root tree search", errno))
    }

    /// Whether the subvolume the location is the root of is read-only.
    pub fn is_read_only(&self) -> Result<bool> {
        Ok(self.subvolume_info(0)?.is_read_only())
    }

    /// Ids of subvolumes that were deleted but whose space has not been
    /// reclaimed yet. Needs privilege.
    pub fn deleted_subvolumes(&self) -> Result<Vec<u64>> {
        self.require_btrfs()?;
        let mut ids = self
            .driver
            .query_deleted(&self.handle)
            .map_err(|errno| location_error(&self.what, "root tree search", errno))?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Id of the subvolume mounted when no `subvol` option is given. Needs
    /// privilege.
    pub fn default_subvolume(&self) -> Result<u64> {
        self.require_btrfs()?;
        self.driver
            .query_default(&self.handle)
            .map_err(|errno| match disposition(errno) {
                Disposition::Vanished => {
                    WalkError::NotFound(format!("default subvolume of {}", self.what))
                }
                _ => location_error(&self.what, "root tree search", errno),
            })
    }
}

fn check_id(id: u64) -> Result<()> {
    if id == BTRFS_FS_TREE_OBJECTID
        || (BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&id)
    {
        Ok(())
    } else {
        Err(WalkError::NoSuchSubvolume(id))
    }
}

fn location_error(what: &str, op: &'static str, errno: nix::errno::Errno) -> WalkError {
    match disposition(errno) {
        Disposition::Vanished => WalkError::NotFound(what.to_string()),
        Disposition::Denied => WalkError::PermissionDenied(what.to_string()),
        Disposition::Unsupported => WalkError::NotSupported(format!("{op} ({errno})")),
        Disposition::Fatal => WalkError::io(op, errno),
    }
}

fn lookup_error(id: u64, op: &'static str, errno: nix::errno::Errno) -> WalkError {
    match disposition(errno) {
        Disposition::Vanished => WalkError::NoSuchSubvolume(id),
        Disposition::Denied => WalkError::PermissionDenied(format!("subvolume {id}")),
        Disposition::Unsupported => WalkError::NotSupported(format!("{op} ({errno})")),
        Disposition::Fatal => WalkError::io(op, errno),
    }
}
