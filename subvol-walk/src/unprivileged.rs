// SPDX-License-Identifier: GPL-3.0-only

//! Discovery by walking directories and spotting subvolume boundaries
//!
//! Only subvolumes reachable through directories the caller can read are
//! found. A directory is a boundary when it lives on a different device than
//! its parent; it is reported as a subvolume only after it has been opened and
//! confirmed to be the root of a subvolume of the same filesystem, hanging off
//! the expected parent.

use std::path::Path;

use subvol_types::{BTRFS_FIRST_FREE_OBJECTID, BTRFS_SUPER_MAGIC, FilesystemId};

use crate::driver::{DirEntry, Driver, EntryKind, NodeStat, join_relative};
use crate::error::{Disposition, Result, WalkError, disposition};
use crate::walk::Child;

/// Races and denials skip the entry, anything else ends the walk.
fn skip_or_fail(op: &'static str, errno: nix::errno::Errno) -> Result<()> {
    match disposition(errno) {
        Disposition::Vanished | Disposition::Denied => Ok(()),
        Disposition::Unsupported | Disposition::Fatal => Err(WalkError::io(op, errno)),
    }
}

/// A directory being listed, below the subvolume root
struct Frame<H> {
    /// `None` for the subvolume root itself, which the caller holds.
    handle: Option<H>,
    rel: String,
    ino: u64,
    entries: std::vec::IntoIter<DirEntry>,
}

/// Open and list the directory `entry` of `dir`, provided it is still the
/// directory `seen` describes.
fn descend<D: Driver>(
    driver: &D,
    dir: &D::Handle,
    entry: &DirEntry,
    rel: String,
    seen: NodeStat,
) -> Result<Option<Frame<D::Handle>>> {
    let handle = match driver.open(Some(dir), Path::new(&entry.name)) {
        Ok(handle) => handle,
        Err(errno) => {
            skip_or_fail("open", errno)?;
            tracing::debug!("Skipping unreachable directory {rel} ({errno})");
            return Ok(None);
        }
    };

    match driver.stat(&handle) {
        Ok(stat) if stat == seen => {}
        Ok(_) => {
            tracing::debug!("Directory {rel} was replaced while being listed");
            return Ok(None);
        }
        Err(errno) => {
            skip_or_fail("stat", errno)?;
            return Ok(None);
        }
    }

    let entries = match driver.read_dir(&handle) {
        Ok(entries) => entries,
        Err(errno) => {
            skip_or_fail("readdir", errno)?;
            tracing::debug!("Skipping unreadable directory {rel} ({errno})");
            return Ok(None);
        }
    };

    Ok(Some(Frame {
        handle: Some(handle),
        rel,
        ino: seen.ino,
        entries: entries.into_iter(),
    }))
}

#[derive(Debug)]
pub(crate) struct TreeWalker {
    filesystem: FilesystemId,
    /// Drop boundaries whose linkage cannot be checked instead of reporting
    /// them unverified.
    require_identity: bool,
    warned_unverified: bool,
}

impl TreeWalker {
    pub(crate) fn new(filesystem: FilesystemId, require_identity: bool) -> Self {
        Self {
            filesystem,
            require_identity,
            warned_unverified: false,
        }
    }

    /// Children of subvolume `id`, found at `path` below `root`.
    pub(crate) fn children<D: Driver>(
        &mut self,
        driver: &D,
        root: &D::Handle,
        path: &str,
        id: u64,
    ) -> Result<Vec<Child>> {
        if path.is_empty() {
            let stat = driver.stat(root).map_err(|e| WalkError::io("stat", e))?;
            return self.scan(driver, root, id, stat);
        }

        let subvol = match driver.open(Some(root), Path::new(path)) {
            Ok(handle) => handle,
            Err(errno) => {
                skip_or_fail("open", errno)?;
                tracing::debug!("Subvolume {id} at {path} is no longer reachable");
                return Ok(Vec::new());
            }
        };

        // The path may have been taken over by something else since it was
        // reported.
        match driver.subvolume_id(&subvol) {
            Ok(found) if found == id => {}
            Ok(found) => {
                tracing::debug!("{path} now belongs to subvolume {found}, not {id}");
                return Ok(Vec::new());
            }
            Err(errno) => {
                skip_or_fail("subvolume id lookup", errno)?;
                return Ok(Vec::new());
            }
        }

        let stat = match driver.stat(&subvol) {
            Ok(stat) => stat,
            Err(errno) => {
                skip_or_fail("stat", errno)?;
                return Ok(Vec::new());
            }
        };

        self.scan(driver, &subvol, id, stat)
    }

    /// Walk the directories of one subvolume, stopping at boundaries.
    ///
    /// Directories are opened relative to their already open parent, so
    /// only the handles along the current branch are held.
    fn scan<D: Driver>(
        &mut self,
        driver: &D,
        subvol: &D::Handle,
        id: u64,
        subvol_stat: NodeStat,
    ) -> Result<Vec<Child>> {
        let mut children = Vec::new();
        let entries = match driver.read_dir(subvol) {
            Ok(entries) => entries,
            Err(errno) => {
                skip_or_fail("readdir", errno)?;
                tracing::debug!("Skipping unreadable subvolume {id} ({errno})");
                return Ok(children);
            }
        };
        let mut stack = vec![Frame {
            handle: None,
            rel: String::new(),
            ino: subvol_stat.ino,
            entries: entries.into_iter(),
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(entry) = frame.entries.next() else {
                stack.pop();
                continue;
            };
            if entry.kind == EntryKind::Other {
                continue;
            }
            let Some(name) = entry.name.to_str() else {
                tracing::debug!(
                    "Skipping non-UTF-8 name {:?} under {:?}",
                    entry.name,
                    frame.rel
                );
                continue;
            };

            let dir = frame.handle.as_ref().unwrap_or(subvol);
            let stat = match driver.stat_at(dir, &entry.name) {
                Ok(stat) => stat,
                Err(errno) => {
                    skip_or_fail("stat", errno)?;
                    continue;
                }
            };
            if !stat.is_dir {
                continue;
            }

            let child_path = join_relative(&frame.rel, name);
            if stat.dev == subvol_stat.dev {
                // Something is mounted over it from inside this subvolume.
                if entry.ino != stat.ino {
                    tracing::debug!("Not descending into mount point {child_path}");
                    continue;
                }
                if let Some(next) = descend(driver, dir, &entry, child_path, stat)? {
                    stack.push(next);
                }
                continue;
            }

            let dir_ino = frame.ino;
            if let Some(child_id) =
                self.identify(driver, dir, &entry, &child_path, stat, id, dir_ino)?
            {
                children.push(Child {
                    id: child_id,
                    name: child_path,
                });
            }
        }

        Ok(children)
    }

    /// Decide whether the boundary `entry` in `dir` is a child subvolume of
    /// `parent_id`. Returns its id when it is.
    #[allow(clippy::too_many_arguments)]
    fn identify<D: Driver>(
        &mut self,
        driver: &D,
        dir: &D::Handle,
        entry: &DirEntry,
        path: &str,
        seen: NodeStat,
        parent_id: u64,
        dir_ino: u64,
    ) -> Result<Option<u64>> {
        let child = match driver.open(Some(dir), Path::new(&entry.name)) {
            Ok(handle) => handle,
            Err(errno) => {
                skip_or_fail("open", errno)?;
                tracing::debug!("Boundary {path} is not accessible ({errno})");
                return Ok(None);
            }
        };

        match driver.stat(&child) {
            Ok(stat) if stat == seen => {}
            Ok(_) => {
                tracing::debug!("Boundary {path} was replaced while being inspected");
                return Ok(None);
            }
            Err(errno) => {
                skip_or_fail("stat", errno)?;
                return Ok(None);
            }
        }

        let fs = match driver.stat_filesystem(&child) {
            Ok(fs) => fs,
            Err(errno) => {
                if disposition(errno) != Disposition::Unsupported {
                    skip_or_fail("statfs", errno)?;
                }
                tracing::debug!("Cannot identify filesystem at {path} ({errno})");
                return Ok(None);
            }
        };
        if fs.magic != BTRFS_SUPER_MAGIC {
            tracing::debug!("{path} is a mount point of another filesystem");
            return Ok(None);
        }
        if fs.fsid != Some(self.filesystem) {
            tracing::debug!("{path} is a mount point of another Btrfs filesystem");
            return Ok(None);
        }
        if seen.ino != BTRFS_FIRST_FREE_OBJECTID {
            tracing::debug!("{path} is mounted from inside a subvolume, not its root");
            return Ok(None);
        }

        let child_id = match driver.subvolume_id(&child) {
            Ok(child_id) => child_id,
            Err(errno) => {
                skip_or_fail("subvolume id lookup", errno)?;
                return Ok(None);
            }
        };

        // The listing shows what lies underneath any mount. A subvolume's own
        // entry carries its tree id or its root inode number.
        if entry.ino != child_id && entry.ino != BTRFS_FIRST_FREE_OBJECTID {
            tracing::debug!("{path} is subvolume {child_id} mounted over inode {}", entry.ino);
            return Ok(None);
        }

        match driver.query_own_info(&child) {
            Ok(info) => {
                if info.id != child_id || info.parent_id != parent_id || info.dir_id != dir_ino {
                    tracing::debug!(
                        "{path} is subvolume {child_id} mounted from elsewhere (parent {}, dir {})",
                        info.parent_id,
                        info.dir_id
                    );
                    return Ok(None);
                }
                Ok(Some(child_id))
            }
            Err(errno) if disposition(errno) == Disposition::Unsupported => {
                if self.require_identity {
                    tracing::debug!("Cannot verify {path}, skipping it ({errno})");
                    return Ok(None);
                }
                if !self.warned_unverified {
                    self.warned_unverified = true;
                    tracing::warn!(
                        "Kernel cannot report subvolume linkage ({errno}); bind mounts of \
                         subvolumes may be reported as children"
                    );
                }
                Ok(Some(child_id))
            }
            Err(errno) => {
                skip_or_fail("subvolume info", errno)?;
                Ok(None)
            }
        }
    }
}
