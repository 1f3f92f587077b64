// SPDX-License-Identifier: GPL-3.0-only

//! [`Driver`] backed by the running kernel

mod ioctl;
mod items;

use std::ffi::OsStr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::dir::{Dir, Type};
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag, open, openat};
use nix::sys::stat::{FileStat, Mode, fstat, fstatat};
use nix::sys::statfs::fstatfs;
use uuid::Uuid;

use subvol_types::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID,
    BTRFS_SUPER_MAGIC, FilesystemId, Subvolume,
};

use crate::driver::{DirEntry, Driver, EntryKind, FsStat, NodeStat, RootBackref, RootRef};
use ioctl::{
    BTRFS_DIR_ITEM_KEY, BTRFS_ORPHAN_ITEM_KEY, BTRFS_ORPHAN_OBJECTID, BTRFS_ROOT_BACKREF_KEY,
    BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_REF_KEY, BTRFS_ROOT_TREE_DIR_OBJECTID, SearchKey,
};
use items::{
    SearchItem, find_dir_item, parse_root_backref, parse_root_item, parse_root_ref, search_items,
    timestamp,
};

const DIR_FLAGS: OFlag = OFlag::O_RDONLY
    .union(OFlag::O_DIRECTORY)
    .union(OFlag::O_CLOEXEC);

/// Talks to Btrfs through ioctls on directory file descriptors
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDriver;

impl NativeDriver {
    pub fn new() -> Self {
        Self
    }
}

fn node_stat(stat: &FileStat) -> NodeStat {
    NodeStat {
        dev: stat.st_dev,
        ino: stat.st_ino,
        is_dir: stat.st_mode & libc::S_IFMT == libc::S_IFDIR,
    }
}

fn check_subvolume_id(id: u64) -> nix::Result<()> {
    if (id < BTRFS_FIRST_FREE_OBJECTID && id != BTRFS_FS_TREE_OBJECTID)
        || id > BTRFS_LAST_FREE_OBJECTID
    {
        return Err(Errno::ENOENT);
    }
    Ok(())
}

/// Run a root tree search to the end of `key`'s range, handing every item
/// of the requested type to `visit`.
fn search_root_tree(
    fd: BorrowedFd<'_>,
    mut key: SearchKey,
    mut visit: impl FnMut(&SearchItem<'_>),
) -> nix::Result<()> {
    let item_type = key.min_type;

    loop {
        key.nr_items = 4096;
        let buf = ioctl::tree_search(fd, &mut key)?;
        let items = search_items(&buf, key.nr_items);
        let Some(last) = items.last() else {
            break;
        };

        for item in items.iter().filter(|item| item.item_type == item_type) {
            visit(item);
        }

        if !key.resume_after(last.objectid, last.item_type, last.offset) {
            break;
        }
    }

    Ok(())
}

impl Driver for NativeDriver {
    type Handle = OwnedFd;

    fn open(&self, base: Option<&OwnedFd>, path: &Path) -> nix::Result<OwnedFd> {
        match base {
            Some(base) => openat(base.as_fd(), path, DIR_FLAGS, Mode::empty()),
            None => open(path, DIR_FLAGS, Mode::empty()),
        }
    }

    fn stat(&self, handle: &OwnedFd) -> nix::Result<NodeStat> {
        fstat(handle.as_fd()).map(|stat| node_stat(&stat))
    }

    fn stat_at(&self, dir: &OwnedFd, name: &OsStr) -> nix::Result<NodeStat> {
        fstatat(dir.as_fd(), name, AtFlags::AT_SYMLINK_NOFOLLOW).map(|stat| node_stat(&stat))
    }

    fn read_dir(&self, dir: &OwnedFd) -> nix::Result<Vec<DirEntry>> {
        // A fresh descriptor, so the caller's handle keeps its own offset.
        let mut listing = Dir::openat(dir.as_fd(), ".", DIR_FLAGS, Mode::empty())?;
        let mut entries = Vec::new();

        for entry in listing.iter() {
            let entry = entry?;
            let name = entry.file_name().to_bytes();
            if name == b"." || name == b".." {
                continue;
            }

            let kind = match entry.file_type() {
                Some(Type::Directory) => EntryKind::Dir,
                Some(_) => EntryKind::Other,
                None => EntryKind::Unknown,
            };

            entries.push(DirEntry {
                name: OsStr::from_bytes(name).to_os_string(),
                ino: entry.ino(),
                kind,
            });
        }

        Ok(entries)
    }

    fn stat_filesystem(&self, handle: &OwnedFd) -> nix::Result<FsStat> {
        let statfs = fstatfs(handle.as_fd())?;
        let magic = statfs.filesystem_type().0 as i64;

        let fsid = if magic == BTRFS_SUPER_MAGIC {
            let bytes = ioctl::fs_info_fsid(handle.as_fd())?;
            Some(FilesystemId(Uuid::from_bytes(bytes)))
        } else {
            None
        };

        Ok(FsStat { magic, fsid })
    }

    fn subvolume_id(&self, handle: &OwnedFd) -> nix::Result<u64> {
        ioctl::ino_lookup(handle.as_fd(), 0, BTRFS_FIRST_FREE_OBJECTID).map(|(tree_id, _)| tree_id)
    }

    fn query_children(&self, handle: &OwnedFd, id: u64) -> nix::Result<Vec<RootRef>> {
        let mut refs = Vec::new();
        search_root_tree(
            handle.as_fd(),
            SearchKey::root_tree(id, BTRFS_ROOT_REF_KEY),
            |item| refs.extend(parse_root_ref(item)),
        )?;
        Ok(refs)
    }

    fn query_root_refs(&self, handle: &OwnedFd) -> nix::Result<Vec<RootRef>> {
        let mut refs = Vec::new();
        search_root_tree(
            handle.as_fd(),
            SearchKey::root_tree_range(
                BTRFS_FS_TREE_OBJECTID,
                BTRFS_LAST_FREE_OBJECTID,
                BTRFS_ROOT_REF_KEY,
            ),
            |item| refs.extend(parse_root_ref(item)),
        )?;
        Ok(refs)
    }

    fn lookup_dir_path(&self, handle: &OwnedFd, tree_id: u64, dir_id: u64) -> nix::Result<String> {
        ioctl::ino_lookup(handle.as_fd(), tree_id, dir_id).map(|(_, path)| path)
    }

    fn query_info(&self, handle: &OwnedFd, id: u64) -> nix::Result<Subvolume> {
        check_subvolume_id(id)?;

        let mut key = SearchKey::root_tree(id, BTRFS_ROOT_ITEM_KEY);
        key.nr_items = 1;
        let buf = ioctl::tree_search(handle.as_fd(), &mut key)?;
        let items = search_items(&buf, key.nr_items);
        let item = items.first().ok_or(Errno::ENOENT)?;

        let mut subvol = parse_root_item(id, item.data);
        if let Some(backref) = self.query_backref(handle, id)? {
            subvol.parent_id = backref.parent_id;
            subvol.dir_id = backref.dir_id;
        }

        Ok(subvol)
    }

    fn query_backref(&self, handle: &OwnedFd, id: u64) -> nix::Result<Option<RootBackref>> {
        if id == BTRFS_FS_TREE_OBJECTID {
            return Ok(None);
        }

        let mut key = SearchKey::root_tree(id, BTRFS_ROOT_BACKREF_KEY);
        key.nr_items = 1;
        let buf = ioctl::tree_search(handle.as_fd(), &mut key)?;

        Ok(search_items(&buf, key.nr_items)
            .first()
            .and_then(parse_root_backref))
    }

    fn query_own_info(&self, handle: &OwnedFd) -> nix::Result<Subvolume> {
        let args = ioctl::get_subvol_info(handle.as_fd())?;

        Ok(Subvolume {
            id: args.treeid,
            parent_id: args.parent_id,
            dir_id: args.dirid,
            flags: args.flags,
            uuid: Uuid::from_bytes(args.uuid),
            parent_uuid: Uuid::from_bytes(args.parent_uuid),
            received_uuid: Uuid::from_bytes(args.received_uuid),
            generation: args.generation,
            ctransid: args.ctransid,
            otransid: args.otransid,
            stransid: args.stransid,
            rtransid: args.rtransid,
            ctime: timestamp(args.ctime.sec, args.ctime.nsec),
            otime: timestamp(args.otime.sec, args.otime.nsec),
            stime: timestamp(args.stime.sec, args.stime.nsec),
            rtime: timestamp(args.rtime.sec, args.rtime.nsec),
        })
    }

    fn query_deleted(&self, handle: &OwnedFd) -> nix::Result<Vec<u64>> {
        // Orphan items of the root tree are keyed on the dead tree's id.
        let mut ids = Vec::new();
        search_root_tree(
            handle.as_fd(),
            SearchKey::root_tree(BTRFS_ORPHAN_OBJECTID, BTRFS_ORPHAN_ITEM_KEY),
            |item| ids.push(item.offset),
        )?;
        Ok(ids)
    }

    fn query_default(&self, handle: &OwnedFd) -> nix::Result<u64> {
        let mut found = None;
        search_root_tree(
            handle.as_fd(),
            SearchKey::root_tree(BTRFS_ROOT_TREE_DIR_OBJECTID, BTRFS_DIR_ITEM_KEY),
            |item| {
                if found.is_none() {
                    found = find_dir_item(item.data, b"default");
                }
            },
        )?;
        found.ok_or(Errno::ENOENT)
    }
}
