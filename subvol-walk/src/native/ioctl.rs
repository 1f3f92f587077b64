// SPDX-License-Identifier: GPL-3.0-only

//! Raw Btrfs ioctls
//!
//! Layouts follow `linux/btrfs.h`. Request numbers are encoded by hand the
//! way `_IOR`/`_IOWR` do it.

use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;

const BTRFS_IOCTL_MAGIC: libc::c_ulong = 0x94;

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (BTRFS_IOCTL_MAGIC << 8) | nr
}

// linux/btrfs.h: BTRFS_IOC_TREE_SEARCH = _IOWR(0x94, 17, struct btrfs_ioctl_search_args)
const BTRFS_IOC_TREE_SEARCH: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 17, size_of::<SearchArgs>());
// _IOWR(0x94, 18, struct btrfs_ioctl_ino_lookup_args)
const BTRFS_IOC_INO_LOOKUP: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 18, size_of::<InoLookupArgs>());
// _IOR(0x94, 31, struct btrfs_ioctl_fs_info_args)
const BTRFS_IOC_FS_INFO: libc::c_ulong = ioc(IOC_READ, 31, size_of::<FsInfoArgs>());
// _IOR(0x94, 60, struct btrfs_ioctl_get_subvol_info_args)
const BTRFS_IOC_GET_SUBVOL_INFO: libc::c_ulong = ioc(IOC_READ, 60, size_of::<GetSubvolInfoArgs>());

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_ORPHAN_OBJECTID: u64 = -5i64 as u64;

pub const BTRFS_ORPHAN_ITEM_KEY: u32 = 48;
pub const BTRFS_DIR_ITEM_KEY: u32 = 84;
pub const BTRFS_ROOT_ITEM_KEY: u32 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u32 = 144;
pub const BTRFS_ROOT_REF_KEY: u32 = 156;

const SEARCH_BUF_SIZE: usize = 4096 - size_of::<SearchKey>();
const INO_LOOKUP_PATH_MAX: usize = 4080;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

impl SearchKey {
    /// Every item of `item_type` keyed on `objectid` in the root tree.
    pub fn root_tree(objectid: u64, item_type: u32) -> Self {
        Self::root_tree_range(objectid, objectid, item_type)
    }

    /// Items of `item_type` keyed on any objectid in `min..=max`. The kernel
    /// compares whole keys, so other item types between the bounds come back
    /// too and have to be filtered out.
    pub fn root_tree_range(min_objectid: u64, max_objectid: u64, item_type: u32) -> Self {
        Self {
            tree_id: BTRFS_ROOT_TREE_OBJECTID,
            min_objectid,
            max_objectid,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: item_type,
            max_type: item_type,
            ..Self::default()
        }
    }

    /// Move the lower bound just past the key `(objectid, item_type, offset)`.
    /// Returns false once nothing can follow it.
    pub fn resume_after(&mut self, objectid: u64, item_type: u32, offset: u64) -> bool {
        if offset < u64::MAX {
            self.min_objectid = objectid;
            self.min_type = item_type;
            self.min_offset = offset + 1;
        } else if item_type < u32::from(u8::MAX) {
            self.min_objectid = objectid;
            self.min_type = item_type + 1;
            self.min_offset = 0;
        } else if objectid < self.max_objectid {
            self.min_objectid = objectid + 1;
            self.min_type = 0;
            self.min_offset = 0;
        } else {
            return false;
        }
        true
    }
}

#[repr(C)]
struct SearchArgs {
    key: SearchKey,
    buf: [u8; SEARCH_BUF_SIZE],
}

#[repr(C)]
struct InoLookupArgs {
    treeid: u64,
    objectid: u64,
    name: [u8; INO_LOOKUP_PATH_MAX],
}

#[repr(C)]
struct FsInfoArgs {
    max_id: u64,
    num_devices: u64,
    fsid: [u8; 16],
    rest: [u8; 1024 - 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IoctlTimespec {
    pub sec: u64,
    pub nsec: u32,
}

#[repr(C)]
pub struct GetSubvolInfoArgs {
    pub treeid: u64,
    pub name: [u8; 256],
    pub parent_id: u64,
    pub dirid: u64,
    pub generation: u64,
    pub flags: u64,
    pub uuid: [u8; 16],
    pub parent_uuid: [u8; 16],
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: IoctlTimespec,
    pub otime: IoctlTimespec,
    pub stime: IoctlTimespec,
    pub rtime: IoctlTimespec,
    reserved: [u64; 8],
}

const _: () = assert!(size_of::<SearchKey>() == 104);
const _: () = assert!(size_of::<SearchArgs>() == 4096);
const _: () = assert!(size_of::<InoLookupArgs>() == 4096);
const _: () = assert!(size_of::<FsInfoArgs>() == 1024);
const _: () = assert!(size_of::<GetSubvolInfoArgs>() == 504);

/// Run one `BTRFS_IOC_TREE_SEARCH` batch.
///
/// On return `key.nr_items` holds the number of items in the returned
/// buffer, which is a sequence of search headers each followed by its item.
pub fn tree_search(fd: BorrowedFd<'_>, key: &mut SearchKey) -> nix::Result<Vec<u8>> {
    // SAFETY: SearchArgs is plain integers, all-zero is a valid value.
    let mut args: Box<SearchArgs> = Box::new(unsafe { std::mem::zeroed() });
    args.key = *key;

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), BTRFS_IOC_TREE_SEARCH, &raw mut *args) };
    Errno::result(ret)?;

    *key = args.key;
    Ok(args.buf.to_vec())
}

/// `BTRFS_IOC_INO_LOOKUP`. With `tree_id == 0` this resolves the tree
/// containing `fd` and needs no privilege when `objectid` is 256.
pub fn ino_lookup(fd: BorrowedFd<'_>, tree_id: u64, objectid: u64) -> nix::Result<(u64, String)> {
    // SAFETY: plain integers and bytes.
    let mut args: Box<InoLookupArgs> = Box::new(unsafe { std::mem::zeroed() });
    args.treeid = tree_id;
    args.objectid = objectid;

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), BTRFS_IOC_INO_LOOKUP, &raw mut *args) };
    Errno::result(ret)?;

    Ok((args.treeid, c_bytes_to_string(&args.name)))
}

pub fn fs_info_fsid(fd: BorrowedFd<'_>) -> nix::Result<[u8; 16]> {
    // SAFETY: plain integers and bytes.
    let mut args: Box<FsInfoArgs> = Box::new(unsafe { std::mem::zeroed() });

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), BTRFS_IOC_FS_INFO, &raw mut *args) };
    Errno::result(ret)?;

    Ok(args.fsid)
}

pub fn get_subvol_info(fd: BorrowedFd<'_>) -> nix::Result<Box<GetSubvolInfoArgs>> {
    // SAFETY: plain integers and bytes.
    let mut args: Box<GetSubvolInfoArgs> = Box::new(unsafe { std::mem::zeroed() });

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), BTRFS_IOC_GET_SUBVOL_INFO, &raw mut *args) };
    Errno::result(ret)?;

    Ok(args)
}

fn c_bytes_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
