// SPDX-License-Identifier: GPL-3.0-only

//! Query primitives the walkers are built on
//!
//! Every primitive takes an explicit base handle; nothing here depends on the
//! process working directory except [`Driver::open`] with `base == None`,
//! which only the resolver uses for caller-supplied paths.

use std::ffi::OsString;
use std::path::Path;

use subvol_types::{FilesystemId, Subvolume};

/// Filesystem type and identity behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub magic: i64,
    /// Only known for Btrfs.
    pub fsid: Option<FilesystemId>,
}

/// The parts of `stat(2)` the walkers look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub dev: u64,
    pub ino: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    Other,
    /// The directory listing did not say (`DT_UNKNOWN`).
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: EntryKind,
}

/// A ROOT_REF record: `child_id` lives in directory `dir_id` of
/// `parent_id` under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRef {
    pub parent_id: u64,
    pub child_id: u64,
    pub dir_id: u64,
    pub name: String,
}

/// A ROOT_BACKREF record seen from the child side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBackref {
    pub parent_id: u64,
    pub dir_id: u64,
    pub name: String,
}

pub trait Driver {
    /// An open directory. Dropping it releases the underlying resource.
    type Handle: std::fmt::Debug;

    /// Open the directory `path` relative to `base`, or relative to the
    /// process working directory when `base` is `None`.
    fn open(&self, base: Option<&Self::Handle>, path: &Path) -> nix::Result<Self::Handle>;

    fn stat(&self, handle: &Self::Handle) -> nix::Result<NodeStat>;

    /// Stat `name` inside `dir` without following symlinks.
    fn stat_at(&self, dir: &Self::Handle, name: &std::ffi::OsStr) -> nix::Result<NodeStat>;

    /// List `dir`, without `.` and `..`.
    fn read_dir(&self, dir: &Self::Handle) -> nix::Result<Vec<DirEntry>>;

    fn stat_filesystem(&self, handle: &Self::Handle) -> nix::Result<FsStat>;

    /// Id of the subvolume containing `handle`. Unprivileged.
    fn subvolume_id(&self, handle: &Self::Handle) -> nix::Result<u64>;

    /// ROOT_REF records of subvolume `id`. Privileged.
    fn query_children(&self, handle: &Self::Handle, id: u64) -> nix::Result<Vec<RootRef>>;

    /// Every ROOT_REF record of the filesystem, in one pass. Privileged.
    fn query_root_refs(&self, handle: &Self::Handle) -> nix::Result<Vec<RootRef>>;

    /// Path of directory `dir_id` inside subvolume `tree_id`, with a trailing
    /// `/`, or empty for the subvolume's root directory. Privileged.
    fn lookup_dir_path(&self, handle: &Self::Handle, tree_id: u64, dir_id: u64)
    -> nix::Result<String>;

    /// Root item and backref of subvolume `id`. Privileged.
    fn query_info(&self, handle: &Self::Handle, id: u64) -> nix::Result<Subvolume>;

    /// Backref of subvolume `id`, `None` for the top-level subvolume.
    /// Privileged.
    fn query_backref(&self, handle: &Self::Handle, id: u64) -> nix::Result<Option<RootBackref>>;

    /// Metadata of the subvolume whose root directory `handle` is. Unprivileged.
    fn query_own_info(&self, handle: &Self::Handle) -> nix::Result<Subvolume>;

    /// Ids of subvolumes deleted but not cleaned up yet. Privileged.
    fn query_deleted(&self, handle: &Self::Handle) -> nix::Result<Vec<u64>>;

    /// Id of the subvolume mounted when no `subvol` option is given.
    /// `ENOENT` when the filesystem records none. Privileged.
    fn query_default(&self, handle: &Self::Handle) -> nix::Result<u64>;
}

/// Append `name` to an already-known relative path.
pub(crate) fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        let mut path = String::with_capacity(parent.len() + 1 + name.len());
        path.push_str(parent);
        path.push('/');
        path.push_str(name);
        path
    }
}

/// Order paths component by component, so `a/b` sorts before `a-b`.
pub(crate) fn cmp_paths(left: &str, right: &str) -> std::cmp::Ordering {
    left.split('/').cmp(right.split('/'))
}
