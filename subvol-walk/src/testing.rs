// SPDX-License-Identifier: GPL-3.0-only

//! In-memory Btrfs used by the unit tests
//!
//! Models one Btrfs filesystem with nested subvolumes, plain directories and
//! files, plus mounts of other filesystems on top of it. Subvolume linkage is
//! derived from where each subvolume's root directory currently sits, so a
//! rename moves a subvolume exactly as it would on disk.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use std::rc::Rc;

use chrono::DateTime;
use nix::errno::Errno;
use uuid::Uuid;

use subvol_types::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_SUPER_MAGIC, FilesystemId,
    SUBVOL_RDONLY, Subvolume,
};

use crate::driver::{DirEntry, Driver, EntryKind, FsStat, NodeStat, RootBackref, RootRef};

const TMPFS_MAGIC: i64 = 0x0102_1994;
const MAIN_FS: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
}

#[derive(Debug)]
struct Inode {
    parent: Option<usize>,
    name: String,
    kind: Kind,
    children: BTreeMap<String, usize>,
    /// Subvolume the inode belongs to.
    tree: u64,
    ino: u64,
    dev: u64,
    fs: usize,
    /// Root of whatever is mounted over this directory.
    mount: Option<usize>,
    denied: bool,
    read_error: Option<Errno>,
    alive: bool,
}

#[derive(Debug)]
struct Filesystem {
    magic: i64,
    fsid: Option<FilesystemId>,
}

#[derive(Debug)]
struct Subvol {
    root: usize,
    info: Subvolume,
    next_ino: u64,
    deleted: bool,
}

#[derive(Debug)]
struct State {
    inodes: Vec<Inode>,
    filesystems: Vec<Filesystem>,
    subvols: BTreeMap<u64, Subvol>,
    next_id: u64,
    next_dev: u64,
    generation: u64,
    privileged: bool,
    subvol_info_supported: bool,
    default_id: Option<u64>,
}

/// Open directory in a [`MemoryDriver`]
#[derive(Debug)]
pub(crate) struct MemHandle {
    inode: usize,
    live: Rc<Cell<usize>>,
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        self.live.set(self.live.get() - 1);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MemoryDriver {
    state: Rc<RefCell<State>>,
    live: Rc<Cell<usize>>,
    info_queries: Rc<Cell<usize>>,
    root_ref_scans: Rc<Cell<usize>>,
    /// Most components in a path opened relative to a handle.
    deepest_relative_open: Rc<Cell<usize>>,
}

fn components(path: &Path) -> Vec<&str> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect()
}

impl State {
    fn mounted(&self, mut inode: usize) -> usize {
        while let Some(root) = self.inodes[inode].mount {
            inode = root;
        }
        inode
    }

    fn walk(&self, start: usize, path: &Path, follow_last: bool) -> nix::Result<usize> {
        let names = components(path);
        let mut cur = start;
        for (i, name) in names.iter().enumerate() {
            let inode = &self.inodes[cur];
            if !inode.alive {
                return Err(Errno::ENOENT);
            }
            if inode.kind != Kind::Dir {
                return Err(Errno::ENOTDIR);
            }
            if inode.denied && !self.privileged {
                return Err(Errno::EACCES);
            }
            let mut next = *inode.children.get(*name).ok_or(Errno::ENOENT)?;
            if follow_last || i + 1 < names.len() {
                next = self.mounted(next);
            }
            cur = next;
        }
        if !self.inodes[cur].alive {
            return Err(Errno::ENOENT);
        }
        Ok(cur)
    }

    fn add_inode(&mut self, inode: Inode) -> usize {
        self.inodes.push(inode);
        self.inodes.len() - 1
    }

    fn new_dev(&mut self) -> u64 {
        self.next_dev += 1;
        self.next_dev
    }

    fn new_fs_root(&mut self, magic: i64, fsid: Option<FilesystemId>, ino: u64, tree: u64) -> usize {
        self.filesystems.push(Filesystem { magic, fsid });
        let fs = self.filesystems.len() - 1;
        let dev = self.new_dev();
        self.add_inode(Inode {
            parent: None,
            name: String::new(),
            kind: Kind::Dir,
            children: BTreeMap::new(),
            tree,
            ino,
            dev,
            fs,
            mount: None,
            denied: false,
            read_error: None,
            alive: true,
        })
    }

    /// Parent directory of `path` and the final component.
    fn split<'a>(&self, path: &'a str) -> (usize, &'a str) {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let parent = self
            .walk(0, Path::new(dir), true)
            .expect("parent directory exists");
        (parent, name)
    }

    fn link(&mut self, parent: usize, name: &str, child: usize) {
        self.inodes[child].parent = Some(parent);
        self.inodes[child].name = name.to_string();
        self.inodes[parent].children.insert(name.to_string(), child);
    }

    fn subvolume_at(&self, inode: usize) -> Option<u64> {
        let inode = &self.inodes[inode];
        (inode.fs == MAIN_FS && inode.ino == BTRFS_FIRST_FREE_OBJECTID && inode.parent.is_some())
            .then_some(inode.tree)
    }

    fn live_subvol(&self, id: u64) -> Option<&Subvol> {
        self.subvols
            .get(&id)
            .filter(|sv| !sv.deleted && self.inodes[sv.root].alive)
    }

    fn info(&self, id: u64) -> Option<Subvolume> {
        let subvol = self.live_subvol(id)?;
        let mut info = subvol.info.clone();
        if id != BTRFS_FS_TREE_OBJECTID {
            let parent = &self.inodes[self.inodes[subvol.root].parent?];
            info.parent_id = parent.tree;
            info.dir_id = parent.ino;
        }
        Some(info)
    }

    /// ROOT_REF records as the current directory tree implies them.
    fn root_refs(&self) -> impl Iterator<Item = RootRef> + '_ {
        self.subvols
            .iter()
            .filter(|&(&child_id, _)| child_id != BTRFS_FS_TREE_OBJECTID)
            .filter(move |&(&child_id, _)| self.live_subvol(child_id).is_some())
            .filter_map(move |(&child_id, subvol)| {
                let root = &self.inodes[subvol.root];
                let parent = &self.inodes[root.parent?];
                Some(RootRef {
                    parent_id: parent.tree,
                    child_id,
                    dir_id: parent.ino,
                    name: root.name.clone(),
                })
            })
    }

    fn kill(&mut self, inode: usize) {
        self.inodes[inode].alive = false;
        if let Some(id) = self.subvolume_at(inode)
            && let Some(subvol) = self.subvols.get_mut(&id)
        {
            subvol.deleted = true;
        }
        let children: Vec<usize> = self.inodes[inode].children.values().copied().collect();
        for child in children {
            self.kill(child);
        }
    }
}

impl MemoryDriver {
    /// An empty filesystem whose top-level subvolume is the working
    /// directory.
    pub fn new() -> Self {
        let mut state = State {
            inodes: Vec::new(),
            filesystems: Vec::new(),
            subvols: BTreeMap::new(),
            next_id: BTRFS_FIRST_FREE_OBJECTID,
            next_dev: 0,
            generation: 1,
            privileged: true,
            subvol_info_supported: true,
            default_id: Some(BTRFS_FS_TREE_OBJECTID),
        };
        let fsid = FilesystemId(Uuid::from_u128(0x5eed));
        let root = state.new_fs_root(BTRFS_SUPER_MAGIC, Some(fsid), BTRFS_FIRST_FREE_OBJECTID, 5);

        let mut info = Subvolume::empty(BTRFS_FS_TREE_OBJECTID);
        info.generation = 1;
        state.subvols.insert(
            BTRFS_FS_TREE_OBJECTID,
            Subvol {
                root,
                info,
                next_ino: BTRFS_FIRST_FREE_OBJECTID + 1,
                deleted: false,
            },
        );

        Self {
            state: Rc::new(RefCell::new(state)),
            live: Rc::new(Cell::new(0)),
            info_queries: Rc::new(Cell::new(0)),
            root_ref_scans: Rc::new(Cell::new(0)),
            deepest_relative_open: Rc::new(Cell::new(0)),
        }
    }

    pub fn fsid(&self) -> FilesystemId {
        self.state.borrow().filesystems[MAIN_FS]
            .fsid
            .expect("main filesystem is btrfs")
    }

    fn add_entry(&self, path: &str, kind: Kind) {
        let mut state = self.state.borrow_mut();
        let (parent, name) = state.split(path);
        let (tree, dev, fs) = {
            let p = &state.inodes[parent];
            (p.tree, p.dev, p.fs)
        };
        let ino = match state.subvols.get_mut(&tree) {
            Some(subvol) if fs == MAIN_FS => {
                subvol.next_ino += 1;
                subvol.next_ino - 1
            }
            _ => 1000 + state.inodes.len() as u64,
        };
        let child = state.add_inode(Inode {
            parent: None,
            name: String::new(),
            kind,
            children: BTreeMap::new(),
            tree,
            ino,
            dev,
            fs,
            mount: None,
            denied: false,
            read_error: None,
            alive: true,
        });
        state.link(parent, name, child);
    }

    pub fn mkdir(&self, path: &str) {
        self.add_entry(path, Kind::Dir);
    }

    pub fn touch(&self, path: &str) {
        self.add_entry(path, Kind::File);
    }

    pub fn create_subvolume(&self, path: &str) -> u64 {
        let mut state = self.state.borrow_mut();
        let (parent, name) = state.split(path);
        let id = state.next_id;
        state.next_id += 1;
        state.generation += 1;
        let dev = state.new_dev();

        let child = state.add_inode(Inode {
            parent: None,
            name: String::new(),
            kind: Kind::Dir,
            children: BTreeMap::new(),
            tree: id,
            ino: BTRFS_FIRST_FREE_OBJECTID,
            dev,
            fs: MAIN_FS,
            mount: None,
            denied: false,
            read_error: None,
            alive: true,
        });
        state.link(parent, name, child);

        let mut info = Subvolume::empty(id);
        info.uuid = Uuid::from_u128(0xa000 + id as u128);
        info.generation = state.generation;
        info.ctransid = state.generation;
        info.otransid = state.generation;
        info.otime = DateTime::from_timestamp(1_700_000_000 + id as i64, 0).unwrap_or_default();
        info.ctime = info.otime;
        state.subvols.insert(
            id,
            Subvol {
                root: child,
                info,
                next_ino: BTRFS_FIRST_FREE_OBJECTID + 1,
                deleted: false,
            },
        );
        id
    }

    /// Snapshot the subvolume at `source`. Nested subvolumes are not
    /// carried over, and neither is any content.
    pub fn snapshot(&self, source: &str, dest: &str, read_only: bool) -> u64 {
        let source_uuid = {
            let state = self.state.borrow();
            let inode = state.walk(0, Path::new(source), true).expect("source exists");
            state.subvols[&state.inodes[inode].tree].info.uuid
        };
        let id = self.create_subvolume(dest);
        let mut state = self.state.borrow_mut();
        let subvol = state.subvols.get_mut(&id).expect("just created");
        subvol.info.parent_uuid = source_uuid;
        if read_only {
            subvol.info.flags |= SUBVOL_RDONLY;
        }
        id
    }

    pub fn rename(&self, from: &str, to: &str) {
        let mut state = self.state.borrow_mut();
        let (old_parent, old_name) = state.split(from);
        let inode = state.inodes[old_parent]
            .children
            .remove(old_name)
            .expect("source exists");
        let (new_parent, new_name) = state.split(to);
        state.link(new_parent, new_name, inode);
    }

    /// Remove the subvolume at `path` along with everything below it.
    pub fn delete_subvolume(&self, path: &str) {
        let mut state = self.state.borrow_mut();
        let (parent, name) = state.split(path);
        let inode = state.inodes[parent]
            .children
            .remove(name)
            .expect("subvolume exists");
        state.kill(inode);
    }

    /// Make `path` inaccessible to unprivileged callers, like a root-owned
    /// directory with mode 0700.
    pub fn deny(&self, path: &str) {
        let mut state = self.state.borrow_mut();
        let inode = state.walk(0, Path::new(path), true).expect("path exists");
        state.inodes[inode].denied = true;
    }

    pub fn fail_read_dir(&self, path: &str, errno: Errno) {
        let mut state = self.state.borrow_mut();
        let inode = state.walk(0, Path::new(path), true).expect("path exists");
        state.inodes[inode].read_error = Some(errno);
    }

    fn mount(&self, path: &str, root: usize) {
        let mut state = self.state.borrow_mut();
        let inode = state.walk(0, Path::new(path), false).expect("mount point exists");
        state.inodes[inode].mount = Some(root);
    }

    /// Mount an empty tmpfs over `path`.
    pub fn mount_foreign(&self, path: &str) {
        let root = self
            .state
            .borrow_mut()
            .new_fs_root(TMPFS_MAGIC, None, 1, 0);
        self.mount(path, root);
    }

    /// Mount the top level of a second, empty Btrfs over `path`.
    pub fn mount_other_btrfs(&self, path: &str) {
        let root = self.state.borrow_mut().new_fs_root(
            BTRFS_SUPER_MAGIC,
            Some(FilesystemId(Uuid::from_u128(0x07e4))),
            BTRFS_FIRST_FREE_OBJECTID,
            BTRFS_FS_TREE_OBJECTID,
        );
        self.mount(path, root);
    }

    /// Bind mount subvolume `id` over `path`.
    pub fn bind_subvolume(&self, path: &str, id: u64) {
        let root = self.state.borrow().subvols[&id].root;
        self.mount(path, root);
    }

    /// Bind mount the directory `source` over `path`.
    pub fn bind_directory(&self, path: &str, source: &str) {
        let root = {
            let state = self.state.borrow();
            state.walk(0, Path::new(source), true).expect("source exists")
        };
        self.mount(path, root);
    }

    /// Drop deleted subvolumes for good, as the cleaner thread does.
    pub fn clean_deleted(&self) {
        self.state.borrow_mut().subvols.retain(|_, subvol| !subvol.deleted);
    }

    /// `None` models a filesystem without the `default` directory entry.
    pub fn set_default_subvolume(&self, id: Option<u64>) {
        self.state.borrow_mut().default_id = id;
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.state.borrow_mut().privileged = privileged;
    }

    pub fn set_subvol_info_supported(&self, supported: bool) {
        self.state.borrow_mut().subvol_info_supported = supported;
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.live.get()
    }

    /// Metadata lookups served so far.
    pub fn info_queries(&self) -> usize {
        self.info_queries.get()
    }

    pub fn deepest_relative_open(&self) -> usize {
        self.deepest_relative_open.get()
    }

    /// Whole-filesystem ROOT_REF listings served so far.
    pub fn root_ref_scans(&self) -> usize {
        self.root_ref_scans.get()
    }

    fn handle(&self, inode: usize) -> MemHandle {
        self.live.set(self.live.get() + 1);
        MemHandle {
            inode,
            live: Rc::clone(&self.live),
        }
    }

    fn require_privilege(&self) -> nix::Result<()> {
        if self.state.borrow().privileged {
            Ok(())
        } else {
            Err(Errno::EPERM)
        }
    }
}

fn node_stat(inode: &Inode) -> NodeStat {
    NodeStat {
        dev: inode.dev,
        ino: inode.ino,
        is_dir: inode.kind == Kind::Dir,
    }
}

impl Driver for MemoryDriver {
    type Handle = MemHandle;

    fn open(&self, base: Option<&MemHandle>, path: &Path) -> nix::Result<MemHandle> {
        if base.is_some() {
            let depth = components(path).len();
            self.deepest_relative_open
                .set(self.deepest_relative_open.get().max(depth));
        }
        let inode = {
            let state = self.state.borrow();
            let start = base.map_or(0, |handle| handle.inode);
            let inode = state.walk(start, path, true)?;
            let found = &state.inodes[inode];
            if found.kind != Kind::Dir {
                return Err(Errno::ENOTDIR);
            }
            if found.denied && !state.privileged {
                return Err(Errno::EACCES);
            }
            inode
        };
        Ok(self.handle(inode))
    }

    fn stat(&self, handle: &MemHandle) -> nix::Result<NodeStat> {
        Ok(node_stat(&self.state.borrow().inodes[handle.inode]))
    }

    fn stat_at(&self, dir: &MemHandle, name: &OsStr) -> nix::Result<NodeStat> {
        let state = self.state.borrow();
        let inode = state.walk(dir.inode, Path::new(name), true)?;
        Ok(node_stat(&state.inodes[inode]))
    }

    fn read_dir(&self, dir: &MemHandle) -> nix::Result<Vec<DirEntry>> {
        let state = self.state.borrow();
        let inode = &state.inodes[dir.inode];
        if !inode.alive {
            return Err(Errno::ENOENT);
        }
        if let Some(errno) = inode.read_error {
            return Err(errno);
        }
        if inode.denied && !state.privileged {
            return Err(Errno::EACCES);
        }

        Ok(inode
            .children
            .iter()
            .map(|(name, &child)| {
                let entry = &state.inodes[child];
                DirEntry {
                    name: OsString::from(name),
                    ino: state.subvolume_at(child).unwrap_or(entry.ino),
                    kind: match entry.kind {
                        Kind::Dir => EntryKind::Dir,
                        Kind::File => EntryKind::Other,
                    },
                }
            })
            .collect())
    }

    fn stat_filesystem(&self, handle: &MemHandle) -> nix::Result<FsStat> {
        let state = self.state.borrow();
        let fs = &state.filesystems[state.inodes[handle.inode].fs];
        Ok(FsStat {
            magic: fs.magic,
            fsid: fs.fsid,
        })
    }

    fn subvolume_id(&self, handle: &MemHandle) -> nix::Result<u64> {
        let state = self.state.borrow();
        let inode = &state.inodes[handle.inode];
        if state.filesystems[inode.fs].magic != BTRFS_SUPER_MAGIC {
            return Err(Errno::ENOTTY);
        }
        if !inode.alive {
            return Err(Errno::ENOENT);
        }
        Ok(inode.tree)
    }

    fn query_children(&self, _handle: &MemHandle, id: u64) -> nix::Result<Vec<RootRef>> {
        self.require_privilege()?;
        Ok(self
            .state
            .borrow()
            .root_refs()
            .filter(|root_ref| root_ref.parent_id == id)
            .collect())
    }

    fn query_root_refs(&self, _handle: &MemHandle) -> nix::Result<Vec<RootRef>> {
        self.require_privilege()?;
        self.root_ref_scans.set(self.root_ref_scans.get() + 1);
        Ok(self.state.borrow().root_refs().collect())
    }

    fn lookup_dir_path(&self, _handle: &MemHandle, tree_id: u64, dir_id: u64) -> nix::Result<String> {
        self.require_privilege()?;
        let state = self.state.borrow();
        let mut cur = state
            .inodes
            .iter()
            .position(|inode| {
                inode.alive
                    && inode.fs == MAIN_FS
                    && inode.kind == Kind::Dir
                    && inode.tree == tree_id
                    && inode.ino == dir_id
            })
            .ok_or(Errno::ENOENT)?;

        let mut names = Vec::new();
        while state.inodes[cur].ino != BTRFS_FIRST_FREE_OBJECTID {
            names.push(state.inodes[cur].name.as_str());
            cur = state.inodes[cur].parent.ok_or(Errno::ENOENT)?;
        }
        names.reverse();

        let mut path = names.join("/");
        if !path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    fn query_info(&self, _handle: &MemHandle, id: u64) -> nix::Result<Subvolume> {
        self.require_privilege()?;
        self.info_queries.set(self.info_queries.get() + 1);
        self.state.borrow().info(id).ok_or(Errno::ENOENT)
    }

    fn query_backref(&self, _handle: &MemHandle, id: u64) -> nix::Result<Option<RootBackref>> {
        self.require_privilege()?;
        if id == BTRFS_FS_TREE_OBJECTID {
            return Ok(None);
        }
        let state = self.state.borrow();
        Ok(state.info(id).map(|info| RootBackref {
            parent_id: info.parent_id,
            dir_id: info.dir_id,
            name: state.inodes[state.subvols[&id].root].name.clone(),
        }))
    }

    fn query_own_info(&self, handle: &MemHandle) -> nix::Result<Subvolume> {
        let state = self.state.borrow();
        if !state.subvol_info_supported {
            return Err(Errno::ENOTTY);
        }
        self.info_queries.set(self.info_queries.get() + 1);

        let inode = &state.inodes[handle.inode];
        if state.filesystems[inode.fs].magic != BTRFS_SUPER_MAGIC {
            return Err(Errno::ENOTTY);
        }
        if inode.fs != MAIN_FS {
            return Ok(Subvolume::empty(inode.tree));
        }
        state.info(inode.tree).ok_or(Errno::ENOENT)
    }

    fn query_deleted(&self, _handle: &MemHandle) -> nix::Result<Vec<u64>> {
        self.require_privilege()?;
        Ok(self
            .state
            .borrow()
            .subvols
            .iter()
            .filter(|(_, subvol)| subvol.deleted)
            .map(|(&id, _)| id)
            .collect())
    }

    fn query_default(&self, _handle: &MemHandle) -> nix::Result<u64> {
        self.require_privilege()?;
        self.state.borrow().default_id.ok_or(Errno::ENOENT)
    }
}
