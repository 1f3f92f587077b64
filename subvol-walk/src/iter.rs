// SPDX-License-Identifier: GPL-3.0-only

//! Lazy, resumable enumeration of a subvolume tree

use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;

use subvol_types::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID, FilesystemId,
    Subvolume, SubvolumeEntry,
};

use crate::driver::{Driver, join_relative};
use crate::error::{Disposition, ErrorClass, Result, WalkError, disposition};
use crate::info;
use crate::native::NativeDriver;
use crate::privileged::RootWalker;
use crate::resolve::{Location, Resolved, resolve};
use crate::unprivileged::TreeWalker;
use crate::walk::{Node, Strategy};

/// How a walk is set up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkOptions {
    /// Subvolume whose descendants are listed. 0 means the subvolume the
    /// starting location is the root of.
    pub top: u64,
    /// Yield children before their parents.
    pub post_order: bool,
    /// Attach [`Subvolume`] metadata to every entry.
    pub with_info: bool,
}

impl WalkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top(mut self, top: u64) -> Self {
        self.top = top;
        self
    }

    pub fn post_order(mut self, post_order: bool) -> Self {
        self.post_order = post_order;
        self
    }

    pub fn with_info(mut self, with_info: bool) -> Self {
        self.with_info = with_info;
        self
    }

    fn validate(&self) -> Result<()> {
        let top = self.top;
        if top != 0
            && top != BTRFS_FS_TREE_OBJECTID
            && !(BTRFS_FIRST_FREE_OBJECTID..=BTRFS_LAST_FREE_OBJECTID).contains(&top)
        {
            return Err(WalkError::InvalidArgument(format!(
                "{top} is not a subvolume id"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Pending {
    /// Not listed yet.
    Expand(Node),
    /// Children already queued, emit on the way back up.
    Ready(Node),
}

#[derive(Debug)]
struct Cursor<H> {
    root: H,
    top: u64,
    filesystem: FilesystemId,
    options: WalkOptions,
    strategy: Strategy,
    frontier: Vec<Pending>,
    seen: HashSet<u64>,
    /// Paths of yielded subvolumes, for metadata lookups without privilege.
    yielded: HashMap<u64, String>,
    /// Subvolumes already listed, in listing order. Without privilege they
    /// are listed once more before the walk ends, to catch children that
    /// moved in behind the walk.
    expanded: Vec<Node>,
    rescanned: usize,
}

#[derive(Debug)]
enum State<H> {
    Open(Box<Cursor<H>>),
    Exhausted,
    Closed,
}

/// Iterator over the subvolumes below a top subvolume
///
/// Entries are produced one at a time, each carrying its path relative to
/// the top subvolume. The top itself is never yielded. Once exhausted, or
/// after an I/O error, the iterator releases its directory handle and keeps
/// returning `None`.
#[derive(Debug)]
pub struct SubvolumeIter<D: Driver = NativeDriver> {
    driver: D,
    state: State<D::Handle>,
}

impl SubvolumeIter<NativeDriver> {
    /// Walk the subvolumes below `location` on the running system.
    pub fn new(location: impl Into<Location<OwnedFd>>, options: WalkOptions) -> Result<Self> {
        Self::with_driver(NativeDriver::new(), location.into(), options)
    }

    /// Walk the subvolumes below the directory `fd`, taking ownership of it.
    pub fn from_fd(fd: OwnedFd, options: WalkOptions) -> Result<Self> {
        Self::with_driver(NativeDriver::new(), Location::Handle(fd), options)
    }
}

impl<D: Driver> SubvolumeIter<D> {
    pub fn with_driver(
        driver: D,
        location: Location<D::Handle>,
        options: WalkOptions,
    ) -> Result<Self> {
        options.validate()?;
        let resolved = resolve(&driver, location)?;

        let top = match options.top {
            0 if resolved.is_subvolume_root => resolved.subvolume_id,
            0 => {
                return Err(WalkError::NotSubvolume(format!(
                    "starting directory is inside subvolume {} but not its root",
                    resolved.subvolume_id
                )));
            }
            top => top,
        };

        let strategy = probe(&driver, &resolved, top, options.with_info)?;
        tracing::debug!(
            "Walking subvolumes below {top} ({})",
            if strategy.is_privileged() {
                "root tree"
            } else {
                "directory tree"
            }
        );

        let cursor = Cursor {
            root: resolved.handle,
            top,
            filesystem: resolved.filesystem,
            options,
            strategy,
            frontier: vec![Pending::Expand(Node::top(top))],
            seen: HashSet::from([top]),
            yielded: HashMap::new(),
            expanded: Vec::new(),
            rescanned: 0,
        };

        Ok(Self {
            driver,
            state: State::Open(Box::new(cursor)),
        })
    }

    /// Next subvolume, `Ok(None)` once the walk is complete.
    pub fn advance(&mut self) -> Result<Option<SubvolumeEntry>> {
        let step = match &mut self.state {
            State::Open(cursor) => cursor.step(&self.driver),
            State::Exhausted => return Ok(None),
            State::Closed => return Err(WalkError::Closed),
        };

        match step {
            Ok(Some(entry)) => Ok(Some(entry)),
            Ok(None) => {
                tracing::debug!("Subvolume walk complete");
                self.state = State::Exhausted;
                Ok(None)
            }
            Err(err) => {
                tracing::warn!("Subvolume walk aborted: {err}");
                self.state = State::Exhausted;
                Err(err)
            }
        }
    }

    /// The directory handle the walk runs against.
    pub fn descriptor(&self) -> Result<&D::Handle> {
        match &self.state {
            State::Open(cursor) => Ok(&cursor.root),
            State::Exhausted | State::Closed => Err(WalkError::Closed),
        }
    }

    /// Release the directory handle and abandon the walk. Safe to call more
    /// than once.
    pub fn close(&mut self) {
        if matches!(self.state, State::Open(_)) {
            tracing::debug!("Closing subvolume walk");
        }
        self.state = State::Closed;
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Id of the subvolume being listed.
    pub fn top(&self) -> Result<u64> {
        match &self.state {
            State::Open(cursor) => Ok(cursor.top),
            State::Exhausted | State::Closed => Err(WalkError::Closed),
        }
    }

    /// Whether children are read from the root tree, which needs privilege.
    pub fn is_privileged(&self) -> Result<bool> {
        match &self.state {
            State::Open(cursor) => Ok(cursor.strategy.is_privileged()),
            State::Exhausted | State::Closed => Err(WalkError::Closed),
        }
    }

    pub fn filesystem(&self) -> Result<FilesystemId> {
        match &self.state {
            State::Open(cursor) => Ok(cursor.filesystem),
            State::Exhausted | State::Closed => Err(WalkError::Closed),
        }
    }

    /// Metadata of subvolume `id`. Without privilege only the top and
    /// subvolumes already yielded can be looked up.
    pub fn fetch_info(&self, id: u64) -> Result<Subvolume> {
        let State::Open(cursor) = &self.state else {
            return Err(WalkError::Closed);
        };
        cursor.fetch_info(&self.driver, id)
    }
}

impl<D: Driver> Iterator for SubvolumeIter<D> {
    type Item = Result<SubvolumeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Pick the discovery strategy by trying a root tree listing of `top`.
fn probe<D: Driver>(
    driver: &D,
    resolved: &Resolved<D::Handle>,
    top: u64,
    with_info: bool,
) -> Result<Strategy> {
    match driver.query_children(&resolved.handle, top) {
        Ok(_) => {
            if top != resolved.subvolume_id {
                // An unknown tree simply has no refs, check it exists.
                driver
                    .query_info(&resolved.handle, top)
                    .map_err(|errno| match disposition(errno) {
                        Disposition::Vanished => WalkError::NoSuchSubvolume(top),
                        _ => WalkError::io("root tree search", errno),
                    })?;
            }
            Ok(Strategy::Privileged(RootWalker::default()))
        }
        Err(errno) => match disposition(errno) {
            Disposition::Denied | Disposition::Unsupported => {
                if top != resolved.subvolume_id || !resolved.is_subvolume_root {
                    return Err(WalkError::PermissionDenied(format!(
                        "listing subvolumes below {top} from another subvolume"
                    )));
                }
                tracing::debug!("Root tree search unavailable ({errno}), walking directories");
                Ok(Strategy::Unprivileged(TreeWalker::new(
                    resolved.filesystem,
                    with_info,
                )))
            }
            Disposition::Vanished => Err(WalkError::NoSuchSubvolume(top)),
            Disposition::Fatal => Err(WalkError::io("root tree search", errno)),
        },
    }
}

impl<H> Cursor<H> {
    fn step<D: Driver<Handle = H>>(&mut self, driver: &D) -> Result<Option<SubvolumeEntry>> {
        loop {
            let Some(pending) = self.frontier.pop() else {
                if self.rescan(driver)? {
                    continue;
                }
                return Ok(None);
            };

            let node = match pending {
                Pending::Ready(node) => {
                    if let Some(entry) = self.emit(driver, node)? {
                        return Ok(Some(entry));
                    }
                    continue;
                }
                Pending::Expand(node) => node,
            };

            let queued = self.discover(driver, &node)?;
            if !self.strategy.is_privileged() {
                self.expanded.push(node.clone());
            }

            if node.is_top() {
                self.frontier.extend(queued.into_iter().rev());
                continue;
            }
            if self.options.post_order {
                self.frontier.push(Pending::Ready(node));
                self.frontier.extend(queued.into_iter().rev());
                continue;
            }

            // Reversed so the lexically first child is popped first.
            self.frontier.extend(queued.into_iter().rev());
            if let Some(entry) = self.emit(driver, node)? {
                return Ok(Some(entry));
            }
        }
    }

    /// List the children of `node` not seen before, in lexical order.
    fn discover<D: Driver<Handle = H>>(
        &mut self,
        driver: &D,
        node: &Node,
    ) -> Result<Vec<Pending>> {
        let children = match self.strategy.children(driver, &self.root, node) {
            Ok(children) => children,
            Err(err) if err.class() == ErrorClass::Permission => {
                tracing::debug!("Skipping children of subvolume {}: {err}", node.id);
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let mut queued = Vec::with_capacity(children.len());
        for child in children {
            if !self.seen.insert(child.id) {
                tracing::debug!("Subvolume {} already listed, skipping", child.id);
                continue;
            }
            queued.push(Pending::Expand(Node {
                id: child.id,
                path: join_relative(&node.path, &child.name),
            }));
        }
        Ok(queued)
    }

    /// List already expanded subvolumes again until one turns up a child the
    /// walk has not seen. Returns whether anything was queued.
    fn rescan<D: Driver<Handle = H>>(&mut self, driver: &D) -> Result<bool> {
        while let Some(node) = self.expanded.get(self.rescanned).cloned() {
            self.rescanned += 1;
            let queued = self.discover(driver, &node)?;
            if !queued.is_empty() {
                tracing::debug!(
                    "{} subvolume(s) moved below subvolume {} during the walk",
                    queued.len(),
                    node.id
                );
                self.frontier.extend(queued.into_iter().rev());
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn emit<D: Driver<Handle = H>>(
        &mut self,
        driver: &D,
        node: Node,
    ) -> Result<Option<SubvolumeEntry>> {
        let info = if self.options.with_info {
            match self.lookup(driver, &node) {
                Ok(info) => Some(info),
                Err(err) if err.class() != ErrorClass::FatalIo => {
                    tracing::debug!("Omitting subvolume {} at {}: {err}", node.id, node.path);
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        if !self.strategy.is_privileged() {
            self.yielded.insert(node.id, node.path.clone());
        }

        Ok(Some(SubvolumeEntry {
            path: node.path,
            id: node.id,
            info,
        }))
    }

    fn lookup<D: Driver<Handle = H>>(&self, driver: &D, node: &Node) -> Result<Subvolume> {
        if self.strategy.is_privileged() {
            info::by_id(driver, &self.root, node.id)
        } else {
            info::by_path(driver, &self.root, &node.path, node.id)
        }
    }

    fn fetch_info<D: Driver<Handle = H>>(&self, driver: &D, id: u64) -> Result<Subvolume> {
        if self.strategy.is_privileged() {
            return match info::by_id(driver, &self.root, id) {
                Err(WalkError::Gone(id)) => Err(WalkError::NoSuchSubvolume(id)),
                other => other,
            };
        }

        let path = if id == self.top {
            ""
        } else {
            self.yielded
                .get(&id)
                .map(String::as_str)
                .ok_or(WalkError::NoSuchSubvolume(id))?
        };
        info::by_path(driver, &self.root, path, id)
    }
}
