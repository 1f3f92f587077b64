// SPDX-License-Identifier: GPL-3.0-only

use crate::driver::{Driver, cmp_paths};
use crate::error::Result;
use crate::privileged::RootWalker;
use crate::unprivileged::TreeWalker;

/// A subvolume found beneath another one
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Child {
    pub id: u64,
    /// Path relative to the parent subvolume's root directory.
    pub name: String,
}

/// A subvolume in the frontier, with its path relative to the walk's top
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub id: u64,
    pub path: String,
}

impl Node {
    pub fn top(id: u64) -> Self {
        Self {
            id,
            path: String::new(),
        }
    }

    pub fn is_top(&self) -> bool {
        self.path.is_empty()
    }
}

/// How children are discovered, fixed for the lifetime of a walk
#[derive(Debug)]
pub(crate) enum Strategy {
    Privileged(RootWalker),
    Unprivileged(TreeWalker),
}

impl Strategy {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Strategy::Privileged(_))
    }

    /// Children of `node` in lexical order.
    pub fn children<D: Driver>(
        &mut self,
        driver: &D,
        root: &D::Handle,
        node: &Node,
    ) -> Result<Vec<Child>> {
        let mut children = match self {
            Strategy::Privileged(walker) => walker.children(driver, root, node.id)?,
            Strategy::Unprivileged(walker) => walker.children(driver, root, &node.path, node.id)?,
        };
        children.sort_by(|left, right| cmp_paths(&left.name, &right.name));
        Ok(children)
    }
}
