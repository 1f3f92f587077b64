// SPDX-License-Identifier: GPL-3.0-only

//! Canonical models for Btrfs subvolume enumeration
//!
//! These types are shared between the walking engine (`subvol-walk`) and
//! anything consuming its output, such as the CLI's JSON printer.

pub mod btrfs;

pub use btrfs::{
    BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID, BTRFS_LAST_FREE_OBJECTID,
    BTRFS_SUPER_MAGIC, FilesystemId, SUBVOL_RDONLY, Subvolume, SubvolumeEntry,
};
