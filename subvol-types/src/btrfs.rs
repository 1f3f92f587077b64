// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `f_type` reported by `statfs(2)` for Btrfs.
pub const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;

/// Tree id of the top-level subvolume.
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;

/// First id handed out to user-created subvolumes, and the inode number of
/// every subvolume's root directory.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

pub const BTRFS_LAST_FREE_OBJECTID: u64 = u64::MAX - 255;

/// Read-only bit in [`Subvolume::flags`].
pub const SUBVOL_RDONLY: u64 = 1 << 0;

/// Identity of a mounted Btrfs filesystem (its fsid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemId(pub Uuid);

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Full metadata of one subvolume, as stored in its root item and backref
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subvolume {
    pub id: u64,
    /// Containing subvolume, 0 for the top-level subvolume
    pub parent_id: u64,
    /// Inode of the directory inside the parent that holds this subvolume
    pub dir_id: u64,
    pub flags: u64,

    // Nil when absent
    pub uuid: Uuid,
    pub parent_uuid: Uuid,
    pub received_uuid: Uuid,

    pub generation: u64,
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,

    pub ctime: DateTime<Utc>,
    pub otime: DateTime<Utc>,
    pub stime: DateTime<Utc>,
    pub rtime: DateTime<Utc>,
}

impl Subvolume {
    /// Metadata with every field zeroed except the id.
    pub fn empty(id: u64) -> Self {
        Self {
            id,
            parent_id: 0,
            dir_id: 0,
            flags: 0,
            uuid: Uuid::nil(),
            parent_uuid: Uuid::nil(),
            received_uuid: Uuid::nil(),
            generation: 0,
            ctransid: 0,
            otransid: 0,
            stransid: 0,
            rtransid: 0,
            ctime: DateTime::default(),
            otime: DateTime::default(),
            stime: DateTime::default(),
            rtime: DateTime::default(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & SUBVOL_RDONLY != 0
    }

    /// Whether this subvolume was created as a snapshot of another one.
    pub fn is_snapshot(&self) -> bool {
        !self.parent_uuid.is_nil()
    }

    pub fn is_received(&self) -> bool {
        !self.received_uuid.is_nil()
    }
}

/// One result of a subvolume walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubvolumeEntry {
    /// Path relative to the walk's top subvolume, `/`-separated, no leading `/`
    pub path: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Subvolume>,
}

impl SubvolumeEntry {
    pub fn new(path: impl Into<String>, id: u64) -> Self {
        Self {
            path: path.into(),
            id,
            info: None,
        }
    }

    /// The `(path, id)` pair, without metadata.
    pub fn key(&self) -> (&str, u64) {
        (self.path.as_str(), self.id)
    }
}
