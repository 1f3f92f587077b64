// SPDX-License-Identifier: GPL-3.0-only

//! Metadata lookup for subvolumes found by a walk

use std::path::Path;

use subvol_types::Subvolume;

use crate::driver::Driver;
use crate::error::{Disposition, Result, WalkError, disposition};

fn info_error(id: u64, op: &'static str, errno: nix::errno::Errno) -> WalkError {
    match disposition(errno) {
        Disposition::Vanished => WalkError::Gone(id),
        Disposition::Denied => WalkError::PermissionDenied(format!("metadata of subvolume {id}")),
        Disposition::Unsupported => WalkError::NotSupported(format!("{op} ({errno})")),
        Disposition::Fatal => WalkError::io(op, errno),
    }
}

/// Read the metadata of subvolume `id` from the root tree. Privileged.
pub(crate) fn by_id<D: Driver>(driver: &D, root: &D::Handle, id: u64) -> Result<Subvolume> {
    driver
        .query_info(root, id)
        .map_err(|errno| info_error(id, "root tree search", errno))
}

/// Read the metadata of subvolume `id` through its root directory at `path`
/// below `root`. Works without privilege.
pub(crate) fn by_path<D: Driver>(
    driver: &D,
    root: &D::Handle,
    path: &str,
    id: u64,
) -> Result<Subvolume> {
    let opened;
    let handle = if path.is_empty() {
        root
    } else {
        opened = driver
            .open(Some(root), Path::new(path))
            .map_err(|errno| info_error(id, "open", errno))?;
        &opened
    };

    let found = driver
        .subvolume_id(handle)
        .map_err(|errno| info_error(id, "subvolume id lookup", errno))?;
    if found != id {
        tracing::debug!("{path} holds subvolume {found} now, {id} is gone");
        return Err(WalkError::Gone(id));
    }

    let info = driver
        .query_own_info(handle)
        .map_err(|errno| info_error(id, "subvolume info", errno))?;
    if info.id != id {
        return Err(WalkError::Gone(id));
    }

    Ok(info)
}
