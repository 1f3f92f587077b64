// SPDX-License-Identifier: GPL-3.0-only

//! Discovery through the root tree's ROOT_REF records

use std::collections::HashMap;

use crate::driver::{Driver, RootRef};
use crate::error::{Disposition, Result, WalkError, disposition};
use crate::walk::Child;

/// Lists children of a subvolume from the root tree. Needs CAP_SYS_ADMIN
/// but sees everything regardless of directory permissions.
///
/// All ROOT_REF records are read in one pass on the first listing, and the
/// walk then follows that index. A subvolume moved after the index was taken
/// is still found under its old parent.
#[derive(Debug, Default)]
pub(crate) struct RootWalker {
    index: Option<HashMap<u64, Vec<RootRef>>>,
}

impl RootWalker {
    fn load<D: Driver>(driver: &D, root: &D::Handle) -> Result<HashMap<u64, Vec<RootRef>>> {
        let refs = match driver.query_root_refs(root) {
            Ok(refs) => refs,
            Err(errno) => match disposition(errno) {
                Disposition::Denied => {
                    return Err(WalkError::PermissionDenied(
                        "reading subvolume references".to_string(),
                    ));
                }
                _ => return Err(WalkError::io("root tree search", errno)),
            },
        };

        tracing::debug!("Indexed {} subvolume references", refs.len());
        let mut index: HashMap<u64, Vec<RootRef>> = HashMap::new();
        for root_ref in refs {
            index.entry(root_ref.parent_id).or_default().push(root_ref);
        }
        Ok(index)
    }

    /// Children of subvolume `id`, named relative to `id`'s root directory.
    /// Each id is handed out once.
    pub(crate) fn children<D: Driver>(
        &mut self,
        driver: &D,
        root: &D::Handle,
        id: u64,
    ) -> Result<Vec<Child>> {
        if self.index.is_none() {
            self.index = Some(Self::load(driver, root)?);
        }
        let refs = self
            .index
            .as_mut()
            .and_then(|index| index.remove(&id))
            .unwrap_or_default();

        let mut children = Vec::with_capacity(refs.len());
        for root_ref in refs {
            let dir_path = match driver.lookup_dir_path(root, id, root_ref.dir_id) {
                Ok(dir_path) => dir_path,
                Err(errno) if disposition(errno) == Disposition::Vanished => {
                    tracing::debug!(
                        "Directory {} of subvolume {id} vanished, skipping child {}",
                        root_ref.dir_id,
                        root_ref.child_id
                    );
                    continue;
                }
                Err(errno) if disposition(errno) == Disposition::Denied => {
                    return Err(WalkError::PermissionDenied(format!(
                        "resolving directory {} of subvolume {id}",
                        root_ref.dir_id
                    )));
                }
                Err(errno) => return Err(WalkError::io("inode lookup", errno)),
            };

            children.push(Child {
                id: root_ref.child_id,
                name: format!("{dir_path}{}", root_ref.name),
            });
        }

        Ok(children)
    }
}
