// SPDX-License-Identifier: GPL-3.0-only

//! Btrfs subvolume tree enumeration
//!
//! Walks the subvolumes below a top subvolume lazily, in pre- or post-order,
//! with paths relative to the top. With CAP_SYS_ADMIN children are read from
//! the root tree; without it the walk falls back to scanning directories the
//! caller can read and recognizing subvolume boundaries.

pub mod driver;
pub mod error;
pub mod inspect;
pub mod iter;
pub mod native;
pub mod resolve;

mod info;
mod privileged;
mod unprivileged;
mod walk;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use driver::Driver;
pub use error::{ErrorClass, Result, WalkError};
pub use inspect::SubvolumeInspector;
pub use iter::{SubvolumeIter, WalkOptions};
pub use native::NativeDriver;
pub use resolve::Location;
pub use subvol_types::{FilesystemId, Subvolume, SubvolumeEntry};
