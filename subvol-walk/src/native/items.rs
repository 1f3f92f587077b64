// SPDX-License-Identifier: GPL-3.0-only

//! Decoding of tree search results
//!
//! Items come back in on-disk format: packed, little-endian.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use subvol_types::Subvolume;

use crate::driver::{RootBackref, RootRef};

const SEARCH_HEADER_LEN: usize = 32;
const ROOT_REF_LEN: usize = 18;
const DIR_ITEM_LEN: usize = 30;

// Offsets into struct btrfs_root_item.
const ROOT_ITEM_GENERATION: usize = 160;
const ROOT_ITEM_FLAGS: usize = 208;
const ROOT_ITEM_UUID: usize = 247;
const ROOT_ITEM_PARENT_UUID: usize = 263;
const ROOT_ITEM_RECEIVED_UUID: usize = 279;
const ROOT_ITEM_CTRANSID: usize = 295;
const ROOT_ITEM_OTRANSID: usize = 303;
const ROOT_ITEM_STRANSID: usize = 311;
const ROOT_ITEM_RTRANSID: usize = 319;
const ROOT_ITEM_CTIME: usize = 327;
const ROOT_ITEM_OTIME: usize = 339;
const ROOT_ITEM_STIME: usize = 351;
const ROOT_ITEM_RTIME: usize = 363;
/// Root items written by kernels before 3.5 end before the uuid fields.
const ROOT_ITEM_V2_LEN: usize = 375;

/// One item out of a search result buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchItem<'a> {
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub data: &'a [u8],
}

/// Split a search buffer holding `nr_items` items. Stops early on a
/// truncated buffer rather than reading past it.
pub fn search_items(buf: &[u8], nr_items: u32) -> Vec<SearchItem<'_>> {
    let mut items = Vec::with_capacity(nr_items as usize);
    let mut pos = 0;

    for _ in 0..nr_items {
        let Some(header) = buf.get(pos..pos + SEARCH_HEADER_LEN) else {
            break;
        };
        let objectid = le_u64(header, 8);
        let offset = le_u64(header, 16);
        let item_type = le_u32(header, 24);
        let len = le_u32(header, 28) as usize;

        let start = pos + SEARCH_HEADER_LEN;
        let Some(data) = buf.get(start..start + len) else {
            break;
        };

        items.push(SearchItem {
            objectid,
            offset,
            item_type,
            data,
        });
        pos = start + len;
    }

    items
}

/// struct btrfs_root_ref: dirid, sequence, name_len, then the name.
fn parse_ref(data: &[u8]) -> Option<(u64, String)> {
    if data.len() < ROOT_REF_LEN {
        return None;
    }
    let dir_id = le_u64(data, 0);
    let name_len = u16::from_le_bytes([data[16], data[17]]) as usize;
    let name = data.get(ROOT_REF_LEN..ROOT_REF_LEN + name_len)?;

    Some((dir_id, String::from_utf8_lossy(name).into_owned()))
}

/// A ROOT_REF item: objectid is the parent, offset the child.
pub fn parse_root_ref(item: &SearchItem<'_>) -> Option<RootRef> {
    let (dir_id, name) = parse_ref(item.data)?;
    Some(RootRef {
        parent_id: item.objectid,
        child_id: item.offset,
        dir_id,
        name,
    })
}

/// A ROOT_BACKREF item: objectid is the child, offset the parent.
pub fn parse_root_backref(item: &SearchItem<'_>) -> Option<RootBackref> {
    let (dir_id, name) = parse_ref(item.data)?;
    Some(RootBackref {
        parent_id: item.offset,
        dir_id,
        name,
    })
}

/// Target objectid of the entry called `name` in a DIR_ITEM. Colliding names
/// are packed one after another: location key, transid, data_len, name_len,
/// type, then name and data.
pub fn find_dir_item(data: &[u8], name: &[u8]) -> Option<u64> {
    let mut pos = 0;
    while let Some(header) = data.get(pos..pos + DIR_ITEM_LEN) {
        let data_len = u16::from_le_bytes([header[25], header[26]]) as usize;
        let name_len = u16::from_le_bytes([header[27], header[28]]) as usize;
        let start = pos + DIR_ITEM_LEN;
        if data.get(start..start + name_len)? == name {
            return Some(le_u64(header, 0));
        }
        pos = start + name_len + data_len;
    }
    None
}

/// Fill everything but the linkage fields from a root item.
pub fn parse_root_item(id: u64, data: &[u8]) -> Subvolume {
    let mut subvol = Subvolume::empty(id);

    if data.len() >= ROOT_ITEM_FLAGS + 8 {
        subvol.generation = le_u64(data, ROOT_ITEM_GENERATION);
        subvol.flags = le_u64(data, ROOT_ITEM_FLAGS);
    }

    if data.len() >= ROOT_ITEM_V2_LEN {
        subvol.uuid = uuid_at(data, ROOT_ITEM_UUID);
        subvol.parent_uuid = uuid_at(data, ROOT_ITEM_PARENT_UUID);
        subvol.received_uuid = uuid_at(data, ROOT_ITEM_RECEIVED_UUID);
        subvol.ctransid = le_u64(data, ROOT_ITEM_CTRANSID);
        subvol.otransid = le_u64(data, ROOT_ITEM_OTRANSID);
        subvol.stransid = le_u64(data, ROOT_ITEM_STRANSID);
        subvol.rtransid = le_u64(data, ROOT_ITEM_RTRANSID);
        subvol.ctime = timespec_at(data, ROOT_ITEM_CTIME);
        subvol.otime = timespec_at(data, ROOT_ITEM_OTIME);
        subvol.stime = timespec_at(data, ROOT_ITEM_STIME);
        subvol.rtime = timespec_at(data, ROOT_ITEM_RTIME);
    }

    subvol
}

pub(crate) fn timestamp(sec: u64, nsec: u32) -> DateTime<Utc> {
    i64::try_from(sec)
        .ok()
        .and_then(|sec| DateTime::from_timestamp(sec, nsec))
        .unwrap_or_default()
}

fn timespec_at(data: &[u8], pos: usize) -> DateTime<Utc> {
    timestamp(le_u64(data, pos), le_u32(data, pos + 8))
}

fn uuid_at(data: &[u8], pos: usize) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[pos..pos + 16]);
    Uuid::from_bytes(bytes)
}

fn le_u64(data: &[u8], pos: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    u64::from_le_bytes(bytes)
}

fn le_u32(data: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}
