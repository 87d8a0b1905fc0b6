//! Key-variant decoding and comparison.
//!
//! Kept in its own module, separate from the generic B-tree core
//! (`node.rs`, `btree.rs`, `query.rs`), which only ever calls through
//! the `Personality`-dispatched `decode`/`keycmp` entry points below.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::btree::Personality;
use crate::error::{ApfsError, Result};

// j_obj_types (top 4 bits of a catalog key's obj_id_and_type)
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

/// A decoded, tree-agnostic key: `(id, type, number, name?)`.
///
/// `name` is owned rather than borrowed from the raw block, so a key
/// can outlive the node it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub id: u64,
    pub ty: u8,
    pub number: u64,
    pub name: Option<KeyName>,
}

/// A key's name payload, tagged with how it must be compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyName {
    /// xattr names: byte comparison.
    Bytes(String),
    /// directory entry / sibling names: normalized Unicode comparison.
    Normalized(String),
}

impl KeyName {
    fn as_str(&self) -> &str {
        match self {
            KeyName::Bytes(s) | KeyName::Normalized(s) => s,
        }
    }
}

/// Case-folding policy threaded in from the volume superblock
/// (`ApfsSuperblock::case_insensitive`).
#[derive(Debug, Clone, Copy)]
pub struct NameFolding {
    pub case_insensitive: bool,
}

/// Compare two optional names, applying `folding` only to `Normalized`
/// names. `Bytes` names (xattrs) are always compared verbatim.
fn name_cmp(a: &Option<KeyName>, b: &Option<KeyName>, folding: NameFolding) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(KeyName::Bytes(x)), Some(KeyName::Bytes(y))) => x.as_bytes().cmp(y.as_bytes()),
        (Some(x), Some(y)) => {
            if folding.case_insensitive {
                fold(x.as_str()).cmp(&fold(y.as_str()))
            } else {
                x.as_str().cmp(y.as_str())
            }
        }
    }
}

/// ASCII case-fold; a full Unicode NFD-insensitive table is out of
/// scope here (see DESIGN.md open question #2).
fn fold(s: &str) -> String {
    s.chars().flat_map(char::to_lowercase).collect()
}

/// Tree-agnostic key comparator: `(id, type, number, name)` lexicographic.
pub fn keycmp(a: &Key, b: &Key, folding: NameFolding) -> Ordering {
    a.id.cmp(&b.id)
        .then_with(|| a.ty.cmp(&b.ty))
        .then_with(|| a.number.cmp(&b.number))
        .then_with(|| name_cmp(&a.name, &b.name, folding))
}

/// Decode one key according to the owning tree's personality.
pub fn decode(personality: Personality, key_bytes: &[u8]) -> Result<Key> {
    match personality {
        Personality::Omap => decode_omap_key(key_bytes),
        Personality::Catalog => decode_cat_key(key_bytes),
        Personality::ExtentRef => decode_extentref_key(key_bytes),
        Personality::SnapMeta => Err(ApfsError::structural(
            "B-tree key decode",
            "snapshot metadata trees carry no keys to decode",
        )),
    }
}

/// OMAP key: `(oid: u64, xid: u64)`, 16 bytes, fixed-size.
pub fn decode_omap_key(key_bytes: &[u8]) -> Result<Key> {
    if key_bytes.len() < 16 {
        return Err(ApfsError::structural("omap key decode", "key shorter than 16 bytes"));
    }
    let mut cursor = Cursor::new(key_bytes);
    let oid = cursor.read_u64::<LittleEndian>()?;
    let xid = cursor.read_u64::<LittleEndian>()?;
    Ok(Key { id: oid, ty: 0, number: xid, name: None })
}

/// Catalog key: top 4 bits of the first 8 bytes are `j_obj_type`, the
/// rest is the object id. `J_TYPE_DIR_REC`/`J_TYPE_XATTR` carry a
/// following name. `J_TYPE_FILE_EXTENT` carries a `logical_addr` and
/// `J_TYPE_SIBLING_LINK` a `sibling_id`, both as the next 8 bytes —
/// neither has a name, and both need that field as `number` to order
/// distinctly from their sibling records sharing the same object id.
pub fn decode_cat_key(key_bytes: &[u8]) -> Result<Key> {
    if key_bytes.len() < 8 {
        return Err(ApfsError::structural("catalog key decode", "key shorter than 8 bytes"));
    }
    let obj_id_and_type = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
    let obj_id = obj_id_and_type & 0x0FFF_FFFF_FFFF_FFFF;
    let j_type = ((obj_id_and_type >> 60) & 0xF) as u8;

    let name = match j_type {
        J_TYPE_DIR_REC => Some(KeyName::Normalized(decode_hashed_name(key_bytes)?)),
        J_TYPE_XATTR => Some(KeyName::Bytes(decode_xattr_name(key_bytes)?)),
        _ => None,
    };

    let number = match j_type {
        J_TYPE_FILE_EXTENT | J_TYPE_SIBLING_LINK => {
            if key_bytes.len() < 16 {
                return Err(ApfsError::structural("catalog key decode", "key shorter than 16 bytes"));
            }
            u64::from_le_bytes(key_bytes[8..16].try_into().unwrap())
        }
        _ => 0,
    };

    Ok(Key { id: obj_id, ty: j_type, number, name })
}

/// Extent-reference key: keyed purely by physical block number.
pub fn decode_extentref_key(key_bytes: &[u8]) -> Result<Key> {
    if key_bytes.len() < 8 {
        return Err(ApfsError::structural("extentref key decode", "key shorter than 8 bytes"));
    }
    let bno = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
    Ok(Key { id: bno, ty: 0, number: 0, name: None })
}

/// `j_drec_hashed_key_t` name: a 4-byte `name_len_and_hash` (name length
/// in the low 10 bits) followed by NUL-terminated UTF-8.
fn decode_hashed_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 12 {
        return Err(ApfsError::structural("catalog key decode", "hashed-name key too short"));
    }
    let name_len_and_hash = u32::from_le_bytes(key_bytes[8..12].try_into().unwrap());
    let name_len = (name_len_and_hash & 0x0000_03FF) as usize;

    let name_start = 12;
    let name_end = name_start + name_len;
    if name_end > key_bytes.len() {
        return Err(ApfsError::structural(
            "catalog key decode",
            format!("name extends beyond key: end={name_end}, key_len={}", key_bytes.len()),
        ));
    }

    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}

/// `j_xattr_key_t` name: a 2-byte length followed by the (unhashed,
/// byte-compared) name bytes.
fn decode_xattr_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 10 {
        return Err(ApfsError::structural("xattr key decode", "xattr key too short"));
    }
    let name_len = u16::from_le_bytes(key_bytes[8..10].try_into().unwrap()) as usize;
    let name_start = 10;
    let name_end = name_start + name_len;
    if name_end > key_bytes.len() {
        return Err(ApfsError::structural(
            "xattr key decode",
            format!("name extends beyond key: end={name_end}, key_len={}", key_bytes.len()),
        ));
    }
    let name_bytes = &key_bytes[name_start..name_end];
    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}
