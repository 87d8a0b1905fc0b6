//! Node Reader (C1) and Record Locator (C2).
//!
//! A personality-agnostic node reader: it enforces the node header
//! offset invariants up front and bounds-checks every record access
//! against the node's own declared key/value areas, not just the block
//! length.
//!
//! The on-disk node header is four `nloc_t` pairs (table_space,
//! free_space, key_free_list, val_free_list), 24 bytes total.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek};

use crate::error::{ApfsError, Result};
use crate::freespace;
use crate::object::{self, Object, ObjectHeader};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;
/// Defined on disk but rejected at the node-validity gate (DESIGN.md
/// open question: `CHECK_KOFF_INVAL` presence is treated as corruption).
pub const BTNODE_CHECK_KOFF_INVAL: u16 = 0x8000;
const APFS_BTNODE_MASK: u16 = BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;

/// A location pair as encoded on disk: `(offset, length)`.
#[derive(Debug, Clone, Copy)]
struct Nloc {
    off: u16,
    len: u16,
}

impl Nloc {
    fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Nloc { off: cursor.read_u16::<LittleEndian>()?, len: cursor.read_u16::<LittleEndian>()? })
    }
}

/// The 24-byte node body header that follows the 32-byte object header.
#[derive(Debug, Clone)]
struct NodeHeader {
    flags: u16,
    level: u16,
    nkeys: u32,
    table_space: Nloc,
    free_space: Nloc,
    key_free_list: Nloc,
    val_free_list: Nloc,
}

impl NodeHeader {
    const SIZE: usize = 24;

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::structural("node header", "node header too short"));
        }
        let mut cursor = Cursor::new(data);
        Ok(NodeHeader {
            flags: cursor.read_u16::<LittleEndian>()?,
            level: cursor.read_u16::<LittleEndian>()?,
            nkeys: cursor.read_u32::<LittleEndian>()?,
            table_space: Nloc::read(&mut cursor)?,
            free_space: Nloc::read(&mut cursor)?,
            key_free_list: Nloc::read(&mut cursor)?,
            val_free_list: Nloc::read(&mut cursor)?,
        })
    }
}

/// BTreeInfo — 40 bytes at the end of a root node, after the value area.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BTreeInfo {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::structural("btree footer", "info footer too short"));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeInfo {
            flags: cursor.read_u32::<LittleEndian>()?,
            node_size: cursor.read_u32::<LittleEndian>()?,
            key_size: cursor.read_u32::<LittleEndian>()?,
            val_size: cursor.read_u32::<LittleEndian>()?,
            longest_key: cursor.read_u32::<LittleEndian>()?,
            longest_val: cursor.read_u32::<LittleEndian>()?,
            key_count: cursor.read_u64::<LittleEndian>()?,
            node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TocEntry {
    key_off: u16,
    key_len: u16,
    val_off: u16,
    val_len: u16,
}

/// One parsed on-disk node: offsets, allocation bitmaps, and the
/// raw block it was built from.
pub struct Node {
    pub object: Object,
    pub flags: u16,
    pub level: u16,
    pub records: u32,
    pub toc: usize,
    pub key: usize,
    pub free: usize,
    pub data: usize,
    pub area_end: usize,
    pub fixed_key_size: u32,
    pub fixed_val_size: u32,
    pub info: Option<BTreeInfo>,
    toc_entries: Vec<TocEntry>,
    pub free_key_bmap: Vec<u8>,
    pub free_val_bmap: Vec<u8>,
    pub used_key_bmap: Vec<u8>,
    pub used_val_bmap: Vec<u8>,
    pub key_free_list_len: u16,
    pub val_free_list_len: u16,
    block: Vec<u8>,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    pub fn key_area_len(&self) -> usize {
        self.free - self.key
    }

    pub fn val_area_len(&self) -> usize {
        self.area_end - self.data
    }

    /// Parse a node from a raw, already checksum-verified block.
    ///
    /// `fixed_key_size`/`fixed_val_size` come from the owning tree's
    /// `BTreeInfo` (root) or are threaded down from the root for
    /// non-root fixed-kv nodes, since only the root carries the footer.
    pub fn parse(object: Object, block: Vec<u8>, fixed_key_size: u32, fixed_val_size: u32) -> Result<Node> {
        let header_end = ObjectHeader::SIZE + NodeHeader::SIZE;
        let node_header = NodeHeader::parse(&block[ObjectHeader::SIZE..])?;

        if node_header.flags & !APFS_BTNODE_MASK != 0 {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                format!("node has disallowed flag bits set: 0x{:04x}", node_header.flags),
            ));
        }

        let is_root = node_header.flags & BTNODE_ROOT != 0;
        let is_leaf = node_header.flags & BTNODE_LEAF != 0;
        let is_fixed_kv = node_header.flags & BTNODE_FIXED_KV_SIZE != 0;

        if !is_root && node_header.nkeys == 0 {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                "non-root node has zero records",
            ));
        }

        let toc = header_end + node_header.table_space.off as usize;
        if toc != header_end {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                format!("table of contents does not immediately follow the header: toc={toc}, expected={header_end}"),
            ));
        }

        let key = toc + node_header.table_space.len as usize;
        let free = key + node_header.free_space.off as usize;
        let data = free + node_header.free_space.len as usize;

        let info = if is_root {
            if block.len() < BTreeInfo::SIZE {
                return Err(ApfsError::structural_at("node validity", object.block_nr, "block too small for footer"));
            }
            Some(BTreeInfo::parse(&block[block.len() - BTreeInfo::SIZE..])?)
        } else {
            None
        };

        let area_end = if is_root { block.len() - BTreeInfo::SIZE } else { block.len() };

        if data > area_end {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                format!("value area start {data} exceeds block bound {area_end}"),
            ));
        }
        if !(toc < key && key <= free && free <= data) {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                format!("node offsets out of order: toc={toc}, key={key}, free={free}, data={data}"),
            ));
        }

        let stride = if is_fixed_kv { 4usize } else { 8usize };
        let needed = node_header.nkeys as usize * stride;
        if needed > node_header.table_space.len as usize {
            return Err(ApfsError::structural_at(
                "node validity",
                object.block_nr,
                format!("table of contents too small for {} records: needs {needed} bytes, has {}", node_header.nkeys, node_header.table_space.len),
            ));
        }

        let mut toc_entries = Vec::with_capacity(node_header.nkeys as usize);
        let mut cursor = Cursor::new(&block[toc..]);
        for _ in 0..node_header.nkeys {
            if is_fixed_kv {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                toc_entries.push(TocEntry { key_off, key_len: 0, val_off, val_len: 0 });
            } else {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let key_len = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                let val_len = cursor.read_u16::<LittleEndian>()?;
                toc_entries.push(TocEntry { key_off, key_len, val_off, val_len });
            }
        }

        let key_area_len = free - key;
        let val_area_len = area_end - data;

        let free_key_bmap = freespace::walk_free_list(
            "key area",
            object.block_nr,
            &block,
            key,
            key_area_len,
            node_header.key_free_list.off,
            node_header.key_free_list.len,
        )?;
        let free_val_bmap = freespace::walk_free_list(
            "value area",
            object.block_nr,
            &block,
            data,
            val_area_len,
            node_header.val_free_list.off,
            node_header.val_free_list.len,
        )?;

        Ok(Node {
            object,
            flags: node_header.flags,
            level: node_header.level,
            records: node_header.nkeys,
            toc,
            key,
            free,
            data,
            area_end,
            fixed_key_size,
            fixed_val_size,
            info,
            toc_entries,
            used_key_bmap: vec![0u8; key_area_len],
            used_val_bmap: vec![0u8; val_area_len],
            free_key_bmap,
            free_val_bmap,
            key_free_list_len: node_header.key_free_list.len,
            val_free_list_len: node_header.val_free_list.len,
            block,
        })
    }

    fn toc_entry(&self, i: usize) -> Result<&TocEntry> {
        self.toc_entries.get(i).ok_or_else(|| {
            ApfsError::structural_at("record locator", self.object.block_nr, format!("record index {i} out of range"))
        })
    }

    /// Bounds-checked byte range of key `i`, relative to `self.key`.
    pub fn locate_key(&self, i: usize) -> Result<(usize, usize)> {
        let entry = self.toc_entry(i)?;
        let len = if self.is_fixed_kv() { self.fixed_key_size as usize } else { entry.key_len as usize };
        let start = entry.key_off as usize;
        let end = start.checked_add(len).ok_or_else(|| {
            ApfsError::structural_at("record locator", self.object.block_nr, "key range overflow")
        })?;
        if end > self.key_area_len() {
            return Err(ApfsError::structural_at(
                "record locator",
                self.object.block_nr,
                format!("key {i} out of bounds: [{start}, {end}) exceeds key area of length {}", self.key_area_len()),
            ));
        }
        Ok((start, len))
    }

    /// Bounds-checked byte range of value `i`, relative to `self.data`.
    pub fn locate_value(&self, i: usize) -> Result<(usize, usize)> {
        let entry = self.toc_entry(i)?;
        let len = if !self.is_leaf() {
            8
        } else if self.is_fixed_kv() {
            self.fixed_val_size as usize
        } else {
            entry.val_len as usize
        };
        let area_len = self.val_area_len();
        let v_off = entry.val_off as usize;
        if v_off > area_len {
            return Err(ApfsError::structural_at(
                "record locator",
                self.object.block_nr,
                format!("value {i} offset {v_off} exceeds value area of length {area_len}"),
            ));
        }
        let start = area_len - v_off;
        let end = start.checked_add(len).ok_or_else(|| {
            ApfsError::structural_at("record locator", self.object.block_nr, "value range overflow")
        })?;
        if end > area_len {
            return Err(ApfsError::structural_at(
                "record locator",
                self.object.block_nr,
                format!("value {i} out of bounds: [{start}, {end}) exceeds value area of length {area_len}"),
            ));
        }
        if len == 0 {
            return Err(ApfsError::structural_at("record locator", self.object.block_nr, "zero-length value"));
        }
        Ok((start, len))
    }

    pub fn key_bytes(&self, i: usize) -> Result<&[u8]> {
        let (start, len) = self.locate_key(i)?;
        Ok(&self.block[self.key + start..self.key + start + len])
    }

    pub fn value_bytes(&self, i: usize) -> Result<&[u8]> {
        let (start, len) = self.locate_value(i)?;
        Ok(&self.block[self.data + start..self.data + start + len])
    }

    /// Mark `[start, start+len)` used in the key bitmap, failing if any
    /// byte in the range is already marked — two records may never
    /// overlap in the key area.
    pub fn mark_used_key(&mut self, start: usize, len: usize) -> Result<()> {
        mark_used(&mut self.used_key_bmap, start, len, "key", self.object.block_nr)
    }

    /// Mark `[start, start+len)` used in the value bitmap, failing if any
    /// byte in the range is already marked — two records may never
    /// overlap in the value area.
    pub fn mark_used_value(&mut self, start: usize, len: usize) -> Result<()> {
        mark_used(&mut self.used_val_bmap, start, len, "value", self.object.block_nr)
    }

    /// Internal-node child object id at record `i` (always 8 bytes).
    pub fn child_oid(&self, i: usize) -> Result<u64> {
        let bytes = self.value_bytes(i)?;
        if bytes.len() < 8 {
            return Err(ApfsError::structural_at("subtree walker", self.object.block_nr, "child pointer too short"));
        }
        Ok(u64::from_le_bytes(bytes[0..8].try_into().unwrap()))
    }
}

fn mark_used(bmap: &mut [u8], start: usize, len: usize, area: &'static str, block_nr: u64) -> Result<()> {
    let end = start.checked_add(len).ok_or_else(|| ApfsError::structural_at("record locator", block_nr, "range overflow"))?;
    if end > bmap.len() {
        return Err(ApfsError::structural_at(
            "record locator",
            block_nr,
            format!("{area} range [{start}, {end}) exceeds area of length {}", bmap.len()),
        ));
    }
    for b in &mut bmap[start..end] {
        if *b != 0 {
            return Err(ApfsError::structural_at("record locator", block_nr, format!("overlapping record data in {area} area")));
        }
        *b = 1;
    }
    Ok(())
}

/// Read and parse the node at physical block `block_nr`.
pub fn read_node<R: Read + Seek>(
    reader: &mut R,
    block_nr: u64,
    block_size: u32,
    fixed_key_size: u32,
    fixed_val_size: u32,
) -> Result<Node> {
    let (object, block) = object::read_object(reader, block_nr, block_size)?;
    Node::parse(object, block, fixed_key_size, fixed_val_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fletcher;

    /// Build a minimal, checksummed leaf node block with `nkeys` fixed-kv
    /// records of `key_size`/`val_size` bytes each, all already packed
    /// contiguously (empty free lists, no root footer).
    fn build_fixed_leaf(block_size: usize, key_size: u16, val_size: u16, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        let nkeys = entries.len() as u32;
        let header_end = ObjectHeader::SIZE + NodeHeader::SIZE;
        let toc_len = entries.len() as u16 * 4;
        let key_area_len = key_size as usize * entries.len();
        let val_area_len = val_size as usize * entries.len();

        let toc_start = header_end;
        let key_start = toc_start + toc_len as usize;
        let data_start = key_start + key_area_len;
        let area_end = data_start + val_area_len;
        // Non-root nodes carry no footer, so `Node::parse` takes the whole
        // block as the value area (`area_end == block.len()`). Allocate
        // exactly that many bytes so there's no trailing padding the real
        // offsets would have to account for.
        assert!(area_end <= block_size, "fixture too large for block_size");
        let mut block = vec![0u8; area_end];

        // object header (checksum filled in later)
        block[8..16].copy_from_slice(&1u64.to_le_bytes()); // oid
        block[16..24].copy_from_slice(&1u64.to_le_bytes()); // xid
        block[24..28].copy_from_slice(&object::OBJECT_TYPE_BTREE_NODE.to_le_bytes());
        block[28..32].copy_from_slice(&object::OBJECT_TYPE_OMAP_SUBTYPE.to_le_bytes());

        // node header
        let flags = BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;
        block[32..34].copy_from_slice(&flags.to_le_bytes());
        block[34..36].copy_from_slice(&0u16.to_le_bytes()); // level
        block[36..40].copy_from_slice(&nkeys.to_le_bytes());
        block[40..42].copy_from_slice(&0u16.to_le_bytes()); // table_space.off
        block[42..44].copy_from_slice(&toc_len.to_le_bytes()); // table_space.len
        block[44..46].copy_from_slice(&(key_area_len as u16).to_le_bytes()); // free_space.off == whole key area used, no gap before data
        block[46..48].copy_from_slice(&0u16.to_le_bytes()); // free_space.len
        block[48..50].copy_from_slice(&0xFFFFu16.to_le_bytes()); // key_free_list.off (sentinel = empty)
        block[50..52].copy_from_slice(&0u16.to_le_bytes()); // key_free_list.len
        block[52..54].copy_from_slice(&0xFFFFu16.to_le_bytes()); // val_free_list.off
        block[54..56].copy_from_slice(&0u16.to_le_bytes()); // val_free_list.len

        for (i, (k, v)) in entries.iter().enumerate() {
            let key_off = i * key_size as usize;
            block[key_start + key_off..key_start + key_off + k.len()].copy_from_slice(k);

            let v_off_from_end = val_area_len - i * val_size as usize;
            let v_start = area_end - v_off_from_end;
            block[v_start..v_start + v.len()].copy_from_slice(v);

            let toc_off = toc_start + i * 4;
            block[toc_off..toc_off + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
            block[toc_off + 2..toc_off + 4].copy_from_slice(&(v_off_from_end as u16).to_le_bytes());
        }

        let checksum = fletcher::fletcher64(&block[8..]);
        block[0..8].copy_from_slice(&checksum.to_le_bytes());
        block
    }

    #[test]
    fn parses_simple_fixed_leaf() {
        let entries = vec![
            (100u64.to_le_bytes().repeat(1).into_iter().chain(0u64.to_le_bytes()).collect::<Vec<u8>>(), 1000u64.to_le_bytes().repeat(2)),
        ];
        let block = build_fixed_leaf(4096, 16, 16, &entries);
        let object = Object { block_nr: 0, oid: 1, xid: 1, obj_type: object::OBJECT_TYPE_BTREE_NODE, subtype: object::OBJECT_TYPE_OMAP_SUBTYPE };
        let node = Node::parse(object, block, 16, 16).unwrap();
        assert_eq!(node.records, 1);
        assert!(node.is_leaf());
        assert!(node.is_fixed_kv());
        assert_eq!(node.key_bytes(0).unwrap().len(), 16);
        assert_eq!(node.value_bytes(0).unwrap().len(), 16);
    }

    #[test]
    fn rejects_disallowed_flag_bits() {
        let entries = vec![(vec![0u8; 16], vec![0u8; 16])];
        let mut block = build_fixed_leaf(4096, 16, 16, &entries);
        let flags = BTNODE_LEAF | BTNODE_FIXED_KV_SIZE | BTNODE_CHECK_KOFF_INVAL;
        block[32..34].copy_from_slice(&flags.to_le_bytes());
        let checksum = fletcher::fletcher64(&block[8..]);
        block[0..8].copy_from_slice(&checksum.to_le_bytes());

        let object = Object { block_nr: 0, oid: 1, xid: 1, obj_type: object::OBJECT_TYPE_BTREE_NODE, subtype: object::OBJECT_TYPE_OMAP_SUBTYPE };
        assert!(Node::parse(object, block, 16, 16).is_err());
    }

    #[test]
    fn locate_key_rejects_out_of_area_offset() {
        let entries = vec![(vec![0u8; 16], vec![0u8; 16])];
        let block = build_fixed_leaf(4096, 16, 16, &entries);
        let object = Object { block_nr: 0, oid: 1, xid: 1, obj_type: object::OBJECT_TYPE_BTREE_NODE, subtype: object::OBJECT_TYPE_OMAP_SUBTYPE };
        let node = Node::parse(object, block, 16, 16).unwrap();
        assert!(node.locate_key(5).is_err());
    }

    #[test]
    fn mark_used_key_detects_overlap() {
        let entries = vec![(vec![0u8; 16], vec![0u8; 16])];
        let block = build_fixed_leaf(4096, 16, 16, &entries);
        let object = Object { block_nr: 0, oid: 1, xid: 1, obj_type: object::OBJECT_TYPE_BTREE_NODE, subtype: object::OBJECT_TYPE_OMAP_SUBTYPE };
        let mut node = Node::parse(object, block, 16, 16).unwrap();
        node.mark_used_key(0, 16).unwrap();
        assert!(node.mark_used_key(8, 16).is_err());
    }
}
