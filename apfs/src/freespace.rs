//! Free-Space Reconciler (C3).
//!
//! Proves the two free-lists self-consistent against what the table of
//! contents actually uses, walking the cell chains the node header's
//! `key_free_list`/`val_free_list` offset-and-length pairs point to.

use crate::error::{ApfsError, Result};

/// Walk one on-disk free list (key or value area), building a
/// byte-granular "1 = free" bitmap over the area.
///
/// `area_start` is the absolute block offset the list's offsets are
/// relative to; `area_len` bounds the bitmap. `head_off`/`head_len` are
/// the node header's free-list head cell. Each list cell is 4 bytes:
/// `(next_off: u16, len: u16)`, sentinel `next_off == 0xFFFF`.
pub fn walk_free_list(
    area_name: &'static str,
    block_nr: u64,
    block: &[u8],
    area_start: usize,
    area_len: usize,
    head_off: u16,
    head_len: u16,
) -> Result<Vec<u8>> {
    let mut bmap = vec![0u8; area_len];
    let mut remaining = head_len as i64;
    let mut cursor = head_off;

    if head_len == 0 {
        if cursor != 0xFFFF {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list advertises zero length but does not terminate immediately"),
            ));
        }
        return Ok(bmap);
    }

    loop {
        if cursor == 0xFFFF {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list terminated early: {remaining} bytes unaccounted for"),
            ));
        }
        let cell_off = cursor as usize;
        if cell_off + 4 > area_len {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list cell at {cell_off} is out of bounds"),
            ));
        }
        let abs = area_start + cell_off;
        if abs + 4 > block.len() {
            return Err(ApfsError::structural_at("free space reconciler", block_nr, format!("{area_name} free list cell reads past end of block")));
        }
        let next_off = u16::from_le_bytes([block[abs], block[abs + 1]]);
        let cell_len = u16::from_le_bytes([block[abs + 2], block[abs + 3]]);

        if cell_len < 4 {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list cell shorter than its own header"),
            ));
        }
        let cell_end = cell_off.checked_add(cell_len as usize).ok_or_else(|| {
            ApfsError::structural_at("free space reconciler", block_nr, format!("{area_name} free list cell length overflows"))
        })?;
        if cell_end > area_len {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list cell [{cell_off}, {cell_end}) exceeds area of length {area_len}"),
            ));
        }

        for bit in &mut bmap[cell_off..cell_end] {
            if *bit != 0 {
                return Err(ApfsError::structural_at(
                    "free space reconciler",
                    block_nr,
                    format!("{area_name} free list lists byte {cell_off} twice"),
                ));
            }
            *bit = 1;
        }

        remaining -= cell_len as i64;
        cursor = next_off;

        if remaining == 0 {
            if cursor != 0xFFFF {
                return Err(ApfsError::structural_at(
                    "free space reconciler",
                    block_nr,
                    format!("{area_name} free list total reached zero before the terminating cell"),
                ));
            }
            break;
        }
        if remaining < 0 {
            return Err(ApfsError::structural_at(
                "free space reconciler",
                block_nr,
                format!("{area_name} free list cells sum to more than the advertised total"),
            ));
        }
    }

    Ok(bmap)
}

/// Compare a free bitmap against the used bitmap the walker built while
/// visiting every live record, and check the advertised free-list total
/// against the number of actually-unused bytes.
///
/// The check is `unused == advertised_len`, not "list-walk sum ==
/// advertised_len" — bytes too small to be linked into the free list
/// still count as unused once the used-bitmap sweep finds them
/// unclaimed.
pub fn reconcile(area_name: &'static str, block_nr: u64, free_bmap: &[u8], used_bmap: &[u8], advertised_len: u16) -> Result<()> {
    debug_assert_eq!(free_bmap.len(), used_bmap.len());

    let mut unused = 0u32;
    for (i, &used) in used_bmap.iter().enumerate() {
        if used != 0 {
            if free_bmap[i] != 0 {
                return Err(ApfsError::structural_at(
                    "free space reconciler",
                    block_nr,
                    format!("{area_name} byte {i} is both live and listed as free"),
                ));
            }
        } else {
            unused += 1;
        }
    }

    if unused as u16 != advertised_len {
        return Err(ApfsError::structural_at(
            "free space reconciler",
            block_nr,
            format!("wrong free space total for {area_name}: advertised {advertised_len}, measured {unused}"),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_free_list_yields_empty_bitmap() {
        let block = vec![0u8; 64];
        let bmap = walk_free_list("key area", 0, &block, 0, 16, 0xFFFF, 0).unwrap();
        assert_eq!(bmap, vec![0u8; 16]);
    }

    #[test]
    fn single_cell_free_list() {
        let mut block = vec![0u8; 64];
        // area is block[0..16), one cell at offset 4, len 8, sentinel next
        block[4..6].copy_from_slice(&0xFFFFu16.to_le_bytes());
        block[6..8].copy_from_slice(&8u16.to_le_bytes());

        let bmap = walk_free_list("key area", 0, &block, 0, 16, 4, 8).unwrap();
        let mut expected = vec![0u8; 16];
        for b in &mut expected[4..12] {
            *b = 1;
        }
        assert_eq!(bmap, expected);
    }

    #[test]
    fn double_listed_byte_is_an_error() {
        let mut block = vec![0u8; 64];
        // two chained cells overlapping at offset 0
        block[0..2].copy_from_slice(&4u16.to_le_bytes()); // next -> 4
        block[2..4].copy_from_slice(&6u16.to_le_bytes()); // len 6, covers [0,6)
        block[4..6].copy_from_slice(&0xFFFFu16.to_le_bytes());
        block[6..8].copy_from_slice(&4u16.to_le_bytes()); // covers [4,8), overlaps [4,6)

        let result = walk_free_list("key area", 0, &block, 0, 16, 0, 10);
        assert!(result.is_err());
    }

    #[test]
    fn reconcile_accepts_matching_totals() {
        let free = vec![1, 1, 0, 0];
        let used = vec![0, 0, 1, 1];
        assert!(reconcile("key area", 0, &free, &used, 2).is_ok());
    }

    #[test]
    fn reconcile_rejects_used_byte_listed_free() {
        let free = vec![1, 0, 0, 0];
        let used = vec![1, 0, 1, 1];
        assert!(reconcile("key area", 0, &free, &used, 1).is_err());
    }

    #[test]
    fn reconcile_rejects_wrong_total() {
        let free = vec![1, 1, 0, 0];
        let used = vec![0, 0, 1, 1];
        assert!(reconcile("key area", 0, &free, &used, 3).is_err());
    }
}
