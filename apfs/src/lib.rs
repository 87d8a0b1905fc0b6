pub mod error;
pub mod fletcher;
pub mod object;
pub mod superblock;
pub mod keys;
pub mod records;
pub mod node;
pub mod freespace;
pub mod query;
pub mod btree;

pub use error::{ApfsError, Result};
pub use btree::TreeStats;

use std::io::{Read, Seek};

/// Per-tree statistics for every tree the checker walks on a volume,
/// plus the identifying information needed to report them.
///
/// This is the top-level result of `check_container`: one pass through
/// the container omap, the volume's own omap, and the volume's three
/// virtual trees (catalog, extent reference, snapshot metadata).
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub volume_name: String,
    pub block_size: u32,
    pub container_omap: TreeStats,
    pub volume_omap: TreeStats,
    pub catalog: TreeStats,
    pub extentref: TreeStats,
    pub snap_meta: TreeStats,
}

/// Open a container image and walk every B-tree reachable from its
/// first volume, proving each one internally consistent.
///
/// 1. Read block 0 -> parse NX superblock, validate NXSB magic + Fletcher-64
/// 2. Scan the checkpoint descriptor area for the latest valid NX superblock
/// 3. Walk the container object map
/// 4. Find the first non-zero OID in `fs_oids`
/// 5. Resolve that OID to a physical block through the container omap
/// 6. Parse the volume superblock (APSB magic)
/// 7. Walk the volume's own object map
/// 8. Walk the catalog, extent-reference and snapshot-metadata trees,
///    each resolved through the volume omap
///
/// Any Invariant violation found along the way aborts the walk and is
/// returned as an `Err`; a successful return means every tree checked
/// out.
pub fn check_container<R: Read + Seek>(mut reader: R) -> Result<CheckReport> {
    let nxsb = superblock::read_nxsb(&mut reader)?;
    let nxsb = superblock::find_latest_nxsb(&mut reader, &nxsb)?;
    let block_size = nxsb.block_size;

    let container_omap = btree::parse_omap_btree(&mut reader, nxsb.omap_oid, block_size)?;

    let vol_oid = nxsb
        .fs_oids
        .iter()
        .find(|&&o| o != 0)
        .copied()
        .ok_or(ApfsError::NoVolume)?;

    let container_xid = container_omap.root.object.xid;
    let (vol_block, _found_xid) =
        query::omap_lookup(&mut reader, &container_omap.root, block_size, vol_oid, container_xid)?;

    let (_vol_obj, vol_data) = object::read_object(&mut reader, vol_block, block_size)?;
    let vol_sb = superblock::ApfsSuperblock::parse(&vol_data)?;

    let volume_omap = btree::parse_omap_btree(&mut reader, vol_sb.omap_oid, block_size)?;

    let folding = keys::NameFolding { case_insensitive: vol_sb.case_insensitive() };

    let catalog = btree::parse_cat_btree(
        &mut reader,
        vol_sb.root_tree_oid,
        &volume_omap.root,
        block_size,
        folding,
    )?;
    let extentref = btree::parse_extentref_btree(
        &mut reader,
        vol_sb.extentref_tree_oid,
        &volume_omap.root,
        block_size,
    )?;
    let snap_meta = btree::parse_snap_meta_btree(
        &mut reader,
        vol_sb.snap_meta_tree_oid,
        &volume_omap.root,
        block_size,
    )?;

    Ok(CheckReport {
        volume_name: vol_sb.volume_name,
        block_size,
        container_omap: container_omap.stats,
        volume_omap: volume_omap.stats,
        catalog: catalog.stats,
        extentref: extentref.stats,
        snap_meta: snap_meta.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn open_appfs() -> BufReader<std::fs::File> {
        let file = std::fs::File::open("../tests/appfs.raw").unwrap();
        BufReader::new(file)
    }

    /// Requires ../tests/appfs.raw fixture. Run with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn check_container_on_fixture() {
        let reader = open_appfs();
        let report = check_container(reader).unwrap();

        assert!(!report.volume_name.is_empty());
        assert_eq!(report.block_size, 4096);
        assert!(report.container_omap.key_count > 0);
        assert!(report.volume_omap.key_count > 0);
    }
}
