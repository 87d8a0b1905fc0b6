//! Subtree Walker (C4), Footer Checker (C5), and Tree Entry Points (C7).
//!
//! A single recursive walker handles leaf vs. internal branches and
//! validates everything — every record is visited regardless of any
//! search key, ordering and allocation invariants are enforced as they
//! go, and the four tree personalities (`omap`/`catalog`/`extentref`/
//! `snap_meta`) are threaded through one walker instead of one-off
//! lookup functions per tree.
//!
//! `BTreeInfo` itself (footer parsing) is kept in `node.rs`, since it is
//! parsed as part of the node body; this module only adds the
//! validation pass over it.

use std::cmp::Ordering;
use std::io::{Read, Seek};

use crate::error::{ApfsError, Result};
use crate::freespace;
use crate::keys::{self, Key, NameFolding};
use crate::node::{self, Node};
use crate::object;
use crate::query::{self, QUERY_EXACT};
use crate::records;

/// Which of the four on-disk tree kinds a `Btree`/`Node` belongs to.
/// Associated rules (fixed-kv requirement, expected object subtype, leaf
/// record validator, key decoder) attach as methods below instead of an
/// if-ladder scattered across the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    Omap,
    Catalog,
    ExtentRef,
    SnapMeta,
}

impl Personality {
    pub fn is_fixed_kv(self) -> bool {
        matches!(self, Personality::Omap)
    }

    pub fn expected_subtype(self) -> u32 {
        match self {
            Personality::Omap => object::OBJECT_TYPE_OMAP_SUBTYPE,
            Personality::Catalog => object::OBJECT_TYPE_FSTREE,
            Personality::ExtentRef => object::OBJECT_TYPE_BLOCKREFTREE,
            Personality::SnapMeta => object::OBJECT_TYPE_SNAPMETATREE,
        }
    }

    /// `(fixed_key_size, fixed_val_size)`, zero for variable-kv trees.
    pub fn fixed_sizes(self) -> (u32, u32) {
        match self {
            Personality::Omap => (16, 16),
            _ => (0, 0),
        }
    }

    /// Whether cross-level xid monotonicity (Invariant 11) applies: a
    /// parent must be updated whenever any descendant is rewritten.
    /// Spec'd for omap and extentref trees only.
    fn checks_xid_monotonicity(self) -> bool {
        matches!(self, Personality::Omap | Personality::ExtentRef)
    }

    fn label(self) -> &'static str {
        match self {
            Personality::Omap => "Object map",
            Personality::Catalog => "Catalog tree",
            Personality::ExtentRef => "Extent reference tree",
            Personality::SnapMeta => "Snapshot metadata tree",
        }
    }
}

/// Global, read-only context threaded through one tree's walk and
/// queries: the tree's personality, block size, optional omap for
/// virtual-oid resolution, the transaction id queries are bounded by,
/// and the name-folding policy read from the volume superblock.
#[derive(Clone, Copy)]
pub struct TreeContext<'a> {
    pub personality: Personality,
    pub block_size: u32,
    pub omap_root: Option<&'a Node>,
    pub xid: u64,
    pub folding: NameFolding,
}

impl TreeContext<'static> {
    pub fn for_omap_lookup(block_size: u32, xid: u64) -> Self {
        TreeContext { personality: Personality::Omap, block_size, omap_root: None, xid, folding: NameFolding { case_insensitive: false } }
    }

    pub fn for_extentref_lookup(block_size: u32) -> Self {
        TreeContext { personality: Personality::ExtentRef, block_size, omap_root: None, xid: 0, folding: NameFolding { case_insensitive: false } }
    }
}

/// Running statistics accumulated over one tree walk, checked against
/// the root's `BTreeInfo` footer at the end.
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub key_count: u64,
    pub node_count: u64,
    pub longest_key: u32,
    pub longest_val: u32,
}

/// One fully verified B-tree: its personality, root node (kept for the
/// lifetime of the check), the omap root used to resolve its virtual
/// oids (`None` for the object map itself, which is physical), and the
/// statistics accumulated over the walk.
pub struct Btree {
    pub personality: Personality,
    pub root: Node,
    pub omap_root: Option<Box<Node>>,
    pub stats: TreeStats,
}

/// Recursively validate one subtree rooted at `node`, threading the
/// largest key seen so far so ordering holds across node boundaries.
/// `node` is a mutable borrow for the root (so its bitmaps and identity
/// survive into `check_footer`/the returned `Btree`) and an owned,
/// drop-on-return value for every descendant.
fn walk_subtree<R: Read + Seek>(
    reader: &mut R,
    ctx: &TreeContext,
    node: &mut Node,
    last_key: &mut Option<Key>,
    depth: u32,
    stats: &mut TreeStats,
) -> Result<()> {
    if depth > 12 {
        return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "B-tree is too deep."));
    }

    let expected_type = if node.is_root() { object::OBJECT_TYPE_BTREE } else { object::OBJECT_TYPE_BTREE_NODE };
    if node.object.obj_type != expected_type {
        return Err(ApfsError::structural_at(
            ctx.personality.label(),
            node.object.block_nr,
            format!("unexpected object type 0x{:x} for {} node", node.object.obj_type, if node.is_root() { "root" } else { "non-root" }),
        ));
    }
    if node.object.subtype != ctx.personality.expected_subtype() {
        return Err(ApfsError::structural_at(
            ctx.personality.label(),
            node.object.block_nr,
            format!("unexpected object subtype 0x{:x}", node.object.subtype),
        ));
    }
    if node.is_leaf() != (node.level == 0) {
        return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "node level does not agree with its leaf flag"));
    }
    if ctx.personality.is_fixed_kv() != node.is_fixed_kv() {
        return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "fixed-kv flag does not match tree personality"));
    }
    if ctx.personality == Personality::SnapMeta && node.is_root() && !node.is_leaf() {
        return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "snapshot metadata tree root is not a leaf"));
    }

    stats.node_count += 1;
    if node.is_leaf() {
        stats.key_count += node.records as u64;
    }

    if ctx.personality == Personality::SnapMeta && node.records > 0 {
        return Err(ApfsError::UnsupportedFeature("non-empty snapshot metadata tree".into()));
    }

    for i in 0..node.records as usize {
        let (key_start, key_len) = node.locate_key(i)?;
        node.mark_used_key(key_start, key_len)?;
        if key_len as u32 > stats.longest_key {
            stats.longest_key = key_len as u32;
        }

        let mut curr_key = keys::decode(ctx.personality, node.key_bytes(i)?)?;

        if ctx.personality == Personality::Omap && curr_key.number > node.object.xid {
            return Err(ApfsError::structural_at(
                ctx.personality.label(),
                node.object.block_nr,
                "object map record xid exceeds the xid of its owning node",
            ));
        }

        if let Some(last) = last_key.as_ref() {
            let cmp = keys::keycmp(last, &curr_key, ctx.folding);
            if cmp == Ordering::Greater || (node.is_leaf() && cmp == Ordering::Equal) {
                return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "keys are out of order."));
            }
        }

        let (val_start, val_len) = node.locate_value(i)?;
        node.mark_used_value(val_start, val_len)?;

        if node.is_leaf() {
            if val_len as u32 > stats.longest_val {
                stats.longest_val = val_len as u32;
            }
            let value_bytes = node.value_bytes(i)?.to_vec();
            match ctx.personality {
                Personality::Omap => {}
                Personality::Catalog => {
                    records::validate_catalog_record(&curr_key, &value_bytes)?;
                }
                Personality::ExtentRef => {
                    curr_key.id = records::validate_phys_ext(&curr_key, &value_bytes)?;
                }
                Personality::SnapMeta => unreachable!("non-empty snapshot metadata tree already rejected above"),
            }
            *last_key = Some(curr_key);
        } else {
            if val_len != 8 {
                return Err(ApfsError::structural_at(ctx.personality.label(), node.object.block_nr, "internal node value is not an 8-byte child oid"));
            }
            let child_oid = node.child_oid(i)?;
            let mut child = query::read_child(reader, ctx, child_oid)?;

            if child.is_root() {
                return Err(ApfsError::structural_at(ctx.personality.label(), child.object.block_nr, "non-root child carries the ROOT flag"));
            }
            if child.level + 1 != node.level {
                return Err(ApfsError::structural_at(ctx.personality.label(), child.object.block_nr, "child level does not equal parent level minus one"));
            }
            if ctx.personality.checks_xid_monotonicity() && child.object.xid > node.object.xid {
                return Err(ApfsError::structural_at(ctx.personality.label(), child.object.block_nr, "xid of node is older than xid of its child."));
            }

            walk_subtree(reader, ctx, &mut child, last_key, depth + 1, stats)?;
            *last_key = Some(curr_key);
        }
    }

    freespace::reconcile("key area", node.object.block_nr, &node.free_key_bmap, &node.used_key_bmap, node.key_free_list_len)?;
    freespace::reconcile("value area", node.object.block_nr, &node.free_val_bmap, &node.used_val_bmap, node.val_free_list_len)?;

    Ok(())
}

/// Footer Checker (C5): validate the root's `BTreeInfo` footer against
/// the statistics accumulated by `walk_subtree`.
fn check_footer(node: &Node, stats: &TreeStats, personality: Personality, block_size: u32) -> Result<()> {
    if !node.is_root() {
        return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "footer check requires the tree root"));
    }
    let info = node.info.as_ref().ok_or_else(|| {
        ApfsError::structural_at(personality.label(), node.object.block_nr, "root node carries no info footer")
    })?;

    if info.node_size != block_size {
        return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "footer node size does not match the container block size"));
    }
    if info.key_count != stats.key_count {
        return Err(ApfsError::structural_at(
            personality.label(),
            node.object.block_nr,
            format!("footer key count {} does not match measured count {}", info.key_count, stats.key_count),
        ));
    }
    if info.node_count != stats.node_count {
        return Err(ApfsError::structural_at(
            personality.label(),
            node.object.block_nr,
            format!("footer node count {} does not match measured count {}", info.node_count, stats.node_count),
        ));
    }

    match personality {
        Personality::Omap => {
            if info.key_size != 16 || info.val_size != 16 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "object map footer key/value sizes are not 16 bytes"));
            }
            if info.longest_key != 16 || info.longest_val != 16 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "object map footer longest key/value does not equal 16 bytes"));
            }
        }
        Personality::Catalog => {
            if info.key_size != 0 || info.val_size != 0 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "catalog tree is not variable-kv in its footer"));
            }
            if info.longest_key < stats.longest_key || info.longest_val < stats.longest_val {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "footer longest key/value understates measured maximum"));
            }
        }
        Personality::ExtentRef => {
            if info.key_size != 0 || info.val_size != 0 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "extent reference tree is not variable-kv in its footer"));
            }
            if info.longest_key != 8 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "extent reference footer longest key is not 8 bytes"));
            }
            if info.longest_val != 20 {
                return Err(ApfsError::structural_at(personality.label(), node.object.block_nr, "extent reference footer longest value is not 20 bytes"));
            }
        }
        Personality::SnapMeta => {
            if info.longest_key != 0 || info.longest_val != 0 {
                return Err(ApfsError::structural_at(
                    personality.label(),
                    node.object.block_nr,
                    "footer claims non-zero longest key/value for an empty snapshot metadata tree",
                ));
            }
        }
    }

    Ok(())
}

fn validate_tree<R: Read + Seek>(reader: &mut R, mut root: Node, ctx: TreeContext, block_size: u32, omap_root: Option<Box<Node>>) -> Result<Btree> {
    let mut stats = TreeStats::default();
    let mut last_key = None;
    walk_subtree(reader, &ctx, &mut root, &mut last_key, 0, &mut stats)?;
    check_footer(&root, &stats, ctx.personality, block_size)?;
    Ok(Btree { personality: ctx.personality, root, omap_root, stats })
}

/// `omap_phys_t`'s fixed prefix after the object header: `om_flags: u32,
/// om_snap_count: u32, om_tree_type: u32, om_snap_tree_type: u32,
/// om_tree_oid: u64` — only `om_tree_oid` (the omap's own root) matters here.
fn omap_phys_tree_oid(block: &[u8]) -> Result<u64> {
    let start = object::ObjectHeader::SIZE + 16;
    if block.len() < start + 8 {
        return Err(ApfsError::structural("object map", "omap_phys object too short"));
    }
    Ok(u64::from_le_bytes(block[start..start + 8].try_into().unwrap()))
}

/// Parse and fully verify the object map tree rooted (indirectly) at
/// `omap_phys_oid` — a physical block holding an `omap_phys_t`, whose
/// `om_tree_oid` is the tree's actual, also-physical root.
pub fn parse_omap_btree<R: Read + Seek>(reader: &mut R, omap_phys_oid: u64, block_size: u32) -> Result<Btree> {
    let (omap_object, omap_block) = object::read_object(reader, omap_phys_oid, block_size)?;
    if omap_object.obj_type != object::OBJECT_TYPE_OMAP {
        return Err(ApfsError::structural_at("object map", omap_object.block_nr, "expected an object map object"));
    }
    let tree_oid = omap_phys_tree_oid(&omap_block)?;

    let root = node::read_node(reader, tree_oid, block_size, 16, 16)?;
    let ctx = TreeContext { personality: Personality::Omap, block_size, omap_root: None, xid: root.object.xid, folding: NameFolding { case_insensitive: false } };
    validate_tree(reader, root, ctx, block_size, None)
}

fn parse_virtual_btree<R: Read + Seek>(
    reader: &mut R,
    personality: Personality,
    root_oid: u64,
    omap_root: &Node,
    block_size: u32,
    folding: NameFolding,
) -> Result<Btree> {
    let (block_nr, xid) = query::omap_lookup(reader, omap_root, block_size, root_oid, omap_root.object.xid)?;
    let (fixed_key_size, fixed_val_size) = personality.fixed_sizes();
    let root = node::read_node(reader, block_nr, block_size, fixed_key_size, fixed_val_size)?;
    let ctx = TreeContext { personality, block_size, omap_root: Some(omap_root), xid, folding };
    let omap_copy = node::read_node(reader, omap_root.object.block_nr, block_size, omap_root.fixed_key_size, omap_root.fixed_val_size)?;
    validate_tree(reader, root, ctx, block_size, Some(Box::new(omap_copy)))
}

/// Parse and fully verify the file-system catalog tree. `folding`
/// selects the name-comparison policy (from the volume superblock's
/// case-insensitivity flag).
pub fn parse_cat_btree<R: Read + Seek>(reader: &mut R, root_oid: u64, omap_root: &Node, block_size: u32, folding: NameFolding) -> Result<Btree> {
    parse_virtual_btree(reader, Personality::Catalog, root_oid, omap_root, block_size, folding)
}

pub fn parse_extentref_btree<R: Read + Seek>(reader: &mut R, root_oid: u64, omap_root: &Node, block_size: u32) -> Result<Btree> {
    parse_virtual_btree(reader, Personality::ExtentRef, root_oid, omap_root, block_size, NameFolding { case_insensitive: false })
}

pub fn parse_snap_meta_btree<R: Read + Seek>(reader: &mut R, root_oid: u64, omap_root: &Node, block_size: u32) -> Result<Btree> {
    parse_virtual_btree(reader, Personality::SnapMeta, root_oid, omap_root, block_size, NameFolding { case_insensitive: false })
}

/// Convenience wrapper around the `QUERY_EXACT` flag for single-match
/// query entry points.
pub fn exact_flag() -> u8 {
    QUERY_EXACT
}
