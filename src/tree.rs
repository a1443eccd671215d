//! Spanning-tree topologies for collective fan-out: flat, k-ary and
//! k-nomial. All public queries run on a filtered group view (membership
//! minus an excluded-rank set) and translate between logical tree positions
//! and primary ranks.

use num_enum::TryFromPrimitive;
use std::{borrow::Cow, convert::TryFrom};

use crate::{
    group::Group,
    util::{rank_list_filter, rank_list_index},
    Error, Rank, Result,
};

pub const TREE_MIN_RATIO: u32 = 2;
pub const TREE_MAX_RATIO: u32 = 64;

const TREE_TYPE_SHIFT: u32 = 16;
const TREE_RATIO_MASK: u32 = (1 << TREE_TYPE_SHIFT) - 1;

#[derive(TryFromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TreeType {
    Flat = 1,
    Kary = 2,
    Knomial = 3,
}

/// Tree type plus branch ratio, packed into one word so it can ride in the
/// collective wire section unchanged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TreeTopo(u32);

impl TreeTopo {
    pub fn new(ty: TreeType, ratio: u32) -> Result<TreeTopo> {
        if ty != TreeType::Flat && !(TREE_MIN_RATIO..=TREE_MAX_RATIO).contains(&ratio) {
            log::error!("tree ratio {} outside [{}, {}]", ratio, TREE_MIN_RATIO, TREE_MAX_RATIO);
            return Err(Error::Inval);
        }

        Ok(TreeTopo(((ty as u32) << TREE_TYPE_SHIFT) | (ratio & TREE_RATIO_MASK)))
    }

    pub fn flat() -> TreeTopo {
        TreeTopo((TreeType::Flat as u32) << TREE_TYPE_SHIFT)
    }

    pub fn kary(ratio: u32) -> Result<TreeTopo> {
        TreeTopo::new(TreeType::Kary, ratio)
    }

    pub fn knomial(ratio: u32) -> Result<TreeTopo> {
        TreeTopo::new(TreeType::Knomial, ratio)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Result<TreeTopo> {
        let ty = TreeType::try_from(raw >> TREE_TYPE_SHIFT).map_err(|_| {
            log::error!("bad tree type in topo {:#x}", raw);
            Error::Inval
        })?;

        TreeTopo::new(ty, raw & TREE_RATIO_MASK)
    }

    pub fn tree_type(&self) -> TreeType {
        TreeType::try_from(self.0 >> TREE_TYPE_SHIFT).expect("validated at construction")
    }

    pub fn ratio(&self) -> u32 {
        self.0 & TREE_RATIO_MASK
    }
}

/// Children of the tree rank `t` in a tree of `size` nodes, in forward
/// order. Tree rank 0 is the root; callers rotate real positions through
/// [`to_tree_rank`] first.
fn topo_children(ty: TreeType, size: u32, ratio: u32, t: u32) -> Vec<u32> {
    // Widened so t * ratio cannot overflow near the top of the rank space.
    let (size, ratio, t) = (size as u64, ratio as u64, t as u64);
    let mut children = Vec::new();

    match ty {
        TreeType::Flat => {
            if t == 0 {
                children.extend((1..size).map(|c| c as u32));
            }
        }
        TreeType::Kary => {
            let first = t * ratio + 1;
            children.extend(
                (first..first + ratio)
                    .take_while(|c| *c < size)
                    .map(|c| c as u32),
            );
        }
        TreeType::Knomial => {
            // Level distances are the powers of the ratio below the group
            // size; a node owns a level iff it is a round leader there.
            // Highest level first, so the widest subtree is dispatched
            // earliest.
            let mut dists = Vec::new();
            let mut dist = 1u64;
            while dist < size {
                dists.push(dist);
                dist *= ratio;
            }

            for dist in dists.into_iter().rev() {
                if t % (dist * ratio) != 0 {
                    continue;
                }
                for j in 1..ratio {
                    let c = t + j * dist;
                    if c < size {
                        children.push(c as u32);
                    }
                }
            }
        }
    }

    children
}

/// Parent of a non-root tree rank.
fn topo_parent(ty: TreeType, ratio: u32, t: u32) -> u32 {
    debug_assert!(t > 0);
    let (ratio, t) = (ratio as u64, t as u64);

    let parent = match ty {
        TreeType::Flat => 0,
        TreeType::Kary => (t - 1) / ratio,
        TreeType::Knomial => {
            let mut dist = 1u64;
            while t % (dist * ratio) == 0 {
                dist *= ratio;
            }
            t - t % (dist * ratio)
        }
    };

    parent as u32
}

fn to_tree_rank(grp_rank: u32, grp_root: u32, size: u32) -> u32 {
    (grp_rank + size - grp_root) % size
}

fn from_tree_rank(tree_rank: u32, grp_root: u32, size: u32) -> u32 {
    (tree_rank + grp_root) % size
}

/// The filtered membership view a tree is built over: the dense primary-rank
/// list after exclusion, plus the logical positions of root and self within
/// it. `None` when exclusion empties the group (callers treat the tree as
/// absent).
fn filtered_view<'a>(
    grp: &'a Group,
    excluded: Option<&[Rank]>,
    root: u32,
    self_idx: u32,
) -> Result<Option<(Cow<'a, [Rank]>, u32, u32)>> {
    let membs = grp.membs();

    match excluded {
        None | Some([]) => Ok(Some((Cow::Borrowed(membs), root, self_idx))),
        Some(excluded) => {
            let mut filtered = membs.to_vec();
            rank_list_filter(&mut filtered, excluded);

            if filtered.is_empty() {
                log::debug!("group {:?} empty after exclusion", grp.id());
                return Ok(None);
            }

            let grp_root = rank_list_index(&filtered, membs[root as usize]).ok_or_else(|| {
                log::error!("root {} of group {:?} is excluded", root, grp.id());
                Error::Nonexist
            })?;
            let grp_self = rank_list_index(&filtered, membs[self_idx as usize]).ok_or_else(|| {
                log::error!("rank {} of group {:?} is excluded", self_idx, grp.id());
                Error::Nonexist
            })?;

            Ok(Some((Cow::Owned(filtered), grp_root, grp_self)))
        }
    }
}

/// Children of `self_idx` (position within `grp`) in the `topo` tree rooted
/// at `root`, as primary ranks. Empty when the node is a leaf or exclusion
/// emptied the group.
pub fn get_children(
    grp: &Group,
    excluded: Option<&[Rank]>,
    topo: TreeTopo,
    root: u32,
    self_idx: u32,
) -> Result<Vec<Rank>> {
    if root >= grp.size() || self_idx >= grp.size() {
        log::error!(
            "root {} / self {} out of range for group {:?} of size {}",
            root,
            self_idx,
            grp.id(),
            grp.size()
        );
        return Err(Error::Inval);
    }

    let (list, grp_root, grp_self) = match filtered_view(grp, excluded, root, self_idx)? {
        Some(view) => view,
        None => return Ok(Vec::new()),
    };

    let size = list.len() as u32;
    let t = to_tree_rank(grp_self, grp_root, size);
    let children = topo_children(topo.tree_type(), size, topo.ratio(), t);

    Ok(children
        .into_iter()
        .map(|c| list[from_tree_rank(c, grp_root, size) as usize])
        .collect())
}

/// Parent of a non-root `self_idx` in the same tree, as a primary rank.
pub fn get_parent(
    grp: &Group,
    excluded: Option<&[Rank]>,
    topo: TreeTopo,
    root: u32,
    self_idx: u32,
) -> Result<Rank> {
    if root >= grp.size() || self_idx >= grp.size() {
        return Err(Error::Inval);
    }

    let (list, grp_root, grp_self) = match filtered_view(grp, excluded, root, self_idx)? {
        Some(view) => view,
        None => {
            log::debug!("group {:?} empty after exclusion", grp.id());
            return Err(Error::Inval);
        }
    };

    let size = list.len() as u32;
    let t = to_tree_rank(grp_self, grp_root, size);
    if t == 0 {
        log::error!("rank {} is the root of group {:?}, no parent", self_idx, grp.id());
        return Err(Error::Inval);
    }

    let parent = topo_parent(topo.tree_type(), topo.ratio(), t);
    Ok(list[from_tree_rank(parent, grp_root, size) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;

    fn group_of(size: u32) -> Group {
        Group::new_primary("t", (0..size).collect())
    }

    fn children(grp: &Group, topo: TreeTopo, root: u32, node: u32) -> Vec<Rank> {
        get_children(grp, None, topo, root, node).unwrap()
    }

    #[test]
    fn topo_encoding_round_trips() {
        let topo = TreeTopo::kary(4).unwrap();
        assert_eq!(TreeTopo::from_raw(topo.raw()).unwrap(), topo);
        assert_eq!(topo.tree_type(), TreeType::Kary);
        assert_eq!(topo.ratio(), 4);

        assert!(TreeTopo::kary(1).is_err());
        assert!(TreeTopo::kary(65).is_err());
        assert!(TreeTopo::from_raw(0xdead_0002).is_err());
    }

    #[test]
    fn single_and_pair_boundaries() {
        let one = group_of(1);
        assert!(children(&one, TreeTopo::flat(), 0, 0).is_empty());

        let two = group_of(2);
        for topo in [
            TreeTopo::flat(),
            TreeTopo::kary(2).unwrap(),
            TreeTopo::knomial(2).unwrap(),
        ] {
            assert_eq!(children(&two, topo, 0, 0), [1]);
            assert!(children(&two, topo, 0, 1).is_empty());
            assert_eq!(get_parent(&two, None, topo, 0, 1).unwrap(), 0);
        }
    }

    #[test]
    fn flat_fans_out_from_root() {
        let grp = group_of(5);
        let topo = TreeTopo::flat();

        assert_eq!(children(&grp, topo, 0, 0), [1, 2, 3, 4]);
        for node in 1..5 {
            assert!(children(&grp, topo, 0, node).is_empty());
            assert_eq!(get_parent(&grp, None, topo, 0, node).unwrap(), 0);
        }
    }

    #[test]
    fn kary_two_seven_ranks() {
        let grp = group_of(7);
        let topo = TreeTopo::kary(2).unwrap();

        assert_eq!(children(&grp, topo, 0, 0), [1, 2]);
        assert_eq!(children(&grp, topo, 0, 1), [3, 4]);
        assert_eq!(children(&grp, topo, 0, 2), [5, 6]);
        for node in 3..7 {
            assert!(children(&grp, topo, 0, node).is_empty());
        }

        assert_eq!(get_parent(&grp, None, topo, 0, 4).unwrap(), 1);
        assert_eq!(get_parent(&grp, None, topo, 0, 6).unwrap(), 2);
    }

    #[test]
    fn knomial_two_eight_ranks() {
        let grp = group_of(8);
        let topo = TreeTopo::knomial(2).unwrap();

        assert_eq!(children(&grp, topo, 0, 0), [4, 2, 1]);
        assert_eq!(children(&grp, topo, 0, 4), [6, 5]);
        assert_eq!(children(&grp, topo, 0, 2), [3]);
        assert_eq!(children(&grp, topo, 0, 6), [7]);
        for node in [1, 3, 5, 7] {
            assert!(children(&grp, topo, 0, node).is_empty());
        }

        assert_eq!(get_parent(&grp, None, topo, 0, 1).unwrap(), 0);
        assert_eq!(get_parent(&grp, None, topo, 0, 3).unwrap(), 2);
        assert_eq!(get_parent(&grp, None, topo, 0, 5).unwrap(), 4);
        assert_eq!(get_parent(&grp, None, topo, 0, 7).unwrap(), 6);
    }

    #[test]
    fn knomial_three_nine_ranks() {
        let grp = group_of(9);
        let topo = TreeTopo::knomial(3).unwrap();

        assert_eq!(children(&grp, topo, 0, 0), [3, 6, 1, 2]);
        assert_eq!(children(&grp, topo, 0, 3), [4, 5]);
        assert_eq!(children(&grp, topo, 0, 6), [7, 8]);
        assert_eq!(get_parent(&grp, None, topo, 0, 5).unwrap(), 3);
        assert_eq!(get_parent(&grp, None, topo, 0, 6).unwrap(), 0);
    }

    #[test]
    fn nonzero_root_rotates() {
        let grp = group_of(7);
        let topo = TreeTopo::kary(2).unwrap();

        // With root 3 the logical tree is the rotation 3,4,5,6,0,1,2.
        assert_eq!(children(&grp, topo, 3, 3), [4, 5]);
        assert_eq!(children(&grp, topo, 3, 4), [6, 0]);
        assert_eq!(children(&grp, topo, 3, 5), [1, 2]);
        assert_eq!(get_parent(&grp, None, topo, 3, 0).unwrap(), 4);
        assert_eq!(get_parent(&grp, None, topo, 3, 3).unwrap_err(), Error::Inval);
    }

    #[test]
    fn exclusion_compacts_the_tree() {
        let grp = group_of(8);
        let topo = TreeTopo::kary(2).unwrap();

        // Excluding 2 and 5 leaves 0,1,3,4,6,7.
        let excluded = [2, 5];
        assert_eq!(get_children(&grp, Some(&excluded), topo, 0, 0).unwrap(), [1, 3]);
        assert_eq!(get_children(&grp, Some(&excluded), topo, 0, 1).unwrap(), [4, 6]);
        assert_eq!(get_children(&grp, Some(&excluded), topo, 0, 3).unwrap(), [7]);
        assert_eq!(
            get_parent(&grp, Some(&excluded), topo, 0, 7).unwrap(),
            3
        );

        // An excluded self has no place in the tree.
        assert_eq!(
            get_children(&grp, Some(&excluded), topo, 0, 2).unwrap_err(),
            Error::Nonexist
        );
    }

    #[test]
    fn full_exclusion_means_no_tree() {
        let grp = group_of(3);
        let excluded = [0, 1, 2];

        assert!(get_children(&grp, Some(&excluded), TreeTopo::flat(), 0, 0)
            .unwrap()
            .is_empty());
        assert_eq!(
            get_parent(&grp, Some(&excluded), TreeTopo::flat(), 0, 1).unwrap_err(),
            Error::Inval
        );
    }
}
