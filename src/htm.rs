//! Trixel id algebra for the hierarchical triangular mesh.
//!
//! Ids are plain `u64`s. The two root trixels are `0b10` (southern hemisphere)
//! and `0b11` (northern hemisphere); every deeper level appends two bits, one
//! of four children per parent. All functions here are pure.

use serde::{Deserialize, Serialize};

pub type TrixelId = u64;

/// Highest level the id encoding supports (level 24 ids use 50 bits).
pub const MAX_ENCODABLE_LEVEL: u8 = 24;

/// A trixel sub-tree delegated to (or excluded from) this TMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub trixel_id: TrixelId,
    #[serde(default)]
    pub exclude: bool,
}

fn bit_length(id: TrixelId) -> u32 {
    64 - id.leading_zeros()
}

/// Whether `id` is a well-formed trixel id (even bit length, below the level cap).
pub fn is_valid(id: TrixelId) -> bool {
    let bits = bit_length(id);
    id >= 2 && bits % 2 == 0 && bits <= 2 * (MAX_ENCODABLE_LEVEL as u32 + 1)
}

/// Subdivision level of `id`. `None` for malformed ids; roots are level 0.
pub fn level(id: TrixelId) -> Option<u8> {
    if !is_valid(id) {
        return None;
    }
    Some((bit_length(id) / 2 - 1) as u8)
}

/// Parent of `id`, or `None` at the root level.
pub fn parent(id: TrixelId) -> Option<TrixelId> {
    match level(id)? {
        0 => None,
        _ => Some(id >> 2),
    }
}

/// The four children of `id`, or `None` at the encoding cap.
pub fn children(id: TrixelId) -> Option<[TrixelId; 4]> {
    let lvl = level(id)?;
    if lvl >= MAX_ENCODABLE_LEVEL {
        return None;
    }
    let base = id << 2;
    Some([base, base | 1, base | 2, base | 3])
}

/// Sibling trixels of `id`: the other three children of its parent, or the
/// opposite hemisphere root at level 0.
pub fn neighbors(id: TrixelId) -> Vec<TrixelId> {
    match level(id) {
        None => Vec::new(),
        Some(0) => vec![id ^ 1],
        Some(_) => {
            let base = (id >> 2) << 2;
            (0..4).map(|c| base | c).filter(|&s| s != id).collect()
        }
    }
}

/// Whether `id` lies within the sub-tree rooted at `ancestor` (inclusive).
pub fn is_descendant(id: TrixelId, ancestor: TrixelId) -> bool {
    match (level(id), level(ancestor)) {
        (Some(l), Some(la)) if l >= la => id >> ((l - la) as u32 * 2) == ancestor,
        _ => false,
    }
}

/// Resolve whether `id` is delegated to this TMS.
///
/// Among all delegations that cover `id` (itself or an ancestor), the deepest
/// one wins; `id` is delegated iff that winner is not an exclusion.
pub fn is_delegated(id: TrixelId, delegations: &[Delegation]) -> bool {
    let Some(lvl) = level(id) else {
        return false;
    };

    let mut winner: Option<(&Delegation, u8)> = None;
    for delegation in delegations {
        let Some(delegation_level) = level(delegation.trixel_id) else {
            continue;
        };
        if delegation_level > lvl {
            continue;
        }
        let sub_id = id >> ((lvl - delegation_level) as u32 * 2);
        if sub_id != delegation.trixel_id {
            continue;
        }
        match winner {
            Some((_, depth)) if depth >= delegation_level => {}
            _ => winner = Some((delegation, delegation_level)),
        }
    }

    matches!(winner, Some((d, _)) if !d.exclude)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roots_and_children() {
        assert_eq!(level(2), Some(0));
        assert_eq!(level(3), Some(0));
        assert_eq!(level(8), Some(1));
        assert_eq!(level(32), Some(2));
        assert_eq!(level(0), None);
        assert_eq!(level(1), None);
        // Odd bit length is malformed
        assert_eq!(level(4), None);
    }

    #[test]
    fn test_parent_child_roundtrip() {
        assert_eq!(parent(2), None);
        assert_eq!(parent(8), Some(2));
        assert_eq!(parent(32), Some(8));
        for child in children(8).unwrap() {
            assert_eq!(parent(child), Some(8));
            assert_eq!(level(child), Some(2));
        }
    }

    #[test]
    fn test_children_at_cap() {
        let mut id: TrixelId = 2;
        for _ in 0..MAX_ENCODABLE_LEVEL {
            id = children(id).unwrap()[0];
        }
        assert_eq!(level(id), Some(MAX_ENCODABLE_LEVEL));
        assert_eq!(children(id), None);
    }

    #[test]
    fn test_neighbors() {
        assert_eq!(neighbors(2), vec![3]);
        assert_eq!(neighbors(3), vec![2]);
        let siblings = neighbors(9);
        assert_eq!(siblings, vec![8, 10, 11]);
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant(32, 8));
        assert!(is_descendant(32, 2));
        assert!(is_descendant(8, 8));
        assert!(!is_descendant(8, 32));
        assert!(!is_descendant(12, 2)); // northern root's child vs southern root
    }

    #[test]
    fn test_delegation_include() {
        let delegations = vec![Delegation { trixel_id: 8, exclude: false }];
        assert!(is_delegated(8, &delegations));
        assert!(is_delegated(32, &delegations));
        assert!(!is_delegated(9, &delegations));
        assert!(!is_delegated(2, &delegations));
    }

    #[test]
    fn test_delegation_inner_exclude_shadows() {
        let delegations = vec![
            Delegation { trixel_id: 2, exclude: false },
            Delegation { trixel_id: 8, exclude: true },
        ];
        assert!(is_delegated(2, &delegations));
        assert!(is_delegated(9, &delegations));
        assert!(!is_delegated(8, &delegations));
        assert!(!is_delegated(32, &delegations)); // under the excluded sub-tree
    }

    #[test]
    fn test_delegation_deepest_wins_regardless_of_order() {
        let delegations = vec![
            Delegation { trixel_id: 32, exclude: false },
            Delegation { trixel_id: 8, exclude: true },
            Delegation { trixel_id: 2, exclude: false },
        ];
        // 32 is re-included below the level-1 exclusion
        assert!(is_delegated(32, &delegations));
        assert!(is_delegated(129, &delegations)); // child of 32
        assert!(!is_delegated(33, &delegations));
    }
}
