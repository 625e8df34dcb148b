//! Quorum arithmetic and leader selection.

use crate::NodeId;

/// Compute the quorum size `Q` and fault tolerance `f` for a cluster of `n`.
///
/// The calculation satisfies the following: given a cluster of `n` nodes
/// tolerating `f` failures with `f = (n - 1) / 3`, `Q` is the smallest set
/// size such that any two subsets of size `Q` intersect in at least `f + 1`
/// nodes:
///
/// ```text
/// Q = ceil((n + f + 1) / 2)
/// ```
///
/// Note that `Q` differs from `n - f` (the number of correct nodes) when the
/// cluster carries slack above the `3f + 1` minimum.
pub fn compute_quorum(n: u64) -> (usize, usize) {
    let f = ((n as usize).saturating_sub(1)) / 3;
    let q = (n as usize + f + 1).div_ceil(2);
    (q, f)
}

/// Leader of a view: the member at position `view % n` in ascending node order.
///
/// # Panics
///
/// Panics if `nodes` is empty.
pub fn leader_for_view(nodes: &[NodeId], view: u64) -> NodeId {
    assert!(!nodes.is_empty(), "leader selection over empty membership");
    let mut sorted: Vec<NodeId> = nodes.to_vec();
    sorted.sort_unstable();
    sorted[(view % sorted.len() as u64) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_values() {
        // (n, expected_q, expected_f)
        for (n, q, f) in [
            (4u64, 3usize, 1usize),
            (5, 4, 1),
            (6, 4, 1),
            (7, 5, 2),
            (10, 7, 3),
            (11, 8, 3),
        ] {
            assert_eq!(compute_quorum(n), (q, f), "n = {}", n);
        }
    }

    #[test]
    fn quorums_intersect_in_f_plus_one() {
        for n in 4u64..=13 {
            let (q, f) = compute_quorum(n);
            // Two quorums overlap in at least 2q - n nodes.
            assert!(2 * q >= n as usize + f + 1, "n = {}", n);
        }
    }

    #[test]
    fn leader_rotates_in_sorted_order() {
        let nodes = vec![NodeId(3), NodeId(1), NodeId(2), NodeId(0)];
        assert_eq!(leader_for_view(&nodes, 0), NodeId(0));
        assert_eq!(leader_for_view(&nodes, 1), NodeId(1));
        assert_eq!(leader_for_view(&nodes, 2), NodeId(2));
        assert_eq!(leader_for_view(&nodes, 3), NodeId(3));
        assert_eq!(leader_for_view(&nodes, 4), NodeId(0));
    }

    #[test]
    fn leader_with_sparse_identities() {
        let nodes = vec![NodeId(10), NodeId(20), NodeId(30), NodeId(40)];
        assert_eq!(leader_for_view(&nodes, 2), NodeId(30));
    }
}
