//! Property-based tests for memoria-bt nodes using proptest.

use memoria_bt::{Accumulator, NodeDescriptor, NodeRegistry, TreeNode};
use memoria_core::BlockId;
use memoria_packed::StreamSpec;
use proptest::prelude::*;

fn leaf_descriptor() -> NodeDescriptor {
    NodeDescriptor::leaf(
        "PropLeaf",
        vec![StreamSpec::VdTree { blocks: 2 }, StreamSpec::FSeq { blocks: 1 }],
    )
}

fn branch_descriptor() -> NodeDescriptor {
    NodeDescriptor::branch("PropBranch", vec![StreamSpec::VdTree { blocks: 1 }])
}

fn row_keys(row: &(u64, u64, u64)) -> Accumulator {
    Accumulator::from_streams(vec![vec![row.0, row.1], vec![row.2]])
}

fn node_rows(node: &TreeNode<'_, Vec<u8>>) -> Vec<(u64, u64, u64)> {
    (0..node.size())
        .map(|i| {
            let k = node.keys_at(i);
            (k.get(0, 0), k.get(0, 1), k.get(1, 0))
        })
        .collect()
}

fn row_strategy() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..1000, 0u64..1_000_000, any::<u64>())
}

proptest! {
    /// A leaf behaves like a vector of key rows under inserts and removes.
    #[test]
    fn leaf_matches_vec_model(
        ops in prop::collection::vec((any::<bool>(), any::<usize>(), row_strategy()), 1..200),
    ) {
        let descriptor = leaf_descriptor();
        let mut node = TreeNode::init(vec![0u8; 16384], &descriptor).unwrap();
        node.prepare().unwrap();
        let mut model: Vec<(u64, u64, u64)> = Vec::new();

        for (insert, pos, row) in ops {
            if insert || model.is_empty() {
                let idx = pos % (model.len() + 1);
                node.insert(idx, &row_keys(&row), None).unwrap();
                model.insert(idx, row);
            } else {
                let idx = pos % model.len();
                let removed = node.remove(idx).unwrap();
                prop_assert_eq!(removed, row_keys(&model.remove(idx)));
            }
        }

        prop_assert!(node.check().is_ok());
        prop_assert_eq!(node_rows(&node), model.clone());
        let total = model.iter().fold(Accumulator::from_streams(vec![vec![0, 0], vec![0]]), |mut acc, r| {
            acc.add_assign(&Accumulator::from_streams(vec![vec![r.0, r.1], vec![0]]));
            acc
        });
        let sums = node.sums();
        prop_assert_eq!(sums.stream(0), total.stream(0));
    }

    /// Splitting at any point and merging back restores the node image.
    #[test]
    fn leaf_split_merge_restores(
        rows in prop::collection::vec((0u64..1000, 0u64..1000, 0u64..1000), 0..150),
        split_frac in 0.0f64..=1.0,
    ) {
        let descriptor = leaf_descriptor();
        let mut left = TreeNode::init(vec![0u8; 16384], &descriptor).unwrap();
        left.prepare().unwrap();
        for (i, row) in rows.iter().enumerate() {
            left.insert(i, &row_keys(row), None).unwrap();
        }
        let before = left.serialize();
        let total = left.sums();

        let at = ((rows.len() as f64) * split_frac) as usize;
        let mut right = TreeNode::init(vec![0u8; 16384], &descriptor).unwrap();
        right.prepare().unwrap();
        let moved = left.split_to(&mut right, at).unwrap();

        prop_assert_eq!(left.size() + right.size(), rows.len());
        prop_assert_eq!(&moved, &right.sums());
        let mut combined = left.sums();
        combined.add_assign(&moved);
        prop_assert_eq!(combined, total);

        left.merge_with(&mut right).unwrap();
        prop_assert_eq!(right.size(), 0);
        prop_assert_eq!(left.serialize(), before);
    }

    /// Child ids stay aligned with their keys through split and merge.
    #[test]
    fn branch_children_stay_aligned(
        keys in prop::collection::vec(0u64..100_000, 1..100),
        split_frac in 0.0f64..1.0,
    ) {
        let descriptor = branch_descriptor();
        let mut left = TreeNode::init(vec![0u8; 8192], &descriptor).unwrap();
        left.prepare().unwrap();
        for (i, k) in keys.iter().enumerate() {
            let acc = Accumulator::from_streams(vec![vec![*k]]);
            left.insert(i, &acc, Some(BlockId::new(i as u128 + 1))).unwrap();
        }

        let at = ((keys.len() as f64) * split_frac) as usize;
        let mut right = TreeNode::init(vec![0u8; 8192], &descriptor).unwrap();
        left.split_to(&mut right, at).unwrap();
        prop_assert!(left.check().is_ok());
        prop_assert!(right.check().is_ok());
        for i in 0..right.size() {
            prop_assert_eq!(right.child_id(i).unwrap(), BlockId::new((at + i) as u128 + 1));
            prop_assert_eq!(right.keys_at(i).get(0, 0), keys[at + i]);
        }

        left.merge_with(&mut right).unwrap();
        let expected: Vec<BlockId> = (1..=keys.len() as u128).map(BlockId::new).collect();
        prop_assert_eq!(left.children(), expected);
    }

    /// Node images survive a trip through the registry.
    #[test]
    fn deserialize_preserves_sums(rows in prop::collection::vec((0u64..1000, 0u64..1000, 0u64..1000), 0..100)) {
        let mut registry = NodeRegistry::new();
        registry.register(leaf_descriptor()).unwrap();
        let descriptor = leaf_descriptor();
        let mut node = TreeNode::init(vec![0u8; 8192], &descriptor).unwrap();
        node.prepare().unwrap();
        for (i, row) in rows.iter().enumerate() {
            node.insert(i, &row_keys(row), None).unwrap();
        }
        let restored = TreeNode::deserialize(&node.serialize(), &registry).unwrap();
        prop_assert_eq!(restored.sums(), node.sums());
        prop_assert_eq!(node_rows(&restored), rows);
    }
}
