use crate::{BranchNode, LeafNode, Node, Tree, Value};

/// The Euler-Mascheroni constant.
pub const EULER_GAMMA: f64 = 0.5772156649;

/**
Compute the average path length of an unsuccessful search in a binary search tree built from `n` points:

```text
c(n) = 2 * (ln(n - 1) + γ) - 2 * (n - 1) / n
```

It estimates how many more splits it would take to isolate the `n` rows that share a leaf, and it normalizes the average path length into an anomaly score. It is 0 when `n` is 0 or 1, because there is nothing left to isolate.
*/
pub fn expected_path_length(n: usize) -> f64 {
	if n <= 1 {
		return 0.0;
	}
	let n = n as f64;
	2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

impl<T> Tree<T>
where
	T: Value,
{
	/// Compute the path length of `point`. This is the depth of the leaf the point reaches, plus the expected depth needed to isolate the other training rows in that leaf.
	pub fn path_length(&self, point: &[T]) -> f64 {
		// Start at the root node.
		let mut node_index = 0;
		// Traverse the tree until we get to a leaf.
		loop {
			match &self.nodes[node_index] {
				Node::Branch(BranchNode {
					left_child_index,
					right_child_index,
					feature_index,
					split_value,
				}) => {
					node_index = if point[*feature_index] < *split_value {
						*left_child_index
					} else {
						*right_child_index
					};
				}
				Node::Leaf(LeafNode { size, height }) => {
					let height = *height as f64;
					return if *size <= 1 {
						height
					} else {
						height + expected_path_length(*size)
					};
				}
			}
		}
	}
}

#[test]
fn test_expected_path_length() {
	assert_eq!(expected_path_length(0), 0.0);
	assert_eq!(expected_path_length(1), 0.0);
	assert!((expected_path_length(2) - (2.0 * EULER_GAMMA - 1.0)).abs() < 1e-12);
	let mut previous = 0.0;
	for n in 2..1000 {
		let c = expected_path_length(n);
		assert!(c > previous);
		previous = c;
	}
	// c(256) is the normalization constant for the default sub-sample size.
	assert!((expected_path_length(256) - 10.244).abs() < 1e-3);
}

#[test]
fn test_path_length() {
	// A tree with a single split on feature 1 at 0.5. The left leaf holds one row and the right leaf holds three.
	let tree: Tree<f64> = Tree {
		height_limit: 2,
		nodes: vec![
			Node::Branch(BranchNode {
				left_child_index: 1,
				right_child_index: 2,
				feature_index: 1,
				split_value: 0.5,
			}),
			Node::Leaf(LeafNode { size: 1, height: 1 }),
			Node::Leaf(LeafNode { size: 3, height: 1 }),
		],
	};
	assert_eq!(tree.path_length(&[9.0, 0.25]), 1.0);
	assert_eq!(
		tree.path_length(&[9.0, 0.5]),
		1.0 + expected_path_length(3)
	);
	assert_eq!(
		tree.path_length(&[-9.0, 0.75]),
		1.0 + expected_path_length(3)
	);
}
