use crate::{
	split::{choose_split_value, rearrange_examples_index},
	BranchNode, CancellationToken, ConfigurationError, Error, Forest, LeafNode, Node,
	ProgressCounter, TrainOptions, TrainProgress, Tree, Value,
};
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;

/// This is added to the seed once for each tree, so every tree gets its own random stream.
const TREE_SEED_INCREMENT: u64 = 0x9e37_79b9_7f4a_7c15;

/// To avoid code duplication, this shared `train` function is called by `Forest::train` and `Forest::build`.
pub fn train<T>(
	features: ArrayView2<T>,
	options: &TrainOptions,
	cancellation_token: &CancellationToken,
	update_progress: &mut dyn FnMut(TrainProgress),
) -> Result<Forest<T>, Error>
where
	T: Value,
{
	check_options(features, options)?;
	let height_limit = compute_height_limit(options.sub_sample_size);
	log::info!(
		"training {} trees on {} rows with {} features, sub-sample size {}, height limit {}",
		options.n_trees,
		features.nrows(),
		features.ncols(),
		options.sub_sample_size,
		height_limit,
	);

	let progress_counter = ProgressCounter::new(options.n_trees as u64);
	update_progress(TrainProgress::Training(progress_counter.clone()));

	// Each tree draws its sample and its splits from its own random stream, so the trees do not depend on the order they are trained in.
	let train_tree_at_index = |tree_index: usize| -> Result<Tree<T>, Error> {
		if cancellation_token.is_cancelled() {
			return Err(Error::Cancelled);
		}
		let mut rng = tree_rng(options.seed, tree_index);
		let tree = train_tree(
			features,
			options.sub_sample_size,
			height_limit,
			&mut rng,
			cancellation_token,
		)?;
		log::trace!("trained tree {} with {} nodes", tree_index, tree.nodes.len());
		progress_counter.inc(1);
		Ok(tree)
	};
	let trees = if options.parallel {
		(0..options.n_trees)
			.into_par_iter()
			.map(&train_tree_at_index)
			.collect::<Result<Vec<_>, _>>()?
	} else {
		(0..options.n_trees)
			.map(&train_tree_at_index)
			.collect::<Result<Vec<_>, _>>()?
	};

	log::debug!("trained {} trees", trees.len());
	Ok(Forest {
		trees,
		sub_sample_size: options.sub_sample_size,
		n_features: features.ncols(),
	})
}

/// Copy `rows` into a two dimensional array, checking that every row has the same number of features.
pub fn features_from_rows<T, R>(rows: &[R]) -> Result<Array2<T>, ConfigurationError>
where
	T: Value,
	R: AsRef<[T]>,
{
	let n_features = rows.first().map(|row| row.as_ref().len()).unwrap_or(0);
	for (row_index, row) in rows.iter().enumerate() {
		let row = row.as_ref();
		if row.len() != n_features {
			return Err(ConfigurationError::RaggedRows {
				row_index,
				expected: n_features,
				actual: row.len(),
			});
		}
	}
	Ok(Array2::from_shape_fn(
		(rows.len(), n_features),
		|(row_index, feature_index)| rows[row_index].as_ref()[feature_index],
	))
}

fn check_options<T>(
	features: ArrayView2<T>,
	options: &TrainOptions,
) -> Result<(), ConfigurationError>
where
	T: Value,
{
	if options.n_trees == 0 {
		return Err(ConfigurationError::NoTrees);
	}
	if options.sub_sample_size < 2 {
		return Err(ConfigurationError::SubSampleSizeTooSmall {
			sub_sample_size: options.sub_sample_size,
		});
	}
	if options.sub_sample_size > features.nrows() {
		return Err(ConfigurationError::SubSampleSizeTooLarge {
			sub_sample_size: options.sub_sample_size,
			n_rows: features.nrows(),
		});
	}
	if features.ncols() == 0 {
		return Err(ConfigurationError::NoFeatures);
	}
	Ok(())
}

/// Compute `ceil(log2(sub_sample_size))` without rounding error. `sub_sample_size` must be at least 1.
pub fn compute_height_limit(sub_sample_size: usize) -> usize {
	let bits = 8 * std::mem::size_of::<usize>() as u32;
	(bits - (sub_sample_size - 1).leading_zeros()) as usize
}

fn tree_rng(seed: u64, tree_index: usize) -> Xoshiro256Plus {
	Xoshiro256Plus::seed_from_u64(
		seed.wrapping_add((tree_index as u64).wrapping_mul(TREE_SEED_INCREMENT)),
	)
}

fn train_tree<T, R>(
	features: ArrayView2<T>,
	sub_sample_size: usize,
	height_limit: usize,
	rng: &mut R,
	cancellation_token: &CancellationToken,
) -> Result<Tree<T>, Error>
where
	T: Value,
	R: Rng,
{
	let mut examples_index =
		rand::seq::index::sample(rng, features.nrows(), sub_sample_size).into_vec();
	let mut builder = TreeBuilder {
		features,
		height_limit,
		rng,
		cancellation_token,
		nodes: Vec::new(),
	};
	builder.build_node(&mut examples_index, 0)?;
	Ok(Tree {
		height_limit,
		nodes: builder.nodes,
	})
}

struct TreeBuilder<'a, 'b, T, R>
where
	T: Value,
	R: Rng,
{
	features: ArrayView2<'a, T>,
	height_limit: usize,
	rng: &'b mut R,
	cancellation_token: &'b CancellationToken,
	nodes: Vec<Node<T>>,
}

impl<'a, 'b, T, R> TreeBuilder<'a, 'b, T, R>
where
	T: Value,
	R: Rng,
{
	/// Grow the subtree for the rows in `examples_index` at depth `depth` and return the index of its root. Nodes are pushed in pre-order.
	fn build_node(&mut self, examples_index: &mut [usize], depth: usize) -> Result<usize, Error> {
		if self.cancellation_token.is_cancelled() {
			return Err(Error::Cancelled);
		}
		let node_index = self.nodes.len();
		if depth >= self.height_limit || examples_index.len() <= 1 {
			self.nodes.push(Node::Leaf(LeafNode {
				size: examples_index.len(),
				height: depth,
			}));
			return Ok(node_index);
		}
		let feature_index = self.rng.gen_range(0, self.features.ncols());
		let split_value =
			choose_split_value(self.features, examples_index, feature_index, &mut *self.rng);
		let n_left =
			rearrange_examples_index(self.features, examples_index, feature_index, split_value);
		// The left child is pushed right after this node. The right child's index is known once the left subtree is complete.
		self.nodes.push(Node::Branch(BranchNode {
			left_child_index: node_index + 1,
			right_child_index: 0,
			feature_index,
			split_value,
		}));
		let (examples_index_left, examples_index_right) = examples_index.split_at_mut(n_left);
		self.build_node(examples_index_left, depth + 1)?;
		let right_child_index = self.build_node(examples_index_right, depth + 1)?;
		if let Node::Branch(branch) = &mut self.nodes[node_index] {
			branch.right_child_index = right_child_index;
		}
		Ok(node_index)
	}
}

#[cfg(test)]
fn covered_count<T: Value>(tree: &Tree<T>, node_index: usize) -> usize {
	match &tree.nodes[node_index] {
		Node::Branch(branch) => {
			covered_count(tree, branch.left_child_index)
				+ covered_count(tree, branch.right_child_index)
		}
		Node::Leaf(leaf) => leaf.size,
	}
}

#[cfg(test)]
fn max_depth<T: Value>(tree: &Tree<T>, node_index: usize, depth: usize) -> usize {
	match &tree.nodes[node_index] {
		Node::Branch(branch) => usize::max(
			max_depth(tree, branch.left_child_index, depth + 1),
			max_depth(tree, branch.right_child_index, depth + 1),
		),
		Node::Leaf(leaf) => {
			assert_eq!(leaf.height, depth);
			depth
		}
	}
}

#[cfg(test)]
fn test_features() -> Array2<f64> {
	Array2::from_shape_fn((200, 4), |(i, j)| {
		let x = (i * 31 + j * 17) % 97;
		x as f64 / 10.0 + j as f64
	})
}

#[test]
fn test_compute_height_limit() {
	assert_eq!(compute_height_limit(1), 0);
	assert_eq!(compute_height_limit(2), 1);
	assert_eq!(compute_height_limit(3), 2);
	assert_eq!(compute_height_limit(8), 3);
	assert_eq!(compute_height_limit(9), 4);
	assert_eq!(compute_height_limit(256), 8);
	assert_eq!(compute_height_limit(257), 9);
	for sub_sample_size in 2..2000usize {
		assert_eq!(
			compute_height_limit(sub_sample_size),
			(sub_sample_size as f64).log2().ceil() as usize
		);
	}
}

#[test]
fn test_trees_are_well_formed() {
	let features = test_features();
	let options = TrainOptions {
		n_trees: 20,
		sub_sample_size: 64,
		seed: 1,
		parallel: false,
	};
	let forest =
		Forest::train(features.view(), &options, &CancellationToken::new(), &mut |_| {}).unwrap();
	assert_eq!(forest.trees().len(), 20);
	assert_eq!(forest.n_features(), 4);
	for tree in forest.trees() {
		assert_eq!(tree.height_limit(), 6);
		assert!(max_depth(tree, 0, 0) <= tree.height_limit());
		assert_eq!(covered_count(tree, 0), 64);
		assert_eq!(tree.leaves().map(|leaf| leaf.size).sum::<usize>(), 64);
		for node in tree.nodes() {
			if let Node::Branch(branch) = node {
				assert!(branch.feature_index < 4);
				assert!(branch.left_child_index < branch.right_child_index);
				assert!(branch.right_child_index < tree.nodes().len());
			}
		}
	}
}

#[test]
fn test_training_is_deterministic() {
	let features = test_features();
	let mut options = TrainOptions {
		n_trees: 30,
		sub_sample_size: 50,
		seed: 9,
		parallel: false,
	};
	let train = |options: &TrainOptions| {
		Forest::train(features.view(), options, &CancellationToken::new(), &mut |_| {}).unwrap()
	};
	let serial = train(&options);
	assert_eq!(serial, train(&options));
	options.parallel = true;
	assert_eq!(serial, train(&options));
	options.seed = 10;
	assert_ne!(serial, train(&options));
}

#[test]
fn test_options_are_checked() {
	let rows = vec![vec![1.0f32, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
	let configuration_error = |result: Result<Forest<f32>, Error>| match result {
		Err(Error::Configuration(error)) => error,
		_ => panic!("expected a configuration error"),
	};
	assert_eq!(
		configuration_error(Forest::build(&rows, 100, 4, 0)),
		ConfigurationError::SubSampleSizeTooLarge {
			sub_sample_size: 4,
			n_rows: 3,
		}
	);
	assert_eq!(
		configuration_error(Forest::build(&rows, 100, 1, 0)),
		ConfigurationError::SubSampleSizeTooSmall { sub_sample_size: 1 }
	);
	assert_eq!(
		configuration_error(Forest::build(&rows, 0, 2, 0)),
		ConfigurationError::NoTrees
	);
	let ragged_rows = vec![vec![1.0f32, 2.0], vec![3.0], vec![5.0, 6.0]];
	assert_eq!(
		configuration_error(Forest::build(&ragged_rows, 100, 2, 0)),
		ConfigurationError::RaggedRows {
			row_index: 1,
			expected: 2,
			actual: 1,
		}
	);
	let empty_rows = vec![Vec::<f32>::new(), Vec::new()];
	assert_eq!(
		configuration_error(Forest::build(&empty_rows, 100, 2, 0)),
		ConfigurationError::NoFeatures
	);
}

#[test]
fn test_constant_features_are_bounded_by_the_height_limit() {
	let rows = vec![vec![7.0f64]; 16];
	let forest = Forest::<f64>::build(&rows, 5, 16, 0).unwrap();
	for tree in forest.trees() {
		// Every split sends all the rows right, so the tree is a chain that ends at the height limit.
		assert_eq!(tree.root().as_branch().unwrap().split_value, 7.0);
		assert_eq!(tree.nodes().len(), 2 * tree.height_limit() + 1);
		assert_eq!(tree.nodes()[1].as_leaf().unwrap().size, 0);
		let deepest_leaf = tree.leaves().last().unwrap();
		assert_eq!(deepest_leaf.size, 16);
		assert_eq!(deepest_leaf.height, tree.height_limit());
	}
}

#[test]
fn test_cancelled_training_returns_no_forest() {
	let features = test_features();
	let token = CancellationToken::new();
	token.cancel();
	let options = TrainOptions {
		n_trees: 10,
		sub_sample_size: 32,
		..Default::default()
	};
	let result = Forest::train(features.view(), &options, &token, &mut |_| {});
	assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn test_progress_counts_trees() {
	let features = test_features();
	let mut progress_counter = None;
	let options = TrainOptions {
		n_trees: 12,
		sub_sample_size: 32,
		seed: 3,
		parallel: true,
	};
	Forest::train(
		features.view(),
		&options,
		&CancellationToken::new(),
		&mut |progress| match progress {
			TrainProgress::Training(counter) => progress_counter = Some(counter),
		},
	)
	.unwrap();
	let progress_counter = progress_counter.unwrap();
	assert_eq!(progress_counter.total(), 12);
	assert_eq!(progress_counter.get(), 12);
}
