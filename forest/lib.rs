/*!
This crate implements unsupervised anomaly detection with isolation forests. An isolation forest is an ensemble of randomized binary trees. Each tree is grown on a random sub-sample of the training rows by repeatedly choosing a random feature and a random split value until every row is isolated or the tree reaches its height limit. Anomalies are few and different, so they are isolated after fewer splits than typical rows. The anomaly score of a point is computed from its average path length over all the trees.

```
use isoforest::Forest;

let rows: Vec<Vec<f32>> = vec![
	vec![1.0, 2.0, 3.0],
	vec![1.2, 2.2, 3.2],
	vec![5.5, 1.0, 3.2],
	vec![1.0, 2.0, 3.0],
	vec![1.1, 2.2, 3.2],
];
let forest = Forest::<f32>::build(&rows, 100, 4, 42).unwrap();
let score = forest.score(&[5.5, 1.0, 3.2]).unwrap();
assert!(score > 0.0 && score <= 1.0);
```
*/

#![allow(clippy::tabs_in_doc_comments)]

mod error;
mod path;
mod progress;
pub mod serialize;
mod split;
mod train;

pub use self::{
	error::{ConfigurationError, EncodingError, Error, ParseWidthError},
	path::{expected_path_length, EULER_GAMMA},
	progress::{CancellationToken, ProgressCounter, TrainProgress},
	serialize::Width,
	train::features_from_rows,
};

use ndarray::prelude::*;
use ndarray::Zip;
use num_traits::Float;
use rand::Rng;
use std::fmt::Debug;

/// `Value` is the element type of the feature matrix and of the split values stored in the trees. It is implemented for `f32` and `f64`.
pub trait Value:
	Float + Debug + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static
{
	/// The width tag written in front of an encoded forest.
	const WIDTH: Width;
	/// Convert an `f64` to this type, rounding if necessary.
	fn cast_f64(value: f64) -> Self;
	/// Draw a value uniformly from `[0, 1)`.
	fn gen_unit<R>(rng: &mut R) -> Self
	where
		R: Rng + ?Sized;
}

impl Value for f32 {
	const WIDTH: Width = Width::F32;
	fn cast_f64(value: f64) -> Self {
		value as f32
	}
	fn gen_unit<R>(rng: &mut R) -> Self
	where
		R: Rng + ?Sized,
	{
		rng.gen::<f32>()
	}
}

impl Value for f64 {
	const WIDTH: Width = Width::F64;
	fn cast_f64(value: f64) -> Self {
		value
	}
	fn gen_unit<R>(rng: &mut R) -> Self
	where
		R: Rng + ?Sized,
	{
		rng.gen::<f64>()
	}
}

/// These are the options passed to `Forest::train`.
#[derive(Clone, Debug)]
pub struct TrainOptions {
	/// The number of trees in the forest.
	pub n_trees: usize,
	/// The number of rows sampled without replacement to grow each tree. It must be at least 2 and at most the number of rows in the training data.
	pub sub_sample_size: usize,
	/// Every random choice made while training is derived from this seed, so training twice with the same data and options produces the same forest.
	pub seed: u64,
	/// If true, the trees are grown in parallel on the rayon thread pool. The trained forest is the same either way.
	pub parallel: bool,
}

impl Default for TrainOptions {
	fn default() -> Self {
		Self {
			n_trees: 100,
			sub_sample_size: 256,
			seed: 0,
			parallel: false,
		}
	}
}

/// A `Forest` is a trained ensemble of isolation trees. It is immutable once trained.
#[derive(Clone, Debug, PartialEq)]
pub struct Forest<T>
where
	T: Value,
{
	trees: Vec<Tree<T>>,
	sub_sample_size: usize,
	n_features: usize,
}

/// Trees are stored as a `Vec` of `Node`s in pre-order, so the root is at index 0 and the left child of a branch immediately follows it. Each branch has two indexes into the `Vec`, one for each of its children.
#[derive(Clone, Debug, PartialEq)]
pub struct Tree<T>
where
	T: Value,
{
	height_limit: usize,
	nodes: Vec<Node<T>>,
}

/// A node is either a branch or a leaf.
#[derive(Clone, Debug, PartialEq)]
pub enum Node<T>
where
	T: Value,
{
	Branch(BranchNode<T>),
	Leaf(LeafNode),
}

/// A `BranchNode` sends a point to its left child if the point's value for `feature_index` is less than `split_value`, and to its right child otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct BranchNode<T>
where
	T: Value,
{
	pub left_child_index: usize,
	pub right_child_index: usize,
	pub feature_index: usize,
	pub split_value: T,
}

/// A `LeafNode` records how many training rows reached it and how deep it is.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LeafNode {
	/// This is the number of sampled training rows that were sent to this leaf.
	pub size: usize,
	/// This is the depth of the leaf, where the root has depth 0.
	pub height: usize,
}

impl<T> Forest<T>
where
	T: Value,
{
	/// Train a forest on the rows of `features`.
	pub fn train(
		features: ArrayView2<T>,
		options: &TrainOptions,
		cancellation_token: &CancellationToken,
		update_progress: &mut dyn FnMut(TrainProgress),
	) -> Result<Forest<T>, Error> {
		train::train(features, options, cancellation_token, update_progress)
	}

	/// Train a forest of `n_trees` trees, each grown on `sub_sample_size` rows drawn from `rows`. Every row must have the same number of features.
	pub fn build<R>(
		rows: &[R],
		n_trees: usize,
		sub_sample_size: usize,
		seed: u64,
	) -> Result<Forest<T>, Error>
	where
		R: AsRef<[T]>,
	{
		let features = features_from_rows(rows)?;
		let options = TrainOptions {
			n_trees,
			sub_sample_size,
			seed,
			..Default::default()
		};
		Self::train(
			features.view(),
			&options,
			&CancellationToken::new(),
			&mut |_| {},
		)
	}

	pub fn trees(&self) -> &[Tree<T>] {
		&self.trees
	}

	pub fn sub_sample_size(&self) -> usize {
		self.sub_sample_size
	}

	/// The number of features every point passed to `score` must have.
	pub fn n_features(&self) -> usize {
		self.n_features
	}

	/// Compute the mean of the path lengths of `point` over all the trees.
	pub fn average_path_length(&self, point: &[T]) -> Result<f64, ConfigurationError> {
		self.check_n_features(point.len())?;
		Ok(self.average_path_length_unchecked(point))
	}

	/// Compute the anomaly score of `point`. The score is in (0, 1]. Scores close to 1 indicate anomalies and scores at or below 0.5 indicate typical points.
	pub fn score(&self, point: &[T]) -> Result<f64, ConfigurationError> {
		self.check_n_features(point.len())?;
		Ok(self.score_unchecked(point))
	}

	/// Compute the anomaly score of each row of `features` and write it to `scores`. Rows are scored in parallel.
	pub fn score_batch(
		&self,
		features: ArrayView2<T>,
		mut scores: ArrayViewMut1<f64>,
	) -> Result<(), ConfigurationError> {
		self.check_n_features(features.ncols())?;
		if scores.len() != features.nrows() {
			return Err(ConfigurationError::ScoreCountMismatch {
				expected: features.nrows(),
				actual: scores.len(),
			});
		}
		Zip::from(features.genrows())
			.and(&mut scores)
			.par_apply(|point, score| {
				*score = match point.as_slice() {
					Some(point) => self.score_unchecked(point),
					None => self.score_unchecked(&point.to_vec()),
				};
			});
		Ok(())
	}

	fn check_n_features(&self, n_features: usize) -> Result<(), ConfigurationError> {
		if n_features != self.n_features {
			return Err(ConfigurationError::FeatureCountMismatch {
				expected: self.n_features,
				actual: n_features,
			});
		}
		Ok(())
	}

	fn average_path_length_unchecked(&self, point: &[T]) -> f64 {
		let sum: f64 = self.trees.iter().map(|tree| tree.path_length(point)).sum();
		sum / self.trees.len() as f64
	}

	fn score_unchecked(&self, point: &[T]) -> f64 {
		let average_path_length = self.average_path_length_unchecked(point);
		2.0f64.powf(-average_path_length / expected_path_length(self.sub_sample_size))
	}
}

impl<T> Tree<T>
where
	T: Value,
{
	/// The depth of a tree never exceeds this value. It is `ceil(log2(sub_sample_size))`.
	pub fn height_limit(&self) -> usize {
		self.height_limit
	}

	pub fn nodes(&self) -> &[Node<T>] {
		&self.nodes
	}

	pub fn root(&self) -> &Node<T> {
		&self.nodes[0]
	}

	/// Iterate over the leaves in the order they are stored, which is left to right.
	pub fn leaves(&self) -> impl Iterator<Item = &LeafNode> {
		self.nodes.iter().filter_map(|node| match node {
			Node::Leaf(leaf) => Some(leaf),
			Node::Branch(_) => None,
		})
	}
}

impl<T> Node<T>
where
	T: Value,
{
	pub fn as_branch(&self) -> Option<&BranchNode<T>> {
		match self {
			Node::Branch(branch) => Some(branch),
			Node::Leaf(_) => None,
		}
	}

	pub fn as_leaf(&self) -> Option<&LeafNode> {
		match self {
			Node::Branch(_) => None,
			Node::Leaf(leaf) => Some(leaf),
		}
	}
}

#[cfg(test)]
fn separation_rows() -> Vec<Vec<f32>> {
	vec![
		vec![1.0, 2.0, 3.0],
		vec![1.2, 2.2, 3.2],
		vec![5.5, 1.0, 3.2],
		vec![1.0, 2.0, 3.0],
		vec![1.1, 2.2, 3.2],
		vec![1.0, 2.1, 3.0],
		vec![1.2, 2.2, 3.1],
		vec![1.0, 2.0, 2.9],
		vec![1.2, 1.9, 3.0],
	]
}

#[test]
fn test_outlier_has_the_highest_score() {
	let rows = separation_rows();
	let forest = Forest::<f32>::build(&rows, 100, 9, 2).unwrap();
	let scores: Vec<f64> = rows.iter().map(|row| forest.score(row).unwrap()).collect();
	for (row_index, score) in scores.iter().enumerate() {
		assert!(*score > 0.0 && *score <= 1.0);
		if row_index != 2 {
			assert!(scores[2] > *score, "{:?}", scores);
		}
	}
}

#[test]
fn test_outlier_ranking_is_stable_as_the_forest_grows() {
	// An 8x8 grid with one point far away from it.
	let mut rows: Vec<Vec<f64>> = (0..64)
		.map(|i| vec![(i % 8) as f64 * 0.1, (i / 8) as f64 * 0.1])
		.collect();
	rows.push(vec![10.0, 10.0]);
	let outlier_index = rows.len() - 1;
	for n_trees in &[10, 50, 200] {
		let forest = Forest::<f64>::build(&rows, *n_trees, rows.len(), 7).unwrap();
		let outlier_score = forest.score(&rows[outlier_index]).unwrap();
		let max_inlier_score = rows[..outlier_index]
			.iter()
			.map(|row| forest.score(row).unwrap())
			.fold(f64::MIN, f64::max);
		assert!(outlier_score > max_inlier_score, "n_trees = {}", n_trees);
	}
}

#[test]
fn test_score_rejects_points_of_the_wrong_width() {
	let forest = Forest::<f32>::build(&separation_rows(), 10, 9, 2).unwrap();
	assert_eq!(
		forest.score(&[1.0, 2.0]),
		Err(ConfigurationError::FeatureCountMismatch {
			expected: 3,
			actual: 2
		})
	);
	assert!(forest.average_path_length(&[1.0, 2.0, 3.0, 4.0]).is_err());
}

#[test]
fn test_score_batch_matches_score() {
	let rows = separation_rows();
	let forest = Forest::<f32>::build(&rows, 50, 8, 3).unwrap();
	let features = features_from_rows(&rows).unwrap();
	let mut scores = Array1::zeros(rows.len());
	forest
		.score_batch(features.view(), scores.view_mut())
		.unwrap();
	for (row, score) in rows.iter().zip(scores.iter()) {
		assert_eq!(forest.score(row).unwrap().to_bits(), score.to_bits());
	}
	// Rows of column major features are not contiguous.
	let column_major_features =
		Array2::from_shape_fn((rows.len(), 3).f(), |(row_index, feature_index)| {
			rows[row_index][feature_index]
		});
	let mut column_major_scores = Array1::zeros(rows.len());
	forest
		.score_batch(column_major_features.view(), column_major_scores.view_mut())
		.unwrap();
	assert_eq!(scores, column_major_scores);
	let mut too_few_scores = Array1::zeros(rows.len() - 1);
	assert_eq!(
		forest.score_batch(features.view(), too_few_scores.view_mut()),
		Err(ConfigurationError::ScoreCountMismatch {
			expected: rows.len(),
			actual: rows.len() - 1,
		})
	);
}

#[test]
fn test_nan_is_sent_right_at_every_branch() {
	let rows = [[0.0f64], [1.0], [2.0], [3.0]];
	let forest = Forest::<f64>::build(&rows, 5, 4, 0).unwrap();
	assert_eq!(
		forest.score(&[f64::NAN]).unwrap().to_bits(),
		forest.score(&[f64::INFINITY]).unwrap().to_bits(),
	);
}
