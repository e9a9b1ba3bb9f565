use crate::serialize::Width;
use thiserror::Error;

/// This is the error returned by `Forest::train` and `Forest::build`.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Configuration(#[from] ConfigurationError),
	#[error("training was cancelled")]
	Cancelled,
}

/// A `ConfigurationError` is returned when the training options, the training data, or a point to score are invalid. It is always detected before any work is done.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigurationError {
	#[error("the number of trees must be at least 1")]
	NoTrees,
	#[error("the sub-sample size must be at least 2, but it is {sub_sample_size}")]
	SubSampleSizeTooSmall { sub_sample_size: usize },
	#[error("the sub-sample size {sub_sample_size} exceeds the number of rows {n_rows}")]
	SubSampleSizeTooLarge {
		sub_sample_size: usize,
		n_rows: usize,
	},
	#[error("row {row_index} has {actual} features, but the first row has {expected}")]
	RaggedRows {
		row_index: usize,
		expected: usize,
		actual: usize,
	},
	#[error("the training data has no features")]
	NoFeatures,
	#[error("the forest was trained with {expected} features, but the input has {actual}")]
	FeatureCountMismatch { expected: usize, actual: usize },
	#[error("there are {expected} rows to score, but room for {actual} scores")]
	ScoreCountMismatch { expected: usize, actual: usize },
}

/// An `EncodingError` is returned when a forest cannot be written or read.
#[derive(Debug, Error)]
pub enum EncodingError {
	#[error("the input is empty")]
	Empty,
	#[error("unknown width tag {0}")]
	UnknownWidth(u8),
	#[error("expected a forest of {expected} values, but found a forest of {found} values")]
	WidthMismatch { expected: Width, found: Width },
	#[error("failed to encode the forest")]
	Encode(#[from] rmp_serde::encode::Error),
	#[error("failed to decode the forest")]
	Decode(#[from] rmp_serde::decode::Error),
	#[error("invalid forest: {0}")]
	InvalidForest(String),
	#[error("tree {tree_index} is invalid: {reason}")]
	InvalidTree { tree_index: usize, reason: String },
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// This error is returned when parsing a `Width` from a string fails.
#[derive(Debug, Error)]
#[error("unknown width \"{0}\", expected \"f32\" or \"f64\"")]
pub struct ParseWidthError(pub String);
