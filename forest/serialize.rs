/*!
This module reads and writes trained forests.

An encoded forest starts with a single byte, the width tag, which is `4` if the split values are `f32`s and `8` if they are `f64`s. The rest is a [MessagePack](https://msgpack.org) value holding the sub-sample size, the number of features, and the trees in training order. Each tree holds its height limit and its nodes in pre-order. A branch holds its feature index and split value, and a leaf holds its size and height. Child indexes are not written. They are recovered from the order of the nodes when the forest is read.

Reading a forest checks that every tree is complete and consistent, so a forest that was read successfully scores points exactly like the forest that was written.
*/

use crate::{
	train::compute_height_limit, BranchNode, EncodingError, Forest, LeafNode, Node,
	ParseWidthError, Tree, Value,
};
use num_traits::ToPrimitive;
use std::{
	fs::File,
	io::{BufReader, BufWriter, Read, Write},
	path::Path,
};

/// The element type of a forest's split values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
	F32,
	F64,
}

impl Width {
	/// The byte written in front of an encoded forest.
	pub fn tag(self) -> u8 {
		match self {
			Width::F32 => 4,
			Width::F64 => 8,
		}
	}

	pub fn from_tag(tag: u8) -> Option<Width> {
		match tag {
			4 => Some(Width::F32),
			8 => Some(Width::F64),
			_ => None,
		}
	}
}

impl std::fmt::Display for Width {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Width::F32 => write!(f, "f32"),
			Width::F64 => write!(f, "f64"),
		}
	}
}

impl std::str::FromStr for Width {
	type Err = ParseWidthError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"f32" => Ok(Width::F32),
			"f64" => Ok(Width::F64),
			_ => Err(ParseWidthError(s.to_owned())),
		}
	}
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SerializedForest<T> {
	sub_sample_size: u64,
	n_features: u64,
	trees: Vec<SerializedTree<T>>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct SerializedTree<T> {
	height_limit: u64,
	nodes: Vec<SerializedNode<T>>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum SerializedNode<T> {
	Branch { feature_index: u64, split_value: T },
	Leaf { size: u64, height: u64 },
}

/// Encode `forest`.
pub fn encode<T>(forest: &Forest<T>) -> Result<Vec<u8>, EncodingError>
where
	T: Value,
{
	forest.to_bytes()
}

/// Decode a forest previously encoded with `encode`. The width tag must match `T`.
pub fn decode<T>(bytes: &[u8]) -> Result<Forest<T>, EncodingError>
where
	T: Value,
{
	Forest::from_slice(bytes)
}

/// Read the width tag of an encoded forest, so the caller can choose whether to decode it as `Forest<f32>` or `Forest<f64>`.
pub fn peek_width(bytes: &[u8]) -> Result<Width, EncodingError> {
	let tag = *bytes.first().ok_or(EncodingError::Empty)?;
	Width::from_tag(tag).ok_or(EncodingError::UnknownWidth(tag))
}

impl<T> Forest<T>
where
	T: Value,
{
	/// Encode this forest to a `Vec<u8>`.
	pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
		let mut bytes = Vec::new();
		self.write(&mut bytes)?;
		Ok(bytes)
	}

	/// Decode a forest from a slice.
	pub fn from_slice(slice: &[u8]) -> Result<Self, EncodingError> {
		check_width::<T>(peek_width(slice)?)?;
		let forest: SerializedForest<T> = rmp_serde::from_slice(&slice[1..])?;
		deserialize_forest(forest)
	}

	/// Decode a forest by reading the file at `path`.
	pub fn from_path(path: &Path) -> Result<Self, EncodingError> {
		let file = File::open(path)?;
		let mut reader = BufReader::new(file);
		let mut tag = [0u8; 1];
		if reader.read(&mut tag)? == 0 {
			return Err(EncodingError::Empty);
		}
		check_width::<T>(peek_width(&tag)?)?;
		let forest: SerializedForest<T> = rmp_serde::from_read(&mut reader)?;
		deserialize_forest(forest)
	}

	/// Write this forest to the file at `path`.
	pub fn to_path(&self, path: &Path) -> Result<(), EncodingError> {
		let file = File::create(path)?;
		let mut writer = BufWriter::new(file);
		self.write(&mut writer)?;
		writer.flush()?;
		Ok(())
	}

	fn write<W>(&self, writer: &mut W) -> Result<(), EncodingError>
	where
		W: Write,
	{
		writer.write_all(&[T::WIDTH.tag()])?;
		rmp_serde::encode::write_named(writer, &serialize_forest(self))?;
		Ok(())
	}
}

fn check_width<T>(found: Width) -> Result<(), EncodingError>
where
	T: Value,
{
	if found != T::WIDTH {
		return Err(EncodingError::WidthMismatch {
			expected: T::WIDTH,
			found,
		});
	}
	Ok(())
}

fn serialize_forest<T>(forest: &Forest<T>) -> SerializedForest<T>
where
	T: Value,
{
	SerializedForest {
		sub_sample_size: forest.sub_sample_size as u64,
		n_features: forest.n_features as u64,
		trees: forest
			.trees
			.iter()
			.map(|tree| {
				let mut nodes = Vec::with_capacity(tree.nodes.len());
				serialize_node(tree, 0, &mut nodes);
				SerializedTree {
					height_limit: tree.height_limit as u64,
					nodes,
				}
			})
			.collect(),
	}
}

fn serialize_node<T>(tree: &Tree<T>, node_index: usize, nodes: &mut Vec<SerializedNode<T>>)
where
	T: Value,
{
	match &tree.nodes[node_index] {
		Node::Branch(branch) => {
			nodes.push(SerializedNode::Branch {
				feature_index: branch.feature_index as u64,
				split_value: branch.split_value,
			});
			serialize_node(tree, branch.left_child_index, nodes);
			serialize_node(tree, branch.right_child_index, nodes);
		}
		Node::Leaf(leaf) => {
			nodes.push(SerializedNode::Leaf {
				size: leaf.size as u64,
				height: leaf.height as u64,
			});
		}
	}
}

fn to_usize(value: u64, name: &str) -> Result<usize, EncodingError> {
	value.to_usize().ok_or_else(|| {
		EncodingError::InvalidForest(format!("{} {} does not fit in a usize", name, value))
	})
}

fn deserialize_forest<T>(forest: SerializedForest<T>) -> Result<Forest<T>, EncodingError>
where
	T: Value,
{
	let sub_sample_size = to_usize(forest.sub_sample_size, "sub-sample size")?;
	let n_features = to_usize(forest.n_features, "feature count")?;
	if sub_sample_size < 2 {
		return Err(EncodingError::InvalidForest(format!(
			"the sub-sample size is {}",
			sub_sample_size
		)));
	}
	if n_features == 0 {
		return Err(EncodingError::InvalidForest(
			"the forest has no features".to_owned(),
		));
	}
	if forest.trees.is_empty() {
		return Err(EncodingError::InvalidForest(
			"the forest has no trees".to_owned(),
		));
	}
	let height_limit = compute_height_limit(sub_sample_size);
	let trees = forest
		.trees
		.into_iter()
		.enumerate()
		.map(|(tree_index, tree)| {
			deserialize_tree(tree, sub_sample_size, height_limit, n_features).map_err(|reason| {
				EncodingError::InvalidTree { tree_index, reason }
			})
		})
		.collect::<Result<Vec<_>, _>>()?;
	Ok(Forest {
		trees,
		sub_sample_size,
		n_features,
	})
}

struct TreeReader<I> {
	nodes: I,
	height_limit: usize,
	n_features: usize,
}

fn deserialize_tree<T>(
	tree: SerializedTree<T>,
	sub_sample_size: usize,
	height_limit: usize,
	n_features: usize,
) -> Result<Tree<T>, String>
where
	T: Value,
{
	if tree.height_limit != height_limit as u64 {
		return Err(format!(
			"the height limit is {}, but a sub-sample size of {} requires {}",
			tree.height_limit, sub_sample_size, height_limit
		));
	}
	let mut reader = TreeReader {
		nodes: tree.nodes.into_iter(),
		height_limit,
		n_features,
	};
	let mut nodes = Vec::new();
	reader.read_node(&mut nodes, 0)?;
	if reader.nodes.next().is_some() {
		return Err("there are nodes after the end of the tree".to_owned());
	}
	let tree = Tree {
		height_limit,
		nodes,
	};
	let covered_count = tree
		.leaves()
		.try_fold(0usize, |sum, leaf| sum.checked_add(leaf.size))
		.ok_or_else(|| "the leaf sizes overflow".to_owned())?;
	if covered_count != sub_sample_size {
		return Err(format!(
			"the leaves hold {} rows, but the sub-sample size is {}",
			covered_count, sub_sample_size
		));
	}
	Ok(tree)
}

impl<T, I> TreeReader<I>
where
	T: Value,
	I: Iterator<Item = SerializedNode<T>>,
{
	/// Read the subtree at depth `depth` and push its nodes in pre-order. Recursion never goes deeper than the height limit.
	fn read_node(&mut self, nodes: &mut Vec<Node<T>>, depth: usize) -> Result<(), String> {
		let node = self
			.nodes
			.next()
			.ok_or_else(|| "the nodes end before the tree is complete".to_owned())?;
		match node {
			SerializedNode::Branch {
				feature_index,
				split_value,
			} => {
				if depth >= self.height_limit {
					return Err(format!(
						"there is a branch at depth {}, but the height limit is {}",
						depth, self.height_limit
					));
				}
				let feature_index = feature_index
					.to_usize()
					.filter(|feature_index| *feature_index < self.n_features)
					.ok_or_else(|| {
						format!(
							"feature index {} is out of range for {} features",
							feature_index, self.n_features
						)
					})?;
				let node_index = nodes.len();
				nodes.push(Node::Branch(BranchNode {
					left_child_index: node_index + 1,
					right_child_index: 0,
					feature_index,
					split_value,
				}));
				self.read_node(nodes, depth + 1)?;
				let right_child_index = nodes.len();
				if let Node::Branch(branch) = &mut nodes[node_index] {
					branch.right_child_index = right_child_index;
				}
				self.read_node(nodes, depth + 1)?;
			}
			SerializedNode::Leaf { size, height } => {
				if height != depth as u64 {
					return Err(format!(
						"a leaf at depth {} says its height is {}",
						depth, height
					));
				}
				let size = size
					.to_usize()
					.ok_or_else(|| format!("leaf size {} does not fit in a usize", size))?;
				nodes.push(Node::Leaf(LeafNode {
					size,
					height: depth,
				}));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
fn encode_serialized<T>(width: Width, forest: &SerializedForest<T>) -> Vec<u8>
where
	T: serde::Serialize,
{
	let mut bytes = vec![width.tag()];
	rmp_serde::encode::write_named(&mut bytes, forest).unwrap();
	bytes
}

#[cfg(test)]
fn rows() -> Vec<Vec<f64>> {
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
fn test_round_trip_preserves_trees_and_scores() {
	let rows = rows();
	let points = vec![
		vec![0.0, 0.0, 0.0],
		vec![1.15, 2.05, 3.05],
		vec![100.0, -100.0, 3.0],
		vec![f64::NAN, 2.0, f64::INFINITY],
	];
	let forest = Forest::<f64>::build(&rows, 50, 6, 2).unwrap();
	let bytes = encode(&forest).unwrap();
	assert_eq!(peek_width(&bytes).unwrap(), Width::F64);
	let decoded = decode::<f64>(&bytes).unwrap();
	assert_eq!(forest, decoded);
	for point in rows.iter().chain(points.iter()) {
		assert_eq!(
			forest.score(point).unwrap().to_bits(),
			decoded.score(point).unwrap().to_bits()
		);
	}
	// Encoding is deterministic.
	assert_eq!(bytes, decoded.to_bytes().unwrap());

	let rows: Vec<Vec<f32>> = rows
		.iter()
		.map(|row| row.iter().map(|value| *value as f32).collect())
		.collect();
	let forest = Forest::<f32>::build(&rows, 50, 9, 2).unwrap();
	let decoded = Forest::<f32>::from_slice(&forest.to_bytes().unwrap()).unwrap();
	assert_eq!(forest, decoded);
	for row in rows.iter() {
		assert_eq!(
			forest.score(row).unwrap().to_bits(),
			decoded.score(row).unwrap().to_bits()
		);
	}
}

#[test]
fn test_decode_hand_built_forest() {
	let forest = SerializedForest {
		sub_sample_size: 2,
		n_features: 1,
		trees: vec![SerializedTree {
			height_limit: 1,
			nodes: vec![
				SerializedNode::Branch {
					feature_index: 0,
					split_value: 0.5f64,
				},
				SerializedNode::Leaf { size: 1, height: 1 },
				SerializedNode::Leaf { size: 1, height: 1 },
			],
		}],
	};
	let forest = decode::<f64>(&encode_serialized(Width::F64, &forest)).unwrap();
	insta::assert_debug_snapshot!(forest, @r###"
	Forest {
	    trees: [
	        Tree {
	            height_limit: 1,
	            nodes: [
	                Branch(
	                    BranchNode {
	                        left_child_index: 1,
	                        right_child_index: 2,
	                        feature_index: 0,
	                        split_value: 0.5,
	                    },
	                ),
	                Leaf(
	                    LeafNode {
	                        size: 1,
	                        height: 1,
	                    },
	                ),
	                Leaf(
	                    LeafNode {
	                        size: 1,
	                        height: 1,
	                    },
	                ),
	            ],
	        },
	    ],
	    sub_sample_size: 2,
	    n_features: 1,
	}
	"###);
	assert_eq!(forest.trees()[0].path_length(&[0.25]), 1.0);
	assert_eq!(
		forest.score(&[0.75]).unwrap(),
		2.0f64.powf(-1.0 / crate::expected_path_length(2))
	);
}

#[test]
fn test_decode_rejects_corrupt_bytes() {
	let forest = Forest::<f32>::build(&[[1.0f32], [2.0], [3.0], [4.0]], 3, 4, 0).unwrap();
	let bytes = forest.to_bytes().unwrap();
	assert!(matches!(
		Forest::<f32>::from_slice(&[]),
		Err(EncodingError::Empty)
	));
	for len in 1..bytes.len() {
		assert!(Forest::<f32>::from_slice(&bytes[..len]).is_err());
	}
	assert!(matches!(
		Forest::<f64>::from_slice(&bytes),
		Err(EncodingError::WidthMismatch {
			expected: Width::F64,
			found: Width::F32,
		})
	));
	let mut unknown_width = bytes.clone();
	unknown_width[0] = 7;
	assert!(matches!(
		Forest::<f32>::from_slice(&unknown_width),
		Err(EncodingError::UnknownWidth(7))
	));
}

#[test]
fn test_decode_rejects_invalid_trees() {
	let leaf = |size, height| SerializedNode::<f32>::Leaf { size, height };
	let branch = |feature_index| SerializedNode::Branch {
		feature_index,
		split_value: 0.5f32,
	};
	let decode_nodes = |nodes: Vec<SerializedNode<f32>>| {
		let forest = SerializedForest {
			sub_sample_size: 4,
			n_features: 2,
			trees: vec![SerializedTree {
				height_limit: 2,
				nodes,
			}],
		};
		decode::<f32>(&encode_serialized(Width::F32, &forest))
	};
	assert!(decode_nodes(vec![branch(1), leaf(1, 1), leaf(3, 1)]).is_ok());
	let invalid_trees = vec![
		// The tree ends early.
		vec![branch(1), leaf(1, 1)],
		// There is a node after the end of the tree.
		vec![leaf(4, 0), leaf(0, 0)],
		// A leaf has the wrong height.
		vec![branch(1), leaf(1, 2), leaf(3, 1)],
		// A feature index is out of range.
		vec![branch(2), leaf(1, 1), leaf(3, 1)],
		// A branch is deeper than the height limit allows.
		vec![
			branch(0),
			branch(0),
			branch(0),
			leaf(1, 3),
			leaf(1, 3),
			leaf(1, 2),
			leaf(1, 1),
		],
		// The leaf sizes do not add up to the sub-sample size.
		vec![branch(1), leaf(1, 1), leaf(1, 1)],
		// The leaf sizes would wrap around to the sub-sample size.
		vec![branch(1), leaf(u64::MAX, 1), leaf(5, 1)],
	];
	for nodes in invalid_trees {
		assert!(matches!(
			decode_nodes(nodes),
			Err(EncodingError::InvalidTree { tree_index: 0, .. })
		));
	}
	let no_trees: SerializedForest<f32> = SerializedForest {
		sub_sample_size: 4,
		n_features: 2,
		trees: vec![],
	};
	assert!(matches!(
		decode::<f32>(&encode_serialized(Width::F32, &no_trees)),
		Err(EncodingError::InvalidForest(_))
	));
	let wrong_height_limit = SerializedForest {
		sub_sample_size: 5,
		n_features: 2,
		trees: vec![SerializedTree {
			height_limit: 2,
			nodes: vec![leaf(5, 0)],
		}],
	};
	assert!(matches!(
		decode::<f32>(&encode_serialized(Width::F32, &wrong_height_limit)),
		Err(EncodingError::InvalidTree { .. })
	));
}

#[test]
fn test_path_round_trip() {
	let rows = rows();
	let forest = Forest::<f64>::build(&rows, 10, 8, 5).unwrap();
	let path = std::env::temp_dir().join(format!(
		"isoforest_test_path_round_trip_{}.isoforest",
		std::process::id()
	));
	forest.to_path(&path).unwrap();
	assert_eq!(Forest::<f64>::from_path(&path).unwrap(), forest);
	assert!(matches!(
		Forest::<f32>::from_path(&path),
		Err(EncodingError::WidthMismatch { .. })
	));
	std::fs::remove_file(&path).unwrap();
	assert!(matches!(
		Forest::<f64>::from_path(&path),
		Err(EncodingError::Io(_))
	));
}

#[test]
fn test_width() {
	assert_eq!("f32".parse::<Width>().unwrap(), Width::F32);
	assert_eq!("f64".parse::<Width>().unwrap(), Width::F64);
	assert!("f16".parse::<Width>().is_err());
	assert_eq!(Width::F64.to_string(), "f64");
	for width in &[Width::F32, Width::F64] {
		assert_eq!(Width::from_tag(width.tag()), Some(*width));
	}
	assert!(matches!(peek_width(&[0]), Err(EncodingError::UnknownWidth(0))));
}
