use crate::Value;
use ndarray::prelude::*;
use rand::Rng;

/// Choose a split value for the feature at `feature_index` uniformly at random between the minimum and maximum values that feature takes among the rows in `examples_index`. If the feature is constant over those rows, the split value is that constant and every row will be sent right.
pub fn choose_split_value<T, R>(
	features: ArrayView2<T>,
	examples_index: &[usize],
	feature_index: usize,
	rng: &mut R,
) -> T
where
	T: Value,
	R: Rng + ?Sized,
{
	let column = features.column(feature_index);
	let first = column[examples_index[0]];
	let (min, max) = examples_index[1..]
		.iter()
		.fold((first, first), |(min, max), example_index| {
			let value = column[*example_index];
			(
				if value < min { value } else { min },
				if value > max { value } else { max },
			)
		});
	min + T::gen_unit(rng) * (max - min)
}

/// Rearrange `examples_index` so the rows whose value for `feature_index` is less than `split_value` come first. Return the number of those rows. Rows are moved in place by swapping from both ends, so the order within each side is not preserved.
pub fn rearrange_examples_index<T>(
	features: ArrayView2<T>,
	examples_index: &mut [usize],
	feature_index: usize,
	split_value: T,
) -> usize
where
	T: Value,
{
	let column = features.column(feature_index);
	let mut left = 0;
	let mut right = examples_index.len();
	while left < right {
		if column[examples_index[left]] < split_value {
			left += 1;
		} else {
			right -= 1;
			examples_index.swap(left, right);
		}
	}
	left
}

#[cfg(test)]
fn features() -> Array2<f64> {
	arr2(&[[1.0, 2.0, 3.0], [1.1, 2.1, 3.1], [1.5, 2.5, 3.5]])
}

#[test]
fn test_split_value_is_within_the_observed_range() {
	use rand::SeedableRng;
	let features = features();
	let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(2);
	for _ in 0..100 {
		let split_value = choose_split_value(features.view(), &[0, 1, 2], 1, &mut rng);
		assert!((2.0..=2.5).contains(&split_value));
		let split_value = choose_split_value(features.view(), &[0, 1], 0, &mut rng);
		assert!((1.0..=1.1).contains(&split_value));
	}
}

#[test]
fn test_f32_split_value_is_below_the_maximum() {
	use rand::SeedableRng;
	let features = arr2(&[[0.0f32], [1.0]]);
	let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(9);
	for _ in 0..10_000 {
		let split_value = choose_split_value(features.view(), &[0, 1], 0, &mut rng);
		assert!((0.0..1.0).contains(&split_value));
	}
}

#[test]
fn test_constant_feature_sends_every_row_right() {
	use rand::SeedableRng;
	let features = arr2(&[[4.0f32, 1.0], [4.0, 2.0], [4.0, 3.0]]);
	let mut rng = rand_xoshiro::Xoshiro256Plus::seed_from_u64(0);
	let split_value = choose_split_value(features.view(), &[0, 1, 2], 0, &mut rng);
	assert_eq!(split_value, 4.0);
	let mut examples_index = vec![0, 1, 2];
	let n_left = rearrange_examples_index(features.view(), &mut examples_index, 0, split_value);
	assert_eq!(n_left, 0);
	examples_index.sort_unstable();
	assert_eq!(examples_index, vec![0, 1, 2]);
}

#[test]
fn test_rearrange_examples_index() {
	let features = features();
	let mut examples_index = vec![2, 0, 1];
	let n_left = rearrange_examples_index(features.view(), &mut examples_index, 2, 3.2);
	assert_eq!(n_left, 2);
	let mut left = examples_index[..n_left].to_vec();
	left.sort_unstable();
	assert_eq!(left, vec![0, 1]);
	assert_eq!(examples_index[n_left..], [2]);
}
