use std::sync::{
	atomic::{AtomicBool, AtomicU64, Ordering},
	Arc,
};

/// This enum reports the training progress. It is passed to the `update_progress` closure given to `Forest::train`.
#[derive(Clone, Debug)]
pub enum TrainProgress {
	/// The counter is incremented once for each tree that finishes growing. Its total is the number of trees.
	Training(ProgressCounter),
}

/**
A `ProgressCounter` counts finished work from any number of threads without locking. Clones share the same count, so a clone can be polled from another thread while trees are grown on the rayon thread pool.
*/
#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
}

impl ProgressCounter {
	pub fn new(total: u64) -> Self {
		Self {
			current: Arc::new(AtomicU64::new(0)),
			total,
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	/// The number of trees finished so far.
	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	/// Training calls this with an amount of one as each tree finishes, from whichever thread grew it.
	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}
}

/**
A `CancellationToken` stops training early. Pass it to `Forest::train` and call `cancel` on a clone from any thread. Training checks the token between trees and between splits, and returns `Error::Cancelled` instead of a partially trained forest.
*/
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

#[test]
fn test_cancellation_token_is_shared_by_clones() {
	let token = CancellationToken::new();
	let clone = token.clone();
	assert!(!token.is_cancelled());
	std::thread::spawn(move || clone.cancel()).join().unwrap();
	assert!(token.is_cancelled());
}
