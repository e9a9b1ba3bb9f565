//! This module contains the main entrypoint to the isoforest cli.

use self::config::{load_config, Config};
use anyhow::{format_err, Context, Result};
use clap::Parser;
use colored::Colorize;
use isoforest::{CancellationToken, Forest, TrainProgress, Value, Width};
use ndarray::prelude::*;
use std::{
	io::Write,
	path::{Path, PathBuf},
};

mod config;

#[derive(Parser)]
#[clap(about = "Find anomalies in your data with isolation forests.")]
enum Options {
	#[clap(name = "train")]
	Train(TrainOptions),
	#[clap(name = "score")]
	Score(ScoreOptions),
}

#[derive(Parser, Debug)]
#[clap(about = "train a forest")]
#[clap(long_about = "train an isolation forest from a csv file of numbers")]
struct TrainOptions {
	/// the path to your .csv file
	#[clap(short, long)]
	file: PathBuf,
	/// the path to a config file
	#[clap(short, long)]
	config: Option<PathBuf>,
	/// the number of trees, overriding the config file
	#[clap(long)]
	trees: Option<usize>,
	/// the number of rows used to grow each tree, overriding the config file
	#[clap(long)]
	sub_sample_size: Option<usize>,
	/// the random seed, overriding the config file
	#[clap(long)]
	seed: Option<u64>,
	/// grow the trees on all cores
	#[clap(long)]
	parallel: bool,
	/// the floating point type of the forest, f32 or f64
	#[clap(long, default_value = "f32")]
	width: Width,
	/// the path to write the .isoforest file to
	#[clap(short, long)]
	output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
#[clap(about = "score rows")]
#[clap(long_about = "print the anomaly score of each row of a csv file, one per line")]
struct ScoreOptions {
	/// the path to your .isoforest file
	#[clap(short, long)]
	model: PathBuf,
	/// the path to your .csv file
	#[clap(short, long)]
	file: PathBuf,
}

fn main() {
	let env = env_logger::Env::default().default_filter_or("isoforest=info");
	env_logger::Builder::from_env(env)
		.format_module_path(false)
		.format_timestamp(None)
		.init();
	let options = Options::parse();
	let result = match options {
		Options::Train(options) => cli_train(options),
		Options::Score(options) => cli_score(options),
	};
	if let Err(error) = result {
		eprintln!("{}: {:#}", "error".red().bold(), error);
		std::process::exit(1);
	}
}

fn cli_train(options: TrainOptions) -> Result<()> {
	let config = load_config(options.config.as_deref())?.unwrap_or_default();
	match options.width {
		Width::F32 => train::<f32>(&options, &config),
		Width::F64 => train::<f64>(&options, &config),
	}
}

fn train<T>(options: &TrainOptions, config: &Config) -> Result<()>
where
	T: Value,
{
	let features = load_features::<T>(&options.file)?;

	// Command line arguments take precedence over the config file, which takes precedence over the defaults. The default sub-sample size is capped at the number of rows.
	let defaults = isoforest::TrainOptions::default();
	let train_options = isoforest::TrainOptions {
		n_trees: options.trees.or(config.n_trees).unwrap_or(defaults.n_trees),
		sub_sample_size: options
			.sub_sample_size
			.or(config.sub_sample_size)
			.unwrap_or_else(|| usize::min(defaults.sub_sample_size, features.nrows())),
		seed: options.seed.or(config.seed).unwrap_or(defaults.seed),
		parallel: options.parallel || config.parallel.unwrap_or(defaults.parallel),
	};
	let forest = Forest::<T>::train(
		features.view(),
		&train_options,
		&CancellationToken::new(),
		&mut |progress| match progress {
			TrainProgress::Training(progress_counter) => {
				log::debug!("growing {} trees", progress_counter.total())
			}
		},
	)?;

	// Retrieve the output path from the command line arguments or generate a default.
	let output_path = match &options.output {
		Some(output) => output.clone(),
		None => default_output_path(&options.file)?,
	};
	forest
		.to_path(&output_path)
		.with_context(|| format!("failed to write {}", output_path.display()))?;
	eprintln!("Your forest was written to {}.", output_path.display());
	Ok(())
}

fn cli_score(options: ScoreOptions) -> Result<()> {
	let bytes = std::fs::read(&options.model)
		.with_context(|| format!("failed to read {}", options.model.display()))?;
	match isoforest::serialize::peek_width(&bytes)? {
		Width::F32 => score::<f32>(&bytes, &options.file),
		Width::F64 => score::<f64>(&bytes, &options.file),
	}
}

fn score<T>(bytes: &[u8], file_path: &Path) -> Result<()>
where
	T: Value,
{
	let forest = Forest::<T>::from_slice(bytes)?;
	let features = load_features::<T>(file_path)?;
	let mut scores = Array1::zeros(features.nrows());
	forest.score_batch(features.view(), scores.view_mut())?;
	let stdout = std::io::stdout();
	let mut stdout = stdout.lock();
	for score in scores.iter() {
		writeln!(stdout, "{}", score)?;
	}
	Ok(())
}

/// Read a csv file with a header row where every field is a number.
fn load_features<T>(file_path: &Path) -> Result<Array2<T>>
where
	T: Value,
{
	let mut reader = csv::Reader::from_path(file_path)
		.with_context(|| format!("failed to open {}", file_path.display()))?;
	let mut rows: Vec<Vec<T>> = Vec::new();
	for (row_index, record) in reader.records().enumerate() {
		let record = record?;
		let row = record
			.iter()
			.enumerate()
			.map(|(column_index, field)| {
				field.trim().parse::<f64>().map(T::cast_f64).with_context(|| {
					format!(
						"the value \"{}\" in row {}, column {} is not a number",
						field,
						row_index + 1,
						column_index + 1
					)
				})
			})
			.collect::<Result<Vec<T>>>()?;
		rows.push(row);
	}
	log::info!("loaded {} rows from {}", rows.len(), file_path.display());
	Ok(isoforest::features_from_rows(&rows)?)
}

fn default_output_path(file_path: &Path) -> Result<PathBuf> {
	let file_stem = file_path
		.file_stem()
		.ok_or_else(|| format_err!("{} is not a file", file_path.display()))?;
	let dir = std::env::current_dir()?;
	Ok(dir.join(format!("{}.isoforest", file_stem.to_string_lossy())))
}
