/*!
This module defines the `Config` struct, which is read from the JSON file passed to `isoforest train --config`.
*/

use anyhow::{Context, Result};
use std::path::Path;

#[derive(Debug, Default, PartialEq, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub n_trees: Option<usize>,
	pub sub_sample_size: Option<usize>,
	pub seed: Option<u64>,
	pub parallel: Option<bool>,
}

pub fn load_config(config_path: Option<&Path>) -> Result<Option<Config>> {
	let config_path = match config_path {
		Some(config_path) => config_path,
		None => return Ok(None),
	};
	let file = std::fs::File::open(config_path)
		.with_context(|| format!("failed to open config file {}", config_path.display()))?;
	let config = serde_json::from_reader(std::io::BufReader::new(file))
		.with_context(|| format!("failed to parse config file {}", config_path.display()))?;
	Ok(Some(config))
}

#[test]
fn test_parse_config() {
	let config: Config = serde_json::from_str(r#"{ "n_trees": 50, "seed": 3 }"#).unwrap();
	assert_eq!(
		config,
		Config {
			n_trees: Some(50),
			seed: Some(3),
			..Default::default()
		}
	);
	assert!(serde_json::from_str::<Config>(r#"{ "max_depth": 4 }"#).is_err());
}
