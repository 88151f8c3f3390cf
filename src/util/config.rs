//! Contains type and functions related to the lumber configuration file
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where partitions, parts and task logs are stored
	pub data_dir: PathBuf,

	/// Address to bind for the internal HTTP API
	pub internal_api_bind_addr: SocketAddr,

	/// The limit on the number of concurrently served internal requests;
	/// requests above this limit wait for a slot
	#[serde(default = "default_max_concurrent_requests")]
	pub max_concurrent_requests: usize,

	/// Base URLs of the storage nodes this node aggregates when acting as a
	/// cluster front-end; empty means this node only serves local data
	#[serde(default)]
	pub storage_nodes: Vec<String>,
}

fn default_max_concurrent_requests() -> usize {
	100
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_config() {
		let config: Config = toml::from_str(
			r#"
			data_dir = "/var/lib/lumber"
			internal_api_bind_addr = "127.0.0.1:9428"
			"#,
		)
		.unwrap();
		assert_eq!(config.max_concurrent_requests, 100);
		assert!(config.storage_nodes.is_empty());

		let config: Config = toml::from_str(
			r#"
			data_dir = "/var/lib/lumber"
			internal_api_bind_addr = "127.0.0.1:9428"
			max_concurrent_requests = 16
			storage_nodes = ["http://10.0.0.1:9428", "http://10.0.0.2:9428"]
			"#,
		)
		.unwrap();
		assert_eq!(config.max_concurrent_requests, 16);
		assert_eq!(config.storage_nodes.len(), 2);
	}
}
