//! [`Config`] (C14): the layered configuration table from §6, assembled once
//! from compiled-in defaults overridable by `DISTFLOW_*` environment
//! variables, then validated before a [`crate::ctx::Context`] is constructed.
//! There is no config file format or hot-reload.

use std::path::PathBuf;

use crate::data::PoolConfig;
use crate::err::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
	Tcp,
	Mock,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub num_hosts: usize,
	pub workers_per_host: usize,
	pub default_block_size: usize,
	pub block_pool: PoolConfig,
	pub spill_directory: PathBuf,
	pub transport: TransportKind,
	pub self_verify: bool,
}

impl Config {
	/// Reads every option named in §6 via the crate's `lazy_env_parse!`
	/// macros, then validates cross-field invariants.
	pub fn from_env() -> Result<Self> {
		let cfg = Self {
			num_hosts: 1,
			workers_per_host: *crate::cnf::WORKERS_PER_HOST,
			default_block_size: *crate::cnf::DEFAULT_BLOCK_SIZE,
			block_pool: PoolConfig {
				default_block_size: *crate::cnf::DEFAULT_BLOCK_SIZE,
				soft_limit_bytes: *crate::cnf::BLOCK_POOL_SOFT_LIMIT_BYTES,
				hard_limit_bytes: *crate::cnf::BLOCK_POOL_HARD_LIMIT_BYTES,
				spill_directory: PathBuf::from(crate::cnf::SPILL_DIRECTORY.as_str()),
			},
			spill_directory: PathBuf::from(crate::cnf::SPILL_DIRECTORY.as_str()),
			transport: TransportKind::Mock,
			self_verify: *crate::cnf::SELF_VERIFY,
		};
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<()> {
		self.block_pool.validate()?;
		if self.workers_per_host == 0 {
			return Err(Error::InvalidConfig("workers_per_host must be at least 1".into()));
		}
		if self.num_hosts == 0 {
			return Err(Error::InvalidConfig("num_hosts must be at least 1".into()));
		}
		Ok(())
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			num_hosts: 1,
			workers_per_host: 1,
			default_block_size: *crate::cnf::DEFAULT_BLOCK_SIZE,
			block_pool: PoolConfig::default(),
			spill_directory: PathBuf::from(crate::cnf::SPILL_DIRECTORY.as_str()),
			transport: TransportKind::Mock,
			self_verify: false,
		}
	}
}
