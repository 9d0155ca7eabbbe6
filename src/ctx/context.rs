use std::sync::Arc;

use tracing::info;

use crate::config::{Config, TransportKind};
use crate::data::BlockPool;
use crate::err::Result;
use crate::net::transport::{MockTransport, Transport};
use crate::net::{Dispatcher, Group, Multiplexer};

/// The single constructed handle for one worker process: owns the resolved
/// [`Config`], the [`BlockPool`], the network [`Group`], the [`Multiplexer`]
/// layered over it, and a [`Dispatcher`] handle for submitting reactor jobs.
/// Every other component borrows `&Context` or a cloned `Arc` rather than
/// reaching a global. Cloning a `Context` is cheap: every field is itself an
/// `Arc` handle or trivially small, so operator nodes that must outlive the
/// call that constructs them (their `execute()` runs later, from the stage
/// runtime) keep an owned clone rather than a borrow.
#[derive(Clone)]
pub struct Context {
	config: Config,
	pool: BlockPool,
	group: Arc<Group>,
	mux: Arc<Multiplexer>,
	dispatcher: Dispatcher,
}

impl Context {
	/// Builds a single-process cluster of `num_workers` contexts sharing an
	/// in-process mock transport mesh — the harness used by every test in
	/// this crate that exercises more than one worker.
	pub fn mock_cluster(num_workers: usize) -> Result<Vec<Arc<Context>>> {
		let mut config = Config::default();
		config.transport = TransportKind::Mock;
		config.num_hosts = num_workers;
		config.validate()?;

		MockTransport::cluster(num_workers)
			.into_iter()
			.map(|transport| Self::build(config.clone(), Arc::new(transport)))
			.collect()
	}

	fn build(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Context>> {
		let pool = BlockPool::new(config.block_pool.clone())?;
		let group = Group::new(transport);
		let mux = Multiplexer::spawn(group.clone(), pool.clone());
		let dispatcher = Dispatcher::spawn();
		info!(rank = group.rank(), num_workers = group.num_workers(), "context constructed");
		Ok(Arc::new(Context {
			config,
			pool,
			group,
			mux,
			dispatcher,
		}))
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn pool(&self) -> &BlockPool {
		&self.pool
	}

	pub fn group(&self) -> &Arc<Group> {
		&self.group
	}

	pub fn multiplexer(&self) -> &Arc<Multiplexer> {
		&self.mux
	}

	pub fn dispatcher(&self) -> &Dispatcher {
		&self.dispatcher
	}

	pub fn rank(&self) -> usize {
		self.group.rank()
	}

	pub fn num_workers(&self) -> usize {
		self.group.num_workers()
	}
}
