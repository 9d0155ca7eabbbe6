//! `generate(f, count)` (§4.8): a SOURCE node producing `f(0)..f(count)`,
//! sharded across workers by rank so each worker produces its contiguous
//! slice of the global index range.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::ctx::Context;
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;

struct GenerateNode<T, F> {
	id: NodeId,
	state: NodeStateCell,
	f: F,
	count: u64,
	rank: usize,
	num_workers: usize,
	children: std::sync::Mutex<Vec<Arc<dyn ItemSink<T>>>>,
}

impl<T, F> GenerateNode<T, F>
where
	T: Clone + Send + Sync + 'static,
	F: Fn(u64) -> T + Send + Sync,
{
	fn register_child(&self, sink: Arc<dyn ItemSink<T>>) {
		self.children.lock().expect("poisoned generate children lock").push(sink);
	}

	fn shard(&self) -> std::ops::Range<u64> {
		let per_worker = self.count / self.num_workers as u64;
		let remainder = self.count % self.num_workers as u64;
		let rank = self.rank as u64;
		let start = rank * per_worker + rank.min(remainder);
		let extra = if rank < remainder {
			1
		} else {
			0
		};
		start..(start + per_worker + extra)
	}
}

#[async_trait]
impl<T, F> NodeBase for GenerateNode<T, F>
where
	T: Clone + Send + Sync + 'static,
	F: Fn(u64) -> T + Send + Sync,
{
	fn id(&self) -> NodeId {
		self.id
	}

	fn kind(&self) -> NodeKind {
		NodeKind::Source
	}

	fn state(&self) -> NodeState {
		self.state.get()
	}

	fn parents(&self) -> &[Arc<dyn NodeBase>] {
		&[]
	}

	async fn start_pre_op(&self) -> Result<()> {
		self.state.advance(NodeState::New, NodeState::PreOpsStarted)
	}

	async fn execute(&self) -> Result<()> {
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let shard = self.shard();
		trace!(node = self.id, shard_len = shard.end - shard.start, "generate: producing shard");
		let children = self.children.lock().expect("poisoned generate children lock").clone();
		for i in shard {
			let item = (self.f)(i);
			for child in &children {
				child.push(item.clone()).await?;
			}
		}
		self.state.advance(NodeState::Executed, NodeState::Pushed)?;
		if consume {
			self.dispose();
		}
		Ok(())
	}

	fn dispose(&self) {}
}

/// Produces `f(0)..f(count)`, one partition's contiguous share per worker.
pub fn generate<T, F>(ctx: &Context, f: F, count: u64) -> Dia<T>
where
	T: Clone + Send + Sync + 'static,
	F: Fn(u64) -> T + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(GenerateNode {
		id,
		state: NodeStateCell::new(id),
		f,
		count,
		rank: ctx.rank(),
		num_workers: ctx.num_workers(),
		children: std::sync::Mutex::new(Vec::new()),
	});
	let registrar = node.clone();
	Dia::new(node.clone(), move |sink| {
		registrar.register_child(sink);
		Ok(())
	})
}
