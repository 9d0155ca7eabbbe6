//! `prefix_sum(f, initial, inclusive)` (§4.8): local fold, a `prefix_sum`
//! collective over the Group for the cross-worker offset, then a local
//! re-scan applying that offset.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ctx::Context;
use crate::data::BlockCodec;
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;

struct PrefixSumNode<T, F> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	ctx: Context,
	buffer: Mutex<Vec<T>>,
	f: F,
	initial: T,
	inclusive: bool,
	children: Mutex<Vec<Arc<dyn ItemSink<T>>>>,
}

#[async_trait]
impl<T, F> ItemSink<T> for PrefixSumNode<T, F>
where
	T: Send + Sync + 'static,
	F: Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		self.buffer.lock().expect("poisoned prefix_sum buffer lock").push(item);
		Ok(())
	}
}

#[async_trait]
impl<T, F> NodeBase for PrefixSumNode<T, F>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> T + Send + Sync,
{
	fn id(&self) -> NodeId {
		self.id
	}

	fn kind(&self) -> NodeKind {
		NodeKind::Dop
	}

	fn state(&self) -> NodeState {
		self.state.get()
	}

	fn parents(&self) -> &[Arc<dyn NodeBase>] {
		&self.parents
	}

	async fn start_pre_op(&self) -> Result<()> {
		self.state.advance(NodeState::New, NodeState::PreOpsStarted)
	}

	async fn execute(&self) -> Result<()> {
		let local = {
			let mut buffer = self.buffer.lock().expect("poisoned prefix_sum buffer lock");
			std::mem::take(&mut *buffer)
		};

		let mut local_total = local.first().cloned();
		for item in local.iter().skip(1) {
			local_total = Some((self.f)(&local_total.take().unwrap(), item));
		}

		// Rank 0 has no preceding worker to fold against, and `Group::prefix_sum`
		// has no identity element of `T` to fall back on for an empty take
		// window — so the base offset there is `initial` alone, skipping the
		// collective entirely rather than calling it with nothing to fold.
		let rank = self.ctx.rank();
		let offset = if rank == 0 {
			self.initial.clone()
		} else {
			let seed = local_total.clone().unwrap_or_else(|| self.initial.clone());
			let preceding = self.ctx.group().prefix_sum(seed, |a, b| (self.f)(a, b), false).await?;
			(self.f)(&self.initial, &preceding)
		};

		let mut scanned = Vec::with_capacity(local.len());
		let mut running = offset;
		for item in &local {
			if !self.inclusive {
				scanned.push(running.clone());
			}
			running = (self.f)(&running, item);
			if self.inclusive {
				scanned.push(running.clone());
			}
		}

		*self.buffer.lock().expect("poisoned prefix_sum buffer lock") = scanned;
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = {
			let mut buffer = self.buffer.lock().expect("poisoned prefix_sum buffer lock");
			std::mem::take(&mut *buffer)
		};
		let children = self.children.lock().expect("poisoned prefix_sum children lock").clone();
		for item in items {
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

/// A running fold of `dia`'s elements (in cat order across the whole
/// cluster), seeded by `initial`. `inclusive` selects whether position `i`'s
/// output includes `items[i]` itself or only everything strictly before it.
pub fn prefix_sum<T, F>(ctx: &Context, dia: Dia<T>, f: F, initial: T, inclusive: bool) -> Dia<T>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> T + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(PrefixSumNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![dia.node()],
		ctx: ctx.clone(),
		buffer: Mutex::new(Vec::new()),
		f,
		initial,
		inclusive,
		children: Mutex::new(Vec::new()),
	});
	dia.attach(node.clone()).expect("attaching prefix_sum to its parent never fails");

	let registrar = node.clone();
	let base: Arc<dyn NodeBase> = node;
	Dia::new(base, move |sink| {
		registrar.children.lock().expect("poisoned prefix_sum children lock").push(sink);
		Ok(())
	})
}
