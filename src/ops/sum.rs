//! `sum(f, initial)` (§4.8): a DOP action that folds its parent's local
//! partition in `pre_op`, then combines across workers with a single
//! `all_reduce` in `execute`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ctx::Context;
use crate::data::BlockCodec;
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;
use crate::net::Group;
use crate::stage;

struct SumNode<T, F> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	group: Arc<Group>,
	buffer: Mutex<Vec<T>>,
	f: F,
	initial: T,
	result: Mutex<Option<T>>,
}

#[async_trait]
impl<T, F> ItemSink<T> for SumNode<T, F>
where
	T: Send + Sync + 'static,
	F: Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		self.buffer.lock().expect("poisoned sum buffer lock").push(item);
		Ok(())
	}
}

#[async_trait]
impl<T, F> NodeBase for SumNode<T, F>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> T + Send + Sync,
{
	fn id(&self) -> NodeId {
		self.id
	}

	fn kind(&self) -> NodeKind {
		NodeKind::Action
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
			let mut buffer = self.buffer.lock().expect("poisoned sum buffer lock");
			std::mem::take(&mut *buffer)
		};

		// Fold this worker's own partition without `initial` first — seeding
		// every rank's local accumulator with it and then `all_reduce`-ing
		// those N already-seeded partials together would apply `initial` N
		// times instead of once. Each rank's local partial travels as a
		// 0-or-1-element `Vec<T>` so an empty partition (no identity element
		// of `T` to fall back on) has something to carry through `all_reduce`.
		let mut local_acc: Option<T> = None;
		for item in &local {
			local_acc = Some(match local_acc {
				Some(acc) => (self.f)(&acc, item),
				None => item.clone(),
			});
		}

		let f = &self.f;
		let seed: Vec<T> = local_acc.into_iter().collect();
		let combined = self
			.group
			.all_reduce(seed, |a: &Vec<T>, b: &Vec<T>| match (a.first(), b.first()) {
				(Some(x), Some(y)) => vec![f(x, y)],
				(Some(_), None) => a.clone(),
				(None, Some(_)) => b.clone(),
				(None, None) => Vec::new(),
			})
			.await?;

		let result = match combined.into_iter().next() {
			Some(partial) => (self.f)(&self.initial, &partial),
			None => self.initial.clone(),
		};
		*self.result.lock().expect("poisoned sum result lock") = Some(result);
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		self.state.advance(NodeState::Executed, NodeState::Pushed)?;
		if consume {
			self.dispose();
		}
		Ok(())
	}

	fn dispose(&self) {}
}

/// Folds `dia`'s elements locally with `f` starting from `initial`, then
/// combines every worker's partial fold into the same final value everywhere.
pub async fn sum<T, F>(ctx: &Context, dia: Dia<T>, f: F, initial: T) -> Result<T>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> T + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(SumNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![dia.node()],
		group: ctx.group().clone(),
		buffer: Mutex::new(Vec::new()),
		f,
		initial,
		result: Mutex::new(None),
	});
	dia.attach(node.clone())?;

	let base: Arc<dyn NodeBase> = node.clone();
	stage::run_action(base, true).await?;

	Ok(node.result.lock().expect("poisoned sum result lock").clone().expect("sum execute always sets a result"))
}

#[cfg(test)]
mod tests {
	use crate::ctx::Context;
	use crate::ops::generate;

	use super::sum;

	#[tokio::test(flavor = "multi_thread")]
	async fn generate_0_to_8_then_sum_is_28() {
		let contexts = Context::mock_cluster(3).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let dia = generate(&ctx, |i| i, 8);
					sum(&ctx, dia, |a, b| a + b, 0u64).await.unwrap()
				})
			})
			.collect();
		for handle in handles {
			assert_eq!(handle.await.unwrap(), 28);
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn non_identity_initial_is_applied_exactly_once() {
		let contexts = Context::mock_cluster(3).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let dia = generate(&ctx, |i| i, 8);
					sum(&ctx, dia, |a, b| a + b, 100u64).await.unwrap()
				})
			})
			.collect();
		for handle in handles {
			// 100 + (0+1+..+7) == 128, not 100 applied once per worker.
			assert_eq!(handle.await.unwrap(), 128);
		}
	}

	#[tokio::test]
	async fn single_worker_sum_matches_local_fold() {
		let ctx = Context::mock_cluster(1).unwrap().pop().unwrap();
		let dia = generate(&ctx, |i| i, 5);
		let total = sum(&ctx, dia, |a, b| a + b, 0u64).await.unwrap();
		assert_eq!(total, 0 + 1 + 2 + 3 + 4);
	}
}
