//! `sort(cmp)` (§4.8): samples a pivot set, computes splitters via
//! `all_gather` plus a local sort, redistributes each element to the
//! worker owning its splitter range, then sorts the received partition
//! locally.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ctx::Context;
use crate::data::BlockCodec;
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;
use crate::ops::shuffle::shuffle_to;

struct SortNode<T, F> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	ctx: Context,
	stream_id: u64,
	buffer: Mutex<Vec<T>>,
	cmp: F,
	children: Mutex<Vec<Arc<dyn ItemSink<T>>>>,
}

#[async_trait]
impl<T, F> ItemSink<T> for SortNode<T, F>
where
	T: Send + Sync + 'static,
	F: Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		self.buffer.lock().expect("poisoned sort buffer lock").push(item);
		Ok(())
	}
}

/// Picks `n - 1` splitters evenly spaced through the globally sorted sample,
/// so worker `r`'s partition holds everything `< splitters[r]` (and `>=
/// splitters[r-1]`).
fn compute_splitters<T: Clone>(mut sample: Vec<T>, cmp: &impl Fn(&T, &T) -> Ordering, n: usize) -> Vec<T> {
	sample.sort_by(cmp);
	(1..n)
		.map(|r| {
			let index = r * sample.len() / n;
			sample[index.min(sample.len() - 1)].clone()
		})
		.collect()
}

fn partition_of<T>(item: &T, splitters: &[T], cmp: &impl Fn(&T, &T) -> Ordering) -> usize {
	splitters.partition_point(|s| cmp(s, item) != Ordering::Greater)
}

#[async_trait]
impl<T, F> NodeBase for SortNode<T, F>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> Ordering + Send + Sync,
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
		let mut local = {
			let mut buffer = self.buffer.lock().expect("poisoned sort buffer lock");
			std::mem::take(&mut *buffer)
		};
		local.sort_by(&self.cmp);

		let n = self.ctx.num_workers();
		let mut sorted = local;
		if n > 1 {
			let samples = self.ctx.group().all_gather(sorted.clone()).await?;
			let pooled: Vec<T> = samples.into_iter().flatten().collect();
			let splitters = compute_splitters(pooled, &self.cmp, n);

			let tagged: Vec<(usize, T)> = sorted.into_iter().map(|item| (partition_of(&item, &splitters, &self.cmp), item)).collect();
			let mut received = shuffle_to(&self.ctx, self.stream_id, tagged, |(partition, _)| *partition).await?;
			received.sort_by(|a, b| (self.cmp)(&a.1, &b.1));
			sorted = received.into_iter().map(|(_, item)| item).collect();
		}

		*self.buffer.lock().expect("poisoned sort buffer lock") = sorted;
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = {
			let mut buffer = self.buffer.lock().expect("poisoned sort buffer lock");
			std::mem::take(&mut *buffer)
		};
		let children = self.children.lock().expect("poisoned sort children lock").clone();
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

/// Globally sorts `dia` by `cmp`, redistributing elements across workers so
/// worker `r`'s local partition is entirely ordered before worker `r + 1`'s.
pub fn sort<T, F>(ctx: &Context, dia: Dia<T>, cmp: F) -> Dia<T>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(SortNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![dia.node()],
		ctx: ctx.clone(),
		stream_id: id,
		buffer: Mutex::new(Vec::new()),
		cmp,
		children: Mutex::new(Vec::new()),
	});
	dia.attach(node.clone()).expect("attaching sort to its parent never fails");

	let registrar = node.clone();
	let base: Arc<dyn NodeBase> = node;
	Dia::new(base, move |sink| {
		registrar.children.lock().expect("poisoned sort children lock").push(sink);
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use crate::ctx::Context;
	use crate::ops::generate;
	use crate::ops::testing::collect;

	use super::sort;

	const VALUES: [i64; 11] = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];

	#[tokio::test]
	async fn single_worker_sort_matches_a_plain_sort() {
		let ctx = Context::mock_cluster(1).unwrap().pop().unwrap();
		let dia = generate(&ctx, |i| VALUES[i as usize], VALUES.len() as u64);
		let sorted = sort(&ctx, dia, |a, b| a.cmp(b));
		let out = collect(sorted).await.unwrap();
		assert_eq!(out, vec![1, 1, 2, 3, 3, 4, 5, 5, 5, 6, 9]);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn three_workers_sort_is_globally_ordered_by_rank() {
		let contexts = Context::mock_cluster(3).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let rank = ctx.rank();
					let dia = generate(&ctx, |i| VALUES[i as usize], VALUES.len() as u64);
					let sorted = sort(&ctx, dia, |a, b| a.cmp(b));
					(rank, collect(sorted).await.unwrap())
				})
			})
			.collect();

		let mut by_rank = Vec::new();
		for handle in handles {
			by_rank.push(handle.await.unwrap());
		}
		by_rank.sort_by_key(|(rank, _)| *rank);

		let mut concatenated = Vec::new();
		for (_, part) in &by_rank {
			assert!(part.windows(2).all(|w| w[0] <= w[1]), "each worker's own partition must be sorted");
			concatenated.extend(part.iter().copied());
		}
		let mut expected: Vec<i64> = VALUES.to_vec();
		expected.sort();
		assert_eq!(concatenated, expected);
		assert!(concatenated.windows(2).all(|w| w[0] <= w[1]), "rank order must be globally sorted");
	}
}
