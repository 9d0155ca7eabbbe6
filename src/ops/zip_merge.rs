//! `zip(other)` / `merge(other, cmp)` (§4.8): DOP nodes over two parent DIAs,
//! each rebalanced onto the uniform `n/P` grid before being combined
//! element-wise (zip) or run-wise (merge, over pre-sorted inputs).

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ctx::Context;
use crate::data::BlockCodec;
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;
use crate::ops::shuffle::rebalance;

struct LeftSink<A> {
	buffer: Arc<Mutex<Vec<A>>>,
}

#[async_trait]
impl<A: Send + Sync + 'static> ItemSink<A> for LeftSink<A> {
	async fn push(&self, item: A) -> Result<()> {
		self.buffer.lock().expect("poisoned zip/merge left buffer lock").push(item);
		Ok(())
	}
}

struct RightSink<B> {
	buffer: Arc<Mutex<Vec<B>>>,
}

#[async_trait]
impl<B: Send + Sync + 'static> ItemSink<B> for RightSink<B> {
	async fn push(&self, item: B) -> Result<()> {
		self.buffer.lock().expect("poisoned zip/merge right buffer lock").push(item);
		Ok(())
	}
}

struct ZipNode<A, B, R, F> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	ctx: Context,
	stream_id_a: u64,
	stream_id_b: u64,
	left: Arc<Mutex<Vec<A>>>,
	right: Arc<Mutex<Vec<B>>>,
	combine: F,
	result: Mutex<Vec<R>>,
	children: Mutex<Vec<Arc<dyn ItemSink<R>>>>,
}

#[async_trait]
impl<A, B, R, F> NodeBase for ZipNode<A, B, R, F>
where
	A: BlockCodec + Clone + Send + Sync + 'static,
	B: BlockCodec + Clone + Send + Sync + 'static,
	R: Clone + Send + Sync + 'static,
	F: Fn(A, B) -> R + Send + Sync,
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
		let local_a = std::mem::take(&mut *self.left.lock().expect("poisoned zip left lock"));
		let local_b = std::mem::take(&mut *self.right.lock().expect("poisoned zip right lock"));
		let rebalanced_a = rebalance(&self.ctx, self.stream_id_a, local_a).await?;
		let rebalanced_b = rebalance(&self.ctx, self.stream_id_b, local_b).await?;
		let zipped = rebalanced_a.into_iter().zip(rebalanced_b).map(|(a, b)| (self.combine)(a, b)).collect();
		*self.result.lock().expect("poisoned zip result lock") = zipped;
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = std::mem::take(&mut *self.result.lock().expect("poisoned zip result lock"));
		let children = self.children.lock().expect("poisoned zip children lock").clone();
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

/// Pairs `left` and `right` element-by-element, rebalancing each onto the
/// uniform `n/P` grid first so a global index lines both sides up even when
/// their original partitioning differs. Both DIAs must carry the same global
/// length; `combine` is applied once both sides have been aligned.
pub fn zip<A, B, R, F>(ctx: &Context, left: Dia<A>, right: Dia<B>, combine: F) -> Dia<R>
where
	A: BlockCodec + Clone + Send + Sync + 'static,
	B: BlockCodec + Clone + Send + Sync + 'static,
	R: Clone + Send + Sync + 'static,
	F: Fn(A, B) -> R + Send + Sync + 'static,
{
	let id = fresh_id();
	let left_buffer = Arc::new(Mutex::new(Vec::new()));
	let right_buffer = Arc::new(Mutex::new(Vec::new()));
	let node = Arc::new(ZipNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![left.node(), right.node()],
		ctx: ctx.clone(),
		stream_id_a: id,
		stream_id_b: fresh_id(),
		left: left_buffer.clone(),
		right: right_buffer.clone(),
		combine,
		result: Mutex::new(Vec::new()),
		children: Mutex::new(Vec::new()),
	});
	left.attach(Arc::new(LeftSink {
		buffer: left_buffer,
	}))
	.expect("attaching zip to its left parent never fails");
	right
		.attach(Arc::new(RightSink {
			buffer: right_buffer,
		}))
		.expect("attaching zip to its right parent never fails");

	let registrar = node.clone();
	let base: Arc<dyn NodeBase> = node;
	Dia::new(base, move |sink| {
		registrar.children.lock().expect("poisoned zip children lock").push(sink);
		Ok(())
	})
}

struct MergeNode<T, F> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	ctx: Context,
	stream_id_a: u64,
	stream_id_b: u64,
	left: Arc<Mutex<Vec<T>>>,
	right: Arc<Mutex<Vec<T>>>,
	cmp: F,
	result: Mutex<Vec<T>>,
	children: Mutex<Vec<Arc<dyn ItemSink<T>>>>,
}

#[async_trait]
impl<T, F> NodeBase for MergeNode<T, F>
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
		let local_left = std::mem::take(&mut *self.left.lock().expect("poisoned merge left lock"));
		let local_right = std::mem::take(&mut *self.right.lock().expect("poisoned merge right lock"));
		let left = rebalance(&self.ctx, self.stream_id_a, local_left).await?;
		let right = rebalance(&self.ctx, self.stream_id_b, local_right).await?;

		let mut merged = Vec::with_capacity(left.len() + right.len());
		let (mut li, mut ri) = (0, 0);
		while li < left.len() && ri < right.len() {
			if (self.cmp)(&left[li], &right[ri]) == Ordering::Greater {
				merged.push(right[ri].clone());
				ri += 1;
			} else {
				merged.push(left[li].clone());
				li += 1;
			}
		}
		merged.extend_from_slice(&left[li..]);
		merged.extend_from_slice(&right[ri..]);

		*self.result.lock().expect("poisoned merge result lock") = merged;
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = std::mem::take(&mut *self.result.lock().expect("poisoned merge result lock"));
		let children = self.children.lock().expect("poisoned merge children lock").clone();
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

/// Merges two pre-sorted DIAs (by `cmp`) into one globally sorted DIA,
/// rebalancing each onto the uniform `n/P` grid before the local two-pointer
/// merge (scenario 6 in §8: per-worker element count may differ from `n/P`
/// by a bounded skew, since a rebalanced run's length need not divide evenly
/// against the other side's).
pub fn merge<T, F>(ctx: &Context, left: Dia<T>, right: Dia<T>, cmp: F) -> Dia<T>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
{
	let id = fresh_id();
	let left_buffer = Arc::new(Mutex::new(Vec::new()));
	let right_buffer = Arc::new(Mutex::new(Vec::new()));
	let node = Arc::new(MergeNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![left.node(), right.node()],
		ctx: ctx.clone(),
		stream_id_a: id,
		stream_id_b: fresh_id(),
		left: left_buffer.clone(),
		right: right_buffer.clone(),
		cmp,
		result: Mutex::new(Vec::new()),
		children: Mutex::new(Vec::new()),
	});
	left.attach(Arc::new(LeftSink {
		buffer: left_buffer,
	}))
	.expect("attaching merge to its left parent never fails");
	right
		.attach(Arc::new(RightSink {
			buffer: right_buffer,
		}))
		.expect("attaching merge to its right parent never fails");

	let registrar = node.clone();
	let base: Arc<dyn NodeBase> = node;
	Dia::new(base, move |sink| {
		registrar.children.lock().expect("poisoned merge children lock").push(sink);
		Ok(())
	})
}

#[cfg(test)]
mod tests {
	use crate::ctx::Context;
	use crate::ops::generate;
	use crate::ops::testing::collect;

	use super::{merge, zip};

	#[tokio::test]
	async fn single_worker_zip_pairs_elements_by_index() {
		let ctx = Context::mock_cluster(1).unwrap().pop().unwrap();
		let left = generate(&ctx, |i| i, 5);
		let right = generate(&ctx, |i| i * 10, 5);
		let zipped = zip(&ctx, left, right, |a, b| a + b);
		let out = collect(zipped).await.unwrap();
		assert_eq!(out, vec![0, 11, 22, 33, 44]);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn three_workers_zip_realigns_differently_partitioned_sides() {
		let contexts = Context::mock_cluster(3).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let rank = ctx.rank();
					let left = generate(&ctx, |i| i, 7);
					let right = generate(&ctx, |i| i * 100, 7);
					let zipped = zip(&ctx, left, right, |a, b| (a, b));
					(rank, collect(zipped).await.unwrap())
				})
			})
			.collect();
		let mut by_rank = Vec::new();
		for handle in handles {
			by_rank.push(handle.await.unwrap());
		}
		by_rank.sort_by_key(|(rank, _)| *rank);
		let mut concatenated = Vec::new();
		for (_, part) in by_rank {
			concatenated.extend(part);
		}
		let expected: Vec<(u64, u64)> = (0..7).map(|i| (i, i * 100)).collect();
		assert_eq!(concatenated, expected);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn merge_of_evens_and_odds_is_globally_sorted_with_bounded_skew() {
		let contexts = Context::mock_cluster(5).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let rank = ctx.rank();
					let evens = generate(&ctx, |i| i * 2, 50);
					let odds = generate(&ctx, |i| i * 2 + 1, 50);
					let merged = merge(&ctx, evens, odds, |a, b| a.cmp(b));
					(rank, collect(merged).await.unwrap())
				})
			})
			.collect();
		let mut by_rank = Vec::new();
		for handle in handles {
			by_rank.push(handle.await.unwrap());
		}
		by_rank.sort_by_key(|(rank, _)| *rank);

		let expected_per_worker = 100 / 5;
		let mut concatenated = Vec::new();
		for (_, part) in &by_rank {
			let skew = (part.len() as i64 - expected_per_worker as i64).unsigned_abs();
			assert!(skew <= 10, "per-worker skew {} exceeds tolerance", skew);
			concatenated.extend(part.iter().copied());
		}
		assert_eq!(concatenated, (0u64..100).collect::<Vec<_>>());
	}
}
