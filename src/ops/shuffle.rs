//! Shared cross-host exchange helpers used by the DOP operators in §4.8:
//! hash-partitioning (`reduce_by_key`, `group_by_key`, `sort`'s
//! redistribution) and rebalancing onto the uniform `n/P` grid (`zip`,
//! `merge`).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ctx::Context;
use crate::data::{BlockCodec, BlockReader, BlockWriter};
use crate::err::Result;
use crate::net::StreamOrder;

fn hash_of<K: Hash>(key: &K) -> u64 {
	let mut hasher = DefaultHasher::new();
	key.hash(&mut hasher);
	hasher.finish()
}

/// Sends every item to the worker returned by `target(item)` (an explicit
/// rank, not derived from a hash) and returns everything this worker
/// received, in arrival order.
pub async fn shuffle_to<T>(ctx: &Context, stream_id: u64, items: Vec<T>, target: impl Fn(&T) -> usize) -> Result<Vec<T>>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
{
	let mux = ctx.multiplexer();
	let n = ctx.num_workers();
	let reader = mux.reader(stream_id, StreamOrder::Mix);

	let mut writers: Vec<_> =
		(0..n).map(|peer| BlockWriter::new(ctx.pool().clone(), mux.writer(stream_id, StreamOrder::Mix, peer))).collect();
	for item in items {
		let peer = target(&item) % n;
		writers[peer].put(&item).await?;
	}
	for writer in writers {
		writer.close().await?;
	}

	let mut reader = BlockReader::new(ctx.pool().clone(), reader);
	let mut out = Vec::new();
	while reader.has_next().await? {
		out.push(reader.next::<T>().await?);
	}
	Ok(out)
}

/// Sends every item to the worker owning `key(item)` (by hash modulo worker
/// count) and returns everything this worker received, in arrival order.
pub async fn shuffle_by_key<T, K>(ctx: &Context, stream_id: u64, items: Vec<T>, key: impl Fn(&T) -> K) -> Result<Vec<T>>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
	K: Hash,
{
	shuffle_to(ctx, stream_id, items, |item| hash_of(&key(item)) as usize).await
}

/// The worker that owns global index `index` out of `total` items split as
/// evenly as possible across `n` workers, matching [`crate::ops::generate`]'s
/// own sharding so a rebalance lands exactly on the uniform grid.
pub fn owner_of(index: u64, total: u64, n: usize) -> usize {
	if n <= 1 || total == 0 {
		return 0;
	}
	let per_worker = total / n as u64;
	let remainder = total % n as u64;
	// The boundary between rank r and r+1 is at r*per_worker + min(r, remainder).
	let boundary = |r: u64| r * per_worker + r.min(remainder);
	let mut lo = 0u64;
	let mut hi = n as u64 - 1;
	while lo < hi {
		let mid = (lo + hi + 1) / 2;
		if boundary(mid) <= index {
			lo = mid;
		} else {
			hi = mid - 1;
		}
	}
	lo as usize
}

/// Redistributes `items` (this worker's local partition, in order) onto the
/// uniform `n/P` grid by global index, restoring global order in the result.
pub async fn rebalance<T>(ctx: &Context, stream_id: u64, items: Vec<T>) -> Result<Vec<T>>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
{
	let group = ctx.group();
	let local_len = items.len() as u64;
	let start = group.prefix_sum(local_len, |a, b| a + b, false).await?;
	let total = group.all_reduce(local_len, |a, b| a + b).await?;
	let n = ctx.num_workers();

	let tagged: Vec<(u64, T)> = items.into_iter().enumerate().map(|(i, item)| (start + i as u64, item)).collect();
	let mut received = shuffle_to(ctx, stream_id, tagged, |(index, _)| owner_of(*index, total, n)).await?;
	received.sort_by_key(|(index, _)| *index);
	Ok(received.into_iter().map(|(_, item)| item).collect())
}

#[cfg(test)]
mod tests {
	use crate::ctx::Context;

	use super::{owner_of, rebalance, shuffle_by_key, shuffle_to};

	#[test]
	fn owner_of_matches_generates_own_contiguous_sharding() {
		// 10 items over 3 workers shard as [4, 3, 3] (see generate.rs's test of
		// the same split) — the boundaries are at 4 and 7.
		for i in 0..4u64 {
			assert_eq!(owner_of(i, 10, 3), 0);
		}
		for i in 4..7u64 {
			assert_eq!(owner_of(i, 10, 3), 1);
		}
		for i in 7..10u64 {
			assert_eq!(owner_of(i, 10, 3), 2);
		}
	}

	#[test]
	fn owner_of_is_degenerate_for_a_single_worker_or_empty_input() {
		for i in 0..5u64 {
			assert_eq!(owner_of(i, 5, 1), 0);
		}
		assert_eq!(owner_of(0, 0, 3), 0);
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shuffle_to_routes_every_item_to_its_explicit_target() {
		let contexts = Context::mock_cluster(3).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let rank = ctx.rank();
					// every worker sends its rank to worker 0, and nothing elsewhere.
					let items: Vec<u64> = vec![rank as u64];
					let received = shuffle_to(&ctx, 42, items, |_| 0).await.unwrap();
					(rank, received)
				})
			})
			.collect();
		for handle in handles {
			let (rank, received) = handle.await.unwrap();
			if rank == 0 {
				let mut sorted = received;
				sorted.sort();
				assert_eq!(sorted, vec![0u64, 1, 2]);
			} else {
				assert!(received.is_empty());
			}
		}
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn shuffle_by_key_groups_every_instance_of_a_key_onto_one_worker() {
		let contexts = Context::mock_cluster(4).unwrap();
		let handles: Vec<_> = contexts
			.into_iter()
			.map(|ctx| {
				tokio::spawn(async move {
					let rank = ctx.rank() as u64;
					// each worker contributes one "a" and one "b".
					let items = vec![("a".to_string(), rank), ("b".to_string(), rank)];
					shuffle_by_key(&ctx, 7, items, |(k, _)| k.clone()).await.unwrap()
				})
			})
			.collect();
		let mut per_worker = Vec::new();
		for handle in handles {
			per_worker.push(handle.await.unwrap());
		}
		// each key must be entirely owned by a single worker (whichever one its
		// hash landed on), and every occurrence across the cluster must show up.
		let mut by_key: std::collections::HashMap<String, Vec<u64>> = std::collections::HashMap::new();
		for received in &per_worker {
			let keys_here: std::collections::HashSet<&str> = received.iter().map(|(k, _)| k.as_str()).collect();
			assert!(keys_here.len() <= 1, "a single worker received more than one distinct key");
		}
		for received in per_worker {
			for (k, rank) in received {
				by_key.entry(k).or_default().push(rank);
			}
		}
		for ranks in by_key.values_mut() {
			ranks.sort();
		}
		assert_eq!(by_key.get("a").cloned(), Some(vec![0, 1, 2, 3]));
		assert_eq!(by_key.get("b").cloned(), Some(vec![0, 1, 2, 3]));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn rebalance_redistributes_onto_the_uniform_grid_preserving_order() {
		let contexts = Context::mock_cluster(3).unwrap();
		// an unevenly-sized local partition per rank: 1, 0, 9 items (10 total).
		let local_inputs = vec![vec![0u64], vec![], (1u64..10).collect::<Vec<_>>()];
		let handles: Vec<_> = contexts
			.into_iter()
			.zip(local_inputs)
			.map(|(ctx, local)| {
				tokio::spawn(async move {
					let rank = ctx.rank();
					let out = rebalance(&ctx, 99, local).await.unwrap();
					(rank, out)
				})
			})
			.collect();
		let mut by_rank = Vec::new();
		for handle in handles {
			by_rank.push(handle.await.unwrap());
		}
		by_rank.sort_by_key(|(rank, _)| *rank);
		assert_eq!(by_rank.iter().map(|(_, out)| out.len()).collect::<Vec<_>>(), vec![4, 3, 3]);
		let mut concatenated = Vec::new();
		for (_, out) in by_rank {
			concatenated.extend(out);
		}
		assert_eq!(concatenated, (0u64..10).collect::<Vec<_>>());
	}
}
