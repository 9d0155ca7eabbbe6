//! Black-box end-to-end scenarios driving the public operator API over an
//! in-process mock cluster, one worker per `tokio::spawn`ed task.

use distflow::ctx::Context;
use distflow::ops::{generate, group_by_key, merge, prefix_sum, read_binary, sort, sum, write_binary};

/// Folds `dia` into one globally ordered `Vec<T>` using only the public
/// operator surface: each element becomes a singleton vector, and `sum`'s
/// associative combine concatenates them. `sum`'s all_reduce folds ranks in
/// order and each worker pushes its own local partition in order, so the
/// result preserves rank-then-local ordering.
async fn collect_via_sum<T>(ctx: &Context, dia: distflow::dia::Dia<T>) -> Vec<T>
where
	T: distflow::data::BlockCodec + Clone + Send + Sync + 'static,
{
	let as_vecs = dia.map(|item| vec![item]);
	sum(ctx, as_vecs, |a: &Vec<T>, b: &Vec<T>| {
		let mut combined = a.clone();
		combined.extend(b.iter().cloned());
		combined
	}, Vec::new())
	.await
	.unwrap()
}

async fn run_on_cluster<F, Fut, T>(num_workers: usize, f: F) -> Vec<T>
where
	F: Fn(std::sync::Arc<Context>) -> Fut + Send + Sync + Clone + 'static,
	Fut: std::future::Future<Output = T> + Send + 'static,
	T: Send + 'static,
{
	let contexts = Context::mock_cluster(num_workers).unwrap();
	let mut handles = Vec::new();
	for ctx in contexts {
		let f = f.clone();
		handles.push(tokio::spawn(async move { f(ctx).await }));
	}
	let mut out = Vec::new();
	for handle in handles {
		out.push(handle.await.unwrap());
	}
	out
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_generate_then_sum_is_28() {
	let results = run_on_cluster(3, |ctx| async move {
		let dia = generate(&ctx, |i| i, 8);
		sum(&ctx, dia, |a, b| a + b, 0u64).await.unwrap()
	})
	.await;
	for total in results {
		assert_eq!(total, 28);
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_generate_then_prefix_sum_matches_the_exclusive_scan() {
	let mut per_rank = run_on_cluster(3, |ctx| async move {
		let rank = ctx.rank();
		let dia = generate(&ctx, |i| i, 10);
		let scanned = prefix_sum(&ctx, dia, |a, b| a + b, 0u64, false);
		(rank, collect_via_sum(&ctx, scanned).await)
	})
	.await;
	per_rank.sort_by_key(|(rank, _)| *rank);

	let mut concatenated = Vec::new();
	for (_, part) in per_rank {
		concatenated.extend(part);
	}
	assert_eq!(concatenated, vec![0u64, 0, 1, 3, 6, 10, 15, 21, 28, 36]);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_word_count_over_a_b_a_c_a_b() {
	let words: Vec<&'static str> = "a b a c a b".split(' ').collect();
	let n = words.len() as u64;
	let per_rank = run_on_cluster(2, move |ctx| {
		let words = words.clone();
		async move {
			let dia = generate(&ctx, move |i| words[i as usize].to_string(), n);
			let grouped = group_by_key(&ctx, dia, |w: &String| w.clone());
			collect_via_sum(&ctx, grouped).await
		}
	})
	.await;

	let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
	for part in per_rank {
		for (word, occurrences) in part {
			*counts.entry(word).or_default() += occurrences.len();
		}
	}
	assert_eq!(counts.get("a"), Some(&3));
	assert_eq!(counts.get("b"), Some(&2));
	assert_eq!(counts.get("c"), Some(&1));
	assert_eq!(counts.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_generate_write_binary_read_binary_all_gather_is_sorted_0_through_15() {
	let dir = tempfile::tempdir().unwrap();
	let base_path = dir.path().to_path_buf();

	let per_rank = run_on_cluster(3, move |ctx| {
		let base_path = base_path.clone();
		async move {
			let dia = generate(&ctx, |i| i, 16);
			write_binary(&ctx, dia, base_path.clone()).await.unwrap();
			let read_back = read_binary(&ctx, base_path);
			let local = collect_via_sum(&ctx, read_back).await;
			ctx.group().all_gather(local).await.unwrap()
		}
	})
	.await;

	let first = per_rank[0].clone();
	for other in &per_rank[1..] {
		assert_eq!(other, &first);
	}
	let mut flattened: Vec<u64> = first.into_iter().flatten().collect();
	flattened.sort();
	assert_eq!(flattened, (0u64..16).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_sort_of_an_unordered_sequence() {
	const VALUES: [i64; 11] = [3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5];
	let mut per_rank = run_on_cluster(3, |ctx| async move {
		let rank = ctx.rank();
		let dia = generate(&ctx, |i| VALUES[i as usize], VALUES.len() as u64);
		let sorted = sort(&ctx, dia, |a, b| a.cmp(b));
		(rank, collect_via_sum(&ctx, sorted).await)
	})
	.await;
	per_rank.sort_by_key(|(rank, _)| *rank);

	let mut concatenated = Vec::new();
	for (_, part) in per_rank {
		concatenated.extend(part);
	}
	let mut expected = VALUES.to_vec();
	expected.sort();
	assert_eq!(concatenated, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_merge_of_evens_and_odds_with_bounded_skew() {
	let mut per_rank = run_on_cluster(5, |ctx| async move {
		let rank = ctx.rank();
		let evens = generate(&ctx, |i| i * 2, 50);
		let odds = generate(&ctx, |i| i * 2 + 1, 50);
		let merged = merge(&ctx, evens, odds, |a, b| a.cmp(b));
		(rank, collect_via_sum(&ctx, merged).await)
	})
	.await;
	per_rank.sort_by_key(|(rank, _)| *rank);

	let expected_per_worker = 100 / 5;
	let mut concatenated = Vec::new();
	for (_, part) in &per_rank {
		let skew = (part.len() as i64 - expected_per_worker as i64).unsigned_abs();
		assert!(skew <= 10, "per-worker skew {skew} exceeds tolerance");
		concatenated.extend(part.iter().copied());
	}
	assert_eq!(concatenated, (0u64..100).collect::<Vec<_>>());
}
