//! [`Group`] (C6): a fully-connected mesh of `n` workers with stable ranks
//! `0 .. n`, point-to-point send/receive, and collectives built on a
//! deterministic one-factor peer pairing so independent implementations can
//! be cross-checked round by round.

use std::sync::Arc;

use crate::data::BlockCodec;
use crate::err::{Error, Result};

use super::mux::{TAG_COLLECTIVE, TAG_STREAM};
use super::transport::Transport;

/// Deterministic peer pairing for round `round` of an `n`-worker
/// one-factorization (the "circle method" for round-robin tournament
/// scheduling). Valid for any `n >= 1`. When `n` is odd one rank sits out
/// each round (`None`); there are `rounds(n)` distinct rounds.
pub fn one_factor_peer(rank: usize, round: usize, n: usize) -> Option<usize> {
	if n <= 1 {
		return None;
	}
	let padded = if n % 2 == 0 {
		n
	} else {
		n + 1
	};
	let last = padded - 1;
	let round = round % last;
	let peer = if rank == last {
		round
	} else if round == rank {
		last
	} else {
		(2 * round + last - rank) % last
	};
	if peer >= n {
		None
	} else {
		Some(peer)
	}
}

/// Number of distinct rounds in the one-factorization of `n` workers.
pub fn one_factor_rounds(n: usize) -> usize {
	if n <= 1 {
		0
	} else if n % 2 == 0 {
		n - 1
	} else {
		n
	}
}

fn encode<T: BlockCodec>(value: &T) -> Vec<u8> {
	let mut buf = Vec::new();
	value.encode(&mut buf);
	buf
}

fn decode<T: BlockCodec>(bytes: &[u8]) -> Result<T> {
	Ok(T::decode(bytes)?.0)
}

/// A Group's own per-peer inbox of demultiplexed collective payloads, fed
/// exclusively by the raw-receive loop `Group::new` spawns for that peer.
type Inbox = Vec<(channel::Sender<Vec<u8>>, channel::Receiver<Vec<u8>>)>;

pub struct Group {
	transport: Arc<dyn Transport>,
	inbox: Inbox,
	/// Stream datagrams, still undecoded, handed off to whoever drains this —
	/// see [`Multiplexer::spawn`](super::stream::Multiplexer::spawn).
	stream_inbox: (channel::Sender<(u64, Vec<u8>)>, channel::Receiver<(u64, Vec<u8>)>),
}

impl Group {
	/// Builds the group and spawns the one raw-receive loop per peer that
	/// ever reads this worker's transport channel. Every arrival is tagged
	/// (see [`TAG_COLLECTIVE`]/[`TAG_STREAM`]): collective datagrams are
	/// demultiplexed straight into this Group's own per-peer inbox, so a
	/// collective's `recv_from` never races anyone else for the same
	/// message; stream datagrams are forwarded, still raw, to whoever drains
	/// [`Group::next_stream_message`].
	pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
		let n = transport.num_workers();
		let inbox = (0..n).map(|_| channel::unbounded()).collect();
		let group = Arc::new(Self {
			transport,
			inbox,
			stream_inbox: channel::unbounded(),
		});
		for peer in 0..n {
			if peer == group.rank() {
				continue;
			}
			let group = group.clone();
			tokio::spawn(async move {
				loop {
					let Ok(message) = group.recv_raw(peer).await else {
						return;
					};
					let Some((&tag, body)) = message.split_first() else {
						continue;
					};
					match tag {
						TAG_COLLECTIVE => group.deliver_collective(peer, body.to_vec()),
						TAG_STREAM => {
							let _ = group.stream_inbox.0.try_send((peer as u64, body.to_vec()));
						}
						other => tracing::warn!(peer, tag = other, "dropped inbound message with unknown tag"),
					}
				}
			});
		}
		group
	}

	pub fn rank(&self) -> usize {
		self.transport.rank()
	}

	pub fn num_workers(&self) -> usize {
		self.transport.num_workers()
	}

	pub fn transport(&self) -> &Arc<dyn Transport> {
		&self.transport
	}

	/// Point-to-point send of a byte buffer of known length to peer `rank`,
	/// tagged as collective traffic.
	pub async fn send_to(&self, peer: usize, data: Vec<u8>) -> Result<()> {
		self.check_rank(peer)?;
		let mut message = Vec::with_capacity(1 + data.len());
		message.push(TAG_COLLECTIVE);
		message.extend_from_slice(&data);
		self.transport.send(peer, message).await
	}

	/// Point-to-point receive of a byte buffer from peer `rank`, drawn from
	/// this Group's own collective inbox rather than the shared transport
	/// channel.
	pub async fn recv_from(&self, peer: usize) -> Result<Vec<u8>> {
		self.check_rank(peer)?;
		let (_, rx) = &self.inbox[peer];
		rx.recv().await.map_err(|_| Error::PeerDisconnected {
			peer,
			reason: "collective inbox closed".into(),
		})
	}

	/// Hands a demultiplexed collective payload from peer `rank` to whichever
	/// collective call on this Group is waiting for it. Called only by this
	/// Group's own raw-receive loop.
	fn deliver_collective(&self, peer: usize, payload: Vec<u8>) {
		if let Some((tx, _)) = self.inbox.get(peer) {
			let _ = tx.try_send(payload);
		}
	}

	/// Point-to-point send tagged as stream traffic, used only by
	/// [`StreamWriter`](super::stream::StreamWriter) so stream blocks and
	/// collective datagrams never share an untagged channel.
	pub(crate) async fn send_stream(&self, peer: usize, data: Vec<u8>) -> Result<()> {
		self.check_rank(peer)?;
		let mut message = Vec::with_capacity(1 + data.len());
		message.push(TAG_STREAM);
		message.extend_from_slice(&data);
		self.transport.send(peer, message).await
	}

	/// Waits for the next stream datagram this Group's raw-receive loop
	/// demultiplexed, returning `(sender_rank, payload)`. Called only by the
	/// Multiplexer's dispatch task.
	pub(crate) async fn next_stream_message(&self) -> Option<(u64, Vec<u8>)> {
		self.stream_inbox.1.recv().await.ok()
	}

	/// Reads one untagged datagram straight off the transport. Called only
	/// from the loop `Group::new` spawns for this peer, which is that peer's
	/// sole raw-transport reader.
	async fn recv_raw(&self, peer: usize) -> Result<Vec<u8>> {
		self.check_rank(peer)?;
		self.transport.recv(peer).await
	}

	fn check_rank(&self, peer: usize) -> Result<()> {
		if peer >= self.num_workers() {
			return Err(Error::InvalidRank {
				rank: peer,
				size: self.num_workers(),
			});
		}
		Ok(())
	}

	/// Combines `value` across every worker using the supplied associative
	/// operator, returning the same combined result on every rank. Built on
	/// [`Group::all_gather`] (itself driven by the one-factor pairing) and a
	/// deterministic rank-ordered local fold, so `f` need not be commutative.
	pub async fn all_reduce<T, F>(&self, value: T, f: F) -> Result<T>
	where
		T: BlockCodec + Clone + Send,
		F: Fn(&T, &T) -> T + Send + Sync,
	{
		let values = self.all_gather(value).await?;
		let mut iter = values.into_iter();
		let mut acc = iter.next().expect("all_gather returns one value per worker");
		for v in iter {
			acc = f(&acc, &v);
		}
		Ok(acc)
	}

	/// Every worker's value, indexed by rank.
	pub async fn all_gather<T>(&self, value: T) -> Result<Vec<T>>
	where
		T: BlockCodec + Clone + Send,
	{
		let n = self.num_workers();
		let mut values: Vec<Option<T>> = (0..n).map(|_| None).collect();
		values[self.rank()] = Some(value.clone());
		for round in 0..one_factor_rounds(n) {
			let Some(peer) = one_factor_peer(self.rank(), round, n) else {
				continue;
			};
			let payload = encode(&value);
			let (_, received) = tokio::try_join!(self.send_to(peer, payload), self.recv_from(peer))?;
			values[peer] = Some(decode(&received)?);
		}
		values.into_iter().enumerate().map(|(rank, v)| v.ok_or(Error::InvalidRank { rank, size: n })).collect()
	}

	/// Exclusive or inclusive prefix fold over worker rank order.
	pub async fn prefix_sum<T, F>(&self, value: T, f: F, inclusive: bool) -> Result<T>
	where
		T: BlockCodec + Clone + Send,
		F: Fn(&T, &T) -> T + Send + Sync,
	{
		let all = self.all_gather(value.clone()).await?;
		let mut acc: Option<T> = None;
		let limit = if inclusive {
			self.rank() + 1
		} else {
			self.rank()
		};
		for v in all.into_iter().take(limit) {
			acc = Some(match acc {
				Some(a) => f(&a, &v),
				None => v,
			});
		}
		acc.ok_or_else(|| Error::InvalidConfig("prefix_sum requires at least one worker".into()))
	}

	/// Distributes `root`'s value to every worker.
	pub async fn broadcast<T>(&self, value: Option<T>, root: usize) -> Result<T>
	where
		T: BlockCodec + Clone + Send,
	{
		self.check_rank(root)?;
		if self.rank() == root {
			let value = value.expect("root must supply a value to broadcast");
			let payload = encode(&value);
			let mut sends = Vec::new();
			for peer in 0..self.num_workers() {
				if peer != root {
					sends.push(self.send_to(peer, payload.clone()));
				}
			}
			futures::future::try_join_all(sends).await?;
			Ok(value)
		} else {
			let bytes = self.recv_from(root).await?;
			decode(&bytes)
		}
	}

	/// Blocks until every worker has reached the barrier.
	pub async fn barrier(&self) -> Result<()> {
		self.all_reduce(0u64, |a, b| a + b).await.map(|_| ())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::net::transport::MockTransport;

	fn cluster(n: usize) -> Vec<Arc<Group>> {
		MockTransport::cluster(n).into_iter().map(|t| Group::new(Arc::new(t))).collect()
	}

	async fn run_on_every_rank<F, Fut, T>(groups: &[Arc<Group>], f: F) -> Vec<T>
	where
		F: Fn(Arc<Group>) -> Fut,
		Fut: std::future::Future<Output = T> + Send + 'static,
		T: Send + 'static,
	{
		let handles: Vec<_> = groups.iter().cloned().map(|g| tokio::spawn(f(g))).collect();
		let mut out = Vec::with_capacity(handles.len());
		for handle in handles {
			out.push(handle.await.unwrap());
		}
		out
	}

	#[tokio::test]
	async fn all_reduce_sums_every_ranks_value_everywhere() {
		for n in [1usize, 2, 3, 5, 8] {
			let groups = cluster(n);
			let results = run_on_every_rank(&groups, |g| async move {
				let rank = g.rank() as u64;
				g.all_reduce(rank, |a, b| a + b).await.unwrap()
			})
			.await;
			let expected: u64 = (0..n as u64).sum();
			assert!(results.iter().all(|&r| r == expected), "n={n}: {results:?} != all {expected}");
		}
	}

	#[tokio::test]
	async fn prefix_sum_exclusive_matches_the_partial_sum() {
		let n = 5;
		let groups = cluster(n);
		let results = run_on_every_rank(&groups, |g| async move {
			let rank = g.rank() as u64;
			g.prefix_sum(rank, |a, b| a + b, false).await.unwrap()
		})
		.await;
		// rank r's exclusive prefix sum of identity values [0,1,2,3,4] is 0+..+(r-1).
		let expected: Vec<u64> = (0..n as u64).map(|r| (0..r).sum()).collect();
		assert_eq!(results, expected);
	}

	#[tokio::test]
	async fn broadcast_returns_the_roots_value_everywhere() {
		let n = 4;
		let groups = cluster(n);
		let root = 2;
		let handles: Vec<_> = groups
			.iter()
			.cloned()
			.map(|g| {
				tokio::spawn(async move {
					let value = if g.rank() == root {
						Some(1234u64)
					} else {
						None
					};
					g.broadcast(value, root).await.unwrap()
				})
			})
			.collect();
		for handle in handles {
			assert_eq!(handle.await.unwrap(), 1234u64);
		}
	}

	#[tokio::test]
	async fn one_factor_pairing_is_a_valid_perfect_matching_each_round() {
		for n in 2..=9 {
			for round in 0..one_factor_rounds(n) {
				let mut seen = std::collections::HashSet::new();
				for rank in 0..n {
					if let Some(peer) = one_factor_peer(rank, round, n) {
						assert_ne!(peer, rank);
						assert_eq!(one_factor_peer(peer, round, n), Some(rank), "pairing must be symmetric");
						seen.insert(rank);
					}
				}
				// At most one rank sits out per round (only possible when n is odd).
				assert!(n - seen.len() <= 1);
			}
		}
	}
}
