//! In-process mock transport (§4.5): per-peer in-memory mailboxes. Used by
//! the test suite to exercise the Group and Multiplexer without sockets.

use async_trait::async_trait;

use crate::err::{Error, Result};

use super::Transport;

pub struct MockTransport {
	rank: usize,
	num_workers: usize,
	/// `senders[peer]` carries messages this rank addresses to `peer`.
	senders: Vec<channel::Sender<Vec<u8>>>,
	/// `receivers[peer]` carries messages `peer` addressed to this rank.
	receivers: Vec<channel::Receiver<Vec<u8>>>,
}

impl MockTransport {
	/// Builds a fully-connected mesh of `n` mock transports, one per rank.
	pub fn cluster(n: usize) -> Vec<MockTransport> {
		let mut senders: Vec<Vec<channel::Sender<Vec<u8>>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
		let mut receivers: Vec<Vec<channel::Receiver<Vec<u8>>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
		for i in 0..n {
			for j in 0..n {
				let (tx, rx) = channel::unbounded();
				senders[i].push(tx);
				receivers[j].push(rx);
			}
		}
		(0..n)
			.map(|rank| MockTransport {
				rank,
				num_workers: n,
				senders: std::mem::take(&mut senders[rank]),
				receivers: std::mem::take(&mut receivers[rank]),
			})
			.collect()
	}
}

#[async_trait]
impl Transport for MockTransport {
	fn rank(&self) -> usize {
		self.rank
	}

	fn num_workers(&self) -> usize {
		self.num_workers
	}

	async fn send(&self, peer: usize, data: Vec<u8>) -> Result<()> {
		self.senders[peer].send(data).await.map_err(|_| Error::PeerDisconnected {
			peer,
			reason: "mock mailbox closed".into(),
		})
	}

	async fn recv(&self, peer: usize) -> Result<Vec<u8>> {
		self.receivers[peer].recv().await.map_err(|_| Error::PeerDisconnected {
			peer,
			reason: "mock mailbox closed".into(),
		})
	}
}
