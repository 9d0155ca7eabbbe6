//! The Multiplexer and logical streams (C8): layers cat/mix streams over the
//! Group's point-to-point connections, routing by `stream_id` and restoring
//! either deterministic sender-rank order (cat) or arrival order (mix).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::data::{Block, BlockPool, BlockSink, BlockSource};
use crate::err::Result;

use super::group::Group;
use super::mux::{BlockHeader, StreamOrder};

/// One arriving block tagged with the sender rank, used by the mix reader to
/// preserve arrival order across all senders. `block: None` is that sender's
/// close signal.
struct Arrival {
	block: Option<Block>,
}

struct StreamState {
	order: StreamOrder,
	num_workers: usize,
	/// Per-sender substream, drained in rank order by the cat reader.
	substreams: Vec<(channel::Sender<Option<Block>>, channel::Receiver<Option<Block>>)>,
	/// Single shared queue all senders push into, drained in arrival order by
	/// the mix reader.
	arrivals: (channel::Sender<Arrival>, channel::Receiver<Arrival>),
}

impl StreamState {
	fn new(order: StreamOrder, num_workers: usize) -> Self {
		let substreams = (0..num_workers).map(|_| channel::unbounded()).collect();
		Self {
			order,
			num_workers,
			substreams,
			arrivals: channel::unbounded(),
		}
	}

	fn route(&self, sender: u64, block: Option<Block>) {
		match self.order {
			StreamOrder::Cat => {
				let (tx, _) = &self.substreams[sender as usize];
				let _ = tx.try_send(block);
			}
			StreamOrder::Mix => {
				let (tx, _) = &self.arrivals;
				let _ = tx.try_send(Arrival {
					block,
				});
			}
		}
	}
}

/// Routes inbound headers and blocks for every open stream on this worker,
/// and issues outbound writers that serialize onto the Group (or loop back
/// in-process for self-sends).
pub struct Multiplexer {
	group: Arc<Group>,
	pool: BlockPool,
	streams: DashMap<u64, Arc<StreamState>>,
}

impl Multiplexer {
	/// Builds the multiplexer and spawns the task that drains the Group's
	/// already-demultiplexed stream datagrams (see
	/// [`Group::next_stream_message`](super::group::Group::next_stream_message)).
	/// The Group itself owns the one raw-receive loop per peer, so this task
	/// never contends with a collective's `Group::recv_from` for the same
	/// inbound message.
	pub fn spawn(group: Arc<Group>, pool: BlockPool) -> Arc<Self> {
		let mux = Arc::new(Self {
			group: group.clone(),
			pool,
			streams: DashMap::new(),
		});
		let dispatcher = mux.clone();
		tokio::spawn(async move {
			while let Some((peer, message)) = group.next_stream_message().await {
				if let Err(err) = dispatcher.dispatch(peer, &message).await {
					warn!(peer, %err, "failed to materialize inbound block");
				}
			}
		});
		mux
	}

	fn stream_state(&self, stream_id: u64, order: StreamOrder) -> Arc<StreamState> {
		self.streams.entry(stream_id).or_insert_with(|| Arc::new(StreamState::new(order, self.group.num_workers()))).clone()
	}

	async fn dispatch(&self, sender: u64, message: &[u8]) -> Result<()> {
		let header = BlockHeader::decode(message)?;
		let state = self.stream_state(header.stream_id, header.order);
		let payload = &message[BlockHeader::ENCODED_LEN..];
		let block = if header.is_close() {
			None
		} else {
			Some(self.materialize(payload, &header).await?)
		};
		state.route(sender, block);
		Ok(())
	}

	async fn materialize(&self, payload: &[u8], header: &BlockHeader) -> Result<Block> {
		let byte_block = self.pool.allocate(payload.len().max(1), true).await?;
		byte_block.with_bytes_mut(|buf| buf[..payload.len()].copy_from_slice(payload));
		byte_block.set_used(payload.len());
		let block = self.pool.seal(byte_block.clone(), header.num_items as usize, header.first_item as usize);
		self.pool.unpin(&byte_block);
		Ok(block)
	}

	/// A writer that serializes blocks pushed to it onto the stream's
	/// `(stream_id, peer)` substream, either over the Group or, for
	/// `peer == self rank`, via a direct in-process loopback.
	pub fn writer(self: &Arc<Self>, stream_id: u64, order: StreamOrder, peer: usize) -> StreamWriter {
		let state = self.stream_state(stream_id, order);
		StreamWriter {
			mux: self.clone(),
			state,
			stream_id,
			peer,
			closed: Arc::new(AtomicBool::new(false)),
		}
	}

	/// A reader draining every sender's substream of `stream_id` in the
	/// order fixed by `order`.
	pub fn reader(self: &Arc<Self>, stream_id: u64, order: StreamOrder) -> StreamReader {
		let state = self.stream_state(stream_id, order);
		StreamReader {
			num_workers: state.num_workers,
			state,
			next_sender: 0,
			remaining_senders: self.group.num_workers(),
		}
	}
}

/// The write half of a stream directed at one peer. Close is idempotent: it
/// may be invoked from both an explicit `execute()` epilogue and `Drop`
/// without sending the close signal twice.
pub struct StreamWriter {
	mux: Arc<Multiplexer>,
	state: Arc<StreamState>,
	stream_id: u64,
	peer: usize,
	closed: Arc<AtomicBool>,
}

impl StreamWriter {
	async fn send(&self, header: BlockHeader, payload: &[u8]) -> Result<()> {
		if self.peer == self.mux.group.rank() {
			let block = if header.is_close() {
				None
			} else {
				Some(self.mux.materialize(payload, &header).await?)
			};
			self.state.route(header.sender_rank, block);
			return Ok(());
		}
		let mut message = Vec::with_capacity(BlockHeader::ENCODED_LEN + payload.len());
		header.encode(&mut message);
		message.extend_from_slice(payload);
		self.mux.group.send_stream(self.peer, message).await
	}

	fn header(&self, size: u64, first_item: u64, num_items: u64) -> BlockHeader {
		BlockHeader {
			order: self.state.order,
			size,
			first_item,
			num_items,
			stream_id: self.stream_id,
			sender_rank: self.mux.group.rank() as u64,
			receiver_local_worker: 0,
			sender_local_worker: 0,
		}
	}
}

#[async_trait]
impl BlockSink for StreamWriter {
	async fn accept(&mut self, block: Block) -> Result<()> {
		let header = self.header(block.size() as u64, block.offset_of_first() as u64, block.num_items() as u64);
		let byte_block = block.byte_block().clone();
		let (begin, end) = (block.begin(), block.end());
		let bytes = byte_block.with_bytes(|b| b[begin..end].to_vec());
		self.send(header, &bytes).await
	}

	async fn close(&mut self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		let header = BlockHeader::close(self.state.order, self.stream_id, self.mux.group.rank() as u64);
		self.send(header, &[]).await
	}
}

impl Drop for StreamWriter {
	fn drop(&mut self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		// `execute()` did not close this writer explicitly (e.g. an error
		// unwound the stage). Route the close signal directly rather than
		// spawning a task, since the peer-vs-loopback branches above both
		// degrade to synchronous bookkeeping except for the network send,
		// which best-effort fires without blocking the dropping thread.
		let header = BlockHeader::close(self.state.order, self.stream_id, self.mux.group.rank() as u64);
		if self.peer == self.mux.group.rank() {
			self.state.route(header.sender_rank, None);
			return;
		}
		let mux = self.mux.clone();
		let peer = self.peer;
		let mut message = Vec::with_capacity(BlockHeader::ENCODED_LEN);
		header.encode(&mut message);
		tokio::spawn(async move {
			let _ = mux.group.send_stream(peer, message).await;
		});
	}
}

/// The read half of a stream: pulls blocks in cat order (rank 0, 1, ..,
/// n-1, each drained to its close) or mix order (first-arrived-first-read),
/// as fixed when the stream was opened.
pub struct StreamReader {
	state: Arc<StreamState>,
	num_workers: usize,
	next_sender: usize,
	remaining_senders: usize,
}

#[async_trait]
impl BlockSource for StreamReader {
	async fn next_block(&mut self) -> Result<Option<Block>> {
		match self.state.order {
			StreamOrder::Cat => {
				while self.next_sender < self.num_workers {
					let (_, rx) = &self.state.substreams[self.next_sender];
					match rx.recv().await {
						Ok(Some(block)) => return Ok(Some(block)),
						Ok(None) => self.next_sender += 1,
						Err(_) => self.next_sender += 1,
					}
				}
				Ok(None)
			}
			StreamOrder::Mix => {
				while self.remaining_senders > 0 {
					let (_, rx) = &self.state.arrivals;
					match rx.recv().await {
						Ok(Arrival {
							block: Some(block),
						}) => return Ok(Some(block)),
						Ok(Arrival {
							block: None,
						}) => self.remaining_senders -= 1,
						Err(_) => self.remaining_senders = 0,
					}
				}
				Ok(None)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_round_trips() {
		let header = BlockHeader {
			order: StreamOrder::Mix,
			size: 128,
			first_item: 3,
			num_items: 7,
			stream_id: 42,
			sender_rank: 1,
			receiver_local_worker: 0,
			sender_local_worker: 0,
		};
		let mut buf = Vec::new();
		header.encode(&mut buf);
		let decoded = BlockHeader::decode(&buf).unwrap();
		assert_eq!(decoded.size, header.size);
		assert_eq!(decoded.stream_id, header.stream_id);
	}
}
