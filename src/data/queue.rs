//! [`BlockQueue`] (C5): a bounded single-producer/single-consumer handoff of
//! [`Block`]s across threads within one host — typically from a stream
//! receiver to an operator's reader. The producer signals end-of-stream by
//! closing; the consumer observes it as `next_block() -> Ok(None)`.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::err::Result;

use super::block::Block;
use super::reader::BlockSource;
use super::writer::BlockSink;

/// Shared handle. `sender`/`receiver` are taken out of their `Mutex<Option<_>>`
/// at most once each via [`BlockQueue::writer`] / [`BlockQueue::reader`],
/// matching the single-producer/single-consumer contract — and, critically,
/// so `BlockQueue` itself never holds a usable `Sender` past that point. If it
/// did, the channel could never close: `QueueSource::next_block` would await
/// a `recv()` that no amount of dropped `QueueSink`s could ever end.
pub struct BlockQueue {
	sender: Mutex<Option<channel::Sender<Block>>>,
	receiver: Mutex<Option<channel::Receiver<Block>>>,
}

impl BlockQueue {
	pub fn new(capacity: usize) -> Self {
		let (sender, receiver) = channel::bounded(capacity);
		Self {
			sender: Mutex::new(Some(sender)),
			receiver: Mutex::new(Some(receiver)),
		}
	}

	/// Takes the write half. Panics if called more than once.
	pub fn writer(&self) -> QueueSink {
		let sender = self.sender.lock().expect("poisoned queue sender lock").take().expect("BlockQueue::writer called more than once");
		QueueSink {
			sender: Some(sender),
		}
	}

	/// Takes the read half. Panics if called more than once.
	pub fn reader(&self) -> QueueSource {
		let receiver = self.receiver.lock().expect("poisoned queue receiver lock").take().expect("BlockQueue::reader called more than once");
		QueueSource {
			receiver,
		}
	}
}

impl Default for BlockQueue {
	fn default() -> Self {
		Self::new(crate::cnf::BLOCK_QUEUE_CAPACITY)
	}
}

pub struct QueueSink {
	sender: Option<channel::Sender<Block>>,
}

#[async_trait]
impl BlockSink for QueueSink {
	async fn accept(&mut self, block: Block) -> Result<()> {
		let sender = self.sender.as_ref().expect("accept called on a closed QueueSink");
		sender.send(block).await.map_err(|_| crate::err::Error::PeerDisconnected {
			peer: 0,
			reason: "block queue consumer dropped".into(),
		})
	}

	async fn close(&mut self) -> Result<()> {
		// `BlockQueue` relinquished its own clone in `writer()`, so this is
		// the last `Sender` standing; dropping it here (rather than waiting
		// on `Drop`) closes the channel as soon as `close` is called, which
		// `QueueSource::next_block` observes as end-of-stream.
		self.sender = None;
		Ok(())
	}
}

pub struct QueueSource {
	receiver: channel::Receiver<Block>,
}

#[async_trait]
impl BlockSource for QueueSource {
	async fn next_block(&mut self) -> Result<Option<Block>> {
		match self.receiver.recv().await {
			Ok(block) => Ok(Some(block)),
			Err(_) => Ok(None),
		}
	}
}
