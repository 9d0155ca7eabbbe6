//! [`BlockWriter`] (C3): serializes items into a sequence of blocks drawn from
//! a [`BlockPool`], flushing into a [`BlockSink`] whenever an item would
//! overrun the current block or on an explicit `close()`.

use async_trait::async_trait;

use crate::err::Result;

use super::block::{Block, ByteBlock};
use super::codec::{type_hash, BlockCodec};
use super::pool::BlockPool;

/// Destination for blocks produced by a [`BlockWriter`]: a [`crate::data::File`],
/// a [`crate::data::BlockQueue`], or a multiplexed stream writer.
#[async_trait]
pub trait BlockSink: Send {
	async fn accept(&mut self, block: Block) -> Result<()>;
	async fn close(&mut self) -> Result<()>;
}

pub struct BlockWriter<S: BlockSink> {
	pool: BlockPool,
	sink: S,
	self_verify: bool,
	current: Option<ByteBlock>,
	write_offset: usize,
	num_items: usize,
	offset_of_first: Option<usize>,
	scratch: Vec<u8>,
}

impl<S: BlockSink> BlockWriter<S> {
	pub fn new(pool: BlockPool, sink: S) -> Self {
		Self::with_self_verify(pool, sink, *crate::cnf::SELF_VERIFY)
	}

	pub fn with_self_verify(pool: BlockPool, sink: S, self_verify: bool) -> Self {
		Self {
			pool,
			sink,
			self_verify,
			current: None,
			write_offset: 0,
			num_items: 0,
			offset_of_first: None,
			scratch: Vec::new(),
		}
	}

	/// Records that the next bytes written begin a new item. Called
	/// automatically by `put`; exposed for callers that build up an item's
	/// encoding across multiple raw writes.
	pub fn mark_item(&mut self) {
		if self.offset_of_first.is_none() {
			self.offset_of_first = Some(self.write_offset);
		}
	}

	pub async fn put<T: BlockCodec>(&mut self, item: &T) -> Result<()> {
		self.scratch.clear();
		if self.self_verify {
			type_hash::<T>().encode(&mut self.scratch);
		}
		item.encode(&mut self.scratch);
		let encoded_len = self.scratch.len();

		let default_size = self.pool.default_block_size();
		if encoded_len > default_size {
			// Oversized item: give it a one-off block of its own so it is
			// never split across two blocks.
			self.flush_current().await?;
			let block = self.pool.allocate(encoded_len, true).await?;
			block.with_bytes_mut(|buf| buf[..encoded_len].copy_from_slice(&self.scratch));
			block.set_used(encoded_len);
			let sealed = self.pool.seal(block.clone(), 1, 0);
			self.pool.unpin(&block);
			self.sink.accept(sealed).await?;
			return Ok(());
		}

		if self.current.is_none() || self.write_offset + encoded_len > default_size {
			self.flush_current().await?;
			self.current = Some(self.pool.allocate(default_size, true).await?);
			self.write_offset = 0;
			self.num_items = 0;
			self.offset_of_first = None;
		}

		self.mark_item();
		let block = self.current.as_ref().unwrap();
		let offset = self.write_offset;
		let scratch = &self.scratch;
		block.with_bytes_mut(|buf| buf[offset..offset + encoded_len].copy_from_slice(scratch));
		self.write_offset += encoded_len;
		self.num_items += 1;
		Ok(())
	}

	async fn flush_current(&mut self) -> Result<()> {
		let Some(block) = self.current.take() else {
			return Ok(());
		};
		if self.num_items == 0 {
			self.pool.unpin(&block);
			return Ok(());
		}
		block.set_used(self.write_offset);
		let sealed = self.pool.seal(block.clone(), self.num_items, self.offset_of_first.unwrap_or(0));
		self.pool.unpin(&block);
		self.sink.accept(sealed).await?;
		self.write_offset = 0;
		self.num_items = 0;
		self.offset_of_first = None;
		Ok(())
	}

	/// Flushes the last partial block and signals end-of-stream to the sink.
	pub async fn close(mut self) -> Result<()> {
		self.flush_current().await?;
		self.sink.close().await
	}

	pub fn sink_mut(&mut self) -> &mut S {
		&mut self.sink
	}
}
