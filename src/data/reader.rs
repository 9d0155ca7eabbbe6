//! [`BlockReader`] (C3): reconstructs typed items from a sequence of blocks,
//! transparently crossing block boundaries. Bytes are copied out of a block
//! under a transient pin and buffered locally, so the reader never holds more
//! than one block pinned at a time.

use async_trait::async_trait;

use crate::err::{Error, Result};

use super::block::Block;
use super::codec::{type_hash, BlockCodec};
use super::pool::BlockPool;

/// Source of blocks for a [`BlockReader`]: a [`crate::data::File`], a
/// [`crate::data::BlockQueue`], or a multiplexed stream reader. Returns
/// `Ok(None)` once the source is exhausted.
#[async_trait]
pub trait BlockSource: Send {
	async fn next_block(&mut self) -> Result<Option<Block>>;
}

pub struct BlockReader<S: BlockSource> {
	pool: BlockPool,
	source: S,
	self_verify: bool,
	pending: Vec<u8>,
	cursor: usize,
	exhausted: bool,
}

impl<S: BlockSource> BlockReader<S> {
	pub fn new(pool: BlockPool, source: S) -> Self {
		Self::with_self_verify(pool, source, *crate::cnf::SELF_VERIFY)
	}

	pub fn with_self_verify(pool: BlockPool, source: S, self_verify: bool) -> Self {
		Self {
			pool,
			source,
			self_verify,
			pending: Vec::new(),
			cursor: 0,
			exhausted: false,
		}
	}

	fn remaining(&self) -> usize {
		self.pending.len() - self.cursor
	}

	fn compact(&mut self) {
		if self.cursor > 0 {
			self.pending.drain(..self.cursor);
			self.cursor = 0;
		}
	}

	async fn pull_block(&mut self) -> Result<bool> {
		let Some(block) = self.source.next_block().await? else {
			self.exhausted = true;
			return Ok(false);
		};
		if block.is_sentinel() {
			self.exhausted = true;
			return Ok(false);
		}
		self.compact();
		let byte_block = block.byte_block().clone();
		self.pool.pin(&byte_block).await?;
		byte_block.with_bytes(|bytes| {
			self.pending.extend_from_slice(&bytes[block.begin()..block.end()]);
		});
		self.pool.unpin(&byte_block);
		Ok(true)
	}

	/// Ensures at least `want` bytes are buffered, pulling further blocks as
	/// needed. Returns the number of bytes actually available (may be less
	/// than `want` if the source is exhausted).
	async fn fill(&mut self, want: usize) -> Result<usize> {
		while self.remaining() < want && !self.exhausted {
			if !self.pull_block().await? {
				break;
			}
		}
		Ok(self.remaining())
	}

	pub async fn has_next(&mut self) -> Result<bool> {
		if self.remaining() > 0 {
			return Ok(true);
		}
		Ok(self.fill(1).await? > 0)
	}

	pub async fn next<T: BlockCodec>(&mut self) -> Result<T> {
		if self.self_verify {
			self.fill(8).await?;
			let (hash, used) = u64::decode(&self.pending[self.cursor..])?;
			let expected = type_hash::<T>();
			if hash != expected {
				return Err(Error::TypeMismatch {
					stream_id: 0,
					written: hash,
					expected,
				});
			}
			self.cursor += used;
		}

		// First try with whatever is already buffered; only pull more blocks
		// if the item's encoding actually underruns what we have (this is
		// how an item spanning a block boundary is reassembled).
		loop {
			match T::decode(&self.pending[self.cursor..]) {
				Ok((value, used)) => {
					self.cursor += used;
					return Ok(value);
				}
				Err(Error::Underrun {
					requested,
					..
				}) => {
					let have = self.remaining();
					let got = self.fill(requested).await?;
					if got <= have {
						return Err(Error::Underrun {
							requested,
							available: got,
						});
					}
				}
				Err(other) => return Err(other),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::file::File;
	use crate::data::pool::PoolConfig;
	use crate::data::writer::BlockWriter;

	fn pool_with_block_size(size: usize) -> BlockPool {
		BlockPool::new(PoolConfig {
			default_block_size: size,
			soft_limit_bytes: 64 * 1024 * 1024,
			hard_limit_bytes: 64 * 1024 * 1024,
			spill_directory: std::env::temp_dir().join(format!("distflow-reader-test-{}", std::process::id())),
		})
		.unwrap()
	}

	async fn round_trip_u64s(block_size: usize, values: &[u64]) -> Vec<u64> {
		let pool = pool_with_block_size(block_size);
		let file = File::new();
		let mut writer = file.get_writer(pool.clone()).unwrap();
		for v in values {
			writer.put(v).await.unwrap();
		}
		writer.close().await.unwrap();

		let mut reader = file.get_reader(pool, false);
		let mut out = Vec::new();
		while reader.has_next().await.unwrap() {
			out.push(reader.next::<u64>().await.unwrap());
		}
		out
	}

	#[tokio::test]
	async fn block_round_trip_reconstructs_values_exactly() {
		let values: Vec<u64> = (0..200).collect();
		let out = round_trip_u64s(256, &values).await;
		assert_eq!(out, values);
	}

	#[tokio::test]
	async fn block_boundary_neutrality_across_block_sizes() {
		let values: Vec<u64> = (0..50).map(|i| i * 7).collect();
		for block_size in [16usize, 32, 64, 128, 4096] {
			let out = round_trip_u64s(block_size, &values).await;
			assert_eq!(out, values, "mismatch at block size {block_size}");
		}
	}

	#[tokio::test]
	async fn fixed_size_pod_encoding_length_equals_sizeof() {
		let mut buf = Vec::new();
		42u64.encode(&mut buf);
		assert_eq!(buf.len(), std::mem::size_of::<u64>());
		assert_eq!(u64::FIXED_SIZE, Some(std::mem::size_of::<u64>()));
	}

	struct VecSink(std::sync::Arc<std::sync::Mutex<Vec<Block>>>);

	#[async_trait::async_trait]
	impl BlockSink for VecSink {
		async fn accept(&mut self, block: Block) -> Result<()> {
			self.0.lock().unwrap().push(block);
			Ok(())
		}

		async fn close(&mut self) -> Result<()> {
			Ok(())
		}
	}

	struct VecSource {
		blocks: std::sync::Arc<std::sync::Mutex<Vec<Block>>>,
		next: usize,
	}

	#[async_trait::async_trait]
	impl BlockSource for VecSource {
		async fn next_block(&mut self) -> Result<Option<Block>> {
			let blocks = self.blocks.lock().unwrap();
			let block = blocks.get(self.next).cloned();
			self.next += 1;
			Ok(block)
		}
	}

	#[tokio::test]
	async fn self_verify_rejects_a_type_mismatch() {
		let pool = pool_with_block_size(256);
		let blocks = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut writer = BlockWriter::with_self_verify(
			pool.clone(),
			VecSink(blocks.clone()),
			true,
		);
		writer.put(&7u64).await.unwrap();
		writer.close().await.unwrap();

		let mut reader = BlockReader::with_self_verify(
			pool,
			VecSource {
				blocks,
				next: 0,
			},
			true,
		);
		let err = reader.next::<u32>().await.unwrap_err();
		assert!(matches!(err, Error::TypeMismatch { .. }));
	}
}
