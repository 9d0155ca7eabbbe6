//! [`ByteBlock`] is the pool-managed fixed-capacity buffer (C1); [`Block`] is the
//! shared-ownership, byte-range view over one that carries item-boundary metadata
//! (§3 "Block (view)"). A [`Block`] does not itself hold a pin: reading through it
//! requires a transient pin obtained from the owning [`crate::data::BlockPool`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use super::pool::PoolShared;

pub type BlockId = u64;

pub(crate) enum Storage {
	/// Resident in memory.
	Resident(BytesMut),
	/// Written out to the pool's spill file at `(offset, len)`; memory freed.
	Swapped {
		offset: u64,
		len: usize,
	},
}

pub(crate) struct ByteBlockInner {
	pub(crate) id: BlockId,
	pub(crate) capacity: usize,
	pub(crate) pool: Arc<PoolShared>,
	pub(crate) storage: std::sync::Mutex<Storage>,
	pub(crate) used: AtomicUsize,
	pub(crate) pin_count: AtomicUsize,
	pub(crate) swapped: AtomicBool,
}

impl Drop for ByteBlockInner {
	fn drop(&mut self) {
		// Last reference gone: the pool's custom deleter reclaims accounting
		// and, if the block was swapped, its backing extent.
		self.pool.on_block_destroyed(self);
	}
}

/// A reference-counted handle to a pool-owned byte buffer. Cloning shares the
/// same underlying storage; mutation is only valid while the block is
/// write-exclusive (see [`crate::data::BlockWriter`]).
#[derive(Clone)]
pub struct ByteBlock(pub(crate) Arc<ByteBlockInner>);

impl ByteBlock {
	pub fn id(&self) -> BlockId {
		self.0.id
	}

	pub fn capacity(&self) -> usize {
		self.0.capacity
	}

	pub fn used(&self) -> usize {
		self.0.used.load(Ordering::Acquire)
	}

	pub fn pin_count(&self) -> usize {
		self.0.pin_count.load(Ordering::Acquire)
	}

	pub fn is_swapped(&self) -> bool {
		self.0.swapped.load(Ordering::Acquire)
	}

	/// Reads the resident bytes. Panics if the block is not currently pinned
	/// and resident; callers must hold a pin (see `BlockPool::pin`) first.
	pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		let guard = self.0.storage.lock().expect("poisoned block storage lock");
		match &*guard {
			Storage::Resident(buf) => f(&buf[..self.used()]),
			Storage::Swapped {
				..
			} => panic!("block {} is swapped out; pin it before reading", self.0.id),
		}
	}

	pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> R {
		let mut guard = self.0.storage.lock().expect("poisoned block storage lock");
		match &mut *guard {
			Storage::Resident(buf) => f(buf),
			Storage::Swapped {
				..
			} => panic!("block {} is swapped out; pin it before writing", self.0.id),
		}
	}

	pub(crate) fn set_used(&self, used: usize) {
		self.0.used.store(used, Ordering::Release);
	}
}

impl fmt::Debug for ByteBlock {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ByteBlock")
			.field("id", &self.id())
			.field("capacity", &self.capacity())
			.field("used", &self.used())
			.field("pin_count", &self.pin_count())
			.field("swapped", &self.is_swapped())
			.finish()
	}
}

/// A shared-ownership view over a [`ByteBlock`]: a byte range, the number of
/// items whose first byte lies in that range, and the offset of the first
/// complete item. `num_items == 0` means this block only continues an item
/// spanning from the previous block in the sequence.
#[derive(Clone, Debug)]
pub struct Block {
	pub(crate) bytes: ByteBlock,
	pub(crate) begin: usize,
	pub(crate) end: usize,
	pub(crate) num_items: usize,
	pub(crate) offset_of_first: usize,
}

impl Block {
	pub fn new(bytes: ByteBlock, begin: usize, end: usize, num_items: usize, offset_of_first: usize) -> Self {
		debug_assert!(begin <= end);
		debug_assert!(offset_of_first <= end - begin);
		Self {
			bytes,
			begin,
			end,
			num_items,
			offset_of_first,
		}
	}

	/// An empty block used as the in-band sentinel terminating a
	/// [`crate::data::BlockQueue`] or a stream substream.
	pub fn sentinel(bytes: ByteBlock) -> Self {
		Self {
			bytes,
			begin: 0,
			end: 0,
			num_items: 0,
			offset_of_first: 0,
		}
	}

	pub fn is_sentinel(&self) -> bool {
		self.begin == self.end && self.num_items == 0
	}

	pub fn byte_block(&self) -> &ByteBlock {
		&self.bytes
	}

	pub fn begin(&self) -> usize {
		self.begin
	}

	pub fn end(&self) -> usize {
		self.end
	}

	pub fn size(&self) -> usize {
		self.end - self.begin
	}

	pub fn num_items(&self) -> usize {
		self.num_items
	}

	pub fn offset_of_first(&self) -> usize {
		self.offset_of_first
	}
}

#[cfg(test)]
mod tests {
	use super::Block;
	use crate::data::pool::{BlockPool, PoolConfig};

	fn test_pool() -> BlockPool {
		let mut dir = std::env::temp_dir();
		dir.push(format!("distflow-block-test-{}", crate::dia::fresh_id()));
		BlockPool::new(PoolConfig {
			default_block_size: 64,
			soft_limit_bytes: 1 << 20,
			hard_limit_bytes: 1 << 20,
			spill_directory: dir,
		})
		.unwrap()
	}

	#[tokio::test]
	async fn sentinel_is_empty_and_carries_no_items() {
		let pool = test_pool();
		let byte_block = pool.allocate(1, true).await.unwrap();
		let block = Block::sentinel(byte_block);
		assert!(block.is_sentinel());
		assert_eq!(block.size(), 0);
		assert_eq!(block.num_items(), 0);
	}

	#[tokio::test]
	async fn a_sealed_block_reports_its_own_range_and_item_count() {
		let pool = test_pool();
		let byte_block = pool.allocate(32, true).await.unwrap();
		byte_block.set_used(20);
		let block = pool.seal(byte_block, 3, 4);
		assert!(!block.is_sentinel());
		assert_eq!(block.begin(), 0);
		assert_eq!(block.end(), 20);
		assert_eq!(block.size(), 20);
		assert_eq!(block.num_items(), 3);
		assert_eq!(block.offset_of_first(), 4);
	}
}
