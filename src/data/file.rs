//! [`File`] (C4): a local, append-only sequence of [`Block`]s with
//! random-access by item index via a cumulative item-count prefix sum.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::err::{Error, Result};

use super::block::Block;
use super::reader::{BlockReader, BlockSource};
use super::writer::{BlockSink, BlockWriter};
use super::pool::BlockPool;

struct FileInner {
	/// `None` once a consuming reader has taken the block out.
	blocks: Vec<Option<Block>>,
	/// Exclusive prefix sum of per-block item counts; length `blocks.len() + 1`.
	item_offsets: Vec<usize>,
	writer_open: bool,
	closed: bool,
}

/// A local, append-only sequence of [`Block`]s. Cloning a [`File`] ("copy" in
/// §4.3) shares the same underlying block list; a second writer may not be
/// opened while one is already active.
#[derive(Clone)]
pub struct File {
	inner: Arc<Mutex<FileInner>>,
}

impl File {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(FileInner {
				blocks: Vec::new(),
				item_offsets: vec![0],
				writer_open: false,
				closed: false,
			})),
		}
	}

	pub fn append(&self, block: Block) -> Result<()> {
		let mut inner = self.inner.lock().expect("poisoned file lock");
		if inner.closed {
			return Err(Error::FileClosed);
		}
		let last = *inner.item_offsets.last().unwrap();
		inner.item_offsets.push(last + block.num_items());
		inner.blocks.push(Some(block));
		Ok(())
	}

	pub fn close(&self) {
		self.inner.lock().expect("poisoned file lock").closed = true;
	}

	pub fn num_blocks(&self) -> usize {
		self.inner.lock().expect("poisoned file lock").blocks.len()
	}

	pub fn num_items(&self) -> usize {
		let inner = self.inner.lock().expect("poisoned file lock");
		*inner.item_offsets.last().unwrap()
	}

	/// A shallow copy sharing the same immutable blocks.
	pub fn copy(&self) -> Self {
		self.clone()
	}

	/// A [`BlockReader`] positioned at the start. With `consume = true`,
	/// blocks are dropped from the file's own list as they are handed out,
	/// releasing pool memory mid-stream once the caller's pin on the
	/// previous block is also released.
	pub fn get_reader(&self, pool: BlockPool, consume: bool) -> BlockReader<FileSource> {
		BlockReader::new(
			pool,
			FileSource {
				file: self.clone(),
				consume,
				next: 0,
			},
		)
	}

	/// A [`BlockWriter`] that appends into this file. At most one writer may
	/// exist concurrently; the file becomes immutable after the writer closes.
	pub fn get_writer(&self, pool: BlockPool) -> Result<BlockWriter<FileSink>> {
		let mut inner = self.inner.lock().expect("poisoned file lock");
		if inner.writer_open {
			return Err(Error::WriterAlreadyOpen);
		}
		inner.writer_open = true;
		Ok(BlockWriter::new(
			pool,
			FileSink {
				file: self.clone(),
			},
		))
	}
}

impl Default for File {
	fn default() -> Self {
		Self::new()
	}
}

pub struct FileSource {
	file: File,
	consume: bool,
	next: usize,
}

#[async_trait]
impl BlockSource for FileSource {
	async fn next_block(&mut self) -> Result<Option<Block>> {
		let mut inner = self.file.inner.lock().expect("poisoned file lock");
		if self.next >= inner.blocks.len() {
			return Ok(None);
		}
		let block = if self.consume {
			// Drops the file's own reference so the block's memory can be
			// reclaimed once the caller releases its pin.
			inner.blocks[self.next].take()
		} else {
			inner.blocks[self.next].clone()
		};
		self.next += 1;
		Ok(block)
	}
}

pub struct FileSink {
	file: File,
}

#[async_trait]
impl BlockSink for FileSink {
	async fn accept(&mut self, block: Block) -> Result<()> {
		self.file.append(block)
	}

	async fn close(&mut self) -> Result<()> {
		let mut inner = self.file.inner.lock().expect("poisoned file lock");
		inner.writer_open = false;
		inner.closed = true;
		Ok(())
	}
}
