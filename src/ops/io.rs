//! `read_binary(path)` / `write_binary(path)` (§4.8): SOURCE / ACTION nodes
//! around the host's file I/O, framing each block with a length prefix and
//! using the same [`BlockCodec`] encoding as the in-memory data plane so a
//! round trip through disk is lossless (end-to-end scenario 4 in §8). Each
//! worker reads and writes its own `part-<rank>` file under the given
//! directory, matching the engine's partitioned-by-rank data model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::ctx::Context;
use crate::data::{Block, BlockCodec, BlockPool, BlockReader, BlockSink, BlockSource, BlockWriter};
use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
use crate::err::Result;

fn part_path(base: &Path, rank: usize) -> PathBuf {
	base.join(format!("part-{rank}"))
}

struct DiskSink {
	file: fs::File,
}

#[async_trait]
impl BlockSink for DiskSink {
	async fn accept(&mut self, block: Block) -> Result<()> {
		let byte_block = block.byte_block().clone();
		let (begin, end) = (block.begin(), block.end());
		let bytes = byte_block.with_bytes(|b| b[begin..end].to_vec());
		self.file.write_all(&(bytes.len() as u64).to_le_bytes()).await?;
		self.file.write_all(&bytes).await?;
		Ok(())
	}

	async fn close(&mut self) -> Result<()> {
		self.file.flush().await?;
		Ok(())
	}
}

struct DiskSource {
	file: fs::File,
	pool: BlockPool,
}

#[async_trait]
impl BlockSource for DiskSource {
	async fn next_block(&mut self) -> Result<Option<Block>> {
		let mut len_buf = [0u8; 8];
		if let Err(err) = self.file.read_exact(&mut len_buf).await {
			if err.kind() == std::io::ErrorKind::UnexpectedEof {
				return Ok(None);
			}
			return Err(err.into());
		}
		let len = u64::from_le_bytes(len_buf) as usize;
		let mut payload = vec![0u8; len];
		self.file.read_exact(&mut payload).await?;

		let byte_block = self.pool.allocate(len.max(1), true).await?;
		byte_block.with_bytes_mut(|buf| buf[..len].copy_from_slice(&payload));
		byte_block.set_used(len);
		let block = self.pool.seal(byte_block.clone(), 1, 0);
		self.pool.unpin(&byte_block);
		Ok(Some(block))
	}
}

struct WriteBinaryNode<T> {
	id: NodeId,
	state: NodeStateCell,
	parents: Vec<Arc<dyn NodeBase>>,
	ctx: Context,
	base_path: PathBuf,
	buffer: Mutex<Vec<T>>,
}

#[async_trait]
impl<T: Send + Sync + 'static> ItemSink<T> for WriteBinaryNode<T> {
	async fn push(&self, item: T) -> Result<()> {
		self.buffer.lock().expect("poisoned write_binary buffer lock").push(item);
		Ok(())
	}
}

#[async_trait]
impl<T: BlockCodec + Clone + Send + Sync + 'static> NodeBase for WriteBinaryNode<T> {
	fn id(&self) -> NodeId {
		self.id
	}

	fn kind(&self) -> NodeKind {
		NodeKind::Action
	}

	fn state(&self) -> NodeState {
		self.state.get()
	}

	fn parents(&self) -> &[Arc<dyn NodeBase>] {
		&self.parents
	}

	async fn start_pre_op(&self) -> Result<()> {
		self.state.advance(NodeState::New, NodeState::PreOpsStarted)
	}

	async fn execute(&self) -> Result<()> {
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = std::mem::take(&mut *self.buffer.lock().expect("poisoned write_binary buffer lock"));
		fs::create_dir_all(&self.base_path).await?;
		let path = part_path(&self.base_path, self.ctx.rank());
		let file = fs::File::create(&path).await?;
		let mut writer = BlockWriter::new(self.ctx.pool().clone(), DiskSink {
			file,
		});
		for item in &items {
			writer.put(item).await?;
		}
		writer.close().await?;
		self.state.advance(NodeState::Executed, NodeState::Pushed)?;
		if consume {
			self.dispose();
		}
		Ok(())
	}

	fn dispose(&self) {}
}

/// Writes `dia`'s elements to `base_path/part-<rank>` on each worker, one
/// file per rank, using the crate's own block codec framing.
pub async fn write_binary<T>(ctx: &Context, dia: Dia<T>, base_path: impl Into<PathBuf>) -> Result<()>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(WriteBinaryNode {
		id,
		state: NodeStateCell::new(id),
		parents: vec![dia.node()],
		ctx: ctx.clone(),
		base_path: base_path.into(),
		buffer: Mutex::new(Vec::new()),
	});
	dia.attach(node.clone()).expect("attaching write_binary to its parent never fails");

	let base: Arc<dyn NodeBase> = node;
	crate::stage::run_action(base, true).await
}

struct ReadBinaryNode<T> {
	id: NodeId,
	state: NodeStateCell,
	ctx: Context,
	base_path: PathBuf,
	items: Mutex<Vec<T>>,
	children: Mutex<Vec<Arc<dyn ItemSink<T>>>>,
}

#[async_trait]
impl<T: BlockCodec + Clone + Send + Sync + 'static> NodeBase for ReadBinaryNode<T> {
	fn id(&self) -> NodeId {
		self.id
	}

	fn kind(&self) -> NodeKind {
		NodeKind::Source
	}

	fn state(&self) -> NodeState {
		self.state.get()
	}

	fn parents(&self) -> &[Arc<dyn NodeBase>] {
		&[]
	}

	async fn start_pre_op(&self) -> Result<()> {
		self.state.advance(NodeState::New, NodeState::PreOpsStarted)
	}

	async fn execute(&self) -> Result<()> {
		let path = part_path(&self.base_path, self.ctx.rank());
		let file = fs::File::open(&path).await?;
		let mut reader = BlockReader::new(self.ctx.pool().clone(), DiskSource {
			file,
			pool: self.ctx.pool().clone(),
		});
		let mut items = Vec::new();
		while reader.has_next().await? {
			items.push(reader.next::<T>().await?);
		}
		*self.items.lock().expect("poisoned read_binary items lock") = items;
		self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
	}

	async fn push_data(&self, consume: bool) -> Result<()> {
		let items = std::mem::take(&mut *self.items.lock().expect("poisoned read_binary items lock"));
		let children = self.children.lock().expect("poisoned read_binary children lock").clone();
		for item in items {
			for child in &children {
				child.push(item.clone()).await?;
			}
		}
		self.state.advance(NodeState::Executed, NodeState::Pushed)?;
		if consume {
			self.dispose();
		}
		Ok(())
	}

	fn dispose(&self) {}
}

/// Reads `base_path/part-<rank>` back into a `Dia<T>`, the inverse of
/// [`write_binary`].
pub fn read_binary<T>(ctx: &Context, base_path: impl Into<PathBuf>) -> Dia<T>
where
	T: BlockCodec + Clone + Send + Sync + 'static,
{
	let id = fresh_id();
	let node = Arc::new(ReadBinaryNode {
		id,
		state: NodeStateCell::new(id),
		ctx: ctx.clone(),
		base_path: base_path.into(),
		items: Mutex::new(Vec::new()),
		children: Mutex::new(Vec::new()),
	});

	let registrar = node.clone();
	let base: Arc<dyn NodeBase> = node;
	Dia::new(base, move |sink| {
		registrar.children.lock().expect("poisoned read_binary children lock").push(sink);
		Ok(())
	})
}
