//! The block-oriented data plane (§4.2–§4.4): fixed-capacity pool-managed
//! byte buffers, a deterministic item codec, and the writer/reader/file/queue
//! abstractions built on top of them.

mod block;
mod codec;
mod file;
mod pool;
mod queue;
mod reader;
mod writer;

pub use block::{Block, BlockId, ByteBlock};
pub use codec::{type_hash, BlockCodec};
pub use file::{File, FileSink, FileSource};
pub use pool::{BlockPool, PoolConfig, PoolStats};
pub use queue::{BlockQueue, QueueSink, QueueSource};
pub use reader::{BlockReader, BlockSource};
pub use writer::{BlockSink, BlockWriter};
