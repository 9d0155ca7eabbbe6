//! The error taxonomy shared by every component of the engine (§7). All fallible
//! operations in the crate return [`Result`], and every error is fatal to the
//! owning compute thread and the owning stage: there is no operator-level retry,
//! callers are expected to restart the job.

use std::path::PathBuf;

/// Crate-wide result alias, matching the host crate's convention of a terse
/// local alias over `std::result::Result`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// The block pool's hard memory limit could not be satisfied even after
	/// evicting every eviction candidate.
	#[error("block pool exhausted: requested {requested} bytes, hard limit is {hard_limit} bytes")]
	ResourceExhausted {
		requested: usize,
		hard_limit: usize,
	},

	/// Writing a spilled block to the backing extent failed.
	#[error("failed to spill block {block_id} ({size} bytes) to {path}: {source}")]
	SpillFailed {
		block_id: u64,
		size: usize,
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// A transport read or write, or a spill-file read or write, failed.
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// A peer connection closed, or a dispatcher-owned socket failed, while a
	/// stage still had pending reads against it.
	#[error("connection to peer {peer} closed unexpectedly: {reason}")]
	PeerDisconnected {
		peer: usize,
		reason: String,
	},

	/// A multiplexer header carried an unrecognized magic byte.
	#[error("unknown stream magic byte {0:#x}")]
	UnknownMagic(u8),

	/// A multiplexer header was truncated (fewer bytes available than the
	/// fixed header size).
	#[error("truncated block header: expected {expected} bytes, got {actual}")]
	TruncatedHeader {
		expected: usize,
		actual: usize,
	},

	/// Self-verify mode: the type hash prefixing an item did not match the
	/// type the reader requested.
	#[error("type mismatch on stream {stream_id}: writer hash {written:#018x}, reader expected {expected:#018x}")]
	TypeMismatch {
		stream_id: u64,
		written: u64,
		expected: u64,
	},

	/// Self-verify mode: a fixed-size item's declared size did not match
	/// `size_of::<T>()` at the reader.
	#[error("size mismatch: writer declared {declared} bytes, reader expects {expected} bytes")]
	SizeMismatch {
		declared: usize,
		expected: usize,
	},

	/// A block reader requested more bytes than the source could supply.
	#[error("buffer underrun: requested {requested} bytes, only {available} available")]
	Underrun {
		requested: usize,
		available: usize,
	},

	/// An append was attempted on a [`crate::data::File`] that is already closed.
	#[error("cannot append to a closed file")]
	FileClosed,

	/// A second writer was requested on a [`crate::data::File`] that already
	/// has one open.
	#[error("a file may have at most one open writer")]
	WriterAlreadyOpen,

	/// A lifecycle method was invoked on a DIA node that has already been
	/// disposed (its storage released after a consuming push).
	#[error("node {0} has already been disposed and cannot be re-pushed")]
	NodeDisposed(u64),

	/// A node's lifecycle method was invoked out of order with respect to its
	/// state machine (`NEW -> PRE_OPS_STARTED -> EXECUTED -> PUSHED -> DISPOSED`).
	#[error("node {node} expected state {expected:?}, found {actual:?}")]
	InvalidNodeState {
		node: u64,
		expected: &'static str,
		actual: &'static str,
	},

	/// A collective (`all_reduce`, `prefix_sum`, `broadcast`, `barrier`) was
	/// invoked with inconsistent group size across peers, or a peer index was
	/// out of range.
	#[error("invalid peer rank {rank} for a group of size {size}")]
	InvalidRank {
		rank: usize,
		size: usize,
	},

	/// `Config` validation failed at `Context` construction (e.g. soft limit
	/// above hard limit).
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
}
