//! [`NodeBase`] (C9): the object-safe lifecycle every DAG node implements,
//! independent of its element type. The stage runtime (C10) drives every
//! node exclusively through this trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::err::{Error, Result};

pub type NodeId = u64;

fn next_node_id() -> NodeId {
	static NEXT: AtomicU64 = AtomicU64::new(1);
	NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
	/// No parents; produces from an external generator or file.
	Source,
	/// Distributed operation requiring cross-host exchange (shuffle, sort, reduce).
	Dop,
	/// Terminal node whose `push_data` delivers a result to the invoking code
	/// rather than to further DAG children.
	Action,
	/// Retains its materialized data across stages.
	Cache,
	/// Materializes a fused chain into a File when type erasure requires it.
	Collapse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
	New,
	PreOpsStarted,
	Executed,
	Pushed,
	Disposed,
}

impl NodeState {
	fn label(self) -> &'static str {
		match self {
			NodeState::New => "NEW",
			NodeState::PreOpsStarted => "PRE_OPS_STARTED",
			NodeState::Executed => "EXECUTED",
			NodeState::Pushed => "PUSHED",
			NodeState::Disposed => "DISPOSED",
		}
	}
}

/// Checked state-machine cell shared by every concrete node. Transitions are
/// `NEW -> PRE_OPS_STARTED -> EXECUTED -> PUSHED -> DISPOSED`, enforced here
/// so a misbehaving stage runtime fails loudly instead of corrupting state.
pub struct NodeStateCell {
	id: NodeId,
	state: std::sync::Mutex<NodeState>,
}

impl NodeStateCell {
	pub fn new(id: NodeId) -> Self {
		Self {
			id,
			state: std::sync::Mutex::new(NodeState::New),
		}
	}

	pub fn get(&self) -> NodeState {
		*self.state.lock().expect("poisoned node state lock")
	}

	pub fn advance(&self, expected: NodeState, next: NodeState) -> Result<()> {
		let mut guard = self.state.lock().expect("poisoned node state lock");
		if *guard != expected {
			return Err(Error::InvalidNodeState {
				node: self.id,
				expected: expected.label(),
				actual: guard.label(),
			});
		}
		*guard = next;
		Ok(())
	}
}

/// The non-generic lifecycle every DAG node implements (§4.7). Per-item
/// behavior lives on the concrete type's own `ItemSink` implementation;
/// this trait only carries what the stage runtime needs to schedule and
/// drive nodes without knowing their element types.
#[async_trait]
pub trait NodeBase: Send + Sync {
	fn id(&self) -> NodeId;
	fn kind(&self) -> NodeKind;
	fn state(&self) -> NodeState;
	fn parents(&self) -> &[Arc<dyn NodeBase>];

	/// Sets up emitters ahead of parents pushing items into this node.
	async fn start_pre_op(&self) -> Result<()>;

	/// The main-op: shuffle, sort, reduce, or whatever cross-host work this
	/// node's kind requires. A no-op for most `Source` nodes.
	async fn execute(&self) -> Result<()>;

	/// Delivers this node's materialized items to its registered children
	/// (or, for an `Action` node, to the invoking code). `consume` releases
	/// backing storage as it is pushed.
	async fn push_data(&self, consume: bool) -> Result<()>;

	/// Releases backing storage; called once a node's reference count under
	/// `consume` semantics reaches zero.
	fn dispose(&self);
}

pub fn fresh_id() -> NodeId {
	next_node_id()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn advance_follows_the_new_pre_ops_executed_pushed_disposed_chain() {
		let cell = NodeStateCell::new(1);
		assert_eq!(cell.get(), NodeState::New);
		cell.advance(NodeState::New, NodeState::PreOpsStarted).unwrap();
		cell.advance(NodeState::PreOpsStarted, NodeState::Executed).unwrap();
		cell.advance(NodeState::Executed, NodeState::Pushed).unwrap();
		assert_eq!(cell.get(), NodeState::Pushed);
	}

	#[test]
	fn advance_rejects_a_transition_from_the_wrong_state() {
		let cell = NodeStateCell::new(1);
		cell.advance(NodeState::New, NodeState::PreOpsStarted).unwrap();
		let err = cell.advance(NodeState::New, NodeState::PreOpsStarted).unwrap_err();
		match err {
			Error::InvalidNodeState {
				node, expected, actual, ..
			} => {
				assert_eq!(node, 1);
				assert_eq!(expected, "NEW");
				assert_eq!(actual, "PRE_OPS_STARTED");
			}
			other => panic!("expected InvalidNodeState, got {other:?}"),
		}
	}
}
