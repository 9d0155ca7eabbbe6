//! The stage builder/runtime (C10): given an action node, computes the set
//! of not-yet-materialized ancestors, topologically orders them, and drives
//! each through `start_pre_op -> execute -> push_data` before finally
//! pushing the action's own result.
//!
//! Simplification from the general design: this runtime assumes a node is
//! staged by at most one action invocation over its lifetime (the
//! representative operator set and end-to-end scenarios never re-stage a
//! node already consumed by an earlier action) — see DESIGN.md.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info_span, Instrument};

use crate::dia::{NodeBase, NodeId, NodeState};
use crate::err::Result;

fn collect_stage(action: &Arc<dyn NodeBase>) -> Vec<Arc<dyn NodeBase>> {
	let mut seen = HashSet::new();
	let mut order = Vec::new();
	visit(action, &mut seen, &mut order);
	order
}

fn visit(node: &Arc<dyn NodeBase>, seen: &mut HashSet<NodeId>, order: &mut Vec<Arc<dyn NodeBase>>) {
	if !seen.insert(node.id()) {
		return;
	}
	if node.state() == NodeState::New {
		for parent in node.parents() {
			visit(parent, seen, order);
		}
	}
	order.push(node.clone());
}

/// Executes every unstaged ancestor of `action` and finally delivers
/// `action`'s own result, releasing its storage iff `consume`.
pub async fn run_action(action: Arc<dyn NodeBase>, consume: bool) -> Result<()> {
	let stage = collect_stage(&action);

	for node in &stage {
		if node.state() == NodeState::New {
			node.start_pre_op().instrument(info_span!("pre_op", node = node.id())).await?;
		}
	}

	let last_index = stage.len().saturating_sub(1);
	for (index, node) in stage.iter().enumerate() {
		if node.state() != NodeState::PreOpsStarted {
			continue;
		}
		node.execute().instrument(info_span!("execute", node = node.id())).await?;
		let node_consume = if index == last_index {
			consume
		} else {
			true
		};
		node.push_data(node_consume).instrument(info_span!("push_data", node = node.id(), consume = node_consume)).await?;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;

	use crate::dia::{fresh_id, NodeStateCell};

	use super::*;

	struct CountingNode {
		id: NodeId,
		state: NodeStateCell,
		parents: Vec<Arc<dyn NodeBase>>,
		executions: AtomicUsize,
		pushes: AtomicUsize,
	}

	impl CountingNode {
		fn new(parents: Vec<Arc<dyn NodeBase>>) -> Arc<Self> {
			let id = fresh_id();
			Arc::new(Self {
				id,
				state: NodeStateCell::new(id),
				parents,
				executions: AtomicUsize::new(0),
				pushes: AtomicUsize::new(0),
			})
		}
	}

	#[async_trait]
	impl NodeBase for CountingNode {
		fn id(&self) -> NodeId {
			self.id
		}

		fn kind(&self) -> crate::dia::NodeKind {
			crate::dia::NodeKind::Action
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
			self.executions.fetch_add(1, Ordering::SeqCst);
			self.state.advance(NodeState::PreOpsStarted, NodeState::Executed)
		}

		async fn push_data(&self, consume: bool) -> Result<()> {
			self.pushes.fetch_add(1, Ordering::SeqCst);
			self.state.advance(NodeState::Executed, NodeState::Pushed)?;
			if consume {
				self.dispose();
			}
			Ok(())
		}

		fn dispose(&self) {}
	}

	#[tokio::test]
	async fn run_action_drives_every_unstaged_ancestor_exactly_once() {
		let source = CountingNode::new(vec![]);
		let action = CountingNode::new(vec![source.clone()]);
		let base: Arc<dyn NodeBase> = action.clone();
		run_action(base, true).await.unwrap();

		assert_eq!(source.executions.load(Ordering::SeqCst), 1);
		assert_eq!(source.pushes.load(Ordering::SeqCst), 1);
		assert_eq!(action.executions.load(Ordering::SeqCst), 1);
		assert_eq!(action.pushes.load(Ordering::SeqCst), 1);
		assert_eq!(action.state(), NodeState::Pushed);
	}

	#[tokio::test]
	async fn re_running_an_already_pushed_action_does_not_redrive_it() {
		let source = CountingNode::new(vec![]);
		let action = CountingNode::new(vec![source.clone()]);
		let base: Arc<dyn NodeBase> = action.clone();
		run_action(base.clone(), true).await.unwrap();
		run_action(base, true).await.unwrap();

		// the action has already reached `Pushed`; a second stage run must
		// leave it (and its already-consumed ancestor) untouched rather than
		// re-executing or re-pushing.
		assert_eq!(source.executions.load(Ordering::SeqCst), 1);
		assert_eq!(action.executions.load(Ordering::SeqCst), 1);
		assert_eq!(action.pushes.load(Ordering::SeqCst), 1);
	}
}
