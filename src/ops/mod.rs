//! The representative operator set (§4.8): a thin layer of SOURCE/DOP/ACTION
//! node types built atop the DIA graph and stage runtime. `map`/`filter`/
//! `flat_map`/`sample`/`window` need no node type of their own and live as
//! [`crate::dia::Dia`] combinators instead.

mod generate;
mod io;
mod prefix_sum;
mod reduce;
mod shuffle;
mod sort;
mod sum;
mod zip_merge;

pub use generate::generate;
pub use io::{read_binary, write_binary};
pub use prefix_sum::prefix_sum;
pub use reduce::{group_by_key, reduce_by_key};
pub use sort::sort;
pub use sum::sum;
pub use zip_merge::{merge, zip};

/// Test-only terminal action that drains a `Dia<T>` into a `Vec<T>`, shared by
/// every operator's own test module below so each one doesn't need its own
/// throwaway action node just to observe what it produced.
#[cfg(test)]
pub(crate) mod testing {
	use std::sync::{Arc, Mutex};

	use async_trait::async_trait;

	use crate::dia::{fresh_id, Dia, ItemSink, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
	use crate::err::Result;

	struct CollectNode<T> {
		id: NodeId,
		state: NodeStateCell,
		parents: Vec<Arc<dyn NodeBase>>,
		buffer: Mutex<Vec<T>>,
	}

	#[async_trait]
	impl<T: Send + Sync + 'static> ItemSink<T> for CollectNode<T> {
		async fn push(&self, item: T) -> Result<()> {
			self.buffer.lock().expect("poisoned testing collect buffer lock").push(item);
			Ok(())
		}
	}

	#[async_trait]
	impl<T: Send + Sync + 'static> NodeBase for CollectNode<T> {
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
			self.state.advance(NodeState::Executed, NodeState::Pushed)?;
			if consume {
				self.dispose();
			}
			Ok(())
		}

		fn dispose(&self) {}
	}

	pub(crate) async fn collect<T>(dia: Dia<T>) -> Result<Vec<T>>
	where
		T: Send + Sync + 'static,
	{
		let id = fresh_id();
		let node = Arc::new(CollectNode {
			id,
			state: NodeStateCell::new(id),
			parents: vec![dia.node()],
			buffer: Mutex::new(Vec::new()),
		});
		dia.attach(node.clone())?;
		let base: Arc<dyn NodeBase> = node.clone();
		crate::stage::run_action(base, true).await?;
		Ok(std::mem::take(&mut *node.buffer.lock().expect("poisoned testing collect buffer lock")))
	}
}
