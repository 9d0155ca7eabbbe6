//! DIA handles, nodes, and the per-item function stack (C9).

mod handle;
mod node;
mod sink;

pub use handle::Dia;
pub use node::{fresh_id, NodeBase, NodeId, NodeKind, NodeState, NodeStateCell};
pub use sink::{Capture, CollectVec, ItemSink};
