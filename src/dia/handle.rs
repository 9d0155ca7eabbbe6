//! [`Dia`] (C9): a handle carrying a pointer to its producing node plus a
//! fused chain of local per-item transformations. Applying `map`/`filter`/
//! `flat_map`/`sample`/`window` never creates a node — it only composes a new
//! `register` closure that, when finally attached to a materializing
//! operator, wires the whole chain directly onto the producing node.

use std::sync::Arc;

use rand::SeedableRng;

use crate::err::Result;

use super::node::NodeBase;
use super::sink::{FilterSink, FlatMapSink, ItemSink, MapSink, SampleSink, WindowSink};

type Register<T> = Arc<dyn Fn(Arc<dyn ItemSink<T>>) -> Result<()> + Send + Sync>;

/// A distributed immutable array: the producing node (for stage scheduling)
/// plus the fused local chain applied to each item the node emits before a
/// downstream consumer sees it.
pub struct Dia<T> {
	node: Arc<dyn NodeBase>,
	register: Register<T>,
}

impl<T: Send + Sync + 'static> Dia<T> {
	/// Wraps a freshly created source/DOP node whose native output type is
	/// `T`, given the closure that attaches a consumer directly to it.
	pub fn new(node: Arc<dyn NodeBase>, attach: impl Fn(Arc<dyn ItemSink<T>>) -> Result<()> + Send + Sync + 'static) -> Self {
		Self {
			node,
			register: Arc::new(attach),
		}
	}

	pub fn node(&self) -> Arc<dyn NodeBase> {
		self.node.clone()
	}

	/// Attaches `sink` as a consumer of this handle's fused chain. Used by
	/// every operator that materializes a new node from a `Dia<T>`.
	pub fn attach(&self, sink: Arc<dyn ItemSink<T>>) -> Result<()> {
		(self.register)(sink)
	}

	pub fn map<U, F>(self, f: F) -> Dia<U>
	where
		U: Send + Sync + 'static,
		F: Fn(T) -> U + Send + Sync + Clone + 'static,
	{
		let register = self.register;
		Dia {
			node: self.node,
			register: Arc::new(move |next: Arc<dyn ItemSink<U>>| {
				register(Arc::new(MapSink {
					f: f.clone(),
					next,
					_marker: std::marker::PhantomData,
				}))
			}),
		}
	}

	pub fn filter<F>(self, pred: F) -> Dia<T>
	where
		F: Fn(&T) -> bool + Send + Sync + Clone + 'static,
	{
		let register = self.register;
		Dia {
			node: self.node,
			register: Arc::new(move |next: Arc<dyn ItemSink<T>>| {
				register(Arc::new(FilterSink {
					pred: pred.clone(),
					next,
				}))
			}),
		}
	}

	pub fn flat_map<U, I, F>(self, f: F) -> Dia<U>
	where
		U: Send + Sync + 'static,
		I: IntoIterator<Item = U> + Send,
		F: Fn(T) -> I + Send + Sync + Clone + 'static,
	{
		let register = self.register;
		Dia {
			node: self.node,
			register: Arc::new(move |next: Arc<dyn ItemSink<U>>| {
				register(Arc::new(FlatMapSink {
					f: f.clone(),
					next,
					_marker: std::marker::PhantomData,
				}))
			}),
		}
	}

	/// A seeded-RNG sample, consistent across re-execution.
	pub fn sample(self, fraction: f64, seed: u64) -> Dia<T>
	where
		T: Clone,
	{
		let register = self.register;
		Dia {
			node: self.node,
			register: Arc::new(move |next: Arc<dyn ItemSink<T>>| {
				register(Arc::new(SampleSink {
					fraction,
					rng: std::sync::Mutex::new(rand::rngs::StdRng::seed_from_u64(seed)),
					next,
				}))
			}),
		}
	}

	/// Fixed-size sliding windows over the local partition's item sequence.
	pub fn window(self, size: usize) -> Dia<Vec<T>>
	where
		T: Clone,
	{
		let register = self.register;
		Dia {
			node: self.node,
			register: Arc::new(move |next: Arc<dyn ItemSink<Vec<T>>>| {
				register(Arc::new(WindowSink {
					size,
					buffer: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(size)),
					next,
				}))
			}),
		}
	}
}
