//! [`ItemSink`] is the per-item half of the function stack (C9): every node
//! that can receive pushed items implements it for its own native element
//! type, and the `map`/`filter`/`flat_map` combinators on [`crate::dia::Dia`]
//! build adapters that fuse local transformations onto it without creating
//! an intermediate node.

use std::sync::Arc;

use async_trait::async_trait;

use crate::err::Result;

#[async_trait]
pub trait ItemSink<T>: Send + Sync {
	async fn push(&self, item: T) -> Result<()>;
}

pub struct MapSink<T, U, F> {
	pub f: F,
	pub next: Arc<dyn ItemSink<U>>,
	pub _marker: std::marker::PhantomData<fn(T) -> U>,
}

#[async_trait]
impl<T, U, F> ItemSink<T> for MapSink<T, U, F>
where
	T: Send + 'static,
	U: Send + 'static,
	F: Fn(T) -> U + Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		self.next.push((self.f)(item)).await
	}
}

pub struct FilterSink<T, F> {
	pub pred: F,
	pub next: Arc<dyn ItemSink<T>>,
}

#[async_trait]
impl<T, F> ItemSink<T> for FilterSink<T, F>
where
	T: Send + 'static,
	F: Fn(&T) -> bool + Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		if (self.pred)(&item) {
			self.next.push(item).await
		} else {
			Ok(())
		}
	}
}

pub struct FlatMapSink<T, U, I, F> {
	pub f: F,
	pub next: Arc<dyn ItemSink<U>>,
	pub _marker: std::marker::PhantomData<fn(T) -> I>,
}

#[async_trait]
impl<T, U, I, F> ItemSink<T> for FlatMapSink<T, U, I, F>
where
	T: Send + 'static,
	U: Send + 'static,
	I: IntoIterator<Item = U> + Send,
	F: Fn(T) -> I + Send + Sync,
{
	async fn push(&self, item: T) -> Result<()> {
		for out in (self.f)(item) {
			self.next.push(out).await?;
		}
		Ok(())
	}
}

/// A fixed-size sliding window over the local partition's item sequence.
pub struct WindowSink<T> {
	pub size: usize,
	pub buffer: std::sync::Mutex<std::collections::VecDeque<T>>,
	pub next: Arc<dyn ItemSink<Vec<T>>>,
}

#[async_trait]
impl<T> ItemSink<T> for WindowSink<T>
where
	T: Clone + Send + Sync + 'static,
{
	async fn push(&self, item: T) -> Result<()> {
		let window = {
			let mut buffer = self.buffer.lock().expect("poisoned window buffer lock");
			buffer.push_back(item);
			if buffer.len() > self.size {
				buffer.pop_front();
			}
			if buffer.len() < self.size {
				None
			} else {
				Some(buffer.iter().cloned().collect::<Vec<_>>())
			}
		};
		if let Some(window) = window {
			self.next.push(window).await?;
		}
		Ok(())
	}
}

/// A seeded-RNG sample, consistent across re-execution since the seed (not
/// wall-clock entropy) drives the decision for each item.
pub struct SampleSink<T> {
	pub fraction: f64,
	pub rng: std::sync::Mutex<rand::rngs::StdRng>,
	pub next: Arc<dyn ItemSink<T>>,
}

#[async_trait]
impl<T> ItemSink<T> for SampleSink<T>
where
	T: Send + Sync + 'static,
{
	async fn push(&self, item: T) -> Result<()> {
		use rand::Rng;
		let keep = self.rng.lock().expect("poisoned sample rng lock").gen_bool(self.fraction);
		if keep {
			self.next.push(item).await
		} else {
			Ok(())
		}
	}
}

/// A terminal sink that captures the single final item an action produces,
/// for the operator wrapper function to read back after the stage runs.
pub struct Capture<T> {
	pub slot: std::sync::Mutex<Option<T>>,
}

impl<T> Capture<T> {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			slot: std::sync::Mutex::new(None),
		})
	}

	pub fn take(&self) -> Option<T> {
		self.slot.lock().expect("poisoned capture lock").take()
	}
}

#[async_trait]
impl<T: Send + 'static> ItemSink<T> for Capture<T> {
	async fn push(&self, item: T) -> Result<()> {
		*self.slot.lock().expect("poisoned capture lock") = Some(item);
		Ok(())
	}
}

/// A terminal sink that simply collects every pushed item, for operators
/// whose action result is a `Vec<T>` rather than a single value.
pub struct CollectVec<T> {
	pub items: std::sync::Mutex<Vec<T>>,
}

impl<T> CollectVec<T> {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			items: std::sync::Mutex::new(Vec::new()),
		})
	}

	pub fn take(&self) -> Vec<T> {
		std::mem::take(&mut *self.items.lock().expect("poisoned collect lock"))
	}
}

#[async_trait]
impl<T: Send + 'static> ItemSink<T> for CollectVec<T> {
	async fn push(&self, item: T) -> Result<()> {
		self.items.lock().expect("poisoned collect lock").push(item);
		Ok(())
	}
}
