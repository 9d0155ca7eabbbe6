//! The Dispatcher (C7): the group's single-threaded reactor. Jobs submitted
//! from other threads and timers queued internally all run on the
//! dispatcher's own task, never concurrently with one another — `tokio`'s
//! cooperative scheduler supplies the nonblocking I/O polling the original
//! design drives by hand, so the dispatcher itself only needs to serialize
//! job execution and order timers by deadline.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::time::Duration;

use tokio::time::Instant;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Item {
	Job(Job),
	Timer {
		deadline: Instant,
		job: Job,
	},
}

struct TimerEntry {
	deadline: Instant,
	job: Job,
}

impl PartialEq for TimerEntry {
	fn eq(&self, other: &Self) -> bool {
		self.deadline == other.deadline
	}
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for TimerEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		// Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
		other.deadline.cmp(&self.deadline)
	}
}

/// A handle for submitting jobs and timers to a running dispatcher loop.
/// Cheaply cloned; every clone feeds the same single dispatcher task.
#[derive(Clone)]
pub struct Dispatcher {
	items: channel::Sender<Item>,
}

impl Dispatcher {
	/// Spawns the reactor loop as its own `tokio` task and returns a handle
	/// to it. The loop runs until every `Dispatcher` handle (and thus the
	/// sender) is dropped.
	pub fn spawn() -> Self {
		let (tx, rx) = channel::unbounded();
		tokio::spawn(Self::run(rx));
		Self {
			items: tx,
		}
	}

	async fn run(rx: channel::Receiver<Item>) {
		let mut timers: BinaryHeap<TimerEntry> = BinaryHeap::new();
		loop {
			let sleep = async {
				match timers.peek() {
					Some(entry) => tokio::time::sleep_until(entry.deadline).await,
					None => std::future::pending().await,
				}
			};
			tokio::select! {
				biased;
				item = rx.recv() => {
					match item {
						Ok(Item::Job(job)) => job(),
						Ok(Item::Timer { deadline, job }) => timers.push(TimerEntry { deadline, job }),
						Err(_) => break,
					}
				}
				_ = sleep => {
					if let Some(entry) = timers.pop() {
						(entry.job)();
					}
				}
			}
		}
	}

	/// Enqueues `job` to run on the dispatcher task as soon as it is reached;
	/// never runs concurrently with another job or timer callback.
	pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
		let _ = self.items.try_send(Item::Job(Box::new(job)));
	}

	/// Enqueues `job` to run once `delay` has elapsed, FIFO by deadline among
	/// other pending timers.
	pub fn after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
		let deadline = Instant::now() + delay;
		let _ = self.items.try_send(Item::Timer {
			deadline,
			job: Box::new(job),
		});
	}
}
