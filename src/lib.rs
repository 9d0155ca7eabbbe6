#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

#[doc(hidden)]
pub mod cnf;

pub mod config;
pub mod ctx;
pub mod data;
pub mod dia;
#[doc(hidden)]
pub mod err;
pub mod net;
pub mod ops;
pub mod stage;

#[doc(hidden)]
/// Bounded/unbounded channels used for cross-thread hand-off throughout the
/// crate (block queues, the dispatcher's job queue, mailbox transports).
pub mod channel {
	pub use channel::bounded;
	pub use channel::unbounded;
	pub use channel::Receiver;
	pub use channel::Sender;
}
