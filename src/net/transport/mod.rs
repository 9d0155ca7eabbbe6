//! The `Transport` trait (§4.5) boundary three interchangeable realizations
//! satisfy: real TCP, an in-process mock, and (unimplemented here) MPI. Each
//! `send`/`recv` pair exchanges one length-framed message between this
//! worker and a specific peer rank.

mod mock;
mod tcp;

pub use mock::MockTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::err::Result;

#[async_trait]
pub trait Transport: Send + Sync {
	fn rank(&self) -> usize;
	fn num_workers(&self) -> usize;
	async fn send(&self, peer: usize, data: Vec<u8>) -> Result<()>;
	async fn recv(&self, peer: usize) -> Result<Vec<u8>>;
}
