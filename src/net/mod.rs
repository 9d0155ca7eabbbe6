//! The network layer (§4.5–§4.6): a fully-connected Group of workers, a
//! single-threaded Dispatcher reactor, and a Multiplexer layering logical
//! cat/mix streams over the Group's point-to-point connections.

pub mod dispatcher;
pub mod group;
pub mod mux;
pub mod stream;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use group::{one_factor_peer, one_factor_rounds, Group};
pub use mux::{BlockHeader, StreamOrder};
pub use stream::{Multiplexer, StreamReader, StreamWriter};
pub use transport::{MockTransport, TcpTransport, Transport};
