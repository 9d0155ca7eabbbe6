//! [`Context`] (C11): the per-host handle owning configuration, the block
//! pool, the network group, and the multiplexer — threaded through every
//! other component instead of a process-wide singleton.

mod context;

pub use context::Context;
