//! The stage builder/runtime (C10).

mod runtime;

pub use runtime::run_action;
