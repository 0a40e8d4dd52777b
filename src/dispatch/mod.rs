//! Job dispatch: the dispatcher and the worker pool that feeds it.

pub mod dispatcher;
pub mod pool;

pub use dispatcher::{Dispatcher, DispatcherDeps, InvocationMode, MessageSink, Submission};
pub use pool::spawn_workers;
