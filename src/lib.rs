//! Agent Dispatch: job-lifecycle queue and dispatcher for agentic work.
//!
//! Jobs move `todo → run → done | dead` through a [`queue::QueueStore`].
//! The [`dispatch::Dispatcher`] hands claimed jobs to a pluggable
//! [`executor::Executor`] in bounded or interactive mode; interactive jobs
//! are controlled through the [`session::SessionRegistry`].

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod notify;
pub mod queue;
pub mod session;
