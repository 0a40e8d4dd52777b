//! Interactive session control: inject, interrupt, list.

pub mod registry;

pub use registry::{Session, SessionRegistry};
