//! Authorization context discovery

pub mod registry;

pub use registry::{ContextEntry, ContextRegistry};
