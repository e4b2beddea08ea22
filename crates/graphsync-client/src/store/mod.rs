//! Local entity cache collaborator

pub mod record;
pub mod registry;

pub use record::{EntityStore, MemoryStore, Record};
pub use registry::{ModelNames, RecordRegistry};
