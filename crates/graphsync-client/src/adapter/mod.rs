//! Entity adapter and push reconciliation

pub mod entity;
pub mod events;
pub mod serializer;

pub use entity::{AdapterOptions, EntityAdapter, FindOptions};
pub use events::RecordEvent;
pub use serializer::{strip_nulls, Serializer};
