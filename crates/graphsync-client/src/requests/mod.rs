//! Active request tracking

pub mod tracker;

pub use tracker::{ActiveRequest, ActiveRequestTracker, RequestGuard, RequestInfo, RequestKind, LIST_MODEL_SUFFIX};
