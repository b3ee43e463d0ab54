pub mod controller;
pub mod facts;
pub mod metrics;
pub mod pipeline;
pub mod telemetry;
pub mod vadmin;
pub mod vdb;

pub use vertiop_k8s_util::error;
