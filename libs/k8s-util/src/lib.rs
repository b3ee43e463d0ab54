pub mod client;
pub mod error;
pub mod events;
pub mod exec;
pub mod metrics;
pub mod parse;
pub mod tls;
pub mod types;
