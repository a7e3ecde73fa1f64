//! The node daemon: serves `JobPipeline` and connects each job to the local
//! workload.

pub mod config;
pub mod keys;
pub mod node;
pub mod pipeline;
pub mod service;
pub mod validators;
pub mod workload;

pub use config::DaemonConfig;
pub use node::Node;
pub use service::{PipelineService, serve, spawn_pipeline};
