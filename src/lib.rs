pub mod annotate;
pub mod config;
pub mod model;
pub mod pipeline;
pub mod postprocess;
pub mod server;
pub mod torch;
pub mod upload;
