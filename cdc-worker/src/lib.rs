pub mod alerts;
pub mod config;
pub mod consumer;
pub mod error;
pub mod offsets;
pub mod pipeline;
pub mod window;
