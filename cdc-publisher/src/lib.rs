pub mod config;
pub mod generator;
pub mod publisher;
pub mod simulator;
