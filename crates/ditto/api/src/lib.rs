pub mod config;
pub mod resource;
pub mod task;
