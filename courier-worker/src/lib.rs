pub mod backend;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
