//! Core key management and imagery fetch engine

pub mod client;
pub mod clock;
pub mod config;
pub mod errors;
pub mod key_pool;
pub mod models;
pub mod storage;
pub mod throttle;
pub mod transport;
