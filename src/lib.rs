#![forbid(unsafe_code)]

pub mod acp;
pub mod config;
pub mod errors;
pub mod event_bus;
pub mod models;
pub mod session;
pub mod stream;

mod sync;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
