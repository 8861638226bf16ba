pub mod config;
pub mod error;
pub mod telemetry;

pub use config::CoreConfig;
pub use error::*;
