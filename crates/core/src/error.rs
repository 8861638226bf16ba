use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Logging already initialized: {0}")]
    Telemetry(String),
}
