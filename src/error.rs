use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetherdError {
    #[error("Datasource unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed datasource entry: {0}")]
    SourceMalformed(String),

    #[error("Connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("Coordination bus error: {0}")]
    Bus(String),
}

pub type Result<T> = std::result::Result<T, NetherdError>;
