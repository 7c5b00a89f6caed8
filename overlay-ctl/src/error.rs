use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent answered with an error body
    #[error("Agent refused ({status}, {code}): {message}")]
    Agent {
        status: u16,
        code: String,
        message: String,
    },

    #[error(
        "Device did not come back within {}s ({attempts} probes). Check power and network, \
         then reach the device directly; the restored configuration may use a different address.",
        .waited.as_secs()
    )]
    DeviceUnreachable { waited: Duration, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, CtlError>;
