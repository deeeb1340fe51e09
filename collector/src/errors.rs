use std::time::Duration;
use thiserror::Error;

/// Failure to obtain a usable reading from the sensor.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Sensor request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sensor unreachable: {0}")]
    Unreachable(String),

    #[error("Sensor responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("Invalid sensor payload: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The file is held by someone else. Retried by the store.
    #[error("Store file locked: {0}")]
    Locked(#[source] std::io::Error),

    #[error("Store unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Store corrupted at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::from(FetchError::HttpStatus(503));
        assert_eq!(err.to_string(), "Fetch error: Sensor responded with HTTP 503");

        let err = Error::from(StoreError::Unavailable {
            attempts: 3,
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        });
        assert!(err.to_string().starts_with("Store error: Store unavailable after 3 attempts"));
    }
}
