use thiserror::Error;

/// Top-level error type for the Deputy engine.
///
/// Subsystem crates define their own error types and implement
/// `From<DeputyError>` so that the `?` operator works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeputyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The audit record for a state transition could not be written.
    /// The transition itself was rolled back.
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for DeputyError {
    fn from(err: toml::de::Error) -> Self {
        DeputyError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DeputyError {
    fn from(err: toml::ser::Error) -> Self {
        DeputyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DeputyError {
    fn from(err: serde_json::Error) -> Self {
        DeputyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Deputy operations.
pub type Result<T> = std::result::Result<T, DeputyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeputyError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = DeputyError::AuditWrite("disk full".to_string());
        assert_eq!(err.to_string(), "Audit write failed: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeputyError = io_err.into();
        assert!(matches!(err, DeputyError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: DeputyError = parse_err.into();
        assert!(matches!(err, DeputyError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let parse_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: DeputyError = parse_err.into();
        assert!(matches!(err, DeputyError::Config(_)));
    }
}
