//! Error types for the synth host crate.

use thiserror::Error;

/// Host error type.
///
/// Every load-path failure (`Compile`, `Instantiation`, `Resolution`) is
/// recoverable: the previously active module keeps rendering.
#[derive(Error, Debug)]
pub enum HostError {
    /// Malformed or unsupported module image
    #[error("compile error: {0}")]
    Compile(String),

    /// Validation or linking failure, including unresolved environment imports
    #[error("instantiation error: {0}")]
    Instantiation(String),

    /// Missing or malformed required export
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A call into the module trapped during a render cycle
    #[error("render fault: {0}")]
    RenderFault(String),

    /// Invalid configuration, sample rate or channel selection
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Whether this error came out of the compile/instantiate/resolve sequence.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            HostError::Compile(_) | HostError::Instantiation(_) | HostError::Resolution(_)
        )
    }
}

/// Result type alias for host operations
pub type Result<T> = std::result::Result<T, HostError>;
