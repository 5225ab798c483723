use thiserror::Error;

#[derive(Debug, Error)]
pub enum DlbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Collective call `{call}` failed at {file}:{line}: {message}")]
    Protocol {
        call: &'static str,
        file: &'static str,
        line: u32,
        message: String,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DlbError>;

/// Build a [`DlbError::Protocol`] tagged with the call site.
///
/// ```ignore
/// return Err(protocol_error!("scatterv", "expected {} bytes, got {}", want, got));
/// ```
#[macro_export]
macro_rules! protocol_error {
    ($call:expr, $($arg:tt)+) => {
        $crate::error::DlbError::Protocol {
            call: $call,
            file: file!(),
            line: line!(),
            message: format!($($arg)+),
        }
    };
}
