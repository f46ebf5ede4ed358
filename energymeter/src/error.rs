use thiserror::Error;

use crate::models::Component;

pub type Result<T> = std::result::Result<T, MeterError>;

#[derive(Debug, Error)]
pub enum MeterError {
    /// A lifecycle method was called out of order.
    #[error("Invalid meter state: {0}")]
    InvalidState(String),
    /// An energy accessor was called before `end()` completed.
    #[error("Energy not ready: {0}")]
    NotReady(String),
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// Recoverable. The component's energy defaults to zero.
    #[error("{component} backend unavailable: {reason}")]
    BackendUnavailable { component: Component, reason: String },
    #[error("Failed to parse trace report: {0}")]
    TraceParse(String),
    #[error("Trace process error: {0}")]
    BackendProcess(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl MeterError {
    pub fn unavailable<S: Into<String>>(component: Component, reason: S) -> Self {
        MeterError::BackendUnavailable {
            component,
            reason: reason.into(),
        }
    }

    /// Whether the session survives this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MeterError::BackendUnavailable { .. })
    }
}

#[macro_export]
macro_rules! throw_err {
    ($kind:ident, $msg:expr) => {
        return Err($crate::MeterError::$kind(String::from($msg)))
    };
    ($kind:ident, $($args:tt)*) => {
        return Err($crate::MeterError::$kind(format!($($args)*)))
    };
}

#[macro_export]
macro_rules! new_err {
    ($kind:ident, $msg:expr) => {
        $crate::MeterError::$kind(String::from($msg))
    };
    ($kind:ident, $($args:tt)*) => {
        $crate::MeterError::$kind(format!($($args)*))
    };
}

#[macro_export]
macro_rules! ignore_err {
    ($err:expr) => {
        let err: &$crate::MeterError = &$err;
        log::warn!("{}. Ignore it.", err);
    };
}
