//! Error kinds that decide the process exit code.
//!
//! Everything else rides on `anyhow`; these two types exist so `main` can
//! downcast the final error and map configuration problems to exit code 2
//! and runtime give-ups to exit code 3.

use std::fmt;

#[derive(Debug)]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub struct FatalError(String);

impl FatalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal: {}", self.0)
    }
}

impl std::error::Error for FatalError {}

/// Creates an `anyhow` error of the `ConfigError` kind.
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        anyhow::Error::from($crate::error::ConfigError::new(format!($($arg)*)))
    };
}
