//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Keystone.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeystoneError(pub String);

impl KeystoneError {
    /// Builds an error from anything that can render itself as a string.
    pub fn msg(m: impl ToString) -> Self {
        KeystoneError(m.to_string())
    }
}

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for KeystoneError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `KeystoneError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for KeystoneError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                KeystoneError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(bincode::error::EncodeError);
impl_from_error!(bincode::error::DecodeError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = KeystoneError("oh no, not again".into());
        assert_eq!(format!("{}", e), String::from("oh no, not again"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = KeystoneError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_msg() {
        assert_eq!(
            KeystoneError::msg("number 42"),
            KeystoneError("number 42".into())
        );
    }
}
