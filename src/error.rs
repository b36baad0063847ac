use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors produced while configuring, starting or running tunnels.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid tunnel configuration: {0}")]
    Config(String),

    #[error("invalid cipher configuration: {0}")]
    CryptoConfig(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind frontend {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to backend {0} timed out")]
    DialTimeout(String),

    #[error("listener on {addr} failed: {source}")]
    Accept {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("relay failed: {0}")]
    Transfer(#[source] io::Error),
}

/// Coarse classification of a [`TunnelError`], used for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    CryptoConfiguration,
    Bind,
    Dial,
    Accept,
    Transfer,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::CryptoConfiguration => "crypto_configuration",
            Self::Bind => "bind",
            Self::Dial => "dial",
            Self::Accept => "accept",
            Self::Transfer => "transfer",
        }
    }
}

impl TunnelError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::ConfigFile { .. } => ErrorKind::Configuration,
            Self::CryptoConfig(_) => ErrorKind::CryptoConfiguration,
            Self::Bind { .. } => ErrorKind::Bind,
            Self::Dial { .. } | Self::DialTimeout(_) => ErrorKind::Dial,
            Self::Accept { .. } => ErrorKind::Accept,
            Self::Transfer(_) => ErrorKind::Transfer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_timeout_is_classified_as_dial() {
        let err = TunnelError::DialTimeout("127.0.0.1:1".to_string());
        assert_eq!(err.kind(), ErrorKind::Dial);
        assert_eq!(err.kind().as_str(), "dial");
    }

    #[test]
    fn bind_error_names_the_address() {
        let err = TunnelError::Bind {
            addr: "127.0.0.1:9001".to_string(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:9001"));
        assert_eq!(err.kind(), ErrorKind::Bind);
    }
}
