use std::{fmt, fs, path::Path, time::Duration};
use tracing::warn;

use crate::crypto::CryptoMethod;
use crate::error::TunnelError;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Parameters of one tunnel instance. Fixed for the instance's lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub frontend_addr: String,
    pub backend_addr: String,
    /// Client mode enciphers towards the backend; server mode towards the frontend.
    pub client_mode: bool,
    pub crypto_method: CryptoMethod,
    pub secret: String,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    /// How long the second direction of a session may keep running after
    /// the first one finished.
    pub linger: Duration,
}

impl TunnelConfig {
    pub fn new(
        frontend_addr: impl Into<String>,
        backend_addr: impl Into<String>,
        crypto_method: CryptoMethod,
        client_mode: bool,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            frontend_addr: frontend_addr.into(),
            backend_addr: backend_addr.into(),
            client_mode,
            crypto_method,
            secret: secret.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            linger: DEFAULT_LINGER,
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        check_endpoint("frontend", &self.frontend_addr, true)?;
        check_endpoint("backend", &self.backend_addr, false)?;
        if self.buffer_size == 0 {
            return Err(TunnelError::Config(
                "buffer size must be greater than zero".to_string(),
            ));
        }
        if self.crypto_method.requires_secret() && self.secret.is_empty() {
            return Err(TunnelError::CryptoConfig(format!(
                "crypto method {} requires a non-empty secret",
                self.crypto_method
            )));
        }
        Ok(())
    }

    /// The address to bind. An empty host (`:9001`) means all interfaces.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        if self.frontend_addr.starts_with(':') {
            format!("0.0.0.0{}", self.frontend_addr)
        } else {
            self.frontend_addr.clone()
        }
    }

    #[must_use]
    pub const fn mode_name(&self) -> &'static str {
        if self.client_mode { "client" } else { "server" }
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frontend={} backend={} crypto={} mode={} secret={} buffer_size={}",
            self.frontend_addr,
            self.backend_addr,
            self.crypto_method,
            self.mode_name(),
            if self.secret.is_empty() { "<none>" } else { "<redacted>" },
            self.buffer_size,
        )
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("frontend_addr", &self.frontend_addr)
            .field("backend_addr", &self.backend_addr)
            .field("client_mode", &self.client_mode)
            .field("crypto_method", &self.crypto_method)
            .field("secret", &"<redacted>")
            .field("buffer_size", &self.buffer_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("linger", &self.linger)
            .finish()
    }
}

fn check_endpoint(role: &str, addr: &str, allow_empty_host: bool) -> Result<(), TunnelError> {
    let invalid = |reason: &str| {
        Err(TunnelError::Config(format!(
            "{role} address {addr:?} {reason}"
        )))
    };

    if addr.trim().is_empty() {
        return invalid("is empty");
    }
    let Some((host, port)) = addr.rsplit_once(':') else {
        return invalid("must be of the form host:port");
    };
    if host.is_empty() && !allow_empty_host {
        return invalid("has no host");
    }
    if port.parse::<u16>().is_err() {
        return invalid("has an invalid port");
    }
    Ok(())
}

/// Parses the multi-tunnel file format.
///
/// One tunnel per line: `frontend backend method client_flag secret`. Blank
/// lines and `#` comments are ignored, lines with fewer than five fields are
/// skipped, and a client flag of exactly `1` selects client mode. Lines naming
/// an unknown cipher are skipped with a warning.
#[must_use]
pub fn parse_tunnel_file(content: &str) -> Vec<TunnelConfig> {
    content
        .lines()
        .enumerate()
        .filter_map(|(index, line)| parse_line(index + 1, line))
        .collect()
}

fn parse_line(line_no: usize, line: &str) -> Option<TunnelConfig> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split_whitespace().collect();
    let [frontend, backend, method, client_flag, secret, ..] = fields.as_slice() else {
        return None;
    };

    match method.parse::<CryptoMethod>() {
        Ok(method) => Some(TunnelConfig::new(
            *frontend,
            *backend,
            method,
            *client_flag == "1",
            *secret,
        )),
        Err(e) => {
            warn!(line = line_no, error = %e, "Skipping tunnel entry");
            None
        }
    }
}

pub fn load_tunnel_file(path: impl AsRef<Path>) -> Result<Vec<TunnelConfig>, TunnelError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| TunnelError::ConfigFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_tunnel_file(&content))
}
