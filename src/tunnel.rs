use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::TunnelConfig;
use crate::crypto::CipherSpec;
use crate::error::TunnelError;
use crate::session::run_session;

/// Pause before accepting again after the process ran out of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(unix)]
const RESOURCE_EXHAUSTION_CODES: [i32; 3] = [
    12, // ENOMEM
    23, // ENFILE
    24, // EMFILE
];

struct Shared {
    config: TunnelConfig,
    cipher: CipherSpec,
}

/// One bound frontend listener plus the fixed backend and cipher parameters
/// every session it accepts will use.
pub struct TunnelInstance {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl TunnelInstance {
    /// Validates the configuration, derives cipher keys and binds the
    /// frontend. Any failure here means the instance never accepts.
    pub async fn bind(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let cipher = CipherSpec::new(config.crypto_method, &config.secret)?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            addr: addr.clone(),
            source,
        })?;

        info!(
            listen_addr = %local_addr,
            backend = %config.backend_addr,
            crypto = %config.crypto_method,
            mode = config.mode_name(),
            "Tunnel listening"
        );

        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared { config, cipher }),
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` fires or the listener fails,
    /// spawning an independent session for each one.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Tunnel shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted connection");
                    let shared = Arc::clone(&self.shared);
                    let shutdown = shutdown.clone();

                    tokio::spawn(
                        async move {
                            if let Err(e) =
                                run_session(stream, &shared.config, &shared.cipher, &shutdown).await
                            {
                                warn!(kind = e.kind().as_str(), error = %e, "Session failed");
                            }
                        }
                        .instrument(info_span!("session", peer_addr = %peer_addr)),
                    );
                }
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Accept failed, continuing");
                    if is_resource_exhaustion(&e) {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
                Err(source) => {
                    error!(error = %source, "Listener failed");
                    return Err(TunnelError::Accept {
                        addr: self.local_addr.to_string(),
                        source,
                    });
                }
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(e)
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    #[cfg(unix)]
    if let Some(code) = e.raw_os_error() {
        return RESOURCE_EXHAUSTION_CODES.contains(&code);
    }
    e.kind() == io::ErrorKind::OutOfMemory
}
