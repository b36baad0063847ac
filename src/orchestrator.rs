//! Startup of all configured tunnels.
//!
//! The orchestrator validates every entry, binds the valid ones concurrently
//! and hands each bound listener its own accept task. After startup it only
//! waits: failed tunnels are not retried for the life of the process.

use futures_util::future::join_all;
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::TunnelConfig;
use crate::error::{ErrorKind, TunnelError};
use crate::tunnel::TunnelInstance;

/// Where the configuration came from, which decides how invalid entries are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    /// One tunnel from command-line flags. Invalid parameters abort startup.
    Single,
    /// Entries from a tunnel file. Invalid entries are skipped.
    Multi,
}

/// A tunnel whose listener could not be started.
#[derive(Debug, Clone)]
pub struct FailedTunnel {
    pub frontend_addr: String,
    pub kind: ErrorKind,
    pub reason: String,
}

pub struct Orchestrator {
    local_addrs: Vec<SocketAddr>,
    failed: Vec<FailedTunnel>,
    tasks: JoinSet<Result<(), TunnelError>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Starts one tunnel per valid entry. Dropping the orchestrator aborts
    /// every accept loop.
    pub async fn start(
        configs: Vec<TunnelConfig>,
        mode: StartupMode,
        shutdown: CancellationToken,
    ) -> Result<Self, TunnelError> {
        let mut failed = Vec::new();
        let mut valid = Vec::with_capacity(configs.len());

        for config in configs {
            match config.validate() {
                Ok(()) => valid.push(config),
                Err(e) if mode == StartupMode::Single => return Err(e),
                Err(e) => {
                    warn!(tunnel = %config, error = %e, "Skipping invalid tunnel entry");
                    failed.push(FailedTunnel {
                        frontend_addr: config.frontend_addr,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let bound = join_all(valid.into_iter().map(|config| async move {
            let frontend_addr = config.frontend_addr.clone();
            (frontend_addr, TunnelInstance::bind(config).await)
        }))
        .await;

        let mut local_addrs = Vec::new();
        let mut tasks = JoinSet::new();
        for (frontend_addr, result) in bound {
            match result {
                Ok(instance) => {
                    let addr = instance.local_addr();
                    local_addrs.push(addr);
                    tasks.spawn(
                        instance
                            .run(shutdown.child_token())
                            .instrument(info_span!("tunnel", frontend = %addr)),
                    );
                }
                Err(e) if mode == StartupMode::Single && e.kind() != ErrorKind::Bind => {
                    return Err(e);
                }
                Err(e) => {
                    error!(frontend = %frontend_addr, error = %e, "Tunnel failed to start");
                    failed.push(FailedTunnel {
                        frontend_addr,
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if local_addrs.is_empty() {
            warn!("No tunnel instances are running");
        } else {
            info!(
                running = local_addrs.len(),
                failed = failed.len(),
                "Tunnels started"
            );
        }

        Ok(Self {
            local_addrs,
            failed,
            tasks,
            shutdown,
        })
    }

    /// Bound frontend addresses of the running tunnels, in configuration order.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    #[must_use]
    pub fn failed(&self) -> &[FailedTunnel] {
        &self.failed
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Waits for every accept loop to end.
    pub async fn wait(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Tunnel stopped"),
                Err(e) => error!(error = %e, "Tunnel task panicked"),
            }
        }
    }
}
