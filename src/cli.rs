//! Command-line entry point: flags, logging destination and the signal wait loop.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{io, path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DEFAULT_BUFFER_SIZE, TunnelConfig, load_tunnel_file};
use crate::crypto::CryptoMethod;
use crate::orchestrator::{Orchestrator, StartupMode};

/// Destination for log output, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogTarget {
    Stdout,
    Syslog,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cipher-tunnel",
    version,
    about = "Encrypted TCP tunnel between a frontend listener and a backend"
)]
pub struct Args {
    /// host:port to listen on
    #[arg(long, default_value = ":9001")]
    pub listen: String,

    /// host:port of the backend
    #[arg(long, default_value = "127.0.0.1:6400")]
    pub backend: String,

    /// Encryption method (identity, rc4, aes-128-ctr, aes-192-ctr, aes-256-ctr, chacha20)
    #[arg(long, default_value = "rc4")]
    pub crypto: String,

    /// Password used to encrypt the data
    #[arg(long, default_value = "secret")]
    pub secret: String,

    /// Run in client mode (encrypt towards the backend)
    #[arg(long)]
    pub clientmode: bool,

    /// Tunnel file with one tunnel per line; overrides the single-tunnel flags
    #[arg(long)]
    pub conf: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogTarget::Stdout)]
    pub logto: LogTarget,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Relay buffer size per direction, in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Backend connect timeout, in seconds
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}

impl Args {
    /// Builds the tunnel list and the startup mode these flags describe.
    pub fn tunnels(&self) -> Result<(Vec<TunnelConfig>, StartupMode)> {
        let (mut configs, mode) = match &self.conf {
            Some(path) => (
                load_tunnel_file(path)
                    .with_context(|| format!("Failed to load tunnel file {}", path.display()))?,
                StartupMode::Multi,
            ),
            None => {
                let method = self
                    .crypto
                    .parse::<CryptoMethod>()
                    .context("Invalid --crypto")?;
                (
                    vec![TunnelConfig::new(
                        self.listen.clone(),
                        self.backend.clone(),
                        method,
                        self.clientmode,
                        self.secret.clone(),
                    )],
                    StartupMode::Single,
                )
            }
        };

        for config in &mut configs {
            config.buffer_size = self.buffer_size;
            config.connect_timeout = Duration::from_secs(self.connect_timeout);
        }
        Ok((configs, mode))
    }
}

pub async fn run(args: Args) -> Result<()> {
    init_tracing(args.logto, &args.log_level)?;

    let (configs, mode) = args.tunnels()?;
    for config in &configs {
        info!(tunnel = %config, "Configuration loaded");
    }

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::start(configs, mode, shutdown.clone())
        .await
        .context("Failed to start tunnels")?;

    wait_for_termination().await?;
    orchestrator.shutdown();
    orchestrator.wait().await;
    Ok(())
}

fn init_tracing(target: LogTarget, level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match target {
        LogTarget::Stdout => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stdout))
            .try_init()
            .context("Failed to install log subscriber"),
        #[cfg(unix)]
        LogTarget::Syslog => {
            let syslog = syslog_tracing::Syslog::new(
                c"cipher-tunnel",
                syslog_tracing::Options::default(),
                syslog_tracing::Facility::default(),
            )
            .context("Syslog writer already in use")?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(syslog).with_ansi(false).without_time())
                .try_init()
                .context("Failed to install log subscriber")
        }
        #[cfg(not(unix))]
        LogTarget::Syslog => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stdout))
                .try_init()
                .context("Failed to install log subscriber")?;
            tracing::warn!("Syslog is not available on this platform, logging to stdout");
            Ok(())
        }
    }
}

/// Returns on SIGINT or SIGTERM. Other common signals are logged and ignored.
#[cfg(unix)]
pub async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let listen = |kind: SignalKind| signal(kind).context("Failed to install signal handler");
    let mut interrupt = listen(SignalKind::interrupt())?;
    let mut terminate = listen(SignalKind::terminate())?;
    let mut hangup = listen(SignalKind::hangup())?;
    let mut user1 = listen(SignalKind::user_defined1())?;
    let mut user2 = listen(SignalKind::user_defined2())?;
    let mut pipe = listen(SignalKind::pipe())?;

    loop {
        let ignored = tokio::select! {
            _ = interrupt.recv() => {
                info!(signal = "SIGINT", "Terminated by signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!(signal = "SIGTERM", "Terminated by signal");
                return Ok(());
            }
            _ = hangup.recv() => "SIGHUP",
            _ = user1.recv() => "SIGUSR1",
            _ = user2.recv() => "SIGUSR2",
            _ = pipe.recv() => "SIGPIPE",
        };
        info!(signal = ignored, "Received signal, ignoring");
    }
}

#[cfg(not(unix))]
pub async fn wait_for_termination() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Terminated by Ctrl+C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("cipher-tunnel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_describe_one_server_mode_tunnel() {
        let (configs, mode) = parse(&[]).tunnels().unwrap();
        assert_eq!(mode, StartupMode::Single);
        assert_eq!(configs.len(), 1);

        let config = &configs[0];
        assert_eq!(config.frontend_addr, ":9001");
        assert_eq!(config.backend_addr, "127.0.0.1:6400");
        assert_eq!(config.crypto_method, CryptoMethod::Rc4);
        assert!(!config.client_mode);
        assert_eq!(config.secret, "secret");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn flags_map_onto_the_single_tunnel() {
        let args = parse(&[
            "--listen",
            "127.0.0.1:7000",
            "--backend",
            "10.0.0.2:22",
            "--crypto",
            "chacha20",
            "--secret",
            "pw",
            "--clientmode",
            "--buffer-size",
            "512",
            "--connect-timeout",
            "3",
            "--logto",
            "syslog",
        ]);
        assert_eq!(args.logto, LogTarget::Syslog);

        let (configs, _) = args.tunnels().unwrap();
        let config = &configs[0];
        assert_eq!(config.frontend_addr, "127.0.0.1:7000");
        assert_eq!(config.crypto_method, CryptoMethod::ChaCha20);
        assert!(config.client_mode);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn unknown_cipher_flag_is_fatal() {
        assert!(parse(&["--crypto", "rot13"]).tunnels().is_err());
    }

    #[test]
    fn conf_file_switches_to_multi_mode() {
        let path = std::env::temp_dir().join(format!("cipher-tunnel-{}.conf", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# two tunnels").unwrap();
        writeln!(file, ":7001 127.0.0.1:80 rc4 1 a").unwrap();
        writeln!(file, ":7002 127.0.0.1:81 identity 0 b").unwrap();
        drop(file);

        let args = parse(&["--conf", path.to_str().unwrap(), "--buffer-size", "1024"]);
        let (configs, mode) = args.tunnels().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(mode, StartupMode::Multi);
        assert_eq!(configs.len(), 2);
        assert!(configs.iter().all(|c| c.buffer_size == 1024));
        assert_eq!(configs[1].crypto_method, CryptoMethod::Identity);
    }
}
