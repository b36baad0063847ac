use std::{
    future::Future,
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::TunnelConfig;
use crate::crypto::{CipherSpec, Role};
use crate::error::TunnelError;
use crate::stream::CipherStream;

/// Bytes moved by one session, per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frontend to backend.
    pub upstream_bytes: u64,
    /// Backend to frontend.
    pub downstream_bytes: u64,
    /// A direction was still open when linger expiry or shutdown cut it off,
    /// so its count covers only what was relayed until then.
    pub truncated: bool,
}

/// Copies `reader` into `writer` until end-of-stream or error, then shuts
/// down the write side so the peer observes end-of-stream.
///
/// Every chunk is flushed before the next read.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    pump_counted(reader, writer, buffer_size, &AtomicU64::new(0)).await
}

/// [`pump`] that also adds every flushed chunk to `relayed`, so the count
/// survives the pump being dropped mid-transfer.
async fn pump_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    relayed: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    let result = loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buffer[..n]).await {
            break Err(e);
        }
        if let Err(e) = writer.flush().await {
            break Err(e);
        }
        total += n as u64;
        relayed.fetch_add(n as u64, Ordering::Relaxed);
        trace!(bytes = n, "Relayed chunk");
    };

    // Already-closed sockets are fine here.
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Failed to shut down write side");
    }
    result
}

/// Runs one session: dials the backend, wraps both connections according to
/// the tunnel mode and relays until both directions are done.
///
/// In client mode the backend side carries ciphertext; in server mode the
/// frontend side does. Both sockets are closed when this returns, whatever
/// the outcome.
pub async fn run_session(
    front: TcpStream,
    config: &TunnelConfig,
    cipher: &CipherSpec,
    shutdown: &CancellationToken,
) -> Result<SessionStats, TunnelError> {
    let back = dial(&config.backend_addr, config.connect_timeout).await?;
    let _ = front.set_nodelay(true);
    let _ = back.set_nodelay(true);

    let plain = CipherSpec::identity();
    let (front_spec, back_spec) = if config.client_mode {
        (&plain, cipher)
    } else {
        (cipher, &plain)
    };
    // A ciphered frontend faces a client-mode peer; a ciphered backend faces
    // a server-mode peer.
    let front = CipherStream::new(front, front_spec, Role::Server)?;
    let back = CipherStream::new(back, back_spec, Role::Client)?;

    relay(front, back, config.buffer_size, config.linger, shutdown).await
}

async fn dial(addr: &str, connect_timeout: Duration) -> Result<TcpStream, TunnelError> {
    debug!(backend = %addr, "Connecting to backend");
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!(backend = %addr, "Connected to backend");
            Ok(stream)
        }
        Ok(Err(source)) => Err(TunnelError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TunnelError::DialTimeout(addr.to_string())),
    }
}

enum Finished {
    Upstream(io::Result<u64>),
    Downstream(io::Result<u64>),
}

/// Relays between two already-wrapped connections with joint teardown.
pub(crate) async fn relay<F, B>(
    front: F,
    back: B,
    buffer_size: usize,
    linger: Duration,
    shutdown: &CancellationToken,
) -> Result<SessionStats, TunnelError>
where
    F: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut front_reader, mut front_writer) = tokio::io::split(front);
    let (mut back_reader, mut back_writer) = tokio::io::split(back);

    let upstream_bytes = AtomicU64::new(0);
    let downstream_bytes = AtomicU64::new(0);
    let counted = |truncated| SessionStats {
        upstream_bytes: upstream_bytes.load(Ordering::Relaxed),
        downstream_bytes: downstream_bytes.load(Ordering::Relaxed),
        truncated,
    };

    let upstream = pump_counted(
        &mut front_reader,
        &mut back_writer,
        buffer_size,
        &upstream_bytes,
    );
    let downstream = pump_counted(
        &mut back_reader,
        &mut front_writer,
        buffer_size,
        &downstream_bytes,
    );
    tokio::pin!(upstream, downstream);

    let first = tokio::select! {
        result = &mut upstream => Finished::Upstream(result),
        result = &mut downstream => Finished::Downstream(result),
        () = shutdown.cancelled() => {
            let stats = counted(true);
            debug!(
                upstream_bytes = stats.upstream_bytes,
                downstream_bytes = stats.downstream_bytes,
                "Session closed by shutdown"
            );
            return Ok(stats);
        }
    };

    let (upstream_result, downstream_result) = match first {
        Finished::Upstream(result) => {
            debug!("Frontend finished sending");
            (Some(result), finish(downstream.as_mut(), linger, shutdown).await)
        }
        Finished::Downstream(result) => {
            debug!("Backend finished sending");
            (finish(upstream.as_mut(), linger, shutdown).await, Some(result))
        }
    };

    let stats = counted(upstream_result.is_none() || downstream_result.is_none());
    let failure = [upstream_result, downstream_result]
        .into_iter()
        .flatten()
        .find_map(Result::err);

    info!(
        upstream_bytes = stats.upstream_bytes,
        downstream_bytes = stats.downstream_bytes,
        truncated = stats.truncated,
        "Session closed"
    );
    match failure {
        Some(e) => Err(TunnelError::Transfer(e)),
        None => Ok(stats),
    }
}

/// Gives the still-running pump `linger` to drain. `None` when it was cut off.
async fn finish<P>(
    pump: P,
    linger: Duration,
    shutdown: &CancellationToken,
) -> Option<io::Result<u64>>
where
    P: Future<Output = io::Result<u64>>,
{
    tokio::select! {
        result = timeout(linger, pump) => {
            if result.is_err() {
                debug!(
                    linger_ms = linger.as_millis() as u64,
                    "Peer still open after linger, closing"
                );
            }
            result.ok()
        }
        () = shutdown.cancelled() => None,
    }
}
