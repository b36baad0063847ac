use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{CipherSpec, Keystream, Role};
use crate::error::TunnelError;

/// A connection wrapper that deciphers everything read from the inner stream
/// and enciphers everything written to it.
///
/// Reading and writing each own a separate [`Keystream`], both created fresh
/// for this stream. The [`Role`] picks which derived direction each side uses,
/// so the two peers of a ciphered leg pair up. Ciphertext is buffered
/// internally between `poll_write` and the inner stream, so callers must flush
/// (or shut down) to be sure all accepted bytes reached the wire.
#[derive(Debug)]
pub struct CipherStream<S> {
    inner: S,
    decryptor: Keystream,
    encryptor: Keystream,
    pending: Vec<u8>,
    written: usize,
}

impl<S> CipherStream<S> {
    pub fn new(inner: S, spec: &CipherSpec, role: Role) -> Result<Self, TunnelError> {
        Ok(Self {
            inner,
            decryptor: spec.keystream(role.incoming())?,
            encryptor: spec.keystream(role.outgoing())?,
            pending: Vec::new(),
            written: 0,
        })
    }

    /// Bytes deciphered from the inner stream so far.
    #[must_use]
    pub const fn read_position(&self) -> u64 {
        self.decryptor.position()
    }

    /// Bytes enciphered towards the inner stream so far.
    #[must_use]
    pub const fn write_position(&self) -> u64 {
        self.encryptor.position()
    }
}

impl<S: AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let unsent = &self.pending[self.written..];
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, unsent))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.decryptor.apply(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // The keystream advances exactly once per accepted byte.
        this.pending.extend_from_slice(buf);
        this.encryptor.apply(&mut this.pending);
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        let this = &mut *self;
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
