//! Streaming AES-CTR relay wrapper shared by the length-preserving
//! transports (obfs2, obfs3).
//!
//! Once a handshake has keyed both directions, the wrapped connection
//! behaves like the inner one byte-for-byte: writes are encrypted under the
//! initiator cipher, reads are decrypted under the responder cipher, and no
//! framing is added.  Back-pressure is inherited from the inner stream; at
//! most one chunk of ciphertext is buffered per direction.

use std::io::Error as IoError;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use cipher::StreamCipher;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// AES-128 in counter mode with a big-endian 128-bit counter.
pub type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Upper bound on ciphertext buffered ahead of the inner writer.
const WRITE_CHUNK: usize = 16 * 1024;

#[pin_project]
pub struct CipherStream<T, C> {
    #[pin]
    inner: T,

    enc: C,
    dec: C,

    /// Plaintext already decrypted but not yet claimed by the reader.
    read_pending: BytesMut,
    /// Ciphertext produced but not yet accepted by the inner writer.
    write_pending: BytesMut,
    /// Plaintext length the current `write_pending` accounts for.
    write_claim: usize,
}

impl<T, C> std::fmt::Debug for CipherStream<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStream").finish_non_exhaustive()
    }
}

impl<T, C> CipherStream<T, C>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: StreamCipher,
{
    pub fn new(inner: T, enc: C, dec: C) -> Self {
        Self {
            inner,
            enc,
            dec,
            read_pending: BytesMut::new(),
            write_pending: BytesMut::new(),
            write_claim: 0,
        }
    }

    /// Like [`new`](Self::new), but bytes that arrived bundled with the tail
    /// of the handshake are decrypted now and served before the inner stream
    /// is read again.
    pub fn with_read_leftover(inner: T, enc: C, mut dec: C, leftover: &[u8]) -> Self {
        let mut read_pending = BytesMut::from(leftover);
        if !read_pending.is_empty() {
            dec.apply_keystream(&mut read_pending);
        }
        Self {
            inner,
            enc,
            dec,
            read_pending,
            write_pending: BytesMut::new(),
            write_claim: 0,
        }
    }

    /// The inner transport, for address queries.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T, C> AsyncRead for CipherStream<T, C>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: StreamCipher + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), IoError>> {
        let this = self.project();

        if !this.read_pending.is_empty() {
            let n = this.read_pending.len().min(buf.remaining());
            buf.put_slice(&this.read_pending.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let pre = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                this.dec.apply_keystream(&mut buf.filled_mut()[pre..]);
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<T, C> AsyncWrite for CipherStream<T, C>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: StreamCipher + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, IoError>> {
        let mut this = self.project();

        if this.write_pending.is_empty() {
            if *this.write_claim != 0 {
                // The previous chunk drained via poll_flush; report it now.
                return Poll::Ready(Ok(std::mem::take(this.write_claim)));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }

            let n = buf.len().min(WRITE_CHUNK);
            this.write_pending.extend_from_slice(&buf[..n]);
            this.enc.apply_keystream(&mut this.write_pending[..]);
            *this.write_claim = n;
        }

        while !this.write_pending.is_empty() {
            match this.inner.as_mut().poll_write(cx, this.write_pending)? {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(0) => {
                    return Poll::Ready(Err(IoError::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream accepted 0 bytes",
                    )))
                }
                Poll::Ready(n) => this.write_pending.advance(n),
            }
        }

        Poll::Ready(Ok(std::mem::take(this.write_claim)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        let mut this = self.project();

        while !this.write_pending.is_empty() {
            match this.inner.as_mut().poll_write(cx, this.write_pending)? {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(0) => {
                    return Poll::Ready(Err(IoError::new(
                        std::io::ErrorKind::WriteZero,
                        "inner stream accepted 0 bytes",
                    )))
                }
                Poll::Ready(n) => this.write_pending.advance(n),
            }
        }

        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        self.project().inner.poll_shutdown(cx)
    }
}
