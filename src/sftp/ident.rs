//! Client identification capture
//!
//! russh reads the peer's `SSH-2.0-...` line internally and does not expose
//! it, so the raw stream is wrapped and the first identification line is
//! recorded as it passes through.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// RFC 4253 §4.2 caps the identification line at 255 bytes.
const MAX_IDENT_LEN: usize = 255;

pub struct IdentTap<S> {
    inner: S,
    line: Vec<u8>,
    version: Arc<OnceLock<String>>,
    done: bool,
}

impl<S> IdentTap<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            line: Vec::new(),
            version: Arc::new(OnceLock::new()),
            done: false,
        }
    }

    /// Shared slot filled once the identification line has been read.
    pub fn version(&self) -> Arc<OnceLock<String>> {
        self.version.clone()
    }

    fn observe(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.line);
                let line = line.trim_end_matches('\r');
                if line.starts_with("SSH-") {
                    let _ = self.version.set(line.to_string());
                    self.finish();
                    return;
                }
                // other lines may precede the identification
                self.line.clear();
            } else if self.line.len() < MAX_IDENT_LEN {
                self.line.push(byte);
            } else {
                self.finish();
                return;
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.line = Vec::new();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdentTap<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if !this.done {
            if let Poll::Ready(Ok(())) = &poll {
                this.observe(&buf.filled()[before..]);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdentTap<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
