//! Tee reader: duplicates every byte read into a retained buffer so the
//! original stream can be replayed after a partial read.

use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncReadExt, Chain, ReadBuf};

/// Wraps a reader, keeping a copy of everything pulled through it.
///
/// The retained bytes plus whatever is still unread in the inner reader
/// always add up to the original stream, however far the consumer got.
pub struct TeeReader<R> {
    inner: R,
    retained: Vec<u8>,
}

/// The original stream reconstructed from a [`TeeReader`].
pub type Replay<R> = Chain<Cursor<Vec<u8>>, R>;

impl<R: AsyncRead + Unpin> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            retained: Vec::new(),
        }
    }

    /// Bytes read through the tee so far.
    pub fn retained(&self) -> &[u8] {
        &self.retained
    }

    /// Retained bytes followed by the unread remainder of the inner reader.
    pub fn into_replay(self) -> Replay<R> {
        Cursor::new(self.retained).chain(self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.retained.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}
