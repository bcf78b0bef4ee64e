//! DATA section reader: dot-unstuffing, end-of-data detection and the
//! message size limit, exposed as a plain `AsyncRead`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use smtp_proto::request::receiver::{DataReceiver, DummyDataReceiver};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, ReadBuf};

/// Unstuffed bytes kept back until the section ends. The receiver drops
/// what follows a line-opening dot once it sees the terminator.
const HOLD_BACK: usize = 3;

/// What the DATA section turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOutcome {
    /// Message size after dot-unstuffing, counted up to the point the limit
    /// was crossed.
    pub size: usize,
    pub exceeded: bool,
}

enum Receiver {
    Data(DataReceiver),
    /// Past the size limit: the rest of the section is discarded.
    TooLarge(DummyDataReceiver),
}

/// Reads the DATA section of one transaction from the connection.
///
/// Yields the unstuffed message and reports end-of-file at the lone `.`
/// line, which is consumed. Once the message grows past `max` bytes every
/// read fails; [`DataReader::drain`] still consumes the section to its end.
pub struct DataReader<'a, R> {
    inner: &'a mut R,
    receiver: Receiver,
    pending: Vec<u8>,
    /// Bytes already handed out or discarded.
    released: usize,
    max: usize,
    exceeded: bool,
    done: bool,
}

impl<'a, R: AsyncBufRead + Unpin> DataReader<'a, R> {
    pub fn new(inner: &'a mut R, max: usize) -> Self {
        // The section opens at the start of a line, right after the CRLF of
        // the DATA command.
        let mut receiver = DataReceiver::new();
        receiver.ingest(&mut b"\r\n".iter(), &mut Vec::new());

        Self {
            inner,
            receiver: Receiver::Data(receiver),
            pending: Vec::new(),
            released: 0,
            max,
            exceeded: false,
            done: false,
        }
    }

    /// Consume whatever is left of the section, discarding it.
    pub async fn drain(&mut self) -> io::Result<DataOutcome> {
        while !self.done {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                return Err(closed_during_data());
            }
            let used = ingest(chunk, &mut self.receiver, &mut self.pending, &mut self.done);
            self.inner.consume(used);
            self.account();
            let n = self.ready();
            self.release(n);
        }
        self.release(self.pending.len());
        Ok(DataOutcome {
            size: self.released,
            exceeded: self.exceeded,
        })
    }

    /// How much of `pending` may leave the reader.
    fn ready(&self) -> usize {
        match self.done {
            true => self.pending.len(),
            false => self.pending.len().saturating_sub(HOLD_BACK),
        }
    }

    fn release(&mut self, n: usize) {
        self.pending.drain(..n);
        self.released += n;
    }

    /// Check the message size after new bytes came in.
    fn account(&mut self) {
        if self.exceeded {
            self.pending.clear();
            return;
        }
        if self.released + self.pending.len() > self.max {
            self.exceeded = true;
            self.release(self.pending.len());
            if let Receiver::Data(receiver) = &mut self.receiver {
                let rest = DummyDataReceiver::new_data(receiver);
                self.receiver = Receiver::TooLarge(rest);
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for DataReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let ready = this.ready();
            if ready > 0 {
                let n = buf.remaining().min(ready);
                buf.put_slice(&this.pending[..n]);
                this.release(n);
                return Poll::Ready(Ok(()));
            }

            if this.exceeded {
                return Poll::Ready(Err(io::Error::other(format!(
                    "message exceeds {} bytes",
                    this.max
                ))));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }

            let chunk = ready!(Pin::new(&mut *this.inner).poll_fill_buf(cx))?;
            if chunk.is_empty() {
                return Poll::Ready(Err(closed_during_data()));
            }
            let used = ingest(chunk, &mut this.receiver, &mut this.pending, &mut this.done);
            Pin::new(&mut *this.inner).consume(used);
            this.account();
        }
    }
}

/// Feed `chunk` to the receiver. Returns how many bytes were used; the
/// receiver stops right after the end-of-data line.
fn ingest(chunk: &[u8], receiver: &mut Receiver, out: &mut Vec<u8>, done: &mut bool) -> usize {
    let mut iter = chunk.iter();
    *done = match receiver {
        Receiver::Data(receiver) => receiver.ingest(&mut iter, out),
        Receiver::TooLarge(receiver) => receiver.ingest(&mut iter),
    };
    chunk.len() - iter.len()
}

fn closed_during_data() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed during DATA",
    )
}
