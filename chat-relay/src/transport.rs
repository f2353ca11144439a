//! Newline-delimited framing over a connected byte stream.
//!
//! A [`LineTransport`] owns both directions of one connection. The read side
//! ([`LineReader`]) belongs to exactly one session loop; the write side
//! ([`LineSender`]) is cheaply cloneable so the peer registry and the owning
//! session can both write to it. Writes are serialized through a mutex, so a
//! recipient never observes two lines interleaved.
//!
//! Closing the sender is the only cancellation primitive: it wakes any
//! `receive_line` call blocked on the same transport, which then reports end of
//! stream instead of waiting for the remote peer.
//!
//! Only newline-terminated lines are ever handed out. Bytes left without a
//! terminator when the stream ends are dropped, so a write cut short on the
//! other side never shows up as a complete message.

use std::{io, pin::Pin, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf},
    net::{TcpStream, tcp::OwnedReadHalf},
    select,
    sync::{Mutex, watch},
};
use tracing::debug;

use crate::error::{ChatError, Result};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line accepted from a peer, terminator included.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

pub struct LineTransport<R> {
    reader: LineReader<R>,
    sender: LineSender,
}

impl<R> LineTransport<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            reader: LineReader {
                inner: BufReader::new(reader),
                pending: Vec::new(),
                closed: closed_rx,
            },
            sender: LineSender {
                inner: Arc::new(SenderInner {
                    writer: Mutex::new(Box::pin(writer)),
                    closed: closed_tx,
                }),
            },
        }
    }

    pub fn sender(&self) -> LineSender {
        self.sender.clone()
    }

    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        self.reader.receive_line().await
    }

    pub async fn send_line(&self, text: &str) -> Result<()> {
        self.sender.send_line(text).await
    }

    pub async fn close(&self) {
        self.sender.close().await;
    }

    pub fn into_parts(self) -> (LineReader<R>, LineSender) {
        (self.reader, self.sender)
    }
}

impl LineTransport<OwnedReadHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(?error, "failed to disable nagle on chat socket");
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

impl<S> LineTransport<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps any in-memory or custom duplex stream, e.g. `tokio::io::duplex`.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

/// Read side of a transport. Not shared: one session loop drives it.
pub struct LineReader<R> {
    inner: BufReader<R>,
    // Bytes of a line whose terminator has not arrived yet. Kept across calls so
    // `receive_line` stays cancel-safe inside `select!`.
    pending: Vec<u8>,
    closed: watch::Receiver<bool>,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Waits for the next full line, returning it without its terminator.
    ///
    /// `Ok(None)` means the stream ended: either the peer closed its side or the
    /// local sender was closed. Abrupt resets come back as `ChatError::Transport`.
    pub async fn receive_line(&mut self) -> Result<Option<String>> {
        let Self {
            inner,
            pending,
            closed,
        } = self;

        let already_closed = *closed.borrow();
        if already_closed {
            return Ok(None);
        }

        let bytes = select! {
            biased;
            _ = wait_closed(closed) => return Ok(None),
            read = read_bounded_line(inner, pending) => read?,
        };

        if bytes == 0 {
            if !pending.is_empty() {
                debug!(bytes = pending.len(), "dropping unterminated line at end of stream");
                pending.clear();
            }
            return Ok(None);
        }

        let mut raw = std::mem::take(pending);
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        let line = String::from_utf8(raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some(line))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Write side of a transport, shared between the registry and its session.
#[derive(Clone)]
pub struct LineSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    writer: Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl LineSender {
    /// Writes `text` plus a newline and flushes.
    ///
    /// Concurrent callers are serialized. Closing the transport aborts a write
    /// that is stuck on a peer that stopped reading.
    pub async fn send_line(&self, text: &str) -> Result<()> {
        if text.contains(LINE_ENDINGS) {
            return Err(ChatError::InvalidLine);
        }
        if self.is_closed() {
            return Err(ChatError::Closed);
        }

        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(b'\n');

        let mut closed = self.inner.closed.subscribe();
        let mut writer = select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(ChatError::Closed),
            writer = self.inner.writer.lock() => writer,
        };

        select! {
            biased;
            _ = wait_closed(&mut closed) => Err(ChatError::Closed),
            written = write_frame(&mut writer, &frame) => written.map_err(ChatError::from),
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Marks the transport closed and shuts down the write half. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }

        // A writer stuck on a dead peer holds the lock; it bails out on its own
        // once it sees the closed flag, and the socket goes away with it.
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            if let Err(error) = writer.shutdown().await {
                debug!(?error, "failed to shut down transport writer");
            }
        }
    }

    /// Resolves once the transport has been closed locally.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    pub fn same_transport(&self, other: &LineSender) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Like `read_until(b'\n')`, but gives up once the line outgrows
/// [`MAX_LINE_BYTES`]. Returns 0 at end of stream, otherwise the number of
/// bytes moved into `pending` by this call, ending with the newline.
///
/// Cancel-safe: bytes are only consumed from `inner` after they were copied.
async fn read_bounded_line<R>(inner: &mut BufReader<R>, pending: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = inner.fill_buf().await?;
        if available.is_empty() {
            return Ok(0);
        }

        let (chunk, done) = match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        pending.extend_from_slice(chunk);
        let used = chunk.len();
        inner.consume(used);
        read += used;

        if pending.len() > MAX_LINE_BYTES {
            pending.clear();
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }
        if done {
            return Ok(read);
        }
    }
}

async fn write_frame(writer: &mut BoxedWriter, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can write to this transport any more.
    let _ = closed.wait_for(|closed| *closed).await;
}
