//! Per-channel read/write façade.
//!
//! A channel holds a non-owning handle to its connection's shared
//! state; it observes connection death but never keeps the transport
//! alive past user release. After close, reads drain buffered bytes
//! then hit eof and writes fail with `channel-closed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use crate::mux::{self, Shared};
use crate::Error;

struct ReadState {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

/// Named bidirectional byte stream inside a multiplexed socket
pub struct ChannelSocket {
    shared: Arc<Shared>,
    id: u16,
    name: String,
    read: tokio::sync::Mutex<ReadState>,
    closed: AtomicBool,
}

impl ChannelSocket {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: u16,
        name: String,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            shared,
            id,
            name,
            read: tokio::sync::Mutex::new(ReadState {
                rx,
                pending: Bytes::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Channel id within the connection
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this channel was closed locally
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read bytes, waiting for data.
    ///
    /// Returns `Ok(0)` on a zero-length buffer immediately, and on eof
    /// once the buffered bytes are drained after a close. A dead
    /// connection surfaces its terminal error instead.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read = self.read.lock().await;
        loop {
            if !read.pending.is_empty() {
                let n = read.pending.len().min(buf.len());
                buf[..n].copy_from_slice(&read.pending[..n]);
                read.pending.advance(n);
                return Ok(n);
            }
            match read.rx.recv().await {
                Some(data) => read.pending = data,
                None => return self.eof_result(),
            }
        }
    }

    /// Read without waiting: `None` when nothing is buffered right
    /// now, `Some(0)` at eof
    pub async fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        if buf.is_empty() {
            return Ok(Some(0));
        }
        let mut read = self.read.lock().await;
        if read.pending.is_empty() {
            match read.rx.try_recv() {
                Ok(data) => read.pending = data,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return self.eof_result().map(Some)
                }
            }
        }
        let n = read.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&read.pending[..n]);
        read.pending.advance(n);
        Ok(Some(n))
    }

    /// Write all bytes; blocks on flow control
    pub async fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed);
        }
        mux::write_channel(&self.shared, self.id, data).await
    }

    /// Close the channel; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            mux::close_channel(&self.shared, self.id);
        }
    }

    fn eof_result(&self) -> Result<usize, Error> {
        match mux::channel_closed_reason(&self.shared) {
            // Graceful channel or connection close reads as eof
            None | Some(Error::ChannelClosed) => Ok(0),
            Some(err) => Err(err),
        }
    }
}

impl Drop for ChannelSocket {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            mux::close_channel(&self.shared, self.id);
        }
    }
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelSocket(#{} \"{}\")", self.id, self.name)
    }
}
