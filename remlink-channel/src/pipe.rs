//! Remote pipes: the sending proxy and the receiving sink wrapper.

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::export::ErrorPropagating;
use crate::window::PipeWindow;
use bytes::Bytes;
use parking_lot::Mutex;
use remlink_protocol::Command;
use std::io::Write;
use std::sync::Arc;

/// Largest slice sent per chunk when the peer does not support throttling.
const UNTHROTTLED_CHUNK: usize = 64 * 1024;

/// Receiver-side wrapper around an exported byte sink.
///
/// Writes are invoked by the channel's sequencer thread in ioId order.
/// Once the sink fails (or the channel aborts), every later operation
/// fails with the original cause.
pub(crate) struct SinkEntry {
    sink: Mutex<Option<Box<dyn Write + Send>>>,
    dead: Mutex<Option<String>>,
}

impl SinkEntry {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            dead: Mutex::new(None),
        }
    }

    fn check_dead(&self) -> std::io::Result<()> {
        match self.dead.lock().as_deref() {
            Some(cause) => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, cause)),
            None => Ok(()),
        }
    }

    pub fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        self.check_dead()?;
        let mut guard = self.sink.lock();
        match guard.as_mut() {
            Some(sink) => sink.write_all(data),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "sink already closed",
            )),
        }
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.check_dead()?;
        let mut guard = self.sink.lock();
        match guard.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        }
    }

    /// Flushes and drops the sink. Idempotent.
    pub fn close(&self) -> std::io::Result<()> {
        let mut guard = self.sink.lock();
        match guard.take() {
            Some(mut sink) => sink.flush(),
            None => Ok(()),
        }
    }

    pub fn fail(&self, cause: &str) {
        let mut dead = self.dead.lock();
        if dead.is_none() {
            *dead = Some(cause.to_string());
        }
        drop(dead);
        // Drop the sink so a blocked reader of e.g. an os_pipe wakes up.
        self.sink.lock().take();
    }
}

impl ErrorPropagating for SinkEntry {
    fn propagate(&self, cause: &str) {
        self.fail(cause);
    }
}

/// Sending proxy for a sink exported by the remote peer.
///
/// Writes are flow-controlled by the per-pipe sliding window when the peer
/// advertises pipe throttling. Dropping an unclosed pipe releases the
/// remote export entry without closing the underlying sink; call
/// [`RemotePipe::close`] to close it.
pub struct RemotePipe {
    channel: Arc<Channel>,
    oid: u64,
    window: Arc<PipeWindow>,
    throttled: bool,
    closed: bool,
}

impl RemotePipe {
    pub(crate) fn new(
        channel: Arc<Channel>,
        oid: u64,
        window: Arc<PipeWindow>,
        throttled: bool,
    ) -> Self {
        Self {
            channel,
            oid,
            window,
            throttled,
            closed: false,
        }
    }

    pub fn oid(&self) -> u64 {
        self.oid
    }

    /// Streams `data` to the remote sink, blocking on window credit.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::PipeDead {
                cause: "pipe already closed".to_string(),
            });
        }
        let mut rest = data;
        while !rest.is_empty() {
            let n = if self.throttled {
                let max = self.window.max();
                // Demand at least a tenth of the window so a nearly-full
                // window is not nibbled away by tiny chunks, each of which
                // pays the full framing overhead.
                let demand = (max / 10).max(1).min(rest.len());
                let got = self.window.get(demand).await?;
                // Cap at half the window so the next chunk is in flight
                // while the previous ack is still returning.
                got.min(rest.len()).min((max / 2).max(1))
            } else {
                rest.len().min(UNTHROTTLED_CHUNK)
            };

            let payload = Bytes::copy_from_slice(&rest[..n]);
            let oid = self.oid;
            self.channel
                .send_io(move |io_id| Command::PipeChunk { io_id, oid, payload })?;
            if self.throttled {
                self.window.decrease(n);
            }
            rest = &rest[n..];
        }
        Ok(())
    }

    /// Orders a flush after everything written so far.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        if self.closed {
            return Ok(());
        }
        let oid = self.oid;
        self.channel
            .send_io(move |io_id| Command::PipeFlush { io_id, oid })
    }

    /// Closes the remote sink and releases its export entry.
    pub fn close(mut self) -> Result<(), ChannelError> {
        self.closed = true;
        let oid = self.oid;
        self.channel.drop_pipe_window(oid);
        self.channel
            .send_io(move |io_id| Command::PipeEof { io_id, oid })
    }
}

impl Drop for RemotePipe {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Scoped destruction stands in for the original's GC coupling:
        // release the remote export entry, leave the sink open.
        let oid = self.oid;
        self.channel.drop_pipe_window(oid);
        let _ = self
            .channel
            .send_io(move |io_id| Command::PipeUnexport { io_id, oid });
    }
}
