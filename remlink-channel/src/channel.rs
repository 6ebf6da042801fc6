//! The channel: a bidirectional, multiplexed connection endpoint.
//!
//! One writer task serializes every outbound command, so the peer observes
//! commands in send order. One reader task receives and dispatches inbound
//! commands in wire order. Inbound requests run on spawned workers;
//! remote-invoked I/O runs on the sequencer thread, keyed by the peer's
//! ioIds.

use crate::config::Tunables;
use crate::error::ChannelError;
use crate::export::ExportTable;
use crate::pipe::{RemotePipe, SinkEntry};
use crate::request::{
    CallContext, CallDecorator, CallHandler, CallReply, PayloadFilter, PendingCall, PendingEntry,
    RoleChecker,
};
use crate::sequencer::Sequencer;
use crate::transport::{CommandReader, CommandTransport, CommandWriter};
use crate::window::PipeWindow;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use remlink_protocol::{Capability, Command, Mode};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

/// How long `close` waits for the peer's half of the shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker prefix for refusal responses, recognized by the calling side.
pub(crate) const REFUSAL_PREFIX: &str = "callable refused: ";

/// Output-side send state. The mutex is the channel's send lock: it orders
/// outbound commands and makes ioId allocation atomic with enqueueing.
struct SendState {
    tx: Option<mpsc::UnboundedSender<Command>>,
    last_io_id: u64,
    out_closed: bool,
}

struct LifeState {
    in_closed: bool,
    terminated: bool,
    cause: Option<String>,
}

/// Everything the builder resolved before the transport was negotiated.
pub(crate) struct ChannelParts {
    pub name: String,
    pub tunables: Tunables,
    pub local_capability: Capability,
    pub handler: Option<Arc<dyn CallHandler>>,
    pub role_checker: Option<Arc<dyn RoleChecker>>,
    pub payload_filter: Option<Arc<dyn PayloadFilter>>,
    pub decorators: Vec<Arc<dyn CallDecorator>>,
    pub arbitrary_callables: bool,
    pub properties: HashMap<String, serde_json::Value>,
}

/// A bidirectional, multiplexed connection to one remote peer.
pub struct Channel {
    name: String,
    tunables: Tunables,
    local_capability: Capability,
    remote_capability: Capability,
    mode: Mode,

    handler: Option<Arc<dyn CallHandler>>,
    role_checker: Option<Arc<dyn RoleChecker>>,
    payload_filter: Option<Arc<dyn PayloadFilter>>,
    decorators: Vec<Arc<dyn CallDecorator>>,
    arbitrary_callables: bool,

    exports: ExportTable,
    pipe_windows: DashMap<u64, Arc<PipeWindow>>,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    executing: Mutex<HashMap<u64, tokio::task::AbortHandle>>,
    sequencer: Sequencer,

    next_call_id: AtomicU64,
    send: Mutex<SendState>,
    life: Mutex<LifeState>,
    closed_notify: Notify,
    reader_abort: Mutex<Option<tokio::task::AbortHandle>>,
    properties: Mutex<HashMap<String, serde_json::Value>>,
}

impl Channel {
    /// Wires up the channel over a negotiated transport and spawns its
    /// reader and writer tasks.
    pub(crate) fn start(
        parts: ChannelParts,
        transport: CommandTransport,
        remote_capability: Capability,
        mode: Mode,
    ) -> Result<Arc<Self>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer::new(&parts.name)?;
        let channel = Arc::new(Channel {
            exports: ExportTable::new(parts.tunables.unexport_log_size),
            name: parts.name,
            tunables: parts.tunables,
            local_capability: parts.local_capability,
            remote_capability,
            mode,
            handler: parts.handler,
            role_checker: parts.role_checker,
            payload_filter: parts.payload_filter,
            decorators: parts.decorators,
            arbitrary_callables: parts.arbitrary_callables,
            pipe_windows: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            executing: Mutex::new(HashMap::new()),
            sequencer,
            next_call_id: AtomicU64::new(1),
            send: Mutex::new(SendState {
                tx: Some(tx),
                last_io_id: 0,
                out_closed: false,
            }),
            life: Mutex::new(LifeState {
                in_closed: false,
                terminated: false,
                cause: None,
            }),
            closed_notify: Notify::new(),
            reader_abort: Mutex::new(None),
            properties: Mutex::new(parts.properties),
        });

        tokio::spawn(writer_loop(channel.clone(), rx, transport.writer));
        let reader = tokio::spawn(reader_loop(channel.clone(), transport.reader));
        *channel.reader_abort.lock() = Some(reader.abort_handle());

        tracing::info!(
            name = %channel.name,
            %mode,
            remote = %channel.remote_capability,
            "channel established"
        );
        Ok(channel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn remote_capability(&self) -> Capability {
        self.remote_capability
    }

    // ------------------------------------------------------------------
    // Outbound calls

    /// Invokes the remote callable and waits for its result.
    pub async fn call(self: &Arc<Self>, payload: Bytes) -> Result<Bytes, ChannelError> {
        self.call_async(payload)?.wait().await
    }

    /// Starts a remote call without waiting.
    pub fn call_async(self: &Arc<Self>, payload: Bytes) -> Result<PendingCall, ChannelError> {
        self.call_async_with_context(payload, 0)
    }

    /// Starts a remote call carrying an opaque deserialization-context
    /// reference for the remote performer.
    pub fn call_async_with_context(
        self: &Arc<Self>,
        payload: Bytes,
        context_oid: u64,
    ) -> Result<PendingCall, ChannelError> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let origin = if self.tunables.chain_cause {
            Some(Backtrace::force_capture().to_string())
        } else {
            None
        };

        {
            let state = self.send.lock();
            if !state.out_closed {
                if let Some(sender) = &state.tx {
                    // Register the reply slot before the request can leave,
                    // then send while still holding the send lock so the
                    // lastIoId snapshot stays consistent with wire order.
                    self.pending.lock().insert(
                        id,
                        PendingEntry {
                            tx,
                            origin: origin.clone(),
                        },
                    );
                    let cmd = Command::UserRequest {
                        id,
                        last_io_id: state.last_io_id,
                        context_oid,
                        origin,
                        payload,
                    };
                    if sender.send(cmd).is_ok() {
                        tracing::debug!(id, "request sent");
                        return Ok(PendingCall {
                            id,
                            rx,
                            channel: self.clone(),
                        });
                    }
                    self.pending.lock().remove(&id);
                }
            }
        }
        Err(self.closed_error())
    }

    /// Abandons a pending call by id. With `may_interrupt`, also asks the
    /// peer to interrupt the executing callable.
    pub fn cancel(&self, id: u64, may_interrupt: bool) {
        let entry = self.pending.lock().remove(&id);
        if entry.is_none() {
            return;
        }
        // Dropping the reply slot completes the waiter as cancelled.
        drop(entry);
        tracing::debug!(id, may_interrupt, "cancelled pending call");
        if may_interrupt {
            if let Err(e) = self.send(Command::Cancel { id }) {
                tracing::debug!(id, "could not send cancel: {e}");
            }
        }
    }

    pub(crate) fn cancel_pending(&self, id: u64, may_interrupt: bool) {
        self.cancel(id, may_interrupt);
    }

    pub(crate) fn forget_pending(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// In-flight outgoing calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Inbound calls currently executing locally.
    pub fn executing_count(&self) -> usize {
        self.executing.lock().len()
    }

    // ------------------------------------------------------------------
    // Exports and pipes

    /// Exports a byte sink for the peer to stream into. Returns its OID,
    /// which the embedder communicates to the peer (typically inside a
    /// call payload).
    pub fn export_sink(&self, sink: Box<dyn std::io::Write + Send>) -> u64 {
        let entry = Arc::new(SinkEntry::new(sink));
        self.exports.export(entry.clone(), Some(entry))
    }

    /// Releases one reference to an exported object.
    pub fn unexport(&self, oid: u64) {
        self.exports.unexport(oid);
    }

    /// Pins an exported object against over-release.
    pub fn pin(&self, oid: u64) {
        self.exports.pin(oid);
    }

    /// The export table, for diagnostics.
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// A proxy for a sink the peer exported under `oid`.
    pub fn remote_pipe(self: &Arc<Self>, oid: u64) -> RemotePipe {
        let window = self
            .pipe_windows
            .entry(oid)
            .or_insert_with(|| Arc::new(PipeWindow::new(self.tunables.pipe_window_size)))
            .clone();
        let throttled = self.remote_capability.supports_pipe_throttling();
        RemotePipe::new(self.clone(), oid, window, throttled)
    }

    pub(crate) fn drop_pipe_window(&self, oid: u64) {
        self.pipe_windows.remove(&oid);
    }

    // ------------------------------------------------------------------
    // Properties

    pub fn set_property(&self, key: impl Into<String>, value: serde_json::Value) {
        self.properties.lock().insert(key.into(), value);
    }

    pub fn get_property(&self, key: &str) -> Option<serde_json::Value> {
        self.properties.lock().get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Orderly close: sends a close notification, waits for the peer's
    /// half of the shutdown (bounded), then terminates.
    pub async fn close(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.send.lock();
            if !state.out_closed {
                state.out_closed = true;
                if let Some(tx) = &state.tx {
                    let _ = tx.send(Command::Close {
                        cause: String::new(),
                    });
                }
                tracing::debug!(name = %self.name, "sent close notify");
            }
        }

        let waited = tokio::time::timeout(CLOSE_TIMEOUT, async {
            loop {
                let notified = self.closed_notify.notified();
                if self.is_in_closed() {
                    return;
                }
                notified.await;
            }
        })
        .await;
        if waited.is_err() {
            tracing::debug!(name = %self.name, "close timed out waiting for peer");
        }

        self.terminate("channel closed");
        Ok(())
    }

    /// Synchronous abort: fails every pending call, interrupts every
    /// executing call, poisons every pipe window, and aborts the export
    /// table. Idempotent; the first cause wins.
    pub fn terminate(&self, cause: &str) {
        {
            let mut life = self.life.lock();
            if life.terminated {
                return;
            }
            life.terminated = true;
            life.in_closed = true;
            if life.cause.is_none() {
                life.cause = Some(cause.to_string());
            }
        }
        tracing::info!(name = %self.name, cause, "channel terminated");

        {
            let mut state = self.send.lock();
            state.out_closed = true;
            state.tx = None;
        }

        let pending: Vec<PendingEntry> = {
            let mut map = self.pending.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in pending {
            let _ = entry.tx.send(CallReply::Aborted {
                cause: cause.to_string(),
            });
        }

        let executing: Vec<tokio::task::AbortHandle> = {
            let mut map = self.executing.lock();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in executing {
            handle.abort();
        }

        for window in self.pipe_windows.iter() {
            window.dead(cause);
        }
        self.pipe_windows.clear();

        self.exports.abort(cause);
        self.sequencer.shutdown();

        if let Some(handle) = self.reader_abort.lock().take() {
            handle.abort();
        }
        self.closed_notify.notify_waiters();
    }

    /// Waits until the channel has fully terminated.
    pub async fn join(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.life.lock().terminated {
                return;
            }
            notified.await;
        }
    }

    /// Bounded `join`; true when the channel terminated within `timeout`.
    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.join()).await.is_ok()
    }

    /// Waits until every remote-invoked I/O received so far has executed.
    pub async fn sync_io(&self) -> Result<(), ChannelError> {
        self.sequencer.drain().await
    }

    pub fn is_in_closed(&self) -> bool {
        self.life.lock().in_closed
    }

    pub fn is_out_closed(&self) -> bool {
        self.send.lock().out_closed
    }

    pub fn is_terminated(&self) -> bool {
        self.life.lock().terminated
    }

    pub(crate) fn close_cause(&self) -> String {
        self.life
            .lock()
            .cause
            .clone()
            .unwrap_or_else(|| "channel closed".to_string())
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::Closed {
            cause: self.close_cause(),
        }
    }

    // ------------------------------------------------------------------
    // Sending

    /// Enqueues a command for the writer task. Fails once out-closed.
    pub(crate) fn send(&self, cmd: Command) -> Result<(), ChannelError> {
        {
            let state = self.send.lock();
            if !state.out_closed {
                if let Some(tx) = &state.tx {
                    if tx.send(cmd).is_ok() {
                        return Ok(());
                    }
                }
            }
        }
        Err(self.closed_error())
    }

    /// Allocates the next ioId and enqueues the command it identifies,
    /// atomically with respect to other senders.
    pub(crate) fn send_io(
        &self,
        make: impl FnOnce(u64) -> Command,
    ) -> Result<(), ChannelError> {
        {
            let mut state = self.send.lock();
            if !state.out_closed {
                let io_id = state.last_io_id + 1;
                let sent = state
                    .tx
                    .as_ref()
                    .map(|tx| tx.send(make(io_id)).is_ok())
                    .unwrap_or(false);
                if sent {
                    state.last_io_id = io_id;
                    return Ok(());
                }
            }
        }
        Err(self.closed_error())
    }

    pub(crate) fn last_io_id(&self) -> u64 {
        self.send.lock().last_io_id
    }

    pub(crate) fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    // ------------------------------------------------------------------
    // Inbound dispatch

    pub(crate) fn mark_in_closed(&self) {
        self.life.lock().in_closed = true;
    }

    /// Handles one inbound command. Returns false when the reader loop
    /// should stop.
    fn dispatch(self: &Arc<Self>, cmd: Command) -> bool {
        tracing::trace!(kind = cmd.kind(), "dispatch");
        match cmd {
            Command::UserRequest {
                id,
                last_io_id,
                context_oid,
                origin,
                payload,
            } => self.handle_user_request(id, last_io_id, context_oid, origin, payload),

            Command::UserResponse {
                id,
                response_io_id,
                is_exception,
                payload,
            } => {
                let entry = self.pending.lock().remove(&id);
                match entry {
                    Some(entry) => {
                        let reply = if is_exception {
                            let mut message = String::from_utf8_lossy(&payload).into_owned();
                            if let Some(origin) = entry.origin {
                                message.push_str("\n  call site:\n");
                                message.push_str(&origin);
                            }
                            CallReply::Failure {
                                message,
                                response_io_id,
                            }
                        } else {
                            CallReply::Success {
                                payload,
                                response_io_id,
                            }
                        };
                        let _ = entry.tx.send(reply);
                    }
                    None => tracing::debug!(id, "response for unknown request (cancelled?)"),
                }
            }

            Command::Cancel { id } => {
                if let Some(handle) = self.executing.lock().remove(&id) {
                    tracing::debug!(id, "interrupting executing call");
                    handle.abort();
                }
            }

            Command::PipeChunk { io_id, oid, payload } => {
                let sink = self.lookup_sink(oid);
                let channel = self.clone();
                let size = payload.len() as u32;
                self.sequencer.submit(
                    io_id,
                    Box::new(move || {
                        let Some(sink) = sink else { return };
                        match sink.write_all(&payload) {
                            Ok(()) => {
                                if channel.remote_capability.supports_pipe_throttling() {
                                    let _ = channel.send(Command::PipeAck { oid, size });
                                }
                            }
                            Err(e) => {
                                let cause = e.to_string();
                                sink.fail(&cause);
                                let _ =
                                    channel.send(Command::PipeDeadWriter { oid, cause });
                            }
                        }
                    }),
                );
            }

            Command::PipeAck { oid, size } => match self.pipe_windows.get(&oid) {
                Some(window) => window.increase(size as usize),
                None => tracing::debug!(oid, "ack for unknown pipe"),
            },

            Command::PipeEof { io_id, oid } => {
                let sink = self.lookup_sink(oid);
                self.sequencer.submit(
                    io_id,
                    Box::new(move || {
                        if let Some(sink) = sink {
                            if let Err(e) = sink.close() {
                                tracing::warn!(oid, "sink close failed: {e}");
                            }
                        }
                    }),
                );
                self.exports.unexport(oid);
            }

            Command::PipeFlush { io_id, oid } => {
                let sink = self.lookup_sink(oid);
                let channel = self.clone();
                self.sequencer.submit(
                    io_id,
                    Box::new(move || {
                        let Some(sink) = sink else { return };
                        if let Err(e) = sink.flush() {
                            let cause = e.to_string();
                            sink.fail(&cause);
                            let _ = channel.send(Command::PipeDeadWriter { oid, cause });
                        }
                    }),
                );
            }

            Command::PipeUnexport { io_id, oid } => {
                let channel = self.clone();
                self.sequencer.submit(
                    io_id,
                    Box::new(move || {
                        channel.exports.unexport(oid);
                    }),
                );
            }

            Command::PipeDeadWriter { oid, cause } => {
                if let Some(window) = self.pipe_windows.get(&oid) {
                    window.dead(&cause);
                } else {
                    tracing::debug!(oid, "dead-writer notice for unknown pipe");
                }
            }

            Command::Close { cause } => {
                let cause = if cause.is_empty() {
                    "channel closed by peer".to_string()
                } else {
                    cause
                };
                tracing::debug!(name = %self.name, %cause, "received close notify");
                {
                    let mut state = self.send.lock();
                    if !state.out_closed {
                        state.out_closed = true;
                        if let Some(tx) = &state.tx {
                            let _ = tx.send(Command::Close {
                                cause: String::new(),
                            });
                        }
                    }
                }
                self.mark_in_closed();
                self.terminate(&cause);
                return false;
            }
        }
        true
    }

    fn handle_user_request(
        self: &Arc<Self>,
        id: u64,
        last_io_id: u64,
        context_oid: u64,
        origin: Option<String>,
        payload: Bytes,
    ) {
        if let Some(origin) = &origin {
            tracing::trace!(id, %origin, "request call site");
        }

        if let Some(filter) = &self.payload_filter {
            if !filter.accept(&payload) {
                tracing::warn!(id, "inbound payload rejected by filter");
                self.respond_refused(id, "payload rejected by filter");
                return;
            }
        }
        if let Some(checker) = &self.role_checker {
            if let Err(reason) = checker.check(&payload) {
                tracing::warn!(id, %reason, "inbound callable refused by role check");
                self.respond_refused(id, &reason);
                return;
            }
        } else if !self.arbitrary_callables {
            tracing::warn!(id, "arbitrary callables are disabled on this channel");
            self.respond_refused(id, "this channel does not accept arbitrary callables");
            return;
        }

        let Some(handler) = self.handler.clone() else {
            self.respond_refused(id, "no call handler installed");
            return;
        };

        // The worker must not start (or finish) before it is registered in
        // the executing map, or a racing cancel could miss it.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let channel = self.clone();
        let task = tokio::spawn(async move {
            let _ = ready_rx.await;

            // Everything the caller sent before this request must have
            // executed locally first.
            if channel.sequencer.sync(last_io_id).await.is_err() {
                channel.executing.lock().remove(&id);
                return;
            }

            let mut call = handler.handle(
                CallContext {
                    channel: channel.clone(),
                    context_oid,
                },
                payload,
            );
            for decorator in &channel.decorators {
                call = decorator.decorate(call);
            }
            let result = call.await;

            channel.executing.lock().remove(&id);
            let response_io_id = channel.last_io_id();
            let cmd = match result {
                Ok(payload) => Command::UserResponse {
                    id,
                    response_io_id,
                    is_exception: false,
                    payload,
                },
                Err(message) => Command::UserResponse {
                    id,
                    response_io_id,
                    is_exception: true,
                    payload: Bytes::from(message.into_bytes()),
                },
            };
            if let Err(e) = channel.send(cmd) {
                tracing::debug!(id, "could not send response: {e}");
            }
        });
        self.executing.lock().insert(id, task.abort_handle());
        let _ = ready_tx.send(());
    }

    fn respond_refused(&self, id: u64, reason: &str) {
        let message = format!("{REFUSAL_PREFIX}{reason}");
        let cmd = Command::UserResponse {
            id,
            response_io_id: self.last_io_id(),
            is_exception: true,
            payload: Bytes::from(message.into_bytes()),
        };
        if let Err(e) = self.send(cmd) {
            tracing::debug!(id, "could not send refusal: {e}");
        }
    }

    fn lookup_sink(&self, oid: u64) -> Option<Arc<SinkEntry>> {
        match self.exports.get(oid) {
            Ok(object) => match object.downcast::<SinkEntry>() {
                Ok(sink) => Some(sink),
                Err(_) => {
                    tracing::warn!(oid, "exported object is not a pipe sink");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(oid, "pipe command for invalid object: {e}");
                None
            }
        }
    }
}

async fn writer_loop(
    channel: Arc<Channel>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    mut writer: CommandWriter,
) {
    while let Some(cmd) = rx.recv().await {
        tracing::trace!(kind = cmd.kind(), "write");
        if let Err(e) = writer.write(&cmd).await {
            tracing::debug!(name = %channel.name, "write failed: {e}");
            channel.terminate(&format!("write failed: {e}"));
            break;
        }
    }
    writer.shutdown().await;
}

async fn reader_loop(channel: Arc<Channel>, mut reader: CommandReader) {
    loop {
        match reader.read().await {
            Ok(Some(cmd)) => {
                if !channel.dispatch(cmd) {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(name = %channel.name, "peer closed the connection");
                channel.mark_in_closed();
                channel.terminate("peer closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(name = %channel.name, "read failed: {e}");
                channel.mark_in_closed();
                channel.terminate(&format!("read failed: {e}"));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChannelBuilder;
    use crate::request::BoxFuture;

    fn echo_handler() -> Arc<dyn CallHandler> {
        Arc::new(
            |_ctx: CallContext, payload: Bytes| -> BoxFuture<Result<Bytes, String>> {
                Box::pin(async move { Ok(payload) })
            },
        )
    }

    fn sleepy_handler() -> Arc<dyn CallHandler> {
        Arc::new(
            |_ctx: CallContext, _payload: Bytes| -> BoxFuture<Result<Bytes, String>> {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Bytes::new())
                })
            },
        )
    }

    async fn connected_pair(
        a: ChannelBuilder,
        b: ChannelBuilder,
    ) -> (Arc<Channel>, Arc<Channel>) {
        let (left, right) = tokio::io::duplex(256 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        let (a, b) = tokio::join!(a.build(lr, lw), b.build(rr, rw));
        (a.unwrap(), b.unwrap())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct CollectSink(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CollectSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_echo_call_with_negotiation() {
        let (a, b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(echo_handler()),
        )
        .await;
        assert_eq!(b.mode(), Mode::Binary);

        let reply = a.call(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(&reply[..], b"hello");
        assert_eq!(a.pending_count(), 0);
        assert_eq!(b.pending_count(), 0);

        a.close().await.unwrap();
        assert!(b.join_timeout(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_text_mode_echo() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Text),
            ChannelBuilder::new("agent").with_handler(echo_handler()),
        )
        .await;
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let reply = a.call(Bytes::from(payload.clone())).await.unwrap();
        assert_eq!(&reply[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_chunked_echo_with_tiny_frames() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller")
                .with_mode(Mode::Binary)
                .with_frame_size(115),
            ChannelBuilder::new("agent")
                .with_frame_size(115)
                .with_handler(echo_handler()),
        )
        .await;
        let payload: Vec<u8> = (0..4096u32).map(|i| (i * 13) as u8).collect();
        let reply = a.call(Bytes::from(payload.clone())).await.unwrap();
        assert_eq!(&reply[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_concurrent_calls_multiplex() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(echo_handler()),
        )
        .await;

        let mut waiters = Vec::new();
        for i in 0..32u32 {
            let a = a.clone();
            waiters.push(tokio::spawn(async move {
                let payload = Bytes::from(i.to_be_bytes().to_vec());
                (i, a.call(payload).await.unwrap())
            }));
        }
        for waiter in waiters {
            let (i, reply) = waiter.await.unwrap();
            assert_eq!(&reply[..], &i.to_be_bytes()[..]);
        }
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_async_cancel_interrupts_remote() {
        let (a, b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(sleepy_handler()),
        )
        .await;

        let call = a.call_async(Bytes::from_static(b"slow")).unwrap();
        let id = call.id();
        let waiter = tokio::spawn(call.wait());

        {
            let b = b.clone();
            wait_until(move || b.executing_count() == 1).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.cancel(id, true);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ChannelError::Cancelled)));

        let b2 = b.clone();
        wait_until(move || b2.executing_count() == 0).await;
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flow_controlled_pipe_delivers_in_order() {
        let (a, b) = connected_pair(
            ChannelBuilder::new("sender")
                .with_mode(Mode::Binary)
                .with_pipe_window_size(8 * 1024),
            ChannelBuilder::new("receiver").with_pipe_window_size(8 * 1024),
        )
        .await;

        let collected = Arc::new(Mutex::new(Vec::new()));
        let oid = b.export_sink(Box::new(CollectSink(collected.clone())));

        let data: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 31) as u8).collect();
        let mut pipe = a.remote_pipe(oid);
        pipe.write(&data).await.unwrap();
        pipe.close().unwrap();

        {
            let collected = collected.clone();
            let want = data.len();
            wait_until(move || collected.lock().len() == want).await;
        }
        assert_eq!(&*collected.lock(), &data);
        // EOF released the receiver-side export entry.
        let b2 = b.clone();
        wait_until(move || b2.exports().count() == 0).await;
    }

    #[tokio::test]
    async fn test_pipe_writes_execute_before_subsequent_call() {
        let collected = Arc::new(Mutex::new(Vec::new()));

        let seen = collected.clone();
        let length_handler: Arc<dyn CallHandler> = Arc::new(
            move |_ctx: CallContext, _payload: Bytes| -> BoxFuture<Result<Bytes, String>> {
                let len = seen.lock().len() as u64;
                Box::pin(async move { Ok(Bytes::from(len.to_be_bytes().to_vec())) })
            },
        );

        let (a, b) = connected_pair(
            ChannelBuilder::new("sender").with_mode(Mode::Binary),
            ChannelBuilder::new("receiver").with_handler(length_handler),
        )
        .await;

        let oid = b.export_sink(Box::new(CollectSink(collected.clone())));
        let data = vec![0x5au8; 64 * 1024];
        let mut pipe = a.remote_pipe(oid);
        pipe.write(&data).await.unwrap();

        // The request trails the chunks; the handler must observe them all.
        let reply = a.call(Bytes::new()).await.unwrap();
        let seen_len = u64::from_be_bytes(reply[..8].try_into().unwrap());
        assert_eq!(seen_len, data.len() as u64);
    }

    #[tokio::test]
    async fn test_dead_sink_poisons_sender_window() {
        struct FailingSink;
        impl std::io::Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "sink exploded",
                ))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let (a, b) = connected_pair(
            ChannelBuilder::new("sender")
                .with_mode(Mode::Binary)
                .with_pipe_window_size(4 * 1024),
            ChannelBuilder::new("receiver"),
        )
        .await;

        let oid = b.export_sink(Box::new(FailingSink));
        let mut pipe = a.remote_pipe(oid);

        // Keep writing until the dead-writer notice poisons the window.
        let data = vec![1u8; 1024];
        let mut saw_dead = false;
        for _ in 0..200 {
            match pipe.write(&data).await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(ChannelError::PipeDead { cause }) => {
                    assert!(cause.contains("sink exploded"));
                    saw_dead = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_dead);
    }

    #[tokio::test]
    async fn test_close_drains_pending_calls() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(sleepy_handler()),
        )
        .await;

        let call = a.call_async(Bytes::from_static(b"blocked")).unwrap();
        let waiter = tokio::spawn(call.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.close().await.unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ChannelError::RequestAborted { .. })));
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_after_close_fails_immediately() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(echo_handler()),
        )
        .await;
        a.close().await.unwrap();

        let err = a.call(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_refuses_arbitrary_callables_when_disabled() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent")
                .with_handler(echo_handler())
                .with_arbitrary_callables(false),
        )
        .await;

        let err = a.call(Bytes::from_static(b"anything")).await.unwrap_err();
        assert!(matches!(err, ChannelError::SecurityRefused(_)));
    }

    #[tokio::test]
    async fn test_role_checker_gates_calls() {
        struct OnlyPing;
        impl RoleChecker for OnlyPing {
            fn check(&self, payload: &Bytes) -> Result<(), String> {
                if &payload[..] == b"ping" {
                    Ok(())
                } else {
                    Err("only ping is allowed".to_string())
                }
            }
        }

        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent")
                .with_handler(echo_handler())
                .with_arbitrary_callables(false)
                .with_role_checker(Arc::new(OnlyPing)),
        )
        .await;

        assert_eq!(
            &a.call(Bytes::from_static(b"ping")).await.unwrap()[..],
            b"ping"
        );
        let err = a.call(Bytes::from_static(b"rm -rf")).await.unwrap_err();
        assert!(matches!(err, ChannelError::SecurityRefused(_)));
    }

    #[tokio::test]
    async fn test_payload_filter_rejects_before_execution() {
        struct NoBinaryZero;
        impl PayloadFilter for NoBinaryZero {
            fn accept(&self, payload: &Bytes) -> bool {
                !payload.contains(&0u8)
            }
        }

        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent")
                .with_handler(echo_handler())
                .with_payload_filter(Arc::new(NoBinaryZero)),
        )
        .await;

        assert_eq!(&a.call(Bytes::from_static(b"ok")).await.unwrap()[..], b"ok");
        let err = a.call(Bytes::from_static(&[1, 0, 1])).await.unwrap_err();
        assert!(matches!(err, ChannelError::SecurityRefused(_)));
    }

    #[tokio::test]
    async fn test_decorators_wrap_execution() {
        struct Suffix(&'static [u8]);
        impl CallDecorator for Suffix {
            fn decorate(
                &self,
                call: crate::request::BoxFuture<Result<Bytes, String>>,
            ) -> crate::request::BoxFuture<Result<Bytes, String>> {
                let suffix = self.0;
                Box::pin(async move {
                    let mut out = call.await?.to_vec();
                    out.extend_from_slice(suffix);
                    Ok(Bytes::from(out))
                })
            }
        }

        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent")
                .with_handler(echo_handler())
                .with_decorator(Arc::new(Suffix(b"-first")))
                .with_decorator(Arc::new(Suffix(b"-second"))),
        )
        .await;

        // Decorators apply in registration order, innermost first.
        let reply = a.call(Bytes::from_static(b"base")).await.unwrap();
        assert_eq!(&reply[..], b"base-first-second");
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_message() {
        let failing: Arc<dyn CallHandler> = Arc::new(
            |_ctx: CallContext, _payload: Bytes| -> BoxFuture<Result<Bytes, String>> {
                Box::pin(async move { Err("division by zero".to_string()) })
            },
        );
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(failing),
        )
        .await;

        let err = a.call(Bytes::from_static(b"compute")).await.unwrap_err();
        match err {
            ChannelError::RemoteCall { message } => assert!(message.contains("division by zero")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_properties() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller")
                .with_mode(Mode::Binary)
                .with_property("side", serde_json::json!("controller")),
            ChannelBuilder::new("agent"),
        )
        .await;
        assert_eq!(
            a.get_property("side"),
            Some(serde_json::json!("controller"))
        );
        a.set_property("ready", serde_json::json!(true));
        assert_eq!(a.get_property("ready"), Some(serde_json::json!(true)));
        assert_eq!(a.get_property("missing"), None);
    }

    #[tokio::test]
    async fn test_terminate_fails_everything() {
        let (a, _b) = connected_pair(
            ChannelBuilder::new("controller").with_mode(Mode::Binary),
            ChannelBuilder::new("agent").with_handler(sleepy_handler()),
        )
        .await;

        let call = a.call_async(Bytes::from_static(b"blocked")).unwrap();
        let waiter = tokio::spawn(call.wait());
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.terminate("cable cut");

        let result = waiter.await.unwrap();
        match result {
            Err(ChannelError::RequestAborted { cause }) => assert!(cause.contains("cable cut")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(a.is_terminated());
        assert!(a.is_out_closed());
        assert_eq!(a.pending_count(), 0);
    }
}
