//! Channel construction.

use crate::channel::{Channel, ChannelParts};
use crate::config::Tunables;
use crate::error::ChannelError;
use crate::handshake::{negotiate, HeaderSink, Negotiated, Negotiation};
use crate::request::{CallDecorator, CallHandler, PayloadFilter, RoleChecker};
use crate::transport::CommandTransport;
use remlink_protocol::{Capability, Mode, DEFAULT_FRAME_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Configures and builds a [`Channel`].
///
/// At least one of the two peers must preset a mode; two `Negotiate` peers
/// would each wait forever for the other's announcement.
pub struct ChannelBuilder {
    name: String,
    mode: Mode,
    capability: Capability,
    tunables: Tunables,
    frame_size: usize,
    header_sink: Option<HeaderSink>,
    handler: Option<Arc<dyn CallHandler>>,
    role_checker: Option<Arc<dyn RoleChecker>>,
    payload_filter: Option<Arc<dyn PayloadFilter>>,
    decorators: Vec<Arc<dyn CallDecorator>>,
    arbitrary_callables: bool,
    properties: HashMap<String, serde_json::Value>,
}

impl ChannelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Negotiate,
            capability: Capability::current(),
            tunables: Tunables::from_env(),
            frame_size: DEFAULT_FRAME_SIZE,
            header_sink: None,
            handler: None,
            role_checker: None,
            payload_filter: None,
            decorators: Vec::new(),
            arbitrary_callables: true,
            properties: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    /// Per-chunk payload size for the chunked transport. Mostly useful in
    /// tests that exercise unaligned chunk boundaries.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Observer for bytes consumed before the handshake completes, e.g.
    /// banner noise from an outer transport.
    pub fn with_header_sink(mut self, sink: HeaderSink) -> Self {
        self.header_sink = Some(sink);
        self
    }

    /// Installs the performer for inbound calls.
    pub fn with_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_role_checker(mut self, checker: Arc<dyn RoleChecker>) -> Self {
        self.role_checker = Some(checker);
        self
    }

    pub fn with_payload_filter(mut self, filter: Arc<dyn PayloadFilter>) -> Self {
        self.payload_filter = Some(filter);
        self
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn CallDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    /// Whether inbound calls are executed without a role check. Channels
    /// facing untrusted peers should set this to false and install a
    /// [`RoleChecker`].
    pub fn with_arbitrary_callables(mut self, allowed: bool) -> Self {
        self.arbitrary_callables = allowed;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Overrides the per-pipe send window for this channel.
    pub fn with_pipe_window_size(mut self, size: usize) -> Self {
        self.tunables.pipe_window_size = size;
        self
    }

    /// Overrides every tunable at once; tests use this to avoid touching
    /// process environment.
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Performs the handshake over a read/write stream pair and builds the
    /// channel.
    pub async fn build<R, W>(self, reader: R, writer: W) -> Result<Arc<Channel>, ChannelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let negotiation = Negotiation {
            mode: self.mode,
            capability: self.capability,
            frame_size: self.frame_size,
            header_sink: self.header_sink,
        };
        let Negotiated {
            transport,
            remote_capability,
            mode,
        } = negotiate(Box::new(reader), Box::new(writer), negotiation).await?;

        Channel::start(
            ChannelParts {
                name: self.name,
                tunables: self.tunables,
                local_capability: self.capability,
                handler: self.handler,
                role_checker: self.role_checker,
                payload_filter: self.payload_filter,
                decorators: self.decorators,
                arbitrary_callables: self.arbitrary_callables,
                properties: self.properties,
            },
            transport,
            remote_capability,
            mode,
        )
    }

    /// Builds over a TCP socket.
    pub async fn build_socket(self, socket: TcpStream) -> Result<Arc<Channel>, ChannelError> {
        socket.set_nodelay(true).ok();
        let (reader, writer) = socket.into_split();
        self.build(reader, writer).await
    }

    /// Builds over an already-negotiated transport, skipping the handshake.
    pub fn build_transport(
        self,
        transport: CommandTransport,
        remote_capability: Capability,
        mode: Mode,
    ) -> Result<Arc<Channel>, ChannelError> {
        Channel::start(
            ChannelParts {
                name: self.name,
                tunables: self.tunables,
                local_capability: self.capability,
                handler: self.handler,
                role_checker: self.role_checker,
                payload_filter: self.payload_filter,
                decorators: self.decorators,
                arbitrary_callables: self.arbitrary_callables,
                properties: self.properties,
            },
            transport,
            remote_capability,
            mode,
        )
    }
}
