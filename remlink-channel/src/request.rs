//! Request/response correlation and the inbound-call surface.
//!
//! Outgoing calls register a oneshot reply slot under their id; the reader
//! loop wakes them when the matching `UserResponse` arrives. Incoming
//! calls run through the embedder's `CallHandler` on a spawned worker.

use crate::channel::Channel;
use crate::error::ChannelError;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Boxed future returned by handlers and decorators.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Execution context handed to the inbound-call handler.
///
/// `context_oid` is the request's opaque deserialization-context reference
/// (0 when absent); the channel core passes it through untouched.
pub struct CallContext {
    pub channel: Arc<Channel>,
    pub context_oid: u64,
}

/// Performs inbound calls. The payload is whatever the remote embedder
/// serialized; the result (or failure message) is sent back verbatim.
pub trait CallHandler: Send + Sync + 'static {
    fn handle(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<Result<Bytes, String>>;
}

impl<F> CallHandler for F
where
    F: Fn(CallContext, Bytes) -> BoxFuture<Result<Bytes, String>> + Send + Sync + 'static,
{
    fn handle(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<Result<Bytes, String>> {
        self(ctx, payload)
    }
}

/// Vets inbound call payloads before execution. A rejection is reported to
/// the caller as a refused call, not a channel failure.
pub trait RoleChecker: Send + Sync + 'static {
    fn check(&self, payload: &Bytes) -> Result<(), String>;
}

/// Inbound payload allow/deny hook, consulted before the role check.
pub trait PayloadFilter: Send + Sync + 'static {
    fn accept(&self, payload: &Bytes) -> bool;
}

/// Wraps the execution of an inbound call.
pub trait CallDecorator: Send + Sync + 'static {
    fn decorate(&self, call: BoxFuture<Result<Bytes, String>>) -> BoxFuture<Result<Bytes, String>>;
}

/// What the reader loop delivers to a waiting caller.
pub(crate) enum CallReply {
    Success { payload: Bytes, response_io_id: u64 },
    Failure { message: String, response_io_id: u64 },
    Aborted { cause: String },
}

/// Registered reply slot for an in-flight outgoing call.
pub(crate) struct PendingEntry {
    pub tx: oneshot::Sender<CallReply>,
    /// Call-site description, kept when cause chaining is enabled.
    pub origin: Option<String>,
}

/// Re-check channel liveness at this interval while waiting for a reply.
const LIVENESS_RECHECK: Duration = Duration::from_secs(30);

/// A correlated outgoing call awaiting its response.
pub struct PendingCall {
    pub(crate) id: u64,
    pub(crate) rx: oneshot::Receiver<CallReply>,
    pub(crate) channel: Arc<Channel>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the response.
    ///
    /// Wakes every 30 seconds to re-check that the channel is still alive,
    /// so a reply lost to an ungraceful peer death cannot hang the caller
    /// forever. After a successful reply, waits for all remote I/O the
    /// responder promised before returning.
    pub async fn wait(mut self) -> Result<Bytes, ChannelError> {
        let reply = loop {
            tokio::select! {
                r = &mut self.rx => match r {
                    Ok(reply) => break reply,
                    // Reply slot dropped without an answer: cancelled.
                    Err(_) => return Err(ChannelError::Cancelled),
                },
                _ = tokio::time::sleep(LIVENESS_RECHECK) => {
                    if self.channel.is_in_closed() {
                        self.channel.forget_pending(self.id);
                        return Err(ChannelError::RequestAborted {
                            cause: self.channel.close_cause(),
                        });
                    }
                }
            }
        };
        match reply {
            CallReply::Success {
                payload,
                response_io_id,
            } => {
                // A sequencer shut down mid-teardown must not turn an
                // already-received successful response into an error.
                let _ = self.channel.sequencer().sync(response_io_id).await;
                Ok(payload)
            }
            CallReply::Failure {
                message,
                response_io_id,
            } => {
                // Still order the failure after the responder's I/O.
                let _ = self.channel.sequencer().sync(response_io_id).await;
                if message.starts_with(crate::channel::REFUSAL_PREFIX) {
                    Err(ChannelError::SecurityRefused(message))
                } else {
                    Err(ChannelError::RemoteCall { message })
                }
            }
            CallReply::Aborted { cause } => Err(ChannelError::RequestAborted { cause }),
        }
    }

    /// Abandons the call. With `may_interrupt`, additionally asks the peer
    /// to interrupt the executing callable (if the channel is still open
    /// for output). The call completes as cancelled either way.
    pub fn cancel(self, may_interrupt: bool) {
        self.channel.cancel_pending(self.id, may_interrupt);
    }
}
