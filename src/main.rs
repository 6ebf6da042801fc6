//! remlink - bidirectional remoting channel
//!
//! Demo agent: accepts TCP connections and serves an echo call handler
//! over a negotiated channel. Useful as a smoke-test peer and as a
//! reference for embedding the channel.

use bytes::Bytes;
use remlink_channel::{BoxFuture, CallContext, CallHandler, Channel, ChannelBuilder, Mode};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Answers every call with its own payload.
struct EchoHandler;

impl CallHandler for EchoHandler {
    fn handle(&self, ctx: CallContext, payload: Bytes) -> BoxFuture<Result<Bytes, String>> {
        tracing::info!(
            channel = %ctx.channel.name(),
            bytes = payload.len(),
            "echoing call"
        );
        Box::pin(async move { Ok(payload) })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("REMLINK_BIND").unwrap_or_else(|_| "127.0.0.1:7611".to_string());
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("remlink agent listening on {bind}");

    let handler: Arc<dyn CallHandler> = Arc::new(EchoHandler);

    loop {
        let (socket, addr) = listener.accept().await?;
        tracing::info!("peer connected: {addr}");

        let handler = handler.clone();
        tokio::spawn(async move {
            let channel: Arc<Channel> = match ChannelBuilder::new(format!("agent:{addr}"))
                .with_mode(Mode::Binary)
                .with_handler(handler)
                .build_socket(socket)
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!("handshake with {addr} failed: {e}");
                    return;
                }
            };

            channel.join().await;
            tracing::info!("peer disconnected: {addr}");
        });
    }
}
