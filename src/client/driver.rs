//! Socket driver for the client runtime.
//!
//! Owns the actual WebSocket connection for embedders that run the
//! dashboard outside a browser (headless tooling, TUIs). Dials the hub
//! or an agent, feeds inbound frames into the [`ClientRuntime`], drains
//! its outbox after every event, and re-dials on loss with the
//! runtime's exponential backoff (one attempt per interval).

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ClientRuntime, TerminalHost};
use crate::protocol::ClientRequest;

/// Outcome of one connection attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed or the link dropped; the driver should back off
    /// and re-dial.
    Lost,
    /// The embedder asked to stop.
    Stopped,
}

/// Connect once and pump frames until the link drops or `stop` fires.
///
/// The embedder composes this with [`super::ReconnectBackoff`]:
///
/// ```no_run
/// # async fn example<H: claude_relay::client::TerminalHost>(
/// #     mut runtime: claude_relay::client::ClientRuntime<H>,
/// # ) {
/// let url = "wss://hub.example:8443/?token=secret";
/// loop {
///     let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
///     drop(stop_tx);
///     match claude_relay::client::driver::run_connection(url, &mut runtime, stop_rx).await {
///         Ok(claude_relay::client::driver::SessionEnd::Stopped) => break,
///         _ => {
///             let delay = runtime.backoff.next_delay();
///             tokio::time::sleep(delay).await;
///         }
///     }
/// }
/// # }
/// ```
pub async fn run_connection<H: TerminalHost>(
    url: &str,
    runtime: &mut ClientRuntime<H>,
    mut stop: tokio::sync::oneshot::Receiver<()>,
) -> Result<SessionEnd, tokio_tungstenite::tungstenite::Error> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await?;
    info!("client socket connected");
    runtime.backoff.reset();

    let (mut sink, mut source) = stream.split();

    // Anything queued while disconnected goes out first.
    for request in runtime.take_outbox() {
        send_request(&mut sink, &request).await?;
    }

    let mut frame_tick = tokio::time::interval(std::time::Duration::from_millis(16));
    frame_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        runtime.handle_raw(&text);
                        for request in runtime.take_outbox() {
                            send_request(&mut sink, &request).await?;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "server closed connection");
                        return Ok(SessionEnd::Lost);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "client socket error");
                        return Ok(SessionEnd::Lost);
                    }
                    None => return Ok(SessionEnd::Lost),
                }
            }
            // Paced scrollback writes ride the same cadence a browser's
            // animation frames would.
            _ = frame_tick.tick() => {
                runtime.on_animation_tick();
            }
            _ = &mut stop => {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(SessionEnd::Stopped);
            }
        }
    }
}

async fn send_request(
    sink: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    request: &ClientRequest,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let text = match serde_json::to_string(request) {
        Ok(text) => text,
        Err(_) => return Ok(()),
    };
    sink.send(Message::Text(text)).await
}
