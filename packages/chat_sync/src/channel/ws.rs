use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelEvent, ConnectionId, Transport};
use crate::error::ChannelError;

/// WebSocket transport over tokio-tungstenite.
///
/// Each `open` spawns one task that owns the socket: it connects, pumps
/// inbound frames into the event sender and writes queued outbound frames.
/// The task always finishes by reporting `Closed` for its connection id.
pub struct WsTransport {
    events: mpsc::UnboundedSender<ChannelEvent>,
    live: Option<LiveConnection>,
}

struct LiveConnection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<tungstenite::Message>,
    cancel: CancellationToken,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { events, live: None }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str, connection: ConnectionId) {
        self.close();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(
            url.to_string(),
            connection,
            outbound_rx,
            self.events.clone(),
            cancel.clone(),
        ));
        self.live = Some(LiveConnection {
            id: connection,
            outbound: outbound_tx,
            cancel,
        });
    }

    fn send(&mut self, frame: String) -> Result<(), ChannelError> {
        let live = self.live.as_ref().ok_or(ChannelError::NotConnected)?;
        live.outbound
            .send(tungstenite::Message::Text(frame.into()))
            .map_err(|_| ChannelError::Transport(format!("connection {} writer has stopped", live.id)))
    }

    fn close(&mut self) {
        if let Some(live) = self.live.take() {
            debug!(connection = %live.id, "closing websocket");
            live.cancel.cancel();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    url: String,
    connection: ConnectionId,
    mut outbound: mpsc::UnboundedReceiver<tungstenite::Message>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = events.send(ChannelEvent::Closed { connection, error: None });
            return;
        }
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
    };

    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = events.send(ChannelEvent::Closed {
                connection,
                error: Some(e.to_string()),
            });
            return;
        }
    };

    info!(connection = %connection, "websocket connected");
    let _ = events.send(ChannelEvent::Opened { connection });

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let error = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                break None;
            }

            Some(msg) = outbound.recv() => {
                if let Err(e) = ws_write.send(msg).await {
                    break Some(e.to_string());
                }
            }

            incoming = ws_read.next() => {
                match incoming {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let _ = events.send(ChannelEvent::Frame {
                            connection,
                            text: text.to_string(),
                        });
                    }
                    Some(Ok(tungstenite::Message::Binary(bytes))) => {
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                let _ = events.send(ChannelEvent::Frame { connection, text });
                            }
                            Err(_) => warn!(connection = %connection, "dropping non-UTF-8 binary frame"),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        debug!(connection = %connection, ?frame, "server closed connection");
                        break None;
                    }
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            }
        }
    };

    let _ = events.send(ChannelEvent::Closed { connection, error });
}
