//! Native WebSocket transport for the connection manager
//!
//! Each socket runs as its own tokio task. Inbound traffic and lifecycle
//! changes come back to the driver loop as `SocketEvent`s over an unbounded
//! channel; outbound frames go to the task over a per-socket channel.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manager::{SocketEvent, SocketEventKind, Transport};
use crate::ws_state::{ChannelKey, SocketId};

pub struct TokioTransport {
    events: UnboundedSender<SocketEvent>,
    outbound: HashMap<(ChannelKey, SocketId), UnboundedSender<String>>,
}

impl TokioTransport {
    /// Create the transport and the receiver its sockets report to.
    pub fn new() -> (Self, UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            events: tx,
            outbound: HashMap::new(),
        };
        (transport, rx)
    }

    pub fn open_sockets(&self) -> usize {
        self.outbound.len()
    }
}

impl Transport for TokioTransport {
    fn open(&mut self, channel: &ChannelKey, socket: SocketId, url: &str) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound.insert((channel.clone(), socket), tx);
        tokio::spawn(run_socket(
            url.to_string(),
            channel.clone(),
            socket,
            rx,
            self.events.clone(),
        ));
        Ok(())
    }

    fn send(&mut self, channel: &ChannelKey, socket: SocketId, text: &str) -> Result<()> {
        let tx = self
            .outbound
            .get(&(channel.clone(), socket))
            .ok_or_else(|| Error::Transport(format!("socket {socket} on {channel} is gone")))?;
        tx.send(text.to_string())
            .map_err(|_| Error::Transport(format!("socket {socket} on {channel} stopped")))
    }

    fn close(&mut self, channel: &ChannelKey, socket: SocketId) {
        // Dropping the sender ends the socket task
        self.outbound.remove(&(channel.clone(), socket));
    }
}

async fn run_socket(
    url: String,
    channel: ChannelKey,
    socket: SocketId,
    mut outbound: UnboundedReceiver<String>,
    events: UnboundedSender<SocketEvent>,
) {
    let emit = |kind: SocketEventKind| {
        let _ = events.send(SocketEvent {
            channel: channel.clone(),
            socket,
            kind,
        });
    };

    info!(%channel, %socket, url = %url, "Connecting to WebSocket");

    let connected = tokio::select! {
        res = connect_async(url.as_str()) => res,
        None = outbound.recv() => {
            debug!(%channel, %socket, "Closed before the socket opened");
            return;
        }
    };
    let ws_stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!(%channel, %socket, error = %e, "Failed to connect");
            emit(SocketEventKind::Error(e.to_string()));
            return;
        }
    };

    info!(%channel, %socket, "WebSocket connected");
    emit(SocketEventKind::Opened);
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => emit(SocketEventKind::Message(text.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    warn!(%channel, %socket, reason = %reason, "WebSocket closed by server");
                    emit(SocketEventKind::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(%channel, %socket, error = %e, "WebSocket error");
                    emit(SocketEventKind::Error(e.to_string()));
                    break;
                }
                None => {
                    warn!(%channel, %socket, "WebSocket stream ended");
                    emit(SocketEventKind::Closed { reason: "stream ended".into() });
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(%channel, %socket, error = %e, "Failed to send frame");
                        emit(SocketEventKind::Error(e.to_string()));
                        break;
                    }
                }
                None => {
                    debug!(%channel, %socket, "Closing WebSocket");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
