//! The persistent link to the control server.
//!
//! [`ConnectionManager::run`] keeps the agent connected for the life of the
//! process: connect, listen until the socket ends, wait a fixed delay, repeat.
//! Outbound events reach the socket through the session's outbound channel,
//! which is attached only while a link is up.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::config::AgentSettings;
use crate::dispatcher::Router;
use crate::endpoints;
use crate::error::ConnectionError;
use crate::protocol::{InboundCommand, OutboundEvent};
use crate::session::{AgentSession, ConnectionState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub server_url: String,
    pub api_key: String,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_agent(settings: &AgentSettings, api_key: impl Into<String>) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            api_key: api_key.into(),
            handshake_timeout: settings.handshake_timeout(),
            reconnect_delay: settings.reconnect_delay(),
        }
    }
}

/// An open socket that finished its handshake window.
pub struct Link {
    socket: Socket,
    /// Frames that arrived before the `connected` acknowledgement.
    early_frames: Vec<String>,
}

impl Link {
    pub fn early_frames(&self) -> &[String] {
        &self.early_frames
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    session: Arc<AgentSession>,
    router: Arc<Router>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, session: Arc<AgentSession>, router: Arc<Router>) -> Self {
        Self {
            settings,
            session,
            router,
        }
    }

    /// Opens the socket and waits for the server's `connected` frame.
    ///
    /// Without an acknowledgement inside the handshake timeout the link is
    /// still returned, with the session flagged degraded.
    pub async fn connect(&self) -> Result<Link, ConnectionError> {
        let url = endpoints::agent_socket_url(&self.settings.server_url, &self.settings.api_key)?;
        self.session
            .set_connection_state(ConnectionState::Connecting)
            .await;
        info!("Connecting to {}", self.settings.server_url);

        let (mut socket, _response) = connect_async(url.as_str())
            .await
            .map_err(classify_handshake)?;
        self.session
            .set_connection_state(ConnectionState::Connected)
            .await;

        let mut early_frames = Vec::new();
        let deadline = Instant::now() + self.settings.handshake_timeout;
        loop {
            let message = match timeout_at(deadline, socket.next()).await {
                Ok(message) => message,
                Err(_) => {
                    warn!(
                        "No handshake acknowledgement within {}s, continuing without it",
                        self.settings.handshake_timeout.as_secs()
                    );
                    self.session.mark_degraded().await;
                    break;
                }
            };
            match message {
                Some(Ok(Message::Text(text))) => match InboundCommand::decode(&text) {
                    Ok(InboundCommand::Connected { message }) => {
                        info!("Connected to server: {message}");
                        self.session
                            .set_connection_state(ConnectionState::Authenticated)
                            .await;
                        break;
                    }
                    _ => early_frames.push(text),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("Server closed during handshake: {frame:?}");
                    return Err(tungstenite::Error::ConnectionClosed.into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => return Err(tungstenite::Error::ConnectionClosed.into()),
            }
        }

        Ok(Link {
            socket,
            early_frames,
        })
    }

    /// Routes inbound frames until the socket closes or `shutdown` fires.
    pub async fn listen(
        &self,
        link: Link,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let Link {
            socket,
            early_frames,
        } = link;
        let (mut sink, mut stream) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
        self.session.attach_outbound(tx).await;
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match event.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        error!("Failed to encode {} event: {err}", event.kind());
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!("Failed to send {} event: {err}", event.kind());
                    break;
                }
            }
            sink
        });

        for frame in &early_frames {
            self.router.handle_frame(frame).await;
        }

        let result = loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => None,
                message = stream.next() => Some(message),
            };
            let Some(message) = message else {
                // Stopped jobs report while the outbound channel is still attached.
                self.router.shutdown_jobs().await;
                info!("Closing server connection");
                break Ok(());
            };
            match message {
                Some(Ok(Message::Text(text))) => self.router.handle_frame(&text).await,
                Some(Ok(Message::Close(frame))) => {
                    info!("Server closed the connection: {frame:?}");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(err.into()),
                None => break Ok(()),
            }
        };

        self.session.detach_outbound().await;
        match writer.await {
            Ok(mut sink) => {
                if let Err(err) = sink.close().await {
                    debug!("Socket close failed: {err}");
                }
            }
            Err(err) => warn!("Socket writer task failed: {err}"),
        }
        result
    }

    /// Keeps the agent connected until `shutdown` fires.
    pub async fn run(&self, shutdown: &CancellationToken) {
        while !shutdown.is_cancelled() {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = self.connect() => Some(result),
            };
            let Some(connected) = connected else {
                break;
            };

            match connected {
                Ok(link) => match self.listen(link, shutdown).await {
                    Ok(()) => info!("Disconnected from server"),
                    Err(err) => warn!("Connection lost: {err}"),
                },
                Err(err @ ConnectionError::Auth { .. }) => {
                    error!("{err}; check the configured api key")
                }
                Err(err) => warn!("Connection failed: {err}"),
            }
            self.session
                .set_connection_state(ConnectionState::Disconnected)
                .await;

            let delay = self.settings.reconnect_delay;
            info!("Reconnecting in {}s", delay.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.session
            .set_connection_state(ConnectionState::Disconnected)
            .await;
    }

    /// Queues `event` for the server; dropped when no link is up.
    pub async fn send(&self, event: OutboundEvent) -> bool {
        self.session.send(event).await
    }
}

/// Maps a refused websocket upgrade to an auth or server failure.
fn classify_handshake(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            match status {
                401 | 403 => ConnectionError::Auth { status },
                _ => ConnectionError::Server { status },
            }
        }
        other => ConnectionError::Transport(other),
    }
}
