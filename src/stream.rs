//! Event stream client.
//!
//! Holds exactly one websocket connection to the platform's event feed and
//! forwards service lifecycle events to the controller.  A closed or silent
//! connection is replaced until shutdown is requested; feed errors are
//! logged and never fatal.

use std::time::Duration;

use anyhow::anyhow;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::backoff::Backoff;
use crate::types::{LifecycleState, PlatformEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the stream client reports to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// A connection was (re)established.
    Connected,
    /// A service changed lifecycle state.
    Service { uuid: String, state: LifecycleState },
}

enum Ended {
    Closed,
    Shutdown,
}

pub struct EventStreamClient {
    url: String,
    auth: String,
    ping_interval: Duration,
    pong_timeout: Duration,
    backoff: Backoff,
}

impl EventStreamClient {
    pub fn new(
        url: String,
        auth: String,
        ping_interval: Duration,
        pong_timeout: Duration,
        backoff: Backoff,
    ) -> anyhow::Result<Self> {
        let client = Self {
            url,
            auth,
            ping_interval,
            pong_timeout,
            backoff,
        };
        client.request()?;
        Ok(client)
    }

    fn request(&self) -> anyhow::Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&self.auth)
            .map_err(|e| anyhow!("Invalid authorization value: {}", e))?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        Ok(request)
    }

    /// Run until `shutdown` flips to true or the controller goes away.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<StreamSignal>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = self.backoff.next_delay();
            if !delay.is_zero() {
                warn!("Reconnecting to event stream in {:?}", delay);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }

            info!("Connecting to {}", self.url);
            let request = match self.request() {
                Ok(request) => request,
                Err(e) => {
                    error!("Unable to build event stream request: {}", e);
                    continue;
                }
            };
            let connected = tokio::select! {
                res = connect_async(request) => res,
                _ = shutdown.changed() => break,
            };
            let mut socket = match connected {
                Ok((socket, _response)) => socket,
                Err(e) => {
                    error!("Event stream connection failed: {}", e);
                    continue;
                }
            };

            info!("Connected!");
            self.backoff.reset();
            if tx.send(StreamSignal::Connected).await.is_err() {
                return Err(anyhow!("Channel closed"));
            }

            match self.pump(&mut socket, &tx, &mut shutdown).await? {
                Ended::Closed => {
                    warn!("Connection closed! ... Restarting connection");
                }
                Ended::Shutdown => {
                    let _ = socket.close(None).await;
                    info!("Connection closed!");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read frames until the connection ends.
    async fn pump(
        &self,
        socket: &mut Socket,
        tx: &mpsc::Sender<StreamSignal>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Ended> {
        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        let mut last_seen = Instant::now();

        loop {
            let silent_after = last_seen + self.ping_interval + self.pong_timeout;
            tokio::select! {
                _ = shutdown.changed() => return Ok(Ended::Shutdown),
                _ = sleep_until(silent_after) => {
                    warn!("No traffic on event stream for {:?}", silent_after - last_seen);
                    return Ok(Ended::Closed);
                }
                _ = ping.tick() => {
                    if let Err(e) = socket.send(Message::Ping(Vec::new().into())).await {
                        warn!("Failed to ping event stream: {}", e);
                        return Ok(Ended::Closed);
                    }
                }
                frame = socket.next() => {
                    let frame = match frame {
                        None => return Ok(Ended::Closed),
                        Some(Ok(frame)) => frame,
                        Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_))) => {
                            return Ok(Ended::Closed)
                        }
                        Some(Err(e)) => {
                            error!("Error on event stream: {}", e);
                            continue;
                        }
                    };
                    last_seen = Instant::now();

                    match frame {
                        Message::Text(text) => match PlatformEvent::parse(text.as_str()) {
                            PlatformEvent::Service { uuid, state } => {
                                if tx.send(StreamSignal::Service { uuid, state }).await.is_err() {
                                    return Err(anyhow!("Channel closed"));
                                }
                            }
                            PlatformEvent::Ignored => debug!("Ignoring event: {}", text.as_str()),
                        },
                        Message::Close(frame) => {
                            debug!("Close frame received: {:?}", frame);
                            return Ok(Ended::Closed);
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
