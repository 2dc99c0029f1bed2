//! WebSocket event stream
//!
//! Each client receives every platform event from the [`EventBus`] and may
//! additionally subscribe to the live output of individual containers. A
//! container subscription is a task forwarding from the lifecycle manager's
//! log channel into this client's queue; unsubscribing aborts only that task.
//! Replies to client requests skip that queue and go straight to the socket,
//! so a backed-up follower can never stall the loop that drains it.

use futures::{SinkExt, StreamExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::db::Database;
use crate::events::{ClientMessage, Event, EventBus};
use crate::lifecycle::LifecycleManager;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const HISTORY_LINES: usize = 100;
const CLIENT_QUEUE: usize = 256;

pub struct EventStream {
    db: Arc<Database>,
    lifecycle: Arc<LifecycleManager>,
    events: EventBus,
}

impl EventStream {
    pub fn new(db: Arc<Database>, lifecycle: Arc<LifecycleManager>, events: EventBus) -> Self {
        Self {
            db,
            lifecycle,
            events,
        }
    }

    /// Complete the WebSocket handshake and serve the client in the background
    pub fn accept(self: &Arc<Self>, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
            return handshake_error("missing Sec-WebSocket-Key");
        };
        let accept = derive_accept_key(key.as_bytes());

        let stream = Arc::clone(self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    stream.serve(ws).await;
                }
                Err(e) => warn!(error = %e, "Event stream upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "Upgrade")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid handshake response")
    }

    /// Drive one client until it disconnects or misses a ping
    pub async fn serve<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut incoming) = ws.split();
        let mut events = self.events.subscribe();
        let (log_tx, mut log_rx) = mpsc::channel::<Event>(CLIENT_QUEUE);
        let mut followers: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut ping = tokio::time::interval(PING_INTERVAL);
        let mut awaiting_pong = false;

        debug!("Event stream client connected");

        loop {
            let outgoing = tokio::select! {
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_client_message(&text, &log_tx, &mut followers).await {
                            Some(reply) => reply,
                            None => continue,
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(error = %e, "Event stream read failed");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event stream client lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(event) = log_rx.recv() => event,
                _ = ping.tick() => {
                    if awaiting_pong {
                        debug!("Event stream client missed ping");
                        break;
                    }
                    awaiting_pong = true;
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let text = match serde_json::to_string(&outgoing) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }

        for (_, task) in followers.drain() {
            task.abort();
        }
        debug!("Event stream client disconnected");
    }

    /// Apply one client request, returning the reply to send back, if any
    async fn handle_client_message(
        &self,
        text: &str,
        log_tx: &mpsc::Sender<Event>,
        followers: &mut HashMap<String, JoinHandle<()>>,
    ) -> Option<Event> {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed client message");
                return None;
            }
        };

        match message {
            ClientMessage::SubscribeLogs { service_id } => {
                if let Some(task) = followers.remove(&service_id) {
                    task.abort();
                }
                let (reply, task) = self.follow(&service_id, log_tx).await;
                if let Some(task) = task {
                    followers.insert(service_id, task);
                }
                Some(reply)
            }
            ClientMessage::UnsubscribeLogs { service_id } => {
                if let Some(task) = followers.remove(&service_id) {
                    task.abort();
                }
                None
            }
            ClientMessage::GetMetrics { service_id } => {
                let handle = self.handle_of(&service_id)?;
                match self.lifecycle.stats(&handle).await {
                    Ok(stats) => Some(Event::Metrics { service_id, stats }),
                    Err(e) => {
                        debug!(service_id, error = %e, "Stats unavailable");
                        None
                    }
                }
            }
        }
    }

    fn handle_of(&self, service_id: &str) -> Option<String> {
        let service = self.db.get_service(service_id).ok().flatten()?;
        self.lifecycle.handle_for(&service)
    }

    /// Recent history as the reply, plus a task forwarding live lines
    /// into the client's queue until aborted
    async fn follow(&self, service_id: &str, log_tx: &mpsc::Sender<Event>) -> (Event, Option<JoinHandle<()>>) {
        let Some(handle) = self.handle_of(service_id) else {
            return (Event::log(service_id, "No container is running for this service"), None);
        };

        // Subscribe before reading history so no line falls between the two
        let subscription = (!self.lifecycle.is_degraded()).then(|| self.lifecycle.subscribe_logs(&handle));

        let logs = self
            .lifecycle
            .logs(&handle, HISTORY_LINES)
            .await
            .unwrap_or_default();
        let history = Event::LogHistory {
            service_id: service_id.to_string(),
            logs,
        };

        let Some(mut subscription) = subscription else {
            return (history, None);
        };
        let tx = log_tx.clone();
        let service_id = service_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(line) = subscription.recv().await {
                if tx.send(Event::log(&service_id, line)).await.is_err() {
                    break;
                }
            }
        });
        (history, Some(task))
    }
}

fn handshake_error(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(
            http_body_util::Full::new(Bytes::from(message.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key() {
        // Sample handshake from RFC 6455 section 1.3
        assert_eq!(
            derive_accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBkAqTbUKaJ4dltx6fxdXE="
        );
    }
}
