//! Transports carrying one host's live feed.

use crate::state::LiveEvent;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use ter_core::live::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// What a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Live(LiveEvent),
}

#[derive(Debug)]
pub(crate) struct ManagerEvent {
    pub(crate) host_id: String,
    pub(crate) generation: u64,
    pub(crate) kind: ManagerEventKind,
}

#[derive(Debug)]
pub(crate) enum ManagerEventKind {
    Transport(TransportEvent),
    ReconnectDue,
}

/// Hands one connection's events to the manager, tagged with the connection
/// they came from so events of a replaced connection can be told apart.
#[derive(Debug, Clone)]
pub struct EventSink {
    host_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl EventSink {
    pub(crate) fn new(
        host_id: String,
        generation: u64,
        tx: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Self {
        Self {
            host_id,
            generation,
            tx,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn send(&self, event: TransportEvent) {
        let _ = self.tx.send(ManagerEvent {
            host_id: self.host_id.clone(),
            generation: self.generation,
            kind: ManagerEventKind::Transport(event),
        });
    }

    pub fn opened(&self) {
        self.send(TransportEvent::Opened);
    }

    pub fn message(&self, message: ServerMessage) {
        self.send(TransportEvent::Live(message.into()));
    }

    pub fn closed(&self, reason: Option<String>) {
        self.send(TransportEvent::Live(LiveEvent::Closed(reason)));
    }
}

/// Opens transports. `run` drives one connection until it ends, reporting
/// through `events`; it must report `Opened` before outbound messages can
/// flow, and a final `Closed` unless `outbound` was dropped first.
pub trait Connector: Send + Sync + 'static {
    fn run(
        &self,
        url: Url,
        events: EventSink,
        outbound: mpsc::Receiver<ClientMessage>,
    ) -> BoxFuture<'static, ()>;
}

/// WebSocket transport to an agent's `/events` endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn run(
        &self,
        url: Url,
        events: EventSink,
        mut outbound: mpsc::Receiver<ClientMessage>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let (mut ws, _) = match connect_async(url.as_str()).await {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "live_connect_error", host = %events.host_id(), error = %err);
                    events.closed(Some(err.to_string()));
                    return;
                }
            };
            events.opened();
            debug!(event = "live_open", host = %events.host_id());

            loop {
                tokio::select! {
                    incoming = ws.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => events.message(message),
                                Err(err) => debug!(event = "live_message_invalid", host = %events.host_id(), error = %err),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            events.closed(None);
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            events.closed(Some(err.to_string()));
                            return;
                        }
                    },
                    queued = outbound.recv() => match queued {
                        Some(message) => {
                            let text = match serde_json::to_string(&message) {
                                Ok(text) => text,
                                Err(err) => {
                                    warn!(event = "encode_error", error = %err);
                                    continue;
                                }
                            };
                            if let Err(err) = ws.send(Message::Text(text)).await {
                                events.closed(Some(err.to_string()));
                                return;
                            }
                        }
                        None => {
                            let _ = ws.close(None).await;
                            return;
                        }
                    },
                }
            }
        }
        .boxed()
    }
}
