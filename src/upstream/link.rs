//! Upstream Link (C5): owns one upstream WebSocket, authenticates,
//! keeps alive, parses frames, dispatches events, and reconnects with a
//! bounded number of attempts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{
    self, OutgoingFrame, UpstreamEvent, WireFrame, authenticate_frame, classify,
    get_all_actives_frame, get_balances_frame, ping_frame, pong_frame, subscribe_candles_frame,
    subscribe_candles_wrapped_frame, subscribe_positions_frame,
};
use crate::registry::AssetRegistry;

const MAX_RECONNECT_ATTEMPTS: u32 = 6;
const RECONNECT_DELAY: Duration = Duration::from_secs(4);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const DEFAULT_CANDLE_ASSET: &str = "EURUSD-OTC";

/// Upstream Link connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    Connecting = 1,
    Authenticating = 2,
    Ready = 3,
    Degraded = 4,
    Closed = 5,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LinkState::Idle,
            1 => LinkState::Connecting,
            2 => LinkState::Authenticating,
            3 => LinkState::Ready,
            4 => LinkState::Degraded,
            _ => LinkState::Closed,
        }
    }
}

/// Shared, lock-free readable handle to the link's current state.
#[derive(Clone)]
pub struct LinkStateCell(Arc<AtomicU8>);

impl LinkStateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(LinkState::Idle as u8)))
    }

    fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.get() == LinkState::Ready
    }
}

/// Handle used by the Session Mediator to send frames upstream and observe
/// readiness, without owning the socket itself.
#[derive(Clone)]
pub struct UpstreamHandle {
    outgoing: mpsc::UnboundedSender<OutgoingFrame>,
    state: LinkStateCell,
    shutdown: Arc<Notify>,
}

impl UpstreamHandle {
    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Send a frame upstream. Fails (silently, as a dropped send) if the
    /// link task has already exited; readiness must be checked by the
    /// caller before sending.
    pub fn send(&self, frame: OutgoingFrame) {
        let _ = self.outgoing.send(frame);
    }

    /// Request the link to close: cancels reconnect attempts and drops the
    /// socket (best-effort).
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// A standalone `Ready` handle with no backing `UpstreamLink` task, for
    /// tests that only need to observe what gets sent upstream.
    #[cfg(test)]
    pub(crate) fn detached_ready_for_test() -> (Self, mpsc::UnboundedReceiver<OutgoingFrame>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let state = LinkStateCell::new();
        state.set(LinkState::Ready);
        (
            Self {
                outgoing: outgoing_tx,
                state,
                shutdown: Arc::new(Notify::new()),
            },
            outgoing_rx,
        )
    }
}

/// Outcome of a single connect-and-serve attempt.
enum ServeOutcome {
    /// Socket closed or errored; eligible for reconnect.
    Disconnected,
    /// Upstream rejected the credential; terminal, no retry.
    AuthRejected,
    /// Caller asked us to stop.
    Teardown,
}

pub struct UpstreamLink {
    url: String,
    credential: String,
    registry: Arc<AssetRegistry>,
    state: LinkStateCell,
    outgoing_rx: mpsc::UnboundedReceiver<OutgoingFrame>,
    outgoing_tx: mpsc::UnboundedSender<OutgoingFrame>,
    shutdown: Arc<Notify>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
}

impl UpstreamLink {
    pub fn new(
        url: String,
        credential: String,
        registry: Arc<AssetRegistry>,
        events: mpsc::UnboundedSender<UpstreamEvent>,
    ) -> (Self, UpstreamHandle) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let state = LinkStateCell::new();
        let shutdown = Arc::new(Notify::new());
        let handle = UpstreamHandle {
            outgoing: outgoing_tx.clone(),
            state: state.clone(),
            shutdown: shutdown.clone(),
        };
        (
            Self {
                url,
                credential,
                registry,
                state,
                outgoing_rx,
                outgoing_tx,
                shutdown,
                events,
            },
            handle,
        )
    }

    /// Drive the link until a terminal condition is reached: auth
    /// rejection, reconnect exhaustion, or an explicit shutdown request.
    pub async fn run(mut self) {
        let mut attempts = 0u32;
        loop {
            self.state.set(LinkState::Connecting);
            match self.connect_and_serve().await {
                ServeOutcome::Teardown => {
                    self.state.set(LinkState::Closed);
                    return;
                }
                ServeOutcome::AuthRejected => {
                    warn!("upstream rejected credential, not reconnecting");
                    self.state.set(LinkState::Closed);
                    return;
                }
                ServeOutcome::Disconnected => {
                    attempts += 1;
                    if attempts > MAX_RECONNECT_ATTEMPTS {
                        warn!(attempts, "upstream reconnect attempts exhausted");
                        self.state.set(LinkState::Closed);
                        let _ = self.events.send(UpstreamEvent::Other {
                            name: "__upstream_lost".to_string(),
                            payload: serde_json::Value::Null,
                        });
                        return;
                    }
                    self.state.set(LinkState::Degraded);
                    info!(attempts, "reconnecting to upstream after backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = self.shutdown.notified() => {
                            self.state.set(LinkState::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_serve(&mut self) -> ServeOutcome {
        let (ws_stream, _response) = match connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "failed to connect to upstream");
                return ServeOutcome::Disconnected;
            }
        };
        info!("connected to upstream");

        let (mut write, mut read) = ws_stream.split();

        self.state.set(LinkState::Authenticating);
        let auth = authenticate_frame(&self.credential);
        if write.send(Message::Text(auth.to_json())).await.is_err() {
            return ServeOutcome::Disconnected;
        }

        let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
        ping_ticker.tick().await; // first tick fires immediately; discard

        loop {
            let ready = self.state.get() == LinkState::Ready;
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(outcome) = self.handle_text_frame(&text, &mut write).await {
                                return outcome;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => return ServeOutcome::Disconnected,
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream read error");
                            return ServeOutcome::Disconnected;
                        }
                        _ => {}
                    }
                }
                Some(frame) = self.outgoing_rx.recv() => {
                    if write.send(Message::Text(frame.to_json())).await.is_err() {
                        return ServeOutcome::Disconnected;
                    }
                }
                _ = ping_ticker.tick(), if ready => {
                    let _ = write.send(Message::Text(ping_frame().to_json())).await;
                }
                _ = self.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return ServeOutcome::Teardown;
                }
            }
        }
    }

    /// Parse and dispatch one text frame. Returns `Some(outcome)` when the
    /// connection should terminate (auth rejection or transport-level
    /// write failure while replying to an app-level ping).
    async fn handle_text_frame<S>(&mut self, text: &str, write: &mut S) -> Option<ServeOutcome>
    where
        S: futures::Sink<Message> + Unpin,
    {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to parse upstream frame, dropping");
                return None;
            }
        };

        if frame.name == "ping" {
            let _ = write.send(Message::Text(pong_frame().to_json())).await;
            return None;
        }
        if frame.name == "pong" || frame.name == "timeSync" {
            return None;
        }

        match classify(&frame) {
            Some(UpstreamEvent::Authenticated) => {
                self.state.set(LinkState::Ready);
                let _ = self.events.send(UpstreamEvent::Authenticated);
                self.send_startup_burst();
                None
            }
            Some(UpstreamEvent::Unauthorized) => {
                let _ = self.events.send(UpstreamEvent::Unauthorized);
                Some(ServeOutcome::AuthRejected)
            }
            Some(event) => {
                let _ = self.events.send(event);
                None
            }
            None => None,
        }
    }

    /// On `Ready` entry: request current balances, subscribe to positions
    /// with a frequent cadence, request the global asset list, and
    /// subscribe to candles for the default asset.
    fn send_startup_burst(&self) {
        debug!("issuing upstream startup burst");
        let _ = self.outgoing_tx.send(get_balances_frame());
        let _ = self.outgoing_tx.send(subscribe_positions_frame());
        let _ = self.outgoing_tx.send(get_all_actives_frame());

        let default_id = self
            .registry
            .id_for_name(DEFAULT_CANDLE_ASSET)
            .unwrap_or(76);
        let _ = self
            .outgoing_tx
            .send(subscribe_candles_frame(default_id, 1, "1m"));
        let _ = self
            .outgoing_tx
            .send(subscribe_candles_wrapped_frame(default_id, 1, "1m"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetRow;
    use serde_json::json;

    fn registry() -> Arc<AssetRegistry> {
        Arc::new(AssetRegistry::new(&[AssetRow {
            name: "EURUSD-OTC".to_string(),
            id: 76,
        }]))
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = LinkStateCell::new();
        assert_eq!(cell.get(), LinkState::Idle);
        cell.set(LinkState::Ready);
        assert!(cell.is_ready());
        cell.set(LinkState::Degraded);
        assert!(!cell.is_ready());
    }

    #[tokio::test]
    async fn startup_burst_uses_registry_default_asset() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut link, handle) = UpstreamLink::new(
            "ws://127.0.0.1:0".to_string(),
            "cred".to_string(),
            registry(),
            events_tx,
        );
        link.send_startup_burst();
        assert!(!handle.is_ready());

        let balances = link.outgoing_rx.try_recv().unwrap();
        assert_eq!(balances.name, "balances.get-balances");
        let positions = link.outgoing_rx.try_recv().unwrap();
        assert_eq!(positions.name, "subscribe-positions");
        let actives = link.outgoing_rx.try_recv().unwrap();
        assert_eq!(actives.name, "actives.get-all");
        let candles = link.outgoing_rx.try_recv().unwrap();
        assert_eq!(candles.msg.unwrap()["active_id"], json!(76));
        let wrapped = link.outgoing_rx.try_recv().unwrap();
        assert_eq!(wrapped.name, "sendMessage");
    }
}
