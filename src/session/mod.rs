//! Session Mediator (C6): the per-client glue between one downstream
//! channel and one Upstream Link.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::aggregator::EventAggregator;
use crate::balance::{self, AccountFlavor, Balance};
use crate::config::AppConfig;
use crate::downstream::{DownstreamCommand, DownstreamEvent, DownstreamSender};
use crate::error::SessionError;
use crate::order_builder::{self, Direction, OrderRequest, Timeframe};
use crate::registry::{AssetRegistry, ResolvedAsset};
use crate::upstream::link::{UpstreamHandle, UpstreamLink};
use crate::upstream::protocol::{
    self, UpstreamEvent, open_option_frame, subscribe_candles_frame,
    subscribe_candles_wrapped_frame, unsubscribe_candles_frame,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const ORDER_TTL: Duration = Duration::from_secs(12);
const ORDER_SCAN_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_CANDLE_SIZE: u32 = 60;

/// Externally-visible slice of session state, published for the HTTP
/// order-submission lookup contract described in the external-interfaces
/// section: `(upstream_ready, user_balance_id, current_active)`.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub upstream_ready: bool,
    pub user_balance_id: Option<String>,
    pub current_active: Option<u32>,
}

/// Handle to a running session, held by the Acceptor's per-connection
/// state and by the process-wide session registry.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub credential: String,
    commands: mpsc::UnboundedSender<DownstreamCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    upstream: UpstreamHandle,
}

impl SessionHandle {
    /// Forward a command to the running session task. Returns `false` if
    /// the session has already torn itself down (its command channel is
    /// closed) — the caller must treat that the same as "no session", since
    /// a dead handle otherwise swallows commands silently.
    pub fn dispatch(&self, command: DownstreamCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Build an order envelope against this session's current balance and
    /// active id, for the out-of-scope HTTP order-submission endpoint.
    pub fn build_order(
        &self,
        direction: Direction,
        stake_major: f64,
        timeframe: Timeframe,
    ) -> Result<order_builder::OrderEnvelope, SessionError> {
        let snap = self.snapshot();
        let req = OrderRequest {
            direction,
            stake_major,
            active_id: snap.current_active,
            timeframe,
            user_balance_id: snap.user_balance_id,
        };
        order_builder::build(&req, now_unix_seconds())
    }

    pub fn close(&self) {
        self.dispatch(DownstreamCommand::Disconnect);
    }

    pub fn is_upstream_ready(&self) -> bool {
        self.upstream.is_ready()
    }
}

struct PendingOrder {
    expires_at: Instant,
}

struct Session {
    session_id: String,
    credential: String,
    account_flavor: AccountFlavor,
    registry: Arc<AssetRegistry>,
    upstream: UpstreamHandle,
    aggregator: Arc<EventAggregator>,
    downstream: DownstreamSender,
    balance: Option<Balance>,
    subscribed_asset: Option<ResolvedAsset>,
    pending_orders: FxHashMap<String, PendingOrder>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    config: Arc<AppConfig>,
}

/// Spawn a new session: starts the Upstream Link, the aggregator flush
/// loop, and the mediator's own command/event loop as background tasks.
/// Returns a handle usable from the Acceptor immediately.
pub fn spawn(
    session_id: String,
    credential: String,
    account_flavor: AccountFlavor,
    registry: Arc<AssetRegistry>,
    config: Arc<AppConfig>,
    downstream: DownstreamSender,
) -> SessionHandle {
    let (event_tx, event_rx) = mpsc::unbounded_channel::<UpstreamEvent>();
    let (link, upstream) = UpstreamLink::new(
        config.upstream_url.clone(),
        credential.clone(),
        registry.clone(),
        event_tx,
    );
    tokio::spawn(link.run());

    let aggregator = Arc::new(EventAggregator::new(downstream.clone()));
    let (agg_shutdown_tx, agg_shutdown_rx) = oneshot::channel();
    {
        let aggregator = aggregator.clone();
        tokio::spawn(async move { aggregator.run(agg_shutdown_rx).await });
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let handle = SessionHandle {
        session_id: session_id.clone(),
        credential: credential.clone(),
        commands: command_tx,
        snapshot: snapshot_rx,
        upstream: upstream.clone(),
    };

    let session = Session {
        session_id,
        credential,
        account_flavor,
        registry,
        upstream,
        aggregator,
        downstream,
        balance: None,
        subscribed_asset: None,
        pending_orders: FxHashMap::default(),
        snapshot_tx,
        config,
    };

    tokio::spawn(session.run(command_rx, event_rx, agg_shutdown_tx));

    handle
}

fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn balance_trio_payload(balance: &Balance) -> Value {
    json!({
        "msg": {
            "current_balance": {
                "id": balance.balance_id,
                "amount": balance.amount_cents,
                "currency": balance.currency,
            }
        }
    })
}

impl Session {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DownstreamCommand>,
        mut upstream_events: mpsc::UnboundedReceiver<UpstreamEvent>,
        agg_shutdown: oneshot::Sender<()>,
    ) {
        info!(session_id = %self.session_id, "session started");
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut order_scan = tokio::time::interval(ORDER_SCAN_INTERVAL);

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(DownstreamCommand::Disconnect) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                event = upstream_events.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_upstream_event(event).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    self.emit("ping-proxy", json!({ "t": now_ms() }));
                }
                _ = order_scan.tick() => {
                    self.expire_orders();
                }
            }
            self.publish_snapshot();
        }

        info!(session_id = %self.session_id, "session tearing down");
        self.aggregator.clear().await;
        let _ = agg_shutdown.send(());
        self.upstream.shutdown();
    }

    fn publish_snapshot(&self) {
        let _ = self.snapshot_tx.send(SessionSnapshot {
            upstream_ready: self.upstream.is_ready(),
            user_balance_id: self.balance.as_ref().map(|b| b.balance_id.clone()),
            current_active: self.subscribed_asset.as_ref().map(|a| a.id),
        });
    }

    fn emit(&self, name: &str, payload: Value) {
        let _ = self.downstream.send(DownstreamEvent::new(name, payload));
    }

    fn emit_error(&self, err: &SessionError) {
        let name = err.downstream_event_name();
        self.emit(name, json!({ "message": err.to_string() }));
        if err.is_terminal() {
            self.emit("disconnected", json!({ "reason": err.to_string() }));
        }
    }

    /// Like `emit_error`, but for failures that occur while building or
    /// transmitting an order: these surface as `order-error` rather than
    /// a bare `error`, per the downstream event contract.
    fn emit_order_error(&self, err: &SessionError) {
        self.emit("order-error", json!({ "message": err.to_string() }));
        if err.is_terminal() {
            self.emit("disconnected", json!({ "reason": err.to_string() }));
        }
    }

    async fn handle_command(&mut self, command: DownstreamCommand) {
        match command {
            DownstreamCommand::Authenticate { .. } => {
                warn!(
                    session_id = %self.session_id,
                    "re-authenticate received on a live session; ignored (handled by the acceptor)"
                );
            }
            DownstreamCommand::SubscribeActive(payload) => self.handle_subscribe_active(payload),
            DownstreamCommand::SendMessage(payload) => self.handle_send_message(payload),
            DownstreamCommand::OpenPosition(payload) => self.handle_open_position(payload),
            DownstreamCommand::GetBalance => self.handle_get_balance(),
            DownstreamCommand::Disconnect => unreachable!("handled by the caller"),
        }
    }

    fn handle_subscribe_active(&mut self, payload: Value) {
        let resolved = match self.registry.resolve(&payload) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.emit_error(&err);
                return;
            }
        };

        if let Some(old) = &self.subscribed_asset {
            if old.id != resolved.id {
                self.upstream.send(unsubscribe_candles_frame(old.id));
            }
        }

        self.upstream
            .send(subscribe_candles_frame(resolved.id, DEFAULT_CANDLE_SIZE, "1m"));
        self.upstream
            .send(subscribe_candles_wrapped_frame(resolved.id, DEFAULT_CANDLE_SIZE, "1m"));

        self.emit(
            "subscribed-active",
            json!([{ "name": resolved.name, "id": resolved.id }]),
        );
        self.subscribed_asset = Some(resolved);
    }

    fn handle_send_message(&mut self, envelope: Value) {
        if !self.upstream.is_ready() {
            self.emit_error(&SessionError::NotReady);
            return;
        }
        let forwarded = envelope.get("msg").cloned().unwrap_or(envelope);
        let name = forwarded
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("sendMessage")
            .to_string();
        // `forwarded` is itself wire-frame-shaped (`{name, msg?}`): if it
        // carries a nested `msg`, forward that as the payload; otherwise
        // forward the bare frame rather than re-wrapping the whole
        // envelope as a new `msg`, which would double the `name` field.
        match forwarded.get("msg").cloned() {
            Some(msg) => self.upstream.send(protocol::OutgoingFrame::new(name, msg)),
            None => self.upstream.send(protocol::OutgoingFrame::bare(name)),
        }
    }

    fn handle_open_position(&mut self, payload: Value) {
        if !self.upstream.is_ready() {
            self.emit_order_error(&SessionError::NotReady);
            return;
        }

        let req = match self.parse_order_request(&payload) {
            Ok(req) => req,
            Err(err) => {
                self.emit_order_error(&err);
                return;
            }
        };

        let mut envelope = match order_builder::build(&req, now_unix_seconds()) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.emit_order_error(&err);
                return;
            }
        };

        if let Some(price) = payload.get("price").and_then(|v| v.as_u64()) {
            envelope.price_scaled = price;
        }
        if let Some(profit) = payload.get("profit_percent").and_then(|v| v.as_u64()) {
            envelope.profit_percent = profit as u32;
        }
        if let Some(refund) = payload.get("refund_value").and_then(|v| v.as_u64()) {
            envelope.refund_value = refund as u32;
        }
        if let Some(option_type_id) = payload.get("option_type_id").and_then(|v| v.as_u64()) {
            envelope.option_kind = option_type_id as u32;
        }

        self.pending_orders.insert(
            envelope.request_id.clone(),
            PendingOrder {
                expires_at: Instant::now() + ORDER_TTL,
            },
        );

        self.emit(
            "order-sent",
            json!({ "request_id": envelope.request_id, "envelope": envelope }),
        );
        self.upstream.send(open_option_frame(&envelope));
    }

    fn parse_order_request(&self, payload: &Value) -> Result<OrderRequest, SessionError> {
        let direction_str = payload
            .get("direction")
            .and_then(|v| v.as_str())
            .ok_or(SessionError::BadOrder("missing direction"))?;
        let direction = Direction::parse(direction_str)?;

        let stake_major = payload
            .get("stake")
            .or_else(|| payload.get("amount"))
            .and_then(|v| v.as_f64())
            .ok_or(SessionError::BadOrder("missing stake"))?;

        let active_id = payload
            .get("active_id")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .or_else(|| {
                payload
                    .get("active")
                    .or_else(|| payload.get("name"))
                    .and_then(|v| self.registry.resolve(v).ok())
                    .map(|r| r.id)
            })
            .or_else(|| self.subscribed_asset.as_ref().map(|a| a.id));

        let timeframe = self.parse_timeframe(payload);

        Ok(OrderRequest {
            direction,
            stake_major,
            active_id,
            timeframe,
            user_balance_id: self.balance.as_ref().map(|b| b.balance_id.clone()),
        })
    }

    fn parse_timeframe(&self, payload: &Value) -> Timeframe {
        match payload.get("timeframe").and_then(|v| v.as_str()) {
            Some("M1") => Timeframe::M1,
            Some("M5") => Timeframe::M5,
            Some("M15") => Timeframe::M15,
            Some("custom") => {
                let seconds = payload
                    .get("custom_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(60);
                Timeframe::Custom(seconds)
            }
            _ => {
                // Older callers send `expiration_size`/`duration` directly
                // rather than the named timeframe enum; treat it as a
                // custom window when present.
                if let Some(seconds) = payload
                    .get("expiration_size")
                    .or_else(|| payload.get("duration"))
                    .and_then(|v| v.as_u64())
                {
                    Timeframe::Custom(seconds)
                } else {
                    Timeframe::M1
                }
            }
        }
    }

    fn handle_get_balance(&self) {
        match &self.balance {
            Some(balance) => self.emit_balance_trio(balance),
            None => self.emit(
                "balance",
                json!({ "msg": { "current_balance": { "id": Value::Null, "amount": 0, "currency": "USD" } } }),
            ),
        }
    }

    /// Direct-query answer: `get-balance` bypasses the aggregator entirely,
    /// since a client asking right now wants the current figure immediately
    /// rather than whatever the coalescing window happens to hold.
    fn emit_balance_trio(&self, balance: &Balance) {
        let payload = balance_trio_payload(balance);
        for name in ["balance", "balance-changed", "current-balance"] {
            self.emit(name, payload.clone());
        }
    }

    fn expire_orders(&mut self) {
        let now = Instant::now();
        self.pending_orders.retain(|_, order| order.expires_at > now);
    }

    /// Returns true if the session must tear down as a result of this
    /// event (auth rejection, terminal upstream loss).
    async fn handle_upstream_event(&mut self, event: UpstreamEvent) -> bool {
        match event {
            UpstreamEvent::Authenticated => {
                self.emit("authenticated", Value::Null);
                false
            }
            UpstreamEvent::Unauthorized => {
                self.emit_error(&SessionError::AuthRejected);
                true
            }
            UpstreamEvent::Balance(body) => {
                if let Some(balance) = balance::normalize(&body, self.account_flavor) {
                    let payload = balance_trio_payload(&balance);
                    self.balance = Some(balance);
                    let rate = self.config.rate_limit_for("balance-changed");
                    self.aggregator
                        .admit(
                            "balance-changed",
                            &["balance", "balance-changed", "current-balance"],
                            payload,
                            rate,
                        )
                        .await;
                } else {
                    warn!(session_id = %self.session_id, "balance payload matched no known shape");
                }
                false
            }
            UpstreamEvent::Candle(raw) => {
                let normalized = protocol::normalize_candle(&raw);
                let rate = self.config.rate_limit_for("candles");
                self.aggregator
                    .admit("candles", &["candles"], normalized, rate)
                    .await;
                false
            }
            UpstreamEvent::Positions(body) => {
                let rate = self.config.rate_limit_for("positions");
                self.aggregator
                    .admit("positions", &["positions"], body, rate)
                    .await;
                false
            }
            UpstreamEvent::PositionChanged(body) => {
                let is_terminal = body
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(|s| s == "closed" || s == "expired" || s == "win" || s == "loss")
                    .unwrap_or(false);
                self.emit("position-changed", body.clone());
                if is_terminal {
                    self.emit("order-result", body);
                }
                false
            }
            UpstreamEvent::ClientBuyback(body) => {
                let rate = self.config.rate_limit_for("pressure");
                self.aggregator
                    .admit(
                        "pressure",
                        &["pressure", "client-buyback-generated"],
                        body,
                        rate,
                    )
                    .await;
                false
            }
            UpstreamEvent::Subscription(body) => {
                self.emit("subscription", body);
                false
            }
            UpstreamEvent::OrderResult { request_id, body } => {
                if self.pending_orders.remove(&request_id).is_some() {
                    let success = body
                        .get("success")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if success {
                        self.emit("order-confirmed", json!({ "request_id": request_id, "raw": body }));
                    } else {
                        self.emit(
                            "order-error",
                            json!({ "request_id": request_id, "raw": body }),
                        );
                    }
                }
                false
            }
            UpstreamEvent::Other { name, payload } => {
                if name == "__upstream_lost" {
                    self.emit_error(&SessionError::UpstreamLost);
                    return true;
                }
                self.emit(&name, payload);
                false
            }
        }
    }
}
