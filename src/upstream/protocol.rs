//! Upstream wire protocol: frame shape, outgoing frame builders, and
//! incoming-frame classification.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Generic upstream frame shape: `{ name, msg?, body?, version?,
/// request_id?, local_time? }`.
#[derive(Debug, Clone, Deserialize)]
pub struct WireFrame {
    pub name: String,
    #[serde(default)]
    pub msg: Option<Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub local_time: Option<u64>,
}

impl WireFrame {
    /// The frame's payload, preferring `msg` (the shape most upstream
    /// events use) and falling back to `body`.
    pub fn payload(&self) -> Value {
        self.msg
            .clone()
            .or_else(|| self.body.clone())
            .unwrap_or(Value::Null)
    }
}

/// Classification of an incoming upstream frame, after the keep-alive
/// filter (`ping`/`pong`/`timeSync` never reach here).
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Authenticated,
    Unauthorized,
    Balance(Value),
    Candle(Value),
    Positions(Value),
    PositionChanged(Value),
    ClientBuyback(Value),
    Subscription(Value),
    OrderResult { request_id: String, body: Value },
    /// Any other named frame, forwarded verbatim under its own name.
    Other { name: String, payload: Value },
}

/// Classify a decoded wire frame. Returns `None` for frames the keep-alive
/// filter consumes before classification ever runs (`ping`, `pong`,
/// `timeSync`).
pub fn classify(frame: &WireFrame) -> Option<UpstreamEvent> {
    let payload = frame.payload();
    Some(match frame.name.as_str() {
        "ping" | "pong" | "timeSync" => return None,
        "authenticated" => UpstreamEvent::Authenticated,
        "unauthorized" => UpstreamEvent::Unauthorized,
        "balance-changed" | "balances" => UpstreamEvent::Balance(payload),
        "candle-generated" | "candles-generated" => UpstreamEvent::Candle(payload),
        "positions-state" => UpstreamEvent::Positions(payload),
        "position-changed" => UpstreamEvent::PositionChanged(payload),
        "price-splitter.client-buyback-generated" | "client-buyback-generated" => {
            UpstreamEvent::ClientBuyback(payload)
        }
        "subscription" => UpstreamEvent::Subscription(payload),
        "result" => match &frame.request_id {
            Some(id) => UpstreamEvent::OrderResult {
                request_id: id.clone(),
                body: payload,
            },
            None => UpstreamEvent::Other {
                name: frame.name.clone(),
                payload,
            },
        },
        other => UpstreamEvent::Other {
            name: other.to_string(),
            payload,
        },
    })
}

/// Normalize a raw candle payload's field names to the downstream shape
/// described below: `high=max`, `low=min`, `timeframe=size`.
pub fn normalize_candle(raw: &Value) -> Value {
    json!({
        "open": raw.get("open"),
        "close": raw.get("close"),
        "high": raw.get("max"),
        "low": raw.get("min"),
        "from": raw.get("from"),
        "to": raw.get("to"),
        "timeframe": raw.get("size"),
        "volume": raw.get("volume"),
    })
}

/// One outgoing upstream frame, serialized verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingFrame {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_time: Option<u64>,
}

impl OutgoingFrame {
    pub fn new(name: impl Into<String>, msg: Value) -> Self {
        Self {
            name: name.into(),
            msg: Some(msg),
            request_id: None,
            local_time: None,
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            msg: None,
            request_id: None,
            local_time: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn authenticate_frame(ssid: &str) -> OutgoingFrame {
    OutgoingFrame::new(
        "authenticate",
        json!({ "ssid": ssid, "protocol": 3, "client_session_id": "" }),
    )
}

pub fn ping_frame() -> OutgoingFrame {
    OutgoingFrame::bare("ping")
}

pub fn pong_frame() -> OutgoingFrame {
    OutgoingFrame::bare("pong")
}

pub fn subscribe_candles_frame(active_id: u32, size: u32, at: &str) -> OutgoingFrame {
    OutgoingFrame::new(
        "subscribe-candles",
        json!({ "active_id": active_id, "size": size, "at": at }),
    )
}

/// Wrapped variant of `subscribe-candles`. Upstream's acceptance of either
/// shape is undocumented; this proxy sends both and tolerates the wrapped
/// one being a no-op.
pub fn subscribe_candles_wrapped_frame(active_id: u32, size: u32, at: &str) -> OutgoingFrame {
    OutgoingFrame::new(
        "sendMessage",
        json!({
            "name": "subscribe-candles",
            "msg": { "active_id": active_id, "size": size, "at": at },
        }),
    )
}

pub fn unsubscribe_candles_frame(active_id: u32) -> OutgoingFrame {
    OutgoingFrame::new("unsubscribe-candles", json!({ "active_id": active_id }))
}

pub fn get_balances_frame() -> OutgoingFrame {
    OutgoingFrame::bare("balances.get-balances")
}

pub fn subscribe_positions_frame() -> OutgoingFrame {
    OutgoingFrame::new("subscribe-positions", json!({ "frequency": "frequent" }))
}

pub fn get_all_actives_frame() -> OutgoingFrame {
    OutgoingFrame::bare("actives.get-all")
}

pub fn open_option_frame(envelope: &crate::order_builder::OrderEnvelope) -> OutgoingFrame {
    let mut frame = OutgoingFrame::new(
        "binary-options.open-option",
        json!({
            "user_balance_id": envelope.user_balance_id,
            "active_id": envelope.active_id,
            "option_type_id": envelope.option_kind,
            "direction": envelope.direction,
            "expiration_size": envelope.expiry_unix,
            "expired": envelope.expiry_unix,
            "price": envelope.price_scaled,
            "profit_percent": envelope.profit_percent,
            "refund_value": envelope.refund_value,
            "value": envelope.value_cents,
        }),
    );
    frame.request_id = Some(envelope.request_id.clone());
    frame.local_time = Some(envelope.local_time);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_balance_changed() {
        let frame = WireFrame {
            name: "balance-changed".to_string(),
            msg: Some(json!({"id": "bx-1"})),
            body: None,
            request_id: None,
            local_time: None,
        };
        assert!(matches!(classify(&frame), Some(UpstreamEvent::Balance(_))));
    }

    #[test]
    fn keepalive_frames_are_filtered() {
        let frame = WireFrame {
            name: "timeSync".to_string(),
            msg: None,
            body: None,
            request_id: None,
            local_time: None,
        };
        assert!(classify(&frame).is_none());
    }

    #[test]
    fn result_without_request_id_forwards_as_other() {
        let frame = WireFrame {
            name: "result".to_string(),
            msg: Some(json!({"success": true})),
            body: None,
            request_id: None,
            local_time: None,
        };
        assert!(matches!(classify(&frame), Some(UpstreamEvent::Other { .. })));
    }

    #[test]
    fn result_with_request_id_correlates() {
        let frame = WireFrame {
            name: "result".to_string(),
            msg: Some(json!({"success": true})),
            body: None,
            request_id: Some("req-1".to_string()),
            local_time: None,
        };
        match classify(&frame) {
            Some(UpstreamEvent::OrderResult { request_id, .. }) => {
                assert_eq!(request_id, "req-1")
            }
            _ => panic!("expected OrderResult"),
        }
    }

    #[test]
    fn candle_normalization_maps_max_min_and_size() {
        let raw = json!({"open": 1.1, "close": 1.2, "max": 1.3, "min": 1.0, "from": 1, "to": 2, "size": 60, "volume": 100});
        let normalized = normalize_candle(&raw);
        assert_eq!(normalized["high"], json!(1.3));
        assert_eq!(normalized["low"], json!(1.0));
        assert_eq!(normalized["timeframe"], json!(60));
    }

    #[test]
    fn handshake_burst_frame_shapes() {
        assert_eq!(get_balances_frame().name, "balances.get-balances");
        let subs = subscribe_positions_frame();
        assert_eq!(subs.msg.unwrap()["frequency"], json!("frequent"));
        let candles = subscribe_candles_frame(76, 1, "1m");
        assert_eq!(candles.msg.as_ref().unwrap()["active_id"], json!(76));
    }
}
