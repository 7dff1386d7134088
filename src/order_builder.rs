//! Order Builder (C4): constructs upstream order envelopes from a
//! downstream order request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::SessionError;

/// Downstream-facing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    pub fn parse(s: &str) -> Result<Self, SessionError> {
        match s {
            "call" => Ok(Direction::Call),
            "put" => Ok(Direction::Put),
            _ => Err(SessionError::BadOrder("direction must be call or put")),
        }
    }
}

/// Downstream timeframe selector.
#[derive(Debug, Clone, Copy)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    Custom(u64),
}

/// Undocumented upstream defaults, opaque and passed through unchanged
/// rather than reinterpreted.
const DEFAULT_PRICE_SCALED: u64 = 10_000;
const DEFAULT_PROFIT_PERCENT: u32 = 88;
const DEFAULT_REFUND_VALUE: u32 = 0;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("req-{now}-{seq}")
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn align_ceil(now_s: u64, bucket_s: u64) -> u64 {
    now_s.div_ceil(bucket_s) * bucket_s
}

/// A request from the downstream client to open a binary option.
pub struct OrderRequest {
    pub direction: Direction,
    pub stake_major: f64,
    pub active_id: Option<u32>,
    pub timeframe: Timeframe,
    pub user_balance_id: Option<String>,
}

/// Constructed value sent upstream as `binary-options.open-option`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderEnvelope {
    pub request_id: String,
    pub local_time: u64,
    pub user_balance_id: String,
    pub active_id: u32,
    pub option_kind: u32,
    pub direction: Direction,
    pub expiry_unix: u64,
    pub price_scaled: u64,
    pub value_cents: i64,
    pub profit_percent: u32,
    pub refund_value: u32,
}

/// Build a fully validated `OrderEnvelope` for `now_s` (exposed as a
/// parameter so tests can pin wall-clock time).
pub fn build(req: &OrderRequest, now_s: u64) -> Result<OrderEnvelope, SessionError> {
    if req.stake_major <= 0.0 {
        return Err(SessionError::BadOrder("stake must be positive"));
    }
    let user_balance_id = req
        .user_balance_id
        .clone()
        .ok_or(SessionError::BadOrder("no known balance id for session"))?;
    let active_id = req
        .active_id
        .ok_or(SessionError::BadOrder("active id not resolvable"))?;

    let (option_kind, expiry_unix) = match req.timeframe {
        Timeframe::M1 => (3, align_ceil(now_s, 60)),
        Timeframe::M5 => (12, align_ceil(now_s, 300)),
        Timeframe::M15 => (13, align_ceil(now_s, 900)),
        Timeframe::Custom(seconds) => (3, now_s + seconds),
    };

    Ok(OrderEnvelope {
        request_id: next_request_id(),
        local_time: now_unix_seconds(),
        user_balance_id,
        active_id,
        option_kind,
        direction: req.direction,
        expiry_unix,
        price_scaled: DEFAULT_PRICE_SCALED,
        value_cents: (req.stake_major * 100.0).round() as i64,
        profit_percent: DEFAULT_PROFIT_PERCENT,
        refund_value: DEFAULT_REFUND_VALUE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> OrderRequest {
        OrderRequest {
            direction: Direction::Call,
            stake_major: 1.5,
            active_id: Some(76),
            timeframe: Timeframe::M1,
            user_balance_id: Some("bx-1".to_string()),
        }
    }

    #[test]
    fn m1_expiry_alignment_and_value_scaling() {
        let req = base_request();
        let envelope = build(&req, 1_700_000_017).unwrap();
        assert_eq!(envelope.option_kind, 3);
        assert_eq!(envelope.expiry_unix, 1_700_000_040);
        assert_eq!(envelope.value_cents, 150);
        assert!(!envelope.request_id.is_empty());
    }

    #[test]
    fn m5_and_m15_alignment() {
        let mut req = base_request();
        req.timeframe = Timeframe::M5;
        let envelope = build(&req, 1_700_000_017).unwrap();
        assert_eq!(envelope.option_kind, 12);
        assert_eq!(envelope.expiry_unix, 1_700_000_100);

        req.timeframe = Timeframe::M15;
        let envelope = build(&req, 1_700_000_017).unwrap();
        assert_eq!(envelope.option_kind, 13);
        assert_eq!(envelope.expiry_unix, 1_700_000_100);
    }

    #[test]
    fn custom_timeframe_adds_seconds() {
        let mut req = base_request();
        req.timeframe = Timeframe::Custom(45);
        let envelope = build(&req, 1_700_000_000).unwrap();
        assert_eq!(envelope.option_kind, 3);
        assert_eq!(envelope.expiry_unix, 1_700_000_045);
    }

    #[test]
    fn missing_balance_id_is_bad_order() {
        let mut req = base_request();
        req.user_balance_id = None;
        assert!(build(&req, 1_700_000_000).is_err());
    }

    #[test]
    fn nonpositive_stake_is_bad_order() {
        let mut req = base_request();
        req.stake_major = 0.0;
        assert!(build(&req, 1_700_000_000).is_err());
    }

    #[test]
    fn repeated_builds_differ_only_in_request_id_and_local_time() {
        let req = base_request();
        let a = build(&req, 1_700_000_000).unwrap();
        let b = build(&req, 1_700_000_000).unwrap();
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.active_id, b.active_id);
        assert_eq!(a.expiry_unix, b.expiry_unix);
        assert_eq!(a.value_cents, b.value_cents);
    }
}
