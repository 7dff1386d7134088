//! Event Aggregator (C2): per-session rate limiter and coalescing buffer
//! with deferred flush for high-frequency upstream event classes.

use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitRow;
use crate::downstream::{DownstreamEvent, DownstreamSender};

/// Rate bucket: count ≤ max within any window; resets on window expiry
/// before admission.
#[derive(Debug, Clone, Copy)]
struct RateBucket {
    interval: Duration,
    max: u32,
    count: u32,
    window_reset: Instant,
}

impl RateBucket {
    fn new(row: RateLimitRow, now: Instant) -> Self {
        Self {
            interval: Duration::from_millis(row.interval_ms),
            max: row.max_per_window,
            count: 0,
            window_reset: now + Duration::from_millis(row.interval_ms),
        }
    }

    fn try_admit(&mut self, now: Instant) -> bool {
        if now >= self.window_reset {
            self.count = 0;
            self.window_reset = now + self.interval;
        }
        if self.count < self.max {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

struct ClassSlot {
    bucket: RateBucket,
    payload: Option<Value>,
    names: Vec<String>,
    deadline: Option<Instant>,
}

/// Flush deadlines land 80-120ms after the admission that first opens a
/// coalescing window; this implementation picks a single uniform delay in
/// that range.
const COALESCE_DELAY: Duration = Duration::from_millis(100);
/// How often the flush loop scans for due deadlines.
const SCAN_INTERVAL: Duration = Duration::from_millis(10);

pub struct EventAggregator {
    slots: Mutex<FxHashMap<String, ClassSlot>>,
    downstream: DownstreamSender,
}

impl EventAggregator {
    pub fn new(downstream: DownstreamSender) -> Self {
        Self {
            slots: Mutex::new(FxHashMap::default()),
            downstream,
        }
    }

    /// Admit one upstream payload for `class` (the canonical event class,
    /// e.g. `candles`, `positions`). `names` lists the downstream event
    /// names to emit on flush, friendly name first.
    ///
    /// Coalescing and rate limiting are two separate mechanisms: every call
    /// overwrites the slot's payload with the latest one and ensures a
    /// flush deadline is pending, regardless of the `RateBucket`'s
    /// remaining capacity. The bucket only gates whether a due flush is
    /// actually allowed to emit (see `flush_due`), so a burst that outruns
    /// the rate limit still ends up holding the most recent payload rather
    /// than whatever happened to land inside the admitted quota.
    pub async fn admit(&self, class: &str, names: &[&str], payload: Value, rate: RateLimitRow) {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(class.to_string()).or_insert_with(|| ClassSlot {
            bucket: RateBucket::new(rate, now),
            payload: None,
            names: Vec::new(),
            deadline: None,
        });

        slot.payload = Some(payload);
        slot.names = names.iter().map(|s| s.to_string()).collect();
        if slot.deadline.is_none() {
            slot.deadline = Some(now + COALESCE_DELAY);
        }
    }

    /// Drain every slot whose deadline has passed and whose `RateBucket`
    /// still has capacity this window, emitting each declared name in
    /// order and clearing the slot afterward. A due slot whose bucket is
    /// exhausted is left in place (payload and deadline untouched) so it
    /// is retried on the next scan once the window rolls over.
    async fn flush_due(&self) {
        let now = Instant::now();
        let mut due: Vec<(Vec<String>, Value)> = Vec::new();
        {
            let mut slots = self.slots.lock().await;
            for slot in slots.values_mut() {
                if let Some(deadline) = slot.deadline {
                    if now >= deadline && slot.bucket.try_admit(now) {
                        if let Some(payload) = slot.payload.take() {
                            due.push((std::mem::take(&mut slot.names), payload));
                        }
                        slot.deadline = None;
                    }
                }
            }
        }
        for (names, payload) in due {
            for name in names {
                let _ = self.downstream.send(DownstreamEvent {
                    name,
                    payload: payload.clone(),
                });
            }
        }
    }

    /// Cancel all pending flush deadlines and drop buffered payloads.
    /// Called on session teardown.
    pub async fn clear(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            slot.payload = None;
            slot.names.clear();
            slot.deadline = None;
        }
    }

    /// Run the flush loop until `shutdown` fires. Intended to be spawned
    /// as one of a session's housekeeping tasks.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(SCAN_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_due().await,
                _ = &mut shutdown => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn rate(interval_ms: u64, max: u32) -> RateLimitRow {
        RateLimitRow {
            interval_ms,
            max_per_window: max,
        }
    }

    #[tokio::test]
    async fn coalesces_to_latest_payload_even_past_bucket_capacity() {
        // 50 upstream frames inside one window, rate {500ms, max 5}: the
        // coalescing buffer always holds the latest payload regardless of
        // how many of those 50 admissions the bucket would ultimately let
        // through at flush time.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = EventAggregator::new(tx);
        let r = rate(500, 5);
        for i in 0..50 {
            agg.admit("candles", &["candles"], json!({"n": i}), r).await;
        }
        {
            let mut slots = agg.slots.lock().await;
            slots.get_mut("candles").unwrap().deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        agg.flush_due().await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload, json!({"n": 49}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rate_bucket_limits_flush_count_not_coalescing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = EventAggregator::new(tx);
        let r = rate(500, 2);

        for i in 0..2 {
            agg.admit("candles", &["candles"], json!({"n": i}), r).await;
            {
                let mut slots = agg.slots.lock().await;
                slots.get_mut("candles").unwrap().deadline = Some(Instant::now() - Duration::from_millis(1));
            }
            agg.flush_due().await;
            let event = rx.try_recv().unwrap();
            assert_eq!(event.payload, json!({"n": i}));
        }

        // Bucket is exhausted for this window: the next admission still
        // coalesces, but its flush is withheld rather than dropped.
        agg.admit("candles", &["candles"], json!({"n": 99}), r).await;
        {
            let mut slots = agg.slots.lock().await;
            slots.get_mut("candles").unwrap().deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        agg.flush_due().await;
        assert!(rx.try_recv().is_err());

        // Once the window rolls over, the withheld payload flushes.
        {
            let mut slots = agg.slots.lock().await;
            let slot = slots.get_mut("candles").unwrap();
            slot.bucket.window_reset = Instant::now() - Duration::from_millis(1);
        }
        agg.flush_due().await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload, json!({"n": 99}));
    }

    #[tokio::test]
    async fn flush_emits_latest_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = EventAggregator::new(tx);
        let r = rate(500, 5);
        for i in 0..5 {
            agg.admit("candles", &["candles"], json!({"n": i}), r).await;
        }
        // Force the deadline into the past and flush directly (avoids a
        // real sleep in the unit test).
        {
            let mut slots = agg.slots.lock().await;
            let slot = slots.get_mut("candles").unwrap();
            slot.deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        agg.flush_due().await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.name, "candles");
        assert_eq!(event.payload, json!({"n": 4}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn friendly_then_original_name_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = EventAggregator::new(tx);
        let r = rate(500, 5);
        agg.admit(
            "pressure",
            &["pressure", "client-buyback-generated"],
            json!({"x": 1}),
            r,
        )
        .await;
        {
            let mut slots = agg.slots.lock().await;
            slots.get_mut("pressure").unwrap().deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        agg.flush_due().await;
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.name, "pressure");
        assert_eq!(second.name, "client-buyback-generated");
    }

    #[tokio::test]
    async fn clear_drops_pending_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = EventAggregator::new(tx);
        let r = rate(500, 5);
        agg.admit("candles", &["candles"], json!({"n": 1}), r).await;
        agg.clear().await;
        {
            let mut slots = agg.slots.lock().await;
            slots.get_mut("candles").unwrap().deadline = Some(Instant::now() - Duration::from_millis(1));
        }
        agg.flush_due().await;
        assert!(rx.try_recv().is_err());
    }
}
