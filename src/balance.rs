//! Balance Normalizer (C3): turns heterogeneous upstream balance shapes
//! into a canonical cents-valued record.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// Which account flavor a session requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountFlavor {
    Real,
    Demo,
}

impl AccountFlavor {
    pub fn from_str_opt(s: Option<&str>) -> Self {
        match s {
            Some("demo") => AccountFlavor::Demo,
            _ => AccountFlavor::Real,
        }
    }
}

/// Canonical balance record, always minor units (integer cents) downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub balance_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub account_flavor: AccountFlavor,
}

/// Upstream type-code markers for demo/real accounts.
const DEMO_TYPE_CODE: i64 = 4;
const REAL_TYPE_CODE: i64 = 1;

/// Normalize either a single "balance-changed" record or a "balances"
/// array into the canonical `Balance` the requested flavor selects.
pub fn normalize(frame_body: &Value, flavor: AccountFlavor) -> Option<Balance> {
    let records: Vec<&Value> = match frame_body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![frame_body],
        _ => return None,
    };

    if records.is_empty() {
        return None;
    }

    let selected = select_record(&records, flavor);
    selected.and_then(|record| build_balance(record, flavor))
}

fn select_record<'a>(records: &[&'a Value], flavor: AccountFlavor) -> Option<&'a Value> {
    if records.len() == 1 {
        return Some(records[0]);
    }

    let is_demo_marker = |r: &&Value| {
        let type_code = r.get("type").and_then(|v| v.as_i64());
        let demo_flag = r.get("is_demo").and_then(|v| v.as_bool());
        type_code == Some(DEMO_TYPE_CODE) || demo_flag == Some(true)
    };
    let is_real_marker = |r: &&Value| {
        let type_code = r.get("type").and_then(|v| v.as_i64());
        let demo_flag = r.get("is_demo").and_then(|v| v.as_bool());
        type_code == Some(REAL_TYPE_CODE) || demo_flag == Some(false) || demo_flag.is_none()
    };

    let found = match flavor {
        AccountFlavor::Demo => records.iter().find(|r| is_demo_marker(r)),
        AccountFlavor::Real => records.iter().find(|r| is_real_marker(r)),
    };

    if let Some(r) = found {
        return Some(*r);
    }

    warn!(
        ?flavor,
        "no balance record matched requested flavor, falling back to USD or first record"
    );
    records
        .iter()
        .find(|r| r.get("currency").and_then(|v| v.as_str()) == Some("USD"))
        .or_else(|| records.first())
        .copied()
}

fn build_balance(record: &Value, flavor: AccountFlavor) -> Option<Balance> {
    let balance_id = record.get("id")?.as_str()?.to_string();
    let currency = record
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("USD")
        .to_string();
    let amount = record.get("amount")?;
    let amount_cents = to_cents(amount)?;

    Some(Balance {
        balance_id,
        amount_cents,
        currency,
        account_flavor: flavor,
    })
}

/// "toCents" heuristic: upstream amounts arrive either as
/// a decimal in major units, or as a large integer already in minor units.
/// The chosen heuristic must be applied consistently; downstream always
/// gets integer cents.
pub fn to_cents(value: &Value) -> Option<i64> {
    if value.is_i64() || value.is_u64() {
        let n = value
            .as_i64()
            .unwrap_or_else(|| value.as_u64().unwrap() as i64);
        return Some(if n.abs() > 100_000 {
            n
        } else {
            n.saturating_mul(100)
        });
    }
    value.as_f64().map(|f| (f * 100.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decimal_balance_normalization() {
        let body = json!([{"currency": "USD", "amount": 98695.57, "id": "bx-1", "type": 1}]);
        let balance = normalize(&body, AccountFlavor::Real).unwrap();
        assert_eq!(balance.balance_id, "bx-1");
        assert_eq!(balance.amount_cents, 9_869_557);
        assert_eq!(balance.currency, "USD");
    }

    #[test]
    fn demo_selection_among_multiple_records() {
        let body = json!([
            {"currency": "USD", "amount": 1000.0, "id": "real-1", "type": 1},
            {"currency": "USD", "amount": 500.0, "id": "demo-1", "type": 4}
        ]);
        let balance = normalize(&body, AccountFlavor::Demo).unwrap();
        assert_eq!(balance.balance_id, "demo-1");
    }

    #[test]
    fn real_selection_prefers_non_demo() {
        let body = json!([
            {"currency": "USD", "amount": 1000.0, "id": "real-1", "type": 1},
            {"currency": "USD", "amount": 500.0, "id": "demo-1", "type": 4}
        ]);
        let balance = normalize(&body, AccountFlavor::Real).unwrap();
        assert_eq!(balance.balance_id, "real-1");
    }

    #[test]
    fn fallback_to_usd_when_no_flavor_marker_matches() {
        let body = json!([
            {"currency": "EUR", "amount": 10.0, "id": "eur-1", "type": 9},
            {"currency": "USD", "amount": 20.0, "id": "usd-1", "type": 9}
        ]);
        // Neither record carries a real/demo marker recognizable under the
        // "demo" request, so selection falls through to the USD fallback.
        let balance = normalize(&body, AccountFlavor::Demo).unwrap();
        assert_eq!(balance.balance_id, "usd-1");
    }

    #[test]
    fn integer_amount_over_threshold_already_minor_units() {
        assert_eq!(to_cents(&json!(250_000)).unwrap(), 250_000);
    }

    #[test]
    fn small_integer_amount_is_multiplied() {
        assert_eq!(to_cents(&json!(42)).unwrap(), 4_200);
    }

    #[test]
    fn canonical_already_cents_is_idempotent() {
        let body = json!({"currency": "USD", "amount": 250_000, "id": "bx-2"});
        let first = normalize(&body, AccountFlavor::Real).unwrap();
        let reencoded = json!({
            "currency": first.currency,
            "amount": first.amount_cents,
            "id": first.balance_id,
        });
        let second = normalize(&reencoded, AccountFlavor::Real).unwrap();
        assert_eq!(first, second);
    }
}
