use serde_json::Value;

// Upstream field naming is not contractually fixed, so each logical field is
// resolved through a prioritized alias list.
const ROW_CONTAINER_KEYS: &[&str] = &["data", "history"];
const BUY_KEYS: &[&str] = &["buy_volume", "taker_buy", "buy"];
const SELL_KEYS: &[&str] = &["sell_volume", "taker_sell", "sell"];

/// Cumulative volume delta over a taker buy/sell history payload: the running
/// sum of `buy - sell` across all rows in the window.
///
/// Best-effort and schema-tolerant: an empty/absent payload or an unrecognized
/// shape yields `None` ("not computable"), rows whose values cannot be coerced
/// to numbers are skipped, and a missing or falsy field counts as zero.
pub fn compute_cvd(payload: &Value) -> Option<f64> {
    if is_empty_payload(payload) {
        return None;
    }
    let rows = locate_rows(payload)?;
    let mut cvd = 0.0;
    for row in rows {
        let Some(obj) = row.as_object() else { continue };
        let buy = pick_field(obj, BUY_KEYS).map_or(Some(0.0), coerce_f64);
        let sell = pick_field(obj, SELL_KEYS).map_or(Some(0.0), coerce_f64);
        match (buy, sell) {
            (Some(b), Some(s)) => cvd += b - s,
            _ => continue,
        }
    }
    Some(cvd)
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Find the row sequence: a known container key holding an array, or the
/// payload itself when it already is one.
fn locate_rows(payload: &Value) -> Option<&[Value]> {
    if let Some(map) = payload.as_object() {
        for key in ROW_CONTAINER_KEYS {
            if let Some(Value::Array(rows)) = map.get(*key) {
                return Some(rows);
            }
        }
        return None;
    }
    payload.as_array().map(Vec::as_slice)
}

/// First candidate field that is present and truthy; `None` means "count as zero".
fn pick_field<'a>(row: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    for key in keys {
        if let Some(v) = row.get(*key)
            && is_truthy(v)
        {
            return Some(v);
        }
    }
    None
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
