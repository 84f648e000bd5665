use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, TimeZone, Utc};
use csv::WriterBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::info;

use crate::{
    ExportArgs,
    api::{self, Coinalyze},
};

// Candle field aliases, highest priority first.
const TS_KEYS: &[&str] = &["t", "ts", "time", "timestamp"];
const OPEN_KEYS: &[&str] = &["o", "open"];
const HIGH_KEYS: &[&str] = &["h", "high"];
const LOW_KEYS: &[&str] = &["l", "low"];
const CLOSE_KEYS: &[&str] = &["c", "close"];
const VOLUME_KEYS: &[&str] = &["v", "volume"];
const BUY_VOLUME_KEYS: &[&str] = &["bv", "buy_volume", "volume_buy"];

const SUGGESTION_PREFIX: usize = 3;
const SUGGESTION_LIMIT: usize = 8;

#[derive(clap::ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON record per candle (unrecognized fields preserved)
    #[default]
    Jsonl,
    /// Fixed nine-column CSV
    Csv,
}

/// One flattened candle. Upstream values are kept verbatim; fields the alias
/// tables don't recognize ride along in `extra` (JSONL output only).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandleRow {
    pub symbol: String,
    pub interval: String,
    pub ts: Value,
    pub o: Value,
    pub h: Value,
    pub l: Value,
    pub c: Value,
    pub v: Value,
    pub bv: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which slice of history to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSelector {
    Day(NaiveDate),
    Range(NaiveDate, NaiveDate),
    Month(i32, u32),
}

impl DateSelector {
    /// Resolve to an inclusive `[from, to]` Unix-second window in UTC.
    pub fn window(&self) -> Result<(i64, i64)> {
        match *self {
            DateSelector::Day(d) => Ok((day_start(d), day_end(d))),
            DateSelector::Range(from, to) => {
                if to < from {
                    bail!("--to must not precede --from");
                }
                Ok((day_start(from), day_end(to)))
            }
            DateSelector::Month(year, month) => {
                let first = NaiveDate::from_ymd_opt(year, month, 1)
                    .with_context(|| format!("invalid month {year}-{month:02}"))?;
                let next = if month == 12 {
                    NaiveDate::from_ymd_opt(year + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)
                }
                .with_context(|| format!("invalid month {year}-{month:02}"))?;
                let last = next.pred_opt().context("month has no last day")?;
                Ok((day_start(first), day_end(last)))
            }
        }
    }
}

pub async fn execute(args: &ExportArgs) -> Result<()> {
    let symbol = args
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .context("--symbol is required")?;
    let out = args.out.as_deref().context("--out is required")?;
    let interval = args.interval.as_deref().unwrap_or("1min");
    let format = args.format.unwrap_or_default();

    let selector = resolve_selector(args)?;
    let (from_ts, to_ts) = selector.window()?;

    let (key, base) = api::resolve_credentials(args.api_key.as_deref(), args.base_url.as_deref())?;
    let api = Coinalyze::new(&key, &base)?;

    validate_symbol(&api, symbol).await?;

    info!("fetching {symbol} {interval} ohlcv for [{from_ts}, {to_ts}]");
    let payload = api.ohlcv_history(symbol, interval, from_ts, to_ts).await?;
    let rows = flatten_candles(&payload, symbol, interval);
    if rows.is_empty() {
        info!("no candles returned for the requested window");
    }

    match format {
        ExportFormat::Jsonl => write_jsonl(out, &rows)?,
        ExportFormat::Csv => write_csv(out, &rows)?,
    }
    info!("wrote {} rows to {}", rows.len(), out.display());
    Ok(())
}

/// Exactly one of --date, --from/--to, or --month.
pub fn resolve_selector(args: &ExportArgs) -> Result<DateSelector> {
    match (&args.date, &args.from_date, &args.to_date, &args.month) {
        (Some(d), None, None, None) => Ok(DateSelector::Day(parse_date(d)?)),
        (None, Some(f), Some(t), None) => Ok(DateSelector::Range(parse_date(f)?, parse_date(t)?)),
        (None, None, None, Some(m)) => {
            let (year, month) = parse_month(m)?;
            Ok(DateSelector::Month(year, month))
        }
        _ => bail!("exactly one of --date, --from/--to, or --month is required"),
    }
}

/// YYYYMMDD or YYYY-MM-DD.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    let fmt = if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        "%Y%m%d"
    } else {
        "%Y-%m-%d"
    };
    NaiveDate::parse_from_str(s, fmt)
        .with_context(|| format!("invalid date {s:?} (expected YYYYMMDD or YYYY-MM-DD)"))
}

/// YYYYMM or YYYY-MM.
pub fn parse_month(s: &str) -> Result<(i32, u32)> {
    let s = s.trim();
    let (y, m) = if s.len() == 6 && s.chars().all(|c| c.is_ascii_digit()) {
        (&s[..4], &s[4..])
    } else {
        s.split_once('-')
            .with_context(|| format!("invalid month {s:?} (expected YYYYMM or YYYY-MM)"))?
    };
    let year: i32 = y.parse().with_context(|| format!("invalid month {s:?}"))?;
    let month: u32 = m.parse().with_context(|| format!("invalid month {s:?}"))?;
    if !(1..=12).contains(&month) {
        bail!("invalid month {s:?} (month must be 01-12)");
    }
    Ok((year, month))
}

fn day_start(d: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()).timestamp()
}

fn day_end(d: NaiveDate) -> i64 {
    Utc.from_utc_datetime(&d.and_hms_opt(23, 59, 59).unwrap())
        .timestamp()
}

/// Reject symbols the discovery endpoints don't know, with a suggestion list
/// of similarly-prefixed ones. Futures are checked first, spot as fallback.
async fn validate_symbol(api: &Coinalyze, symbol: &str) -> Result<()> {
    let mut known: Vec<String> = api
        .future_markets()
        .await?
        .into_iter()
        .map(|m| m.symbol)
        .collect();
    if !known.iter().any(|s| s == symbol) {
        known.extend(api.spot_markets().await?.into_iter().map(|m| m.symbol));
    }
    if known.iter().any(|s| s == symbol) {
        return Ok(());
    }
    let hints = suggest_symbols(&known, symbol);
    if hints.is_empty() {
        bail!("symbol {symbol} not found in Coinalyze markets");
    }
    bail!(
        "symbol {symbol} not found in Coinalyze markets; similar: {}",
        hints.join(", ")
    )
}

/// Known symbols sharing the wanted symbol's leading prefix, deduped and
/// sorted, capped at eight.
pub fn suggest_symbols(known: &[String], wanted: &str) -> Vec<String> {
    let prefix: String = wanted
        .chars()
        .take(SUGGESTION_PREFIX)
        .collect::<String>()
        .to_uppercase();
    if prefix.is_empty() {
        return Vec::new();
    }
    known
        .iter()
        .filter(|s| s.to_uppercase().starts_with(&prefix))
        .cloned()
        .unique()
        .sorted()
        .take(SUGGESTION_LIMIT)
        .collect()
}

/// Flatten an OHLCV reply into fixed-shape rows. Accepts both the per-symbol
/// wrapper shape `[{symbol, history: [..]}]` and a bare candle array; the
/// wrapper's own symbol wins over the requested one.
pub fn flatten_candles(payload: &Value, requested_symbol: &str, interval: &str) -> Vec<CandleRow> {
    let Some(entries) = payload.as_array() else {
        return Vec::new();
    };
    let mut rows = Vec::new();
    for entry in entries {
        match entry.get("history").and_then(Value::as_array) {
            Some(history) => {
                let symbol = entry
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or(requested_symbol);
                for candle in history {
                    if let Some(row) = flatten_one(candle, symbol, interval) {
                        rows.push(row);
                    }
                }
            }
            None => {
                if let Some(row) = flatten_one(entry, requested_symbol, interval) {
                    rows.push(row);
                }
            }
        }
    }
    rows
}

fn flatten_one(candle: &Value, symbol: &str, interval: &str) -> Option<CandleRow> {
    let obj = candle.as_object()?;
    let mut extra = obj.clone();
    let ts = take_first(&mut extra, TS_KEYS);
    let o = take_first(&mut extra, OPEN_KEYS);
    let h = take_first(&mut extra, HIGH_KEYS);
    let l = take_first(&mut extra, LOW_KEYS);
    let c = take_first(&mut extra, CLOSE_KEYS);
    let v = take_first(&mut extra, VOLUME_KEYS);
    let bv = take_first(&mut extra, BUY_VOLUME_KEYS);
    Some(CandleRow {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        ts,
        o,
        h,
        l,
        c,
        v,
        bv,
        extra,
    })
}

fn take_first(map: &mut Map<String, Value>, keys: &[&str]) -> Value {
    for key in keys {
        if let Some(v) = map.remove(*key) {
            return v;
        }
    }
    Value::Null
}

fn out_dir(out: &Path) -> &Path {
    match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_jsonl(out: &Path, rows: &[CandleRow]) -> Result<()> {
    let dir = out_dir(out);
    fs::create_dir_all(dir).ok();
    let mut tmp = NamedTempFile::new_in(dir)?;
    for row in rows {
        writeln!(tmp.as_file_mut(), "{}", serde_json::to_string(row)?)?;
    }
    tmp.as_file_mut().flush()?;
    tmp.persist(out)?;
    Ok(())
}

fn write_csv(out: &Path, rows: &[CandleRow]) -> Result<()> {
    let dir = out_dir(out);
    fs::create_dir_all(dir).ok();
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        wtr.write_record(["symbol", "interval", "ts", "o", "h", "l", "c", "v", "bv"])?;
        for row in rows {
            wtr.write_record(&[
                row.symbol.clone(),
                row.interval.clone(),
                csv_field(&row.ts),
                csv_field(&row.o),
                csv_field(&row.h),
                csv_field(&row.l),
                csv_field(&row.c),
                csv_field(&row.v),
                csv_field(&row.bv),
            ])?;
        }
        wtr.flush()?;
    }
    tmp.persist(out)?;
    Ok(())
}

fn csv_field(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_wrapped_fixture_to_fixed_row() {
        let payload = json!([
            {"symbol": "BTCUSDT_PERP.A", "history": [
                {"t": 1000, "o": 1, "h": 2, "l": 0.5, "c": 1.5, "v": 10}
            ]}
        ]);
        let rows = flatten_candles(&payload, "BTCUSDT_PERP.A", "1min");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            serde_json::to_value(&rows[0]).unwrap(),
            json!({
                "symbol": "BTCUSDT_PERP.A",
                "interval": "1min",
                "ts": 1000,
                "o": 1,
                "h": 2,
                "l": 0.5,
                "c": 1.5,
                "v": 10,
                "bv": null
            })
        );
    }

    #[test]
    fn flattens_aliases_and_preserves_extras() {
        let payload = json!([
            {"symbol": "ETHUSDT_PERP.A", "history": [
                {"time": 2000, "open": 1, "high": 2, "low": 0.5, "close": 1.5,
                 "volume": 3, "buy_volume": 1.2, "vwap": 1.4}
            ]}
        ]);
        let rows = flatten_candles(&payload, "ignored", "5min");
        assert_eq!(rows.len(), 1);
        let row = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(row["symbol"], json!("ETHUSDT_PERP.A"));
        assert_eq!(row["ts"], json!(2000));
        assert_eq!(row["v"], json!(3));
        assert_eq!(row["bv"], json!(1.2));
        assert_eq!(row["vwap"], json!(1.4));
    }

    #[test]
    fn flattens_bare_candle_arrays() {
        let payload = json!([{"t": 1, "o": 1, "h": 1, "l": 1, "c": 1, "v": 1}]);
        let rows = flatten_candles(&payload, "BTCUSDT_PERP.A", "1min");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTCUSDT_PERP.A");
        assert_eq!(rows[0].ts, json!(1));
    }

    #[test]
    fn flatten_skips_non_object_candles_and_non_array_payloads() {
        assert!(flatten_candles(&json!({"error": "nope"}), "X", "1min").is_empty());
        let rows = flatten_candles(&json!([{"history": [1, 2, {"t": 3}]}]), "X", "1min");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn date_parses_both_formats() {
        let a = parse_date("20250801").unwrap();
        let b = parse_date("2025-08-01").unwrap();
        assert_eq!(a, b);
        assert!(parse_date("2025/08/01").is_err());
    }

    #[test]
    fn month_parses_both_formats() {
        assert_eq!(parse_month("202502").unwrap(), (2025, 2));
        assert_eq!(parse_month("2025-02").unwrap(), (2025, 2));
        assert!(parse_month("2025-13").is_err());
        assert!(parse_month("feb").is_err());
    }

    #[test]
    fn day_window_covers_the_utc_day() {
        let (from, to) = DateSelector::Day(parse_date("2025-08-01").unwrap())
            .window()
            .unwrap();
        assert_eq!(from, 1_754_006_400);
        assert_eq!(to, 1_754_092_799);
    }

    #[test]
    fn range_window_is_inclusive_of_both_ends() {
        let sel = DateSelector::Range(
            parse_date("2025-08-01").unwrap(),
            parse_date("2025-08-07").unwrap(),
        );
        let (from, to) = sel.window().unwrap();
        assert_eq!(from, 1_754_006_400);
        assert_eq!(to, 1_754_006_400 + 7 * 86_400 - 1);

        let backwards = DateSelector::Range(
            parse_date("2025-08-07").unwrap(),
            parse_date("2025-08-01").unwrap(),
        );
        assert!(backwards.window().is_err());
    }

    #[test]
    fn month_window_covers_the_whole_month() {
        let (from, to) = DateSelector::Month(2025, 2).window().unwrap();
        assert_eq!(from, 1_738_368_000); // 2025-02-01T00:00:00Z
        assert_eq!(to, 1_740_787_199); // 2025-02-28T23:59:59Z
    }

    #[test]
    fn selector_requires_exactly_one_date_form() {
        let none = ExportArgs::default();
        assert!(resolve_selector(&none).is_err());

        let both = ExportArgs {
            date: Some("20250801".into()),
            month: Some("202508".into()),
            ..Default::default()
        };
        assert!(resolve_selector(&both).is_err());

        let day = ExportArgs {
            date: Some("20250801".into()),
            ..Default::default()
        };
        assert_eq!(
            resolve_selector(&day).unwrap(),
            DateSelector::Day(parse_date("20250801").unwrap())
        );
    }

    #[test]
    fn suggestions_share_prefix_sorted_and_capped() {
        let known: Vec<String> = [
            "BTCUSDT_PERP.A",
            "BTCUSD_PERP.0",
            "BTCUSDT.C",
            "ETHUSDT_PERP.A",
            "btcusdt.x",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            suggest_symbols(&known, "BTCUSDT_PERP"),
            vec!["BTCUSDT.C", "BTCUSDT_PERP.A", "BTCUSD_PERP.0", "btcusdt.x"]
        );
        assert!(suggest_symbols(&known, "XRP").is_empty());
        assert!(suggest_symbols(&known, "").is_empty());
    }

    #[test]
    fn jsonl_writer_emits_one_record_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export.jsonl");
        let payload = json!([
            {"symbol": "BTCUSDT_PERP.A", "history": [
                {"t": 1, "o": 1, "h": 1, "l": 1, "c": 1, "v": 1},
                {"t": 2, "o": 2, "h": 2, "l": 2, "c": 2, "v": 2}
            ]}
        ]);
        let rows = flatten_candles(&payload, "BTCUSDT_PERP.A", "1min");
        write_jsonl(&out, &rows).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["ts"], json!(1));
    }

    #[test]
    fn csv_writer_emits_header_and_fixed_columns() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export.csv");
        let payload = json!([{"t": 1000, "o": 1, "h": 2, "l": 0.5, "c": 1.5, "v": 10}]);
        let rows = flatten_candles(&payload, "BTCUSDT_PERP.A", "1min");
        write_csv(&out, &rows).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "symbol,interval,ts,o,h,l,c,v,bv");
        assert_eq!(lines[1], "BTCUSDT_PERP.A,1min,1000,1,2,0.5,1.5,10,");
    }
}
