use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    LiveArgs,
    api::{self, Coinalyze},
    cvd::compute_cvd,
    notify::{Notifier, build_embed},
    sink::DataSink,
};

pub const DEFAULT_MAX_SNAPSHOTS: usize = 1000;
pub const DEFAULT_MAX_STREAM_MB: u64 = 200;

const RETENTION_EVERY: u64 = 60;
const MAX_BACKOFF: Duration = Duration::from_secs(600);
const ECHO_LIMIT: usize = 800;

/// One cycle's complete set of fetched snapshots, histories and derived
/// metrics. Immutable once produced; written once to each sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchBlock {
    pub symbol: String,
    pub interval: String,
    pub window_hours: u64,
    pub snapshots: Snapshots,
    pub history: History,
    pub computed: Computed,
    pub fetched_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshots {
    pub open_interest: Value,
    pub funding_rate: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub open_interest: Value,
    pub funding_rate: Value,
    pub predicted_funding_rate: Value,
    pub liquidations: Value,
    pub long_short_ratio: Value,
    pub ohlcv: Value,
    /// Raw taker buy/sell series when the endpoint exists upstream.
    pub taker: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Computed {
    pub cvd: Option<f64>,
}

/// Resolved loop configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub symbol: String,
    pub interval: String,
    pub window_hours: u64,
    pub sleep_secs: u64,
    pub print_json: bool,
    pub data_dir: PathBuf,
    pub max_snapshots: usize,
    pub max_stream_bytes: u64,
}

/// Cooperative shutdown token: the signal task trips it, the loop checks it
/// at the top of each cycle. In-flight cycles complete.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn install_signal_handler(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received; finishing the current cycle");
            flag.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Failure backoff: sleep the current delay, then double it up to the cap.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
        }
    }

    /// Delay for this failure; the next one doubles, capped at 600 s.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

pub async fn execute(args: &LiveArgs) -> Result<()> {
    let cfg = resolve_config(args)?;
    let (key, base) = api::resolve_credentials(args.api_key.as_deref(), args.base_url.as_deref())?;
    let api = Coinalyze::new(&key, &base)?;
    let sink = DataSink::new(&cfg.data_dir)?;
    let notifier = Notifier::from_env()?;

    // Optional single-instance lock: one collector per artifact set.
    let _lock_guard = match args.lock_file.as_deref() {
        Some(path) => Some(acquire_lock(path)?),
        None => None,
    };

    println!("=== Coinalyze Live Collector ===");
    println!(
        "Symbol: {} | Interval: {} | Window(h): {}",
        cfg.symbol, cfg.interval, cfg.window_hours
    );
    println!("Ctrl+C to stop.\n");

    let shutdown = ShutdownFlag::new();
    shutdown.install_signal_handler();
    run_loop(&api, &sink, &notifier, &cfg, shutdown).await
}

/// Apply CLI/env fallbacks and validate. Missing symbol is startup-fatal.
pub fn resolve_config(args: &LiveArgs) -> Result<LiveConfig> {
    let symbol = args
        .symbol
        .clone()
        .or_else(|| env::var("SYMBOL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .context("symbol required (set SYMBOL or pass --symbol)")?;
    let interval = args
        .interval
        .clone()
        .or_else(|| env::var("INTERVAL").ok())
        .unwrap_or_else(|| "5min".to_string());
    let window_hours = args.window.or_else(|| env_parse("WINDOW_HOURS")).unwrap_or(6);
    let sleep_secs = args.sleep.or_else(|| env_parse("SLEEP_SECONDS")).unwrap_or(60);
    if window_hours == 0 {
        bail!("--window must be positive");
    }
    if sleep_secs == 0 {
        bail!("--sleep must be positive");
    }
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| env::var("DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./data"));
    Ok(LiveConfig {
        symbol,
        interval,
        window_hours,
        sleep_secs,
        print_json: args.print_json,
        data_dir,
        max_snapshots: args.max_snapshots.unwrap_or(DEFAULT_MAX_SNAPSHOTS),
        max_stream_bytes: args.max_stream_mb.unwrap_or(DEFAULT_MAX_STREAM_MB) * 1024 * 1024,
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Acquire an exclusive file lock; keep the handle alive to hold it.
fn acquire_lock(lock_path: &Path) -> Result<fs::File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).ok();
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.try_lock_exclusive()
        .with_context(|| format!("another collector holds {}", lock_path.display()))?;
    Ok(file)
}

/// Run cycles until the shutdown flag is observed.
pub async fn run_loop(
    api: &Coinalyze,
    sink: &DataSink,
    notifier: &Notifier,
    cfg: &LiveConfig,
    shutdown: ShutdownFlag,
) -> Result<()> {
    let mut backoff = Backoff::new(Duration::from_secs(cfg.sleep_secs));
    let mut cycle: u64 = 0;

    while !shutdown.is_triggered() {
        let now_ts = Utc::now().timestamp();
        match run_cycle(api, sink, notifier, cfg, now_ts).await {
            Ok(report) => {
                println!("{}", report.summary);
                if let Some(echo) = report.echo {
                    println!("{echo}");
                }
                cycle += 1;
                if cycle % RETENTION_EVERY == 0 {
                    sink.retention_cleanup(cfg.max_snapshots, cfg.max_stream_bytes);
                }
                backoff.reset();
                sleep(jittered_sleep(cfg.sleep_secs)).await;
            }
            Err(e) => {
                let delay = backoff.next();
                println!(
                    "[{}] ERROR: {:#} | backoff:{}s",
                    Local::now().format("%H:%M:%S"),
                    e,
                    delay.as_secs()
                );
                sleep(delay).await;
            }
        }
    }

    info!("shutdown flag observed; exiting loop");
    Ok(())
}

/// What one successful cycle produced.
#[derive(Debug)]
pub struct CycleReport {
    pub snapshot_path: PathBuf,
    pub stream_path: PathBuf,
    pub summary: String,
    pub echo: Option<String>,
}

/// One complete fetch-persist-notify sequence.
pub async fn run_cycle(
    api: &Coinalyze,
    sink: &DataSink,
    notifier: &Notifier,
    cfg: &LiveConfig,
    now_ts: i64,
) -> Result<CycleReport> {
    let started = Instant::now();
    let block = fetch_block(api, &cfg.symbol, &cfg.interval, cfg.window_hours, now_ts).await?;

    let snapshot_path = sink.write_snapshot(&block)?;
    let stream_path = sink.append_stream(&block)?;

    let summary = summary_line(&block, &snapshot_path, started.elapsed());
    let echo = cfg.print_json.then(|| truncated_json(&block, ECHO_LIMIT));

    let title = format!("Coinalyze • {} • {}", block.symbol, block.interval);
    match notifier.post_summary(&title, &build_embed(&block)).await {
        Ok(true) => debug!("webhook summary delivered"),
        Ok(false) => {}
        Err(e) => warn!("webhook post failed: {e:#}"),
    }

    Ok(CycleReport {
        snapshot_path,
        stream_path,
        summary,
        echo,
    })
}

/// Gather one block: two current snapshots, six histories, plus the
/// best-effort taker series for CVD.
pub async fn fetch_block(
    api: &Coinalyze,
    symbol: &str,
    interval: &str,
    window_hours: u64,
    now_ts: i64,
) -> Result<FetchBlock> {
    let to = now_ts;
    let from = to - (window_hours as i64) * 3600;

    let open_interest = api.open_interest(symbol, false).await?;
    let funding_rate = api.funding_rate(symbol).await?;

    let oi_history = api.open_interest_history(symbol, interval, from, to, false).await?;
    let fr_history = api.funding_rate_history(symbol, interval, from, to).await?;
    let pfr_history = api
        .predicted_funding_rate_history(symbol, interval, from, to)
        .await?;
    let liq_history = api.liquidation_history(symbol, interval, from, to, false).await?;
    let ls_history = api.long_short_ratio_history(symbol, interval, from, to).await?;
    let ohlcv = api.ohlcv_history(symbol, interval, from, to).await?;

    // Best-effort: absence of the taker endpoint is a legitimate outcome,
    // and no taker failure is allowed to fail the cycle.
    let taker = match api.taker_volume_history(symbol, interval, from, to).await {
        Ok(t) => t,
        Err(e) => {
            debug!("taker volume fetch failed: {e}");
            None
        }
    };
    let cvd = taker.as_ref().and_then(compute_cvd);

    Ok(FetchBlock {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        window_hours,
        snapshots: Snapshots {
            open_interest,
            funding_rate,
        },
        history: History {
            open_interest: oi_history,
            funding_rate: fr_history,
            predicted_funding_rate: pfr_history,
            liquidations: liq_history,
            long_short_ratio: ls_history,
            ohlcv,
            taker,
        },
        computed: Computed { cvd },
        fetched_at: now_ts,
    })
}

/// One-line human summary of a cycle.
pub fn summary_line(block: &FetchBlock, snapshot_path: &Path, elapsed: Duration) -> String {
    let cvd = block
        .computed
        .cvd
        .map_or_else(|| "NA".to_string(), |v| v.to_string());
    let saved = snapshot_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("?");
    format!(
        "[{}] {} TF:{} OI:{} FR:{} Candles:{} LIQ:{} LS:{} CVD:{} Saved:{} Dur:{:.2}s",
        Local::now().format("%H:%M:%S"),
        block.symbol,
        block.interval,
        snapshot_value(&block.snapshots.open_interest),
        snapshot_value(&block.snapshots.funding_rate),
        record_count(&block.history.ohlcv),
        record_count(&block.history.liquidations),
        record_count(&block.history.long_short_ratio),
        cvd,
        saved,
        elapsed.as_secs_f64(),
    )
}

/// `value` of the first entry in a snapshot reply shaped `[{..}, ..]`.
pub fn snapshot_value(payload: &Value) -> String {
    let field = payload
        .as_array()
        .and_then(|a| a.first())
        .and_then(|e| e.get("value"));
    match field {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "?".to_string(),
    }
}

/// Record count of a history reply: sums per-symbol `history` arrays when the
/// reply uses the wrapper shape, otherwise the top-level length.
pub fn record_count(payload: &Value) -> usize {
    let Some(entries) = payload.as_array() else {
        return 0;
    };
    let mut nested = 0usize;
    let mut saw_nested = false;
    for entry in entries {
        if let Some(history) = entry.get("history").and_then(Value::as_array) {
            saw_nested = true;
            nested += history.len();
        }
    }
    if saw_nested { nested } else { entries.len() }
}

fn truncated_json(block: &FetchBlock, limit: usize) -> String {
    let s = serde_json::to_string(block).unwrap_or_default();
    if s.chars().count() <= limit {
        s
    } else {
        let cut: String = s.chars().take(limit).collect();
        format!("{cut}...")
    }
}

/// Base sleep plus a uniform random jitter in `[0, 0.25 * base)`.
fn jittered_sleep(base_secs: u64) -> Duration {
    let base = base_secs as f64;
    let jitter = rand::thread_rng().gen_range(0.0..0.25) * base;
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_block(cvd: Option<f64>) -> FetchBlock {
        FetchBlock {
            symbol: "BTCUSDT_PERP.A".into(),
            interval: "5min".into(),
            window_hours: 6,
            snapshots: Snapshots {
                open_interest: json!([{"symbol": "BTCUSDT_PERP.A", "value": 61234.5}]),
                funding_rate: json!([{"symbol": "BTCUSDT_PERP.A", "value": "0.0001"}]),
            },
            history: History {
                open_interest: json!([]),
                funding_rate: json!([]),
                predicted_funding_rate: json!([]),
                liquidations: json!([{"symbol": "BTCUSDT_PERP.A", "history": [{"t": 1}]}]),
                long_short_ratio: json!([{"symbol": "BTCUSDT_PERP.A", "history": []}]),
                ohlcv: json!([{"symbol": "BTCUSDT_PERP.A", "history": [{"t": 1}, {"t": 2}]}]),
                taker: None,
            },
            computed: Computed { cvd },
            fetched_at: 1_722_900_000,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(60));
        assert_eq!(backoff.next(), Duration::from_secs(120));
        assert_eq!(backoff.next(), Duration::from_secs(240));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(60));

        let mut backoff = Backoff::new(Duration::from_secs(400));
        assert_eq!(backoff.next(), Duration::from_secs(400));
        assert_eq!(backoff.next(), Duration::from_secs(600));
        assert_eq!(backoff.next(), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_base() {
        for _ in 0..200 {
            let d = jittered_sleep(60);
            assert!(d >= Duration::from_secs(60));
            assert!(d < Duration::from_secs(75));
        }
    }

    #[test]
    fn summary_names_symbol_interval_and_metrics() {
        let block = sample_block(Some(-12.5));
        let line = summary_line(&block, Path::new("/data/snapshots/x.json"), Duration::from_millis(1500));
        assert!(line.contains("BTCUSDT_PERP.A"));
        assert!(line.contains("TF:5min"));
        assert!(line.contains("OI:61234.5"));
        assert!(line.contains("FR:0.0001"));
        assert!(line.contains("Candles:2"));
        assert!(line.contains("LIQ:1"));
        assert!(line.contains("LS:0"));
        assert!(line.contains("CVD:-12.5"));
        assert!(line.contains("Saved:x.json"));
        assert!(line.contains("Dur:1.50s"));
    }

    #[test]
    fn summary_prints_na_when_cvd_absent() {
        let line = summary_line(&sample_block(None), Path::new("x.json"), Duration::ZERO);
        assert!(line.contains("CVD:NA"));
    }

    #[test]
    fn record_count_handles_wrapper_and_flat_shapes() {
        assert_eq!(record_count(&json!([{"history": [1, 2, 3]}, {"history": [4]}])), 4);
        assert_eq!(record_count(&json!([{"t": 1}, {"t": 2}])), 2);
        assert_eq!(record_count(&json!([])), 0);
        assert_eq!(record_count(&json!({"not": "an array"})), 0);
    }

    #[test]
    fn snapshot_value_reads_first_entry() {
        assert_eq!(snapshot_value(&json!([{"value": 5}])), "5");
        assert_eq!(snapshot_value(&json!([{"value": "0.01"}])), "0.01");
        assert_eq!(snapshot_value(&json!([])), "?");
        assert_eq!(snapshot_value(&json!([{"other": 1}])), "?");
    }

    #[test]
    fn echo_truncates_long_blocks() {
        let block = sample_block(None);
        let full = serde_json::to_string(&block).unwrap();
        assert_eq!(truncated_json(&block, full.len()), full);
        let cut = truncated_json(&block, 10);
        assert_eq!(cut.chars().count(), 13);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn shutdown_flag_round_trip() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_triggered());
        let other = flag.clone();
        other.trigger();
        assert!(flag.is_triggered());
    }

    #[test]
    fn resolve_config_applies_defaults_and_validates() {
        let args = LiveArgs {
            symbol: Some("BTCUSDT_PERP.A".into()),
            interval: Some("1min".into()),
            window: Some(12),
            sleep: Some(30),
            data_dir: Some(PathBuf::from("/tmp/data")),
            ..Default::default()
        };
        let cfg = resolve_config(&args).unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT_PERP.A");
        assert_eq!(cfg.interval, "1min");
        assert_eq!(cfg.window_hours, 12);
        assert_eq!(cfg.sleep_secs, 30);
        assert_eq!(cfg.max_snapshots, DEFAULT_MAX_SNAPSHOTS);
        assert_eq!(cfg.max_stream_bytes, DEFAULT_MAX_STREAM_MB * 1024 * 1024);

        let zero_window = LiveArgs {
            symbol: Some("X".into()),
            window: Some(0),
            ..Default::default()
        };
        assert!(resolve_config(&zero_window).is_err());
    }
}
