pub mod api;
pub mod cvd;
pub mod export;
pub mod live;
pub mod markets;
pub mod notify;
pub mod sink;

use clap::Parser;
use std::path::PathBuf;

use crate::export::ExportFormat;

/// Live collector args
#[derive(Parser, Debug, Clone, Default)]
#[command(
    version,
    about = "Poll Coinalyze for one symbol; persist snapshot + JSONL stream each cycle"
)]
pub struct LiveArgs {
    /// Symbol to poll, e.g. BTCUSDT_PERP.A (or set SYMBOL env)
    #[arg(long)]
    pub symbol: Option<String>,

    /// Interval token understood by the API, e.g. 1min, 5min (or INTERVAL env)
    #[arg(long)]
    pub interval: Option<String>,

    /// History window in hours (or WINDOW_HOURS env)
    #[arg(long)]
    pub window: Option<u64>,

    /// Base sleep between cycles in seconds (or SLEEP_SECONDS env)
    #[arg(long)]
    pub sleep: Option<u64>,

    /// Echo a truncated JSON excerpt of each block to stdout
    #[arg(long)]
    pub print_json: bool,

    /// Coinalyze API key (or set COINALYZE_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// API base URL override (or COINALYZE_BASE env)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Base directory for snapshots/ and streams/ (or DATA_DIR env)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep at most this many snapshot files
    #[arg(long)]
    pub max_snapshots: Option<usize>,

    /// Cap total stream storage, MiB
    #[arg(long)]
    pub max_stream_mb: Option<u64>,

    /// Optional lock file path to prevent concurrent collectors
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Historical OHLCV exporter: one flattened JSON (or CSV) record per candle.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct ExportArgs {
    /// Symbol to export, e.g. BTCUSDT_PERP.A
    #[arg(long)]
    pub symbol: Option<String>,

    /// Interval token, e.g. 1min, 5min
    #[arg(long)]
    pub interval: Option<String>,

    /// Single day, YYYYMMDD or YYYY-MM-DD
    #[arg(long)]
    pub date: Option<String>,

    /// Range start date (inclusive)
    #[arg(long = "from")]
    pub from_date: Option<String>,

    /// Range end date (inclusive)
    #[arg(long = "to")]
    pub to_date: Option<String>,

    /// Whole month, YYYYMM or YYYY-MM
    #[arg(long)]
    pub month: Option<String>,

    /// Output path
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<ExportFormat>,

    /// Coinalyze API key (or set COINALYZE_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// API base URL override (or COINALYZE_BASE env)
    #[arg(long)]
    pub base_url: Option<String>,
}

/// Market discovery listing
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct MarketsArgs {
    /// Filter by base asset substring, e.g. BTC
    #[arg(long)]
    pub base: Option<String>,

    /// List spot markets instead of futures
    #[arg(long)]
    pub spot: bool,

    /// Dump the exchange directory instead of markets
    #[arg(long)]
    pub exchanges: bool,

    /// Coinalyze API key (or set COINALYZE_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// API base URL override (or COINALYZE_BASE env)
    #[arg(long)]
    pub base_url: Option<String>,
}
