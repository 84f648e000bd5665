use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::live::FetchBlock;

/// Persistence sink for fetch blocks: point-in-time snapshots under
/// `<base>/snapshots/` and append-only JSONL streams under `<base>/streams/`.
#[derive(Debug, Clone)]
pub struct DataSink {
    snapshot_dir: PathBuf,
    stream_dir: PathBuf,
}

impl DataSink {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let snapshot_dir = base_dir.join("snapshots");
        let stream_dir = base_dir.join("streams");
        fs::create_dir_all(&snapshot_dir).context("create snapshot dir")?;
        fs::create_dir_all(&stream_dir).context("create stream dir")?;
        Ok(Self {
            snapshot_dir,
            stream_dir,
        })
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn stream_dir(&self) -> &Path {
        &self.stream_dir
    }

    /// Write the block as a new uniquely named snapshot artifact, atomically.
    pub fn write_snapshot(&self, block: &FetchBlock) -> Result<PathBuf> {
        let name = format!(
            "{}_{}_{}.json",
            sanitize_symbol(&block.symbol),
            block.interval,
            block.fetched_at
        );
        let path = self.snapshot_dir.join(name);
        let mut tmp = NamedTempFile::new_in(&self.snapshot_dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), block)?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&path)?;
        Ok(path)
    }

    /// Append one compact JSON line to the (symbol, interval)-keyed stream,
    /// creating the file if absent.
    pub fn append_stream(&self, block: &FetchBlock) -> Result<PathBuf> {
        let name = format!("{}_{}.jsonl", sanitize_symbol(&block.symbol), block.interval);
        let path = self.stream_dir.join(name);
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{}", serde_json::to_string(block)?)?;
        f.flush()?;
        Ok(path)
    }

    /// Enforce the retention boundary: at most `max_snapshots` snapshot files
    /// and at most `max_stream_bytes` of stream data, deleting oldest first.
    /// Never propagates a failure into the calling loop.
    pub fn retention_cleanup(&self, max_snapshots: usize, max_stream_bytes: u64) {
        if let Err(e) = self.enforce_snapshot_count(max_snapshots) {
            warn!("snapshot retention pass failed: {e}");
        }
        if let Err(e) = self.enforce_stream_budget(max_stream_bytes) {
            warn!("stream retention pass failed: {e}");
        }
    }

    fn enforce_snapshot_count(&self, max: usize) -> std::io::Result<()> {
        let files = list_by_mtime(&self.snapshot_dir, "json")?;
        if files.len() <= max {
            return Ok(());
        }
        let excess = files.len() - max;
        for (path, _, _) in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                debug!("could not remove {}: {e}", path.display());
            }
        }
        Ok(())
    }

    fn enforce_stream_budget(&self, max_bytes: u64) -> std::io::Result<()> {
        let files = list_by_mtime(&self.stream_dir, "jsonl")?;
        let mut total: u64 = files.iter().map(|(_, _, len)| len).sum();
        for (path, _, len) in files {
            if total <= max_bytes {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => total -= len,
                Err(e) => debug!("could not remove {}: {e}", path.display()),
            }
        }
        Ok(())
    }
}

fn sanitize_symbol(symbol: &str) -> String {
    symbol.replace('/', "_")
}

/// (path, mtime, size) for every `.ext` file in `dir`, oldest first.
fn list_by_mtime(dir: &Path, ext: &str) -> std::io::Result<Vec<(PathBuf, SystemTime, u64)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().unwrap_or_default() != ext {
            continue;
        }
        let meta = entry.metadata()?;
        files.push((path, meta.modified()?, meta.len()));
    }
    files.sort_by_key(|(_, mtime, _)| *mtime);
    Ok(files)
}
