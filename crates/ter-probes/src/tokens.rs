//! Token accounting from the coding assistant's per-session JSONL logs.

use chrono::{Days, Local, NaiveDate};
use serde_json::Value;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use ter_core::model::{TokenUsage, UsageSource};
use ter_core::TtlCache;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

pub const CODEX_HOME_ENV: &str = "CODEX_HOME";
pub const TOKEN_PERIOD_DAYS: u32 = 7;
pub const MAX_TOKEN_FILES: usize = 200;
pub const TOKENS_TTL: Duration = Duration::from_secs(60);

/// `$CODEX_HOME/sessions`, falling back to `~/.codex/sessions`.
pub fn resolve_sessions_root() -> Option<PathBuf> {
    let home = match std::env::var(CODEX_HOME_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => dirs::home_dir()?.join(".codex"),
    };
    Some(home.join("sessions"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    input: i64,
    cached: i64,
    output: i64,
}

impl Counters {
    fn read(snapshot: &Value) -> Self {
        Self {
            input: count(snapshot.get("input_tokens")),
            cached: count(
                snapshot
                    .get("cached_input_tokens")
                    .filter(|value| !value.is_null())
                    .or_else(|| snapshot.get("cache_read_input_tokens")),
            ),
            output: count(snapshot.get("output_tokens")),
        }
    }

    fn add_growth(&mut self, current: Counters, previous: Counters) {
        self.input += (current.input - previous.input).max(0);
        self.cached += (current.cached - previous.cached).max(0);
        self.output += (current.output - previous.output).max(0);
    }
}

/// Numbers and numeric strings count; anything else is zero.
fn count(value: Option<&Value>) -> i64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) if !text.trim().is_empty() => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite()).map(|n| n as i64).unwrap_or(0)
}

/// Running totals across log files.
#[derive(Debug, Default)]
pub struct TokenTally {
    totals: Counters,
}

/// Per-file state: cumulative snapshots are diffed against the previous one
/// in the same file.
#[derive(Debug, Default)]
pub struct FileTally {
    previous_total: Option<Counters>,
}

impl TokenTally {
    pub fn record(&mut self, file: &mut FileTally, line: &str) {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            return;
        };
        let payload = record
            .get("payload")
            .filter(|payload| truthy(payload))
            .unwrap_or(&record);
        let Some(info) = payload
            .get("info")
            .filter(|info| truthy(info))
            .or_else(|| record.get("info").filter(|info| truthy(info)))
        else {
            return;
        };

        if let Some(total) = info.get("total_token_usage").filter(|v| truthy(v)) {
            let current = Counters::read(total);
            let previous = file.previous_total.unwrap_or_default();
            self.totals.add_growth(current, previous);
            file.previous_total = Some(current);
        } else if let Some(last) = info.get("last_token_usage").filter(|v| truthy(v)) {
            self.totals.add_growth(Counters::read(last), Counters::default());
        }
    }

    pub fn finish(self, period_days: u32, updated_at: i64) -> TokenUsage {
        let Counters {
            input,
            cached,
            output,
        } = self.totals;
        let input = input.max(0) as u64;
        let output = output.max(0) as u64;
        TokenUsage {
            input,
            cached: cached.max(0) as u64,
            output,
            total: input + output,
            period_days,
            updated_at,
            source: UsageSource::Logs,
        }
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// `.jsonl` files from the `YYYY/MM/DD` folders of the last `days` days,
/// newest day first, at most [`MAX_TOKEN_FILES`].
pub async fn list_log_files(root: &Path, today: NaiveDate, days: u32) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for offset in 0..days {
        let Some(date) = today.checked_sub_days(Days::new(u64::from(offset))) else {
            break;
        };
        let dir = root
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string());
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        let mut day_files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            let path = entry.path();
            if is_file && path.extension().is_some_and(|ext| ext == "jsonl") {
                day_files.push(path);
            }
        }
        day_files.sort();
        for path in day_files {
            files.push(path);
            if files.len() >= MAX_TOKEN_FILES {
                return files;
            }
        }
    }
    files
}

async fn tally_file(tally: &mut TokenTally, path: &Path) {
    let Ok(file) = tokio::fs::File::open(path).await else {
        return;
    };
    let mut state = FileTally::default();
    let mut lines = BufReader::new(file).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    tally.record(&mut state, &line);
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(event = "token_log_read_failed", path = %path.display(), error = %err);
                break;
            }
        }
    }
}

/// Sums token usage under `root`. `None` when the root is missing or holds no
/// log files in the period.
pub async fn scan_token_usage(root: &Path, today: NaiveDate, days: u32) -> Option<TokenUsage> {
    if tokio::fs::metadata(root).await.is_err() {
        return None;
    }
    let files = list_log_files(root, today, days).await;
    if files.is_empty() {
        return None;
    }
    let mut tally = TokenTally::default();
    for path in &files {
        tally_file(&mut tally, path).await;
    }
    debug!(event = "token_usage_scanned", files = files.len());
    Some(tally.finish(days, chrono::Utc::now().timestamp_millis()))
}

#[derive(Clone)]
pub struct TokenProbe {
    root: Option<Arc<Path>>,
    cache: Arc<TtlCache<(), Option<TokenUsage>, Infallible>>,
}

impl Default for TokenProbe {
    fn default() -> Self {
        Self::new(resolve_sessions_root())
    }
}

impl TokenProbe {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: root.map(Arc::from),
            cache: Arc::new(TtlCache::new()),
        }
    }

    pub async fn usage(&self) -> Option<TokenUsage> {
        let root = self.root.clone()?;
        let result = self
            .cache
            .get((), TOKENS_TTL, move || async move {
                let today = Local::now().date_naive();
                Ok(scan_token_usage(&root, today, TOKEN_PERIOD_DAYS).await)
            })
            .await;
        match result {
            Ok(usage) => usage,
            Err(never) => match never {},
        }
    }
}
