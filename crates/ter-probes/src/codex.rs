//! Coding-assistant quota probe.
//!
//! Usage is read through an ordered list of strategies. The app-server RPC is
//! authoritative and tried first; scraping the interactive `/status` screen is
//! the fallback.

use crate::error::ProbeError;
use chrono::{DateTime, SecondsFormat};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use ter_core::model::{ProviderUsage, UsageSource, UsageWindow};
use ter_core::pty::{run_pty_command, strip_ansi, PtyError, PtyOptions};
use ter_core::rpc::{RpcError, RpcSession};
use ter_core::TtlCache;
use tracing::{debug, info};

pub const CODEX_TTL: Duration = Duration::from_secs(60);
pub const CODEX_BIN_ENV: &str = "TER_CODEX_BIN";
const RPC_SESSION_TIMEOUT: Duration = Duration::from_secs(7);
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const SCREEN_TIMEOUT: Duration = Duration::from_secs(8);
const SANDBOX_ARGS: [&str; 4] = ["-s", "read-only", "-a", "untrusted"];

/// Phrases the `/status` screen is expected to contain. Kept together so a
/// CLI wording change is a one-place edit.
pub mod patterns {
    use regex::Regex;
    use std::sync::OnceLock;

    macro_rules! pattern {
        ($name:ident, $re:expr) => {
            pub fn $name() -> &'static Regex {
                static CELL: OnceLock<Regex> = OnceLock::new();
                CELL.get_or_init(|| Regex::new($re).expect("valid regex"))
            }
        };
    }

    pattern!(percent_left, r"(?i)(\d{1,3})%\s*(?:left|remaining)");
    pattern!(percent_used, r"(?i)(\d{1,3})%\s*used");
    pattern!(percent_any, r"(\d{1,3})%");
    pattern!(percent_token, r"\b\d{1,3}%");
    pattern!(reset_phrase, r"(?i)resets?\s*(?:in|at)?\s*(.*)$");
    pattern!(credits, r"(?i)Credits:\s*([0-9][0-9.,]*)");
    pattern!(five_hour_compact, r"(?i)5\s*h");
    pattern!(five_hour_dashed, r"(?i)5-hour");
    pattern!(five_hour_spaced, r"(?i)5 hour");
    pattern!(weekly, r"(?i)week");
}

/// `max(0, round(100 - used))`; an absent or non-finite input stays absent.
pub fn percent_left_from_used(used: Option<f64>) -> Option<u32> {
    used.filter(|value| value.is_finite())
        .map(|value| (100.0 - value).round().max(0.0) as u32)
}

pub fn percent_left_from_line(line: &str) -> Option<u32> {
    if let Some(caps) = patterns::percent_left().captures(line) {
        return caps[1].parse().ok();
    }
    if let Some(caps) = patterns::percent_used().captures(line) {
        let used: u32 = caps[1].parse().ok()?;
        return Some(100u32.saturating_sub(used));
    }
    patterns::percent_any()
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

pub fn reset_from_line(line: &str) -> Option<String> {
    patterns::reset_phrase()
        .captures(line)
        .map(|caps| caps[1].trim().to_string())
        .filter(|reset| !reset.is_empty())
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "")
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn epoch_to_iso(seconds: f64) -> Option<String> {
    let millis = (seconds * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis).map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn rate_limit_window(window: &Value) -> UsageWindow {
    UsageWindow {
        percent_left: percent_left_from_used(window.get("usedPercent").and_then(Value::as_f64)),
        reset: window
            .get("resetsAt")
            .and_then(Value::as_f64)
            .and_then(epoch_to_iso),
    }
}

/// Maps an `account/rateLimits/read` payload onto usage windows. The payload
/// may nest everything under `rateLimits`.
pub fn usage_from_rate_limits(payload: &Value) -> ProviderUsage {
    let limits = payload
        .get("rateLimits")
        .filter(|value| value.is_object())
        .unwrap_or(payload);
    let mut usage = ProviderUsage::new(UsageSource::Rpc);
    usage.session = limits.get("primary").map(rate_limit_window);
    usage.weekly = limits.get("secondary").map(rate_limit_window);
    usage.credits = limits
        .get("credits")
        .and_then(|credits| credits.get("balance"))
        .and_then(|balance| match balance {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => parse_number(text),
            _ => None,
        });
    usage
}

/// Recovers usage from a rendered `/status` screen.
pub fn parse_status_screen(raw: &str) -> Result<ProviderUsage, ProbeError> {
    let clean = strip_ansi(raw);
    let clean = clean.trim();
    if clean.is_empty() {
        return Err(ProbeError::Protocol("codex status unavailable".to_string()));
    }
    let lower = clean.to_lowercase();
    if lower.contains("update available") && lower.contains("codex") {
        return Err(ProbeError::UpdateRequired("codex update required".to_string()));
    }

    let lines: Vec<&str> = clean.lines().collect();
    let find = |pattern: &regex::Regex| lines.iter().copied().find(|line| pattern.is_match(line));
    let five_hour = find(patterns::five_hour_compact())
        .or_else(|| find(patterns::five_hour_dashed()))
        .or_else(|| find(patterns::five_hour_spaced()));
    let week = find(patterns::weekly());
    let window = |line: &str| UsageWindow {
        percent_left: percent_left_from_line(line),
        reset: reset_from_line(line),
    };

    let mut session = five_hour.map(window);
    let mut weekly = week.map(window);
    let percent_lines: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| patterns::percent_token().is_match(line))
        .collect();
    if let Some(session) = session.as_mut().filter(|w| w.percent_left.is_none()) {
        session.percent_left = percent_lines.first().and_then(|line| percent_left_from_line(line));
    }
    if let Some(weekly) = weekly.as_mut().filter(|w| w.percent_left.is_none()) {
        weekly.percent_left = percent_lines.get(1).and_then(|line| percent_left_from_line(line));
    }

    let has_percent = |w: &Option<UsageWindow>| w.as_ref().and_then(|w| w.percent_left).is_some();
    if !has_percent(&session) && !has_percent(&weekly) {
        return Err(ProbeError::Protocol("codex status unavailable".to_string()));
    }

    let mut usage = ProviderUsage::new(UsageSource::Cli);
    usage.session = session;
    usage.weekly = weekly;
    usage.credits = patterns::credits()
        .captures(clean)
        .and_then(|caps| parse_number(&caps[1]));
    Ok(usage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageStrategy {
    AppServerRpc,
    StatusScreen,
}

impl UsageStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStrategy::AppServerRpc => "app_server_rpc",
            UsageStrategy::StatusScreen => "status_screen",
        }
    }

    pub async fn run(&self, binary: &str) -> Result<ProviderUsage, ProbeError> {
        match self {
            UsageStrategy::AppServerRpc => read_rate_limits(binary).await,
            UsageStrategy::StatusScreen => scrape_status_screen(binary).await,
        }
    }
}

/// Tries each strategy in order and returns the first success.
///
/// When all fail: a missing binary stops the chain at once, an update-required
/// screen outranks everything else, and otherwise the first strategy's error is
/// reported.
pub async fn run_chain(
    binary: &str,
    strategies: &[UsageStrategy],
) -> Result<ProviderUsage, ProbeError> {
    let mut first_error = None;
    for strategy in strategies {
        match strategy.run(binary).await {
            Ok(usage) => {
                debug!(event = "codex_usage_read", strategy = strategy.as_str());
                return Ok(usage);
            }
            Err(err) => {
                info!(event = "codex_strategy_failed", strategy = strategy.as_str(), error = %err);
                match err {
                    ProbeError::ToolMissing(_) | ProbeError::UpdateRequired(_) => return Err(err),
                    _ => {
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
    }
    Err(first_error.unwrap_or_else(|| ProbeError::Failed("codex status unavailable".to_string())))
}

async fn read_rate_limits(binary: &str) -> Result<ProviderUsage, ProbeError> {
    let mut args: Vec<&str> = SANDBOX_ARGS.to_vec();
    args.push("app-server");
    let session = RpcSession::spawn(binary, &args).map_err(rpc_failure)?;
    let payload = session
        .run(RPC_SESSION_TIMEOUT, |client| async move {
            client
                .call(
                    "initialize",
                    json!({ "clientInfo": { "name": "ter", "version": env!("CARGO_PKG_VERSION") } }),
                    RPC_CALL_TIMEOUT,
                )
                .await?;
            client.notify("initialized", json!({})).await?;
            client
                .call("account/rateLimits/read", json!({}), RPC_CALL_TIMEOUT)
                .await
        })
        .await
        .map_err(rpc_failure)?;
    Ok(usage_from_rate_limits(&payload))
}

fn rpc_failure(err: RpcError) -> ProbeError {
    match err {
        RpcError::NotFound(_) => ProbeError::ToolMissing("codex not installed".to_string()),
        RpcError::SessionTimeout => ProbeError::Timeout("codex rpc timeout".to_string()),
        RpcError::Closed => ProbeError::Unreachable("codex rpc closed".to_string()),
        RpcError::Timeout(method) => {
            ProbeError::Timeout(format!("codex rpc failed: {method} request timeout"))
        }
        other => ProbeError::Failed(format!("codex rpc failed: {other}")),
    }
}

async fn scrape_status_screen(binary: &str) -> Result<ProviderUsage, ProbeError> {
    let args: Vec<String> = SANDBOX_ARGS.iter().map(|arg| arg.to_string()).collect();
    let options = PtyOptions::default().with_timeout(SCREEN_TIMEOUT);
    let output = run_pty_command(binary, &args, "/status\n", &options)
        .await
        .map_err(|err| match err {
            PtyError::NotFound(_) => ProbeError::ToolMissing("codex not installed".to_string()),
            other => ProbeError::Failed(other.to_string()),
        })?;
    parse_status_screen(&output)
}

/// `TER_CODEX_BIN` when set, otherwise `codex` from `PATH`.
pub fn resolve_binary() -> String {
    std::env::var(CODEX_BIN_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "codex".to_string())
}

#[derive(Clone)]
pub struct CodexProbe {
    binary: Arc<str>,
    strategies: Arc<[UsageStrategy]>,
    cache: Arc<TtlCache<(), ProviderUsage, ProbeError>>,
}

impl Default for CodexProbe {
    fn default() -> Self {
        Self::new(resolve_binary())
    }
}

impl CodexProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self::with_strategies(
            binary,
            vec![UsageStrategy::AppServerRpc, UsageStrategy::StatusScreen],
        )
    }

    pub fn with_strategies(binary: impl Into<String>, strategies: Vec<UsageStrategy>) -> Self {
        Self {
            binary: Arc::from(binary.into()),
            strategies: Arc::from(strategies),
            cache: Arc::new(TtlCache::new()),
        }
    }

    pub async fn usage(&self) -> Result<ProviderUsage, ProbeError> {
        let binary = self.binary.clone();
        let strategies = self.strategies.clone();
        self.cache
            .get((), CODEX_TTL, move || async move {
                run_chain(&binary, &strategies).await
            })
            .await
    }
}
