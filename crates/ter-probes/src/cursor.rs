use crate::error::ProbeError;
use crate::oauth::{
    fetch_json, home_path, http_client, resolve_credential, rounded_percent, AuthAttempt,
    CredentialSource,
};
use reqwest::header::{HeaderMap, COOKIE};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use ter_core::model::{ProviderUsage, UsageSource, UsageWindow};
use ter_core::TtlCache;

pub const CURSOR_USAGE_URL: &str = "https://cursor.com/api/usage-summary";
pub const CURSOR_COOKIE_ENV: &str = "CURSOR_COOKIE";
pub const CURSOR_TTL: Duration = Duration::from_secs(60);

/// Accepts either a ready `cookie` header string or a browser-style
/// `cookies` array of `{name, value}` pairs.
fn cookie_header(value: &Value) -> Option<String> {
    if let Some(cookie) = value.get("cookie").and_then(Value::as_str) {
        return Some(cookie.to_string());
    }
    let pairs = value
        .get("cookies")?
        .as_array()?
        .iter()
        .map(|cookie| {
            let part = |key: &str| cookie.get(key).and_then(Value::as_str).unwrap_or("");
            format!("{}={}", part("name"), part("value"))
        })
        .filter(|pair| pair != "=")
        .collect::<Vec<_>>();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

pub fn default_sources() -> Vec<CredentialSource> {
    let mut sources = vec![CredentialSource::Env(CURSOR_COOKIE_ENV)];
    for file in ["session.json", "cookie.json"] {
        if let Some(path) = home_path(&[".cursor", file]) {
            sources.push(CredentialSource::JsonFile {
                path,
                extract: cookie_header,
            });
        }
    }
    sources
}

/// Maps the usage summary's plan figure to a session window. A summary
/// without `totalPercentUsed` has no window at all.
pub fn usage_from_summary(summary: &Value) -> ProviderUsage {
    let reset = summary
        .get("billingCycleEnd")
        .or_else(|| summary.get("billing_cycle_end"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let used = summary
        .get("individualUsage")
        .and_then(|usage| usage.get("plan"))
        .and_then(|plan| plan.get("totalPercentUsed"))
        .or_else(|| {
            summary
                .get("individual_usage")
                .and_then(|usage| usage.get("plan"))
                .and_then(|plan| plan.get("total_percent_used"))
        })
        .and_then(number_like);

    let mut usage = ProviderUsage::new(UsageSource::Web);
    usage.session = used.and_then(|used| rounded_percent(100.0 - used)).map(|left| UsageWindow {
        percent_left: Some(left),
        reset,
    });
    usage
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

struct CursorConfig {
    endpoint: String,
    sources: Vec<CredentialSource>,
}

#[derive(Clone)]
pub struct CursorProbe {
    config: Arc<CursorConfig>,
    cache: Arc<TtlCache<(), ProviderUsage, ProbeError>>,
}

impl Default for CursorProbe {
    fn default() -> Self {
        Self::new(CURSOR_USAGE_URL, default_sources())
    }
}

impl CursorProbe {
    pub fn new(endpoint: impl Into<String>, sources: Vec<CredentialSource>) -> Self {
        Self {
            config: Arc::new(CursorConfig {
                endpoint: endpoint.into(),
                sources,
            }),
            cache: Arc::new(TtlCache::new()),
        }
    }

    pub async fn usage(&self) -> Result<ProviderUsage, ProbeError> {
        let config = self.config.clone();
        self.cache
            .get((), CURSOR_TTL, move || async move { fetch_usage(&config).await })
            .await
    }
}

async fn fetch_usage(config: &CursorConfig) -> Result<ProviderUsage, ProbeError> {
    let credential = resolve_credential(&config.sources)
        .await
        .ok_or_else(|| ProbeError::NotConnected("cursor not configured".to_string()))?;
    let attempt = AuthAttempt::with_header("cookie", COOKIE, &credential.value)?;
    let client = http_client(HeaderMap::new())?;
    let summary = fetch_json(&client, "cursor", &config.endpoint, &[attempt])
        .await
        .map_err(|err| match err {
            ProbeError::Unauthorized(_) => {
                ProbeError::Unauthorized("cursor not logged in".to_string())
            }
            other => other,
        })?;
    Ok(usage_from_summary(&summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cookie_string_wins_over_array() {
        let header = cookie_header(&json!({
            "cookie": "a=1; b=2",
            "cookies": [{ "name": "c", "value": "3" }]
        }));
        assert_eq!(header.as_deref(), Some("a=1; b=2"));
    }

    #[test]
    fn cookie_array_is_joined_and_blank_pairs_dropped() {
        let header = cookie_header(&json!({
            "cookies": [
                { "name": "WorkosCursorSessionToken", "value": "tok" },
                {},
                { "name": "theme", "value": "dark" }
            ]
        }));
        assert_eq!(header.as_deref(), Some("WorkosCursorSessionToken=tok; theme=dark"));
        assert_eq!(cookie_header(&json!({ "cookies": [{}] })), None);
    }

    #[test]
    fn plan_usage_becomes_session_window() {
        let usage = usage_from_summary(&json!({
            "billingCycleEnd": "2026-11-01T00:00:00.000Z",
            "individualUsage": { "plan": { "totalPercentUsed": 37.4 } }
        }));
        assert_eq!(usage.source, UsageSource::Web);
        let session = usage.session.unwrap();
        assert_eq!(session.percent_left, Some(63));
        assert_eq!(session.reset.as_deref(), Some("2026-11-01T00:00:00.000Z"));
        assert!(usage.weekly.is_none());
    }

    #[test]
    fn snake_case_summary_and_overuse() {
        let usage = usage_from_summary(&json!({
            "individual_usage": { "plan": { "total_percent_used": "120" } }
        }));
        assert_eq!(usage.session.unwrap().percent_left, Some(0));
    }

    #[test]
    fn summary_without_plan_has_no_window() {
        let usage = usage_from_summary(&json!({ "billingCycleEnd": "2026-11-01" }));
        assert!(usage.session.is_none());
    }

    #[tokio::test]
    async fn missing_cookie_is_not_configured() {
        let probe = CursorProbe::new("http://127.0.0.1:9/unused", Vec::new());
        assert_eq!(
            probe.usage().await.unwrap_err(),
            ProbeError::NotConnected("cursor not configured".to_string())
        );
    }
}
