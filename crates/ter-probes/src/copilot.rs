use crate::error::ProbeError;
use crate::oauth::{
    fetch_json, home_path, http_client, resolve_credential, rounded_percent, AuthAttempt,
    CredentialSource,
};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use ter_core::model::{ProviderUsage, UsageSource, UsageWindow};
use ter_core::TtlCache;

pub const COPILOT_USAGE_URL: &str = "https://api.github.com/copilot_internal/user";
pub const COPILOT_TOKEN_ENV: &str = "COPILOT_API_TOKEN";
pub const COPILOT_TTL: Duration = Duration::from_secs(60);
const AUTH_SCHEMES: [&str; 2] = ["Bearer", "token"];
const GH_HELPER_TIMEOUT: Duration = Duration::from_secs(3);

fn hosts_oauth_token(value: &Value) -> Option<String> {
    value.as_object()?.values().find_map(|entry| {
        entry
            .get("oauth_token")?
            .as_str()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Env override, editor plugin `hosts.json` files, the gh CLI config, then
/// `gh auth token`.
pub fn default_sources() -> Vec<CredentialSource> {
    let mut sources = vec![CredentialSource::Env(COPILOT_TOKEN_ENV)];
    for dir in [
        &[".config", "github-copilot"][..],
        &[".github-copilot"][..],
        &[".copilot"][..],
    ] {
        let mut parts = dir.to_vec();
        parts.push("hosts.json");
        if let Some(path) = home_path(&parts) {
            sources.push(CredentialSource::JsonFile {
                path,
                extract: hosts_oauth_token,
            });
        }
    }
    if let (Some(path), Ok(pattern)) = (
        home_path(&[".config", "gh", "hosts.yml"]),
        Regex::new(r"oauth_token:\s*([^\s]+)"),
    ) {
        sources.push(CredentialSource::TextFile { path, pattern });
    }
    sources.push(CredentialSource::Helper {
        program: "gh",
        args: &["auth", "token"],
        timeout: GH_HELPER_TIMEOUT,
    });
    sources
}

fn editor_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("editor-version"),
        HeaderValue::from_static("vscode/1.96.2"),
    );
    headers.insert(
        HeaderName::from_static("editor-plugin-version"),
        HeaderValue::from_static("copilot-chat/0.26.7"),
    );
    headers.insert(USER_AGENT, HeaderValue::from_static("GitHubCopilotChat/0.26.7"));
    headers.insert(
        HeaderName::from_static("x-github-api-version"),
        HeaderValue::from_static("2025-04-01"),
    );
    headers
}

fn quota_window(snapshot: Option<&Value>) -> Option<UsageWindow> {
    let remaining = snapshot?.get("percent_remaining")?.as_f64()?;
    Some(UsageWindow {
        percent_left: rounded_percent(remaining),
        reset: None,
    })
}

/// Premium interactions become the session window, chat the weekly one.
pub fn usage_from_quota(payload: &Value) -> ProviderUsage {
    let quota = payload
        .get("quotaSnapshots")
        .or_else(|| payload.get("quota_snapshots"));
    let mut usage = ProviderUsage::new(UsageSource::Api);
    usage.session = quota_window(
        quota.and_then(|q| q.get("premiumInteractions").or_else(|| q.get("premium_interactions"))),
    );
    usage.weekly = quota_window(quota.and_then(|q| q.get("chat")));
    usage
}

struct CopilotConfig {
    endpoint: String,
    sources: Vec<CredentialSource>,
}

#[derive(Clone)]
pub struct CopilotProbe {
    config: Arc<CopilotConfig>,
    cache: Arc<TtlCache<(), ProviderUsage, ProbeError>>,
}

impl Default for CopilotProbe {
    fn default() -> Self {
        Self::new(COPILOT_USAGE_URL, default_sources())
    }
}

impl CopilotProbe {
    pub fn new(endpoint: impl Into<String>, sources: Vec<CredentialSource>) -> Self {
        Self {
            config: Arc::new(CopilotConfig {
                endpoint: endpoint.into(),
                sources,
            }),
            cache: Arc::new(TtlCache::new()),
        }
    }

    /// Cached for a minute, failures included.
    pub async fn usage(&self) -> Result<ProviderUsage, ProbeError> {
        let config = self.config.clone();
        self.cache
            .get((), COPILOT_TTL, move || async move { fetch_usage(&config).await })
            .await
    }
}

async fn fetch_usage(config: &CopilotConfig) -> Result<ProviderUsage, ProbeError> {
    let credential = resolve_credential(&config.sources)
        .await
        .ok_or_else(|| ProbeError::NotConnected("copilot token missing".to_string()))?;
    let attempts = AUTH_SCHEMES
        .iter()
        .map(|scheme| AuthAttempt::authorization(scheme, &credential.value))
        .collect::<Result<Vec<_>, _>>()?;
    let client = http_client(editor_headers())?;
    let payload = fetch_json(&client, "copilot", &config.endpoint, &attempts).await?;
    Ok(usage_from_quota(&payload))
}
