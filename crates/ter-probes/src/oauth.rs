//! Credential discovery and authenticated GETs shared by the web-backed usage
//! probes.

use crate::command::run_command;
use crate::error::{truncate_body, ProbeError};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(12);
pub const BODY_PREVIEW_CHARS: usize = 200;

/// Pulls a credential out of a parsed JSON file.
pub type JsonExtractor = fn(&Value) -> Option<String>;

/// One place a credential may live. Sources are consulted in order.
#[derive(Clone)]
pub enum CredentialSource {
    Env(&'static str),
    JsonFile {
        path: PathBuf,
        extract: JsonExtractor,
    },
    /// A plain-text file searched with a pattern whose first group is the
    /// credential.
    TextFile { path: PathBuf, pattern: Regex },
    Helper {
        program: &'static str,
        args: &'static [&'static str],
        timeout: Duration,
    },
}

impl CredentialSource {
    pub fn label(&self) -> String {
        match self {
            CredentialSource::Env(name) => format!("env:{name}"),
            CredentialSource::JsonFile { path, .. } | CredentialSource::TextFile { path, .. } => {
                format!("file:{}", path.display())
            }
            CredentialSource::Helper { program, .. } => format!("helper:{program}"),
        }
    }

    async fn read(&self) -> Option<String> {
        let found = match self {
            CredentialSource::Env(name) => std::env::var(name).ok(),
            CredentialSource::JsonFile { path, extract } => {
                let raw = tokio::fs::read_to_string(path).await.ok()?;
                let parsed = serde_json::from_str::<Value>(&raw).ok()?;
                extract(&parsed)
            }
            CredentialSource::TextFile { path, pattern } => {
                let raw = tokio::fs::read_to_string(path).await.ok()?;
                pattern
                    .captures(&raw)
                    .and_then(|caps| caps.get(1))
                    .map(|found| found.as_str().to_string())
            }
            CredentialSource::Helper {
                program,
                args,
                timeout,
            } => match run_command(program, args, *timeout).await {
                Ok(output) if output.success => Some(output.stdout),
                _ => None,
            },
        };
        found
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub origin: String,
}

pub async fn resolve_credential(sources: &[CredentialSource]) -> Option<Credential> {
    for source in sources {
        if let Some(value) = source.read().await {
            debug!(event = "credential_resolved", origin = %source.label());
            return Some(Credential {
                value,
                origin: source.label(),
            });
        }
    }
    None
}

pub fn home_path(parts: &[&str]) -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    path.extend(parts);
    Some(path)
}

/// Headers for one request attempt, labelled for error messages.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    pub label: String,
    pub headers: HeaderMap,
}

impl AuthAttempt {
    pub fn authorization(scheme: &str, token: &str) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header_value(&format!("{scheme} {token}"))?);
        Ok(Self {
            label: scheme.to_lowercase(),
            headers,
        })
    }

    pub fn with_header(label: &str, name: HeaderName, value: &str) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(name, header_value(value)?);
        Ok(Self {
            label: label.to_string(),
            headers,
        })
    }
}

pub fn header_value(value: &str) -> Result<HeaderValue, ProbeError> {
    HeaderValue::from_str(value)
        .map_err(|err| ProbeError::Protocol(format!("invalid header value: {err}")))
}

pub fn http_client(default_headers: HeaderMap) -> Result<reqwest::Client, ProbeError> {
    let mut headers = default_headers;
    headers
        .entry(ACCEPT)
        .or_insert(HeaderValue::from_static("application/json"));
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .default_headers(headers)
        .build()
        .map_err(|err| ProbeError::Failed(format!("http client: {err}")))
}

/// GETs `url` with each attempt's headers in turn.
///
/// 401/403 move on to the next attempt and end as `Unauthorized` once every
/// attempt is rejected. Any other non-2xx stops immediately with the status
/// and a truncated body.
pub async fn fetch_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    attempts: &[AuthAttempt],
) -> Result<Value, ProbeError> {
    let mut last_rejection = None;
    for attempt in attempts {
        let response = client
            .get(url)
            .headers(attempt.headers.clone())
            .send()
            .await
            .map_err(|err| transport_failure(provider, err))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| transport_failure(provider, err))?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|err| ProbeError::Protocol(format!("{provider} response: {err}")));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(event = "auth_rejected", provider, scheme = %attempt.label, status = status.as_u16());
            last_rejection = Some(ProbeError::Unauthorized(format!(
                "{provider} unauthorized ({})",
                attempt.label
            )));
            continue;
        }
        return Err(ProbeError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: truncate_body(&body, BODY_PREVIEW_CHARS),
        });
    }
    Err(last_rejection
        .unwrap_or_else(|| ProbeError::Unauthorized(format!("{provider} unauthorized"))))
}

fn transport_failure(provider: &str, err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout(format!("{provider} request timed out"))
    } else {
        ProbeError::Unreachable(format!("{provider} request failed: {err}"))
    }
}

/// Rounds a percentage and clamps it at zero.
pub fn rounded_percent(value: f64) -> Option<u32> {
    value
        .is_finite()
        .then(|| value.round().max(0.0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn first_oauth_token(value: &Value) -> Option<String> {
        value
            .as_object()?
            .values()
            .find_map(|entry| entry.get("oauth_token")?.as_str().map(str::to_string))
    }

    #[tokio::test]
    async fn sources_are_consulted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("hosts.json");
        fs::write(&json_path, r#"{"github.com":{"user":"me","oauth_token":" gho_json "}}"#).unwrap();
        let yaml_path = dir.path().join("hosts.yml");
        fs::write(&yaml_path, "github.com:\n    oauth_token: gho_yaml\n").unwrap();

        let sources = vec![
            CredentialSource::JsonFile {
                path: dir.path().join("missing.json"),
                extract: first_oauth_token,
            },
            CredentialSource::JsonFile {
                path: json_path,
                extract: first_oauth_token,
            },
            CredentialSource::TextFile {
                path: yaml_path.clone(),
                pattern: Regex::new(r"oauth_token:\s*([^\s]+)").unwrap(),
            },
        ];
        let credential = resolve_credential(&sources).await.unwrap();
        assert_eq!(credential.value, "gho_json");
        assert!(credential.origin.ends_with("hosts.json"));

        let credential = resolve_credential(&sources[2..]).await.unwrap();
        assert_eq!(credential.value, "gho_yaml");
    }

    #[tokio::test]
    async fn no_source_means_no_credential() {
        let sources = vec![CredentialSource::Helper {
            program: "ter-no-such-helper",
            args: &["auth", "token"],
            timeout: Duration::from_secs(1),
        }];
        assert_eq!(resolve_credential(&sources).await, None);
    }

    #[test]
    fn authorization_attempt_is_labelled_by_scheme() {
        let attempt = AuthAttempt::authorization("Bearer", "abc").unwrap();
        assert_eq!(attempt.label, "bearer");
        assert_eq!(attempt.headers[AUTHORIZATION], "Bearer abc");
        assert!(AuthAttempt::authorization("token", "bad\nvalue").is_err());
    }

    #[test]
    fn percent_rounding_clamps_at_zero() {
        assert_eq!(rounded_percent(42.6), Some(43));
        assert_eq!(rounded_percent(-3.0), Some(0));
        assert_eq!(rounded_percent(f64::NAN), None);
    }
}
