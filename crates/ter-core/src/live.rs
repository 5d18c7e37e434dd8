//! Live push protocol spoken on `/events`.

use crate::error::ErrorKind;
use crate::model::{DockerSnapshot, HostInfo, Session};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::time::Duration;

pub const DEFAULT_PREVIEW_LINES: u32 = 6;
pub const MAX_PREVIEW_LINES: u32 = 200;
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
pub const MIN_INTERVAL_MS: u64 = 2_000;
pub const MIN_SNAPSHOT_TTL: Duration = Duration::from_secs(1);
pub const MAX_SNAPSHOT_TTL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Refresh,
}

/// One point-in-time composite. Every data field is optional: a field is
/// present only when it was requested and its probe produced something.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<Session>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSnapshot>,
    /// Requested fields that were left out because their probe failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub omitted: Vec<OmittedField>,
}

impl Snapshot {
    pub fn is_partial(&self) -> bool {
        !self.omitted.is_empty()
    }

    pub fn has_data(&self) -> bool {
        self.sessions.is_some() || self.host.is_some() || self.docker.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OmittedField {
    pub field: String,
    pub error: String,
    pub kind: ErrorKind,
}

/// Subscription flags for one live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveOptions {
    pub sessions: bool,
    pub preview: bool,
    pub preview_lines: u32,
    pub insights: bool,
    pub host: bool,
    pub docker: bool,
    pub interval_ms: u64,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            sessions: false,
            preview: false,
            preview_lines: DEFAULT_PREVIEW_LINES,
            insights: false,
            host: false,
            docker: false,
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl LiveOptions {
    /// Reads flags from query pairs. Booleans are on only for `"1"`; numbers
    /// that do not parse fall back to their defaults, preview lines are capped
    /// and the interval never drops under the floor.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Borrow<str>,
        V: Borrow<str>,
    {
        let mut options = LiveOptions::default();
        for (key, value) in pairs {
            let value = value.borrow();
            match key.borrow() {
                "sessions" => options.sessions = value == "1",
                "preview" => options.preview = value == "1",
                "insights" => options.insights = value == "1",
                "host" => options.host = value == "1",
                "docker" => options.docker = value == "1",
                "previewLines" => {
                    options.preview_lines = parse_whole(value).map_or(DEFAULT_PREVIEW_LINES, |lines| {
                        u32::try_from(lines).map_or(MAX_PREVIEW_LINES, |lines| {
                            lines.min(MAX_PREVIEW_LINES)
                        })
                    })
                }
                "interval" => {
                    options.interval_ms = parse_whole(value).unwrap_or(DEFAULT_INTERVAL_MS)
                }
                _ => {}
            }
        }
        options.interval_ms = options.interval_ms.max(MIN_INTERVAL_MS);
        options
    }

    pub fn from_query(query: &str) -> Self {
        Self::from_pairs(url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()))
    }

    /// Query pairs for an events URL; unset flags are left out.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let flag = |name: &'static str, on: bool| on.then(|| (name, "1".to_string()));
        [
            flag("sessions", self.sessions),
            flag("preview", self.preview),
            (self.preview_lines > 0).then(|| ("previewLines", self.preview_lines.to_string())),
            flag("insights", self.insights),
            flag("host", self.host),
            flag("docker", self.docker),
            (self.interval_ms > 0).then(|| ("interval", self.interval_ms.to_string())),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Identifies the snapshot contents a subscriber receives. Two option
    /// sets with the same key can share one cached snapshot.
    pub fn cache_key(&self) -> String {
        format!(
            "s{}|p{}|l{}|i{}|h{}|d{}",
            u8::from(self.sessions),
            u8::from(self.preview),
            self.preview_lines,
            u8::from(self.insights),
            u8::from(self.host),
            u8::from(self.docker),
        )
    }

    /// Identifies a subscription, push interval included. A connection built
    /// under a different key must be replaced.
    pub fn options_key(&self) -> String {
        format!("{}|t{}", self.cache_key(), self.interval_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(MIN_INTERVAL_MS))
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.interval_ms).clamp(MIN_SNAPSHOT_TTL, MAX_SNAPSHOT_TTL)
    }
}

fn parse_whole(raw: &str) -> Option<u64> {
    let value = raw.trim().parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value.floor() as u64)
    } else {
        None
    }
}
