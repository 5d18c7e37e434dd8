//! Data carried inside live snapshots and read endpoints.
//!
//! Field names follow the mobile client (camelCase on the wire).

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub name: String,
    pub windows: u32,
    pub created: i64,
    pub attached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attached: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<SessionInsights>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInsights {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,
    pub platform: String,
    pub release: String,
    pub arch: String,
    pub uptime: u64,
    pub load: Vec<f64>,
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub cores: usize,
    /// Busy percentage since the previous sample; absent on the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSnapshot {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub containers: Vec<DockerContainer>,
    #[serde(default)]
    pub images: Vec<DockerImage>,
    #[serde(default)]
    pub volumes: Vec<DockerVolume>,
    #[serde(default)]
    pub networks: Vec<DockerNetwork>,
}

impl DockerSnapshot {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_for: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default, rename = "netIO", skip_serializing_if = "Option::is_none")]
    pub net_io: Option<String>,
    #[serde(default, rename = "blockIO", skip_serializing_if = "Option::is_none")]
    pub block_io: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerImage {
    pub id: String,
    pub repository: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_since: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerVolume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerNetwork {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Where a usage figure was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Rpc,
    Cli,
    Api,
    Web,
    Logs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_left: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<String>,
}

impl UsageWindow {
    pub fn is_empty(&self) -> bool {
        self.percent_left.is_none() && self.reset.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<UsageWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
    pub source: UsageSource,
}

impl ProviderUsage {
    pub fn new(source: UsageSource) -> Self {
        Self {
            session: None,
            weekly: None,
            credits: None,
            source,
        }
    }
}

/// A provider's usage, or the reason it could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderStatus {
    Unavailable { error: String, kind: ErrorKind },
    Ready(ProviderUsage),
}

impl ProviderStatus {
    pub fn usage(&self) -> Option<&ProviderUsage> {
        match self {
            ProviderStatus::Ready(usage) => Some(usage),
            ProviderStatus::Unavailable { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub cached: u64,
    pub output: u64,
    pub total: u64,
    pub period_days: u32,
    pub updated_at: i64,
    pub source: UsageSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub codex: ProviderStatus,
    pub copilot: ProviderStatus,
    pub cursor: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn container_io_fields_keep_upper_case_names() {
        let container = DockerContainer {
            id: "abc".to_string(),
            name: "web".to_string(),
            image: "nginx".to_string(),
            net_io: Some("1kB / 2kB".to_string()),
            block_io: Some("0B / 0B".to_string()),
            memory_used_bytes: Some(1024),
            ..DockerContainer::default()
        };
        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["netIO"], "1kB / 2kB");
        assert_eq!(value["blockIO"], "0B / 0B");
        assert_eq!(value["memoryUsedBytes"], 1024);
        assert!(value.get("cpuPercent").is_none());
    }

    #[test]
    fn provider_status_distinguishes_error_from_usage() {
        let unavailable: ProviderStatus = serde_json::from_value(json!({
            "error": "copilot token missing",
            "kind": "not_connected"
        }))
        .unwrap();
        assert!(matches!(
            unavailable,
            ProviderStatus::Unavailable {
                kind: ErrorKind::NotConnected,
                ..
            }
        ));

        let ready: ProviderStatus = serde_json::from_value(json!({
            "session": { "percentLeft": 13, "reset": "2026-01-01T00:00:00.000Z" },
            "source": "rpc"
        }))
        .unwrap();
        let usage = ready.usage().unwrap();
        assert_eq!(usage.source, UsageSource::Rpc);
        assert_eq!(usage.session.as_ref().and_then(|w| w.percent_left), Some(13));
    }
}
