//! Container runtime snapshot built from the docker CLI's JSON-lines output.

use crate::command::run_checked;
use crate::error::ProbeError;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use ter_core::frame::parse_json_lines;
use ter_core::model::{DockerContainer, DockerImage, DockerNetwork, DockerSnapshot, DockerVolume};
use ter_core::TtlCache;
use tracing::{debug, warn};

pub const DOCKER_TTL: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Default, Deserialize)]
struct PsRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "State", default)]
    state: Option<String>,
    #[serde(rename = "Ports", default)]
    ports: Option<String>,
    #[serde(rename = "CreatedAt", default)]
    created_at: Option<String>,
    #[serde(rename = "RunningFor", default)]
    running_for: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StatsRow {
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: Option<String>,
    #[serde(rename = "MemPerc", default)]
    mem_perc: Option<String>,
    #[serde(rename = "MemUsage", default)]
    mem_usage: Option<String>,
    #[serde(rename = "NetIO", default)]
    net_io: Option<String>,
    #[serde(rename = "BlockIO", default)]
    block_io: Option<String>,
    #[serde(rename = "PIDs", default, deserialize_with = "lenient_text")]
    pids: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ImageRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Repository", default)]
    repository: String,
    #[serde(rename = "Tag", default)]
    tag: String,
    #[serde(rename = "Size", default)]
    size: Option<String>,
    #[serde(rename = "CreatedAt", default)]
    created_at: Option<String>,
    #[serde(rename = "CreatedSince", default)]
    created_since: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VolumeRow {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: Option<String>,
    #[serde(rename = "Scope", default)]
    scope: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NetworkRow {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Driver", default)]
    driver: Option<String>,
    #[serde(rename = "Scope", default)]
    scope: Option<String>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Pulls the first number out of strings like `"12.3%"`.
pub fn parse_percent(raw: &str) -> Option<f64> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let number = NUMBER.get_or_init(|| Regex::new(r"-?\d+(\.\d+)?").expect("valid regex"));
    let found = number.find(raw.trim())?;
    found.as_str().parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Converts `"512MiB"`, `"1.2GB"`, `"0B"` into a byte count. `i` units are
/// powers of 1024, the rest powers of 1000.
pub fn parse_bytes(raw: &str) -> Option<u64> {
    static SIZE: OnceLock<Regex> = OnceLock::new();
    let size = SIZE.get_or_init(|| {
        Regex::new(r"(?i)^([\d.]+)\s*([kmgpt]?i?b)$").expect("valid regex")
    });
    let captures = size.captures(raw.trim())?;
    let amount = captures[1].parse::<f64>().ok().filter(|v| v.is_finite())?;
    let unit = captures[2].to_lowercase();
    let base: f64 = if unit.contains("ib") { 1024.0 } else { 1000.0 };
    let exponent = match unit.chars().next() {
        Some('k') => 1,
        Some('m') => 2,
        Some('g') => 3,
        Some('t') => 4,
        Some('p') => 5,
        _ => 0,
    };
    Some((amount * base.powi(exponent)).round() as u64)
}

/// Splits `"used / limit"` into both byte counts.
pub fn parse_memory_usage(raw: &str) -> (Option<u64>, Option<u64>) {
    let mut parts = raw.split('/').map(str::trim);
    let used = parts.next().and_then(parse_bytes);
    let limit = parts.next().and_then(parse_bytes);
    (used, limit)
}

fn container_from_rows(row: PsRow, stats: Option<&StatsRow>) -> DockerContainer {
    let memory_usage = stats.and_then(|s| s.mem_usage.clone());
    let (memory_used_bytes, memory_limit_bytes) = memory_usage
        .as_deref()
        .map(parse_memory_usage)
        .unwrap_or((None, None));
    DockerContainer {
        id: row.id,
        name: row.names,
        image: row.image,
        status: row.status,
        state: row.state,
        ports: row.ports,
        created_at: row.created_at,
        running_for: row.running_for,
        cpu_percent: stats.and_then(|s| s.cpu_perc.as_deref()).and_then(parse_percent),
        memory_percent: stats.and_then(|s| s.mem_perc.as_deref()).and_then(parse_percent),
        memory_usage,
        memory_used_bytes,
        memory_limit_bytes,
        net_io: stats.and_then(|s| s.net_io.clone()),
        block_io: stats.and_then(|s| s.block_io.clone()),
        pids: stats
            .and_then(|s| s.pids.as_deref())
            .and_then(|pids| pids.trim().parse().ok()),
    }
}

/// Raw stdout of each docker subcommand. Only `ps` is required; the rest
/// degrade to empty lists.
#[derive(Debug, Clone)]
pub struct DockerOutputs {
    pub ps: Result<String, ProbeError>,
    pub stats: Result<String, ProbeError>,
    pub images: Result<String, ProbeError>,
    pub volumes: Result<String, ProbeError>,
    pub networks: Result<String, ProbeError>,
}

fn rows<T: DeserializeOwned>(label: &str, output: &Result<String, ProbeError>) -> Vec<T> {
    match output {
        Ok(stdout) => {
            let parsed = parse_json_lines::<T>(stdout);
            if !parsed.rejected.is_empty() {
                debug!(event = "docker_rows_skipped", command = label, skipped = parsed.rejected.len());
            }
            parsed.rows
        }
        Err(err) => {
            debug!(event = "docker_command_failed", command = label, error = %err);
            Vec::new()
        }
    }
}

/// Correlates stats to containers by id, then by name, and assembles the
/// snapshot. Only a failed `ps` is an error.
pub fn assemble_snapshot(outputs: DockerOutputs) -> Result<DockerSnapshot, ProbeError> {
    if let Err(err) = &outputs.ps {
        return Err(err.clone());
    }
    let ps = rows::<PsRow>("ps", &outputs.ps);

    let mut stats_by_key: HashMap<String, StatsRow> = HashMap::new();
    for row in rows::<StatsRow>("stats", &outputs.stats) {
        if let Some(id) = row.id.clone().filter(|id| !id.is_empty()) {
            stats_by_key.insert(id, row.clone());
        }
        if let Some(name) = row.name.clone().filter(|name| !name.is_empty()) {
            stats_by_key.insert(name, row);
        }
    }

    let containers = ps
        .into_iter()
        .map(|row| {
            let stats = stats_by_key
                .get(&row.id)
                .or_else(|| stats_by_key.get(&row.names));
            container_from_rows(row, stats)
        })
        .collect();

    let images = rows::<ImageRow>("images", &outputs.images)
        .into_iter()
        .map(|row| DockerImage {
            id: row.id,
            repository: row.repository,
            tag: row.tag,
            size: row.size,
            created_at: row.created_at,
            created_since: row.created_since,
        })
        .collect();
    let volumes = rows::<VolumeRow>("volume ls", &outputs.volumes)
        .into_iter()
        .map(|row| DockerVolume {
            name: row.name,
            driver: row.driver,
            scope: row.scope,
        })
        .collect();
    let networks = rows::<NetworkRow>("network ls", &outputs.networks)
        .into_iter()
        .map(|row| DockerNetwork {
            id: row.id,
            name: row.name,
            driver: row.driver,
            scope: row.scope,
        })
        .collect();

    Ok(DockerSnapshot {
        available: true,
        error: None,
        containers,
        images,
        volumes,
        networks,
    })
}

/// Memoized docker probe. Never fails: a runtime that stops answering keeps
/// serving the last good snapshot, and one that never answered is reported
/// inside the snapshot.
#[derive(Clone)]
pub struct DockerProbe {
    binary: Arc<str>,
    cache: Arc<TtlCache<(), DockerSnapshot, ProbeError>>,
}

impl Default for DockerProbe {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: Arc::from(binary.into()),
            cache: Arc::new(TtlCache::new()),
        }
    }

    pub async fn snapshot(&self) -> DockerSnapshot {
        let binary = self.binary.clone();
        let fetched = self
            .cache
            .get((), DOCKER_TTL, move || async move { collect(&binary).await })
            .await;
        fetched.unwrap_or_else(|err: ProbeError| DockerSnapshot::unavailable(err.to_string()))
    }
}

async fn collect(binary: &str) -> Result<DockerSnapshot, ProbeError> {
    let format = ["--format", "{{json .}}"];
    let run = |args: &'static [&'static str]| {
        let mut full: Vec<&str> = args.to_vec();
        full.extend_from_slice(&format);
        async move { run_checked(binary, &full, COMMAND_TIMEOUT).await }
    };
    let (ps, stats, images, volumes, networks) = tokio::join!(
        run(&["ps", "-a", "--no-trunc"]),
        run(&["stats", "--no-stream", "--no-trunc"]),
        run(&["images", "--no-trunc"]),
        run(&["volume", "ls"]),
        run(&["network", "ls"]),
    );
    let ps = ps.map_err(|err| match err {
        ProbeError::ToolMissing(_) => ProbeError::ToolMissing("docker not installed".to_string()),
        other => other,
    });
    if let Err(err) = &ps {
        warn!(event = "docker_unavailable", error = %err);
    }
    assemble_snapshot(DockerOutputs {
        ps,
        stats,
        images,
        volumes,
        networks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(text: &str) -> Result<String, ProbeError> {
        Ok(text.to_string())
    }

    #[test]
    fn parses_binary_and_decimal_sizes() {
        assert_eq!(parse_bytes("512MiB"), Some(536_870_912));
        assert_eq!(parse_bytes("1.2GB"), Some(1_200_000_000));
        assert_eq!(parse_bytes("0B"), Some(0));
        assert_eq!(parse_bytes("1.5kB"), Some(1_500));
        assert_eq!(parse_bytes("--"), None);
    }

    #[test]
    fn parses_percent_strings() {
        assert_eq!(parse_percent("12.3%"), Some(12.3));
        assert_eq!(parse_percent(" 0.00% "), Some(0.0));
        assert_eq!(parse_percent("--"), None);
    }

    #[test]
    fn splits_memory_usage() {
        assert_eq!(
            parse_memory_usage("512MiB / 1GiB"),
            (Some(536_870_912), Some(1_073_741_824))
        );
        assert_eq!(parse_memory_usage("garbage"), (None, None));
    }

    #[test]
    fn stats_correlate_by_id_or_name() {
        let ps = concat!(
            r#"{"ID":"aaa","Names":"web","Image":"nginx","State":"running"}"#,
            "\n",
            r#"{"ID":"bbb","Names":"db","Image":"postgres","State":"running"}"#,
            "\n",
            r#"{"ID":"ccc","Names":"idle","Image":"busybox","State":"exited"}"#,
            "\n",
            "not json\n",
        );
        let stats = concat!(
            r#"{"ID":"aaa","Name":"web","CPUPerc":"1.50%","MemPerc":"2.00%","MemUsage":"512MiB / 1GiB","PIDs":"4"}"#,
            "\n",
            r#"{"ID":"short","Name":"db","CPUPerc":"0.25%","NetIO":"1kB / 2kB"}"#,
            "\n",
        );
        let snapshot = assemble_snapshot(DockerOutputs {
            ps: ok(ps),
            stats: ok(stats),
            images: ok(r#"{"ID":"sha256:1","Repository":"nginx","Tag":"latest","Size":"187MB"}"#),
            volumes: Err(ProbeError::Failed("docker: volume ls failed".to_string())),
            networks: ok(r#"{"ID":"n1","Name":"bridge","Driver":"bridge","Scope":"local"}"#),
        })
        .unwrap();

        assert!(snapshot.available);
        assert_eq!(snapshot.containers.len(), 3);
        let web = &snapshot.containers[0];
        assert_eq!(web.cpu_percent, Some(1.5));
        assert_eq!(web.memory_used_bytes, Some(536_870_912));
        assert_eq!(web.memory_limit_bytes, Some(1_073_741_824));
        assert_eq!(web.pids, Some(4));
        let db = &snapshot.containers[1];
        assert_eq!(db.cpu_percent, Some(0.25));
        assert_eq!(db.net_io.as_deref(), Some("1kB / 2kB"));
        assert_eq!(snapshot.containers[2].cpu_percent, None);
        assert_eq!(snapshot.images[0].repository, "nginx");
        assert!(snapshot.volumes.is_empty());
        assert_eq!(snapshot.networks[0].name, "bridge");
    }

    #[test]
    fn failed_ps_is_an_error() {
        let err = assemble_snapshot(DockerOutputs {
            ps: Err(ProbeError::ToolMissing("docker not installed".to_string())),
            stats: ok(""),
            images: ok(""),
            volumes: ok(""),
            networks: ok(""),
        })
        .unwrap_err();
        assert_eq!(err, ProbeError::ToolMissing("docker not installed".to_string()));
    }

    #[test]
    fn empty_ps_is_available_with_no_containers() {
        let snapshot = assemble_snapshot(DockerOutputs {
            ps: ok(""),
            stats: ok(""),
            images: ok(""),
            volumes: ok(""),
            networks: ok(""),
        })
        .unwrap();
        assert!(snapshot.available);
        assert!(snapshot.containers.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let probe = DockerProbe::new("ter-no-such-docker");
        let snapshot = probe.snapshot().await;
        assert!(!snapshot.available);
        assert_eq!(snapshot.error.as_deref(), Some("docker not installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn daemon_going_away_keeps_last_good_snapshot() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("docker");
        std::fs::write(
            &script,
            r#"#!/bin/sh
if [ -e "$(dirname "$0")/down" ]; then
  echo "Cannot connect to the Docker daemon" >&2
  exit 1
fi
if [ "$1" = "ps" ]; then
  echo '{"ID":"aaa","Names":"web","Image":"nginx","State":"running"}'
fi
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let probe = DockerProbe::new(script.to_string_lossy());
        let first = probe.snapshot().await;
        assert!(first.available);
        assert_eq!(first.containers.len(), 1);

        std::fs::write(dir.path().join("down"), "").unwrap();
        probe.cache.expire(&());
        let second = probe.snapshot().await;
        assert!(second.available);
        assert_eq!(second.error, None);
        assert_eq!(second.containers[0].name, "web");
    }
}
