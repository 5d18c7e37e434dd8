//! Snapshot aggregation for the live feed.
//!
//! Snapshots are cached per flag combination, so subscribers asking for the
//! same fields within a TTL share one round of probing while differently
//! configured subscribers never see each other's payloads.

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use ter_core::live::{LiveOptions, OmittedField, Snapshot};
use ter_core::model::{DockerSnapshot, HostInfo, Session, UsageSnapshot};
use ter_core::{ErrorKind, TtlCache};
use ter_probes::{DockerProbe, HostProbe, ProbeError, SessionProbe, SessionQuery, UsageProbes};
use tracing::{debug, warn};

/// The probes behind a snapshot and the read endpoints.
pub trait LiveSources: Send + Sync + 'static {
    fn sessions(&self, query: SessionQuery) -> BoxFuture<'static, Result<Vec<Session>, ProbeError>>;
    fn host(&self) -> BoxFuture<'static, Result<HostInfo, ProbeError>>;
    fn docker(&self) -> BoxFuture<'static, Result<DockerSnapshot, ProbeError>>;
    fn usage(&self) -> BoxFuture<'static, UsageSnapshot>;
    fn multiplexer_version(&self) -> BoxFuture<'static, Result<String, ProbeError>>;
}

#[derive(Clone, Default)]
pub struct ProbeSources {
    pub sessions: SessionProbe,
    pub host: HostProbe,
    pub docker: DockerProbe,
    pub usage: UsageProbes,
}

impl LiveSources for ProbeSources {
    fn sessions(&self, query: SessionQuery) -> BoxFuture<'static, Result<Vec<Session>, ProbeError>> {
        let probe = self.sessions.clone();
        let usage = self.usage.clone();
        async move {
            let usage_fetch = async {
                if query.insights {
                    Some(usage.snapshot().await)
                } else {
                    None
                }
            };
            let (sessions, usage) = tokio::join!(probe.list(), usage_fetch);
            Ok(probe.decorate(sessions?, query, usage).await)
        }
        .boxed()
    }

    fn host(&self) -> BoxFuture<'static, Result<HostInfo, ProbeError>> {
        let probe = self.host.clone();
        async move { Ok(probe.snapshot().await) }.boxed()
    }

    fn docker(&self) -> BoxFuture<'static, Result<DockerSnapshot, ProbeError>> {
        let probe = self.docker.clone();
        async move { Ok(probe.snapshot().await) }.boxed()
    }

    fn usage(&self) -> BoxFuture<'static, UsageSnapshot> {
        let probes = self.usage.clone();
        async move { probes.snapshot().await }.boxed()
    }

    fn multiplexer_version(&self) -> BoxFuture<'static, Result<String, ProbeError>> {
        let probe = self.sessions.clone();
        async move { probe.version().await }.boxed()
    }
}

pub struct Aggregator<S> {
    sources: Arc<S>,
    cache: TtlCache<String, Snapshot, ProbeError>,
}

impl<S: LiveSources> Aggregator<S> {
    pub fn new(sources: S) -> Self {
        Self {
            sources: Arc::new(sources),
            cache: TtlCache::new(),
        }
    }

    pub fn sources(&self) -> &S {
        &self.sources
    }

    /// The snapshot for `options`, shared with every subscriber using the same
    /// flags while it is younger than the options' TTL.
    pub async fn snapshot(&self, options: &LiveOptions) -> Result<Snapshot, ProbeError> {
        let sources = self.sources.clone();
        let options = *options;
        self.cache
            .get(options.cache_key(), options.snapshot_ttl(), move || {
                build_snapshot(sources, options)
            })
            .await
    }

    /// Rebuilds now instead of waiting out the TTL.
    pub async fn refresh(&self, options: &LiveOptions) -> Result<Snapshot, ProbeError> {
        self.cache.expire(&options.cache_key());
        self.snapshot(options).await
    }
}

/// Probes only what `options` asks for, concurrently. A failed probe leaves
/// its field out and is listed in `omitted`; the build fails only when every
/// requested probe failed.
pub async fn build_snapshot<S: LiveSources + ?Sized>(
    sources: Arc<S>,
    options: LiveOptions,
) -> Result<Snapshot, ProbeError> {
    let query = SessionQuery {
        preview: options.preview,
        preview_lines: options.preview_lines,
        insights: options.insights,
    };
    let (sessions, host, docker) = tokio::join!(
        requested(options.sessions, || sources.sessions(query)),
        requested(options.host, || sources.host()),
        requested(options.docker, || sources.docker()),
    );

    let mut snapshot = Snapshot {
        ts: Utc::now().timestamp_millis(),
        ..Snapshot::default()
    };
    snapshot.sessions = settle("sessions", sessions, &mut snapshot.omitted);
    snapshot.host = settle("host", host, &mut snapshot.omitted);
    snapshot.docker = settle("docker", docker, &mut snapshot.omitted);

    if snapshot.is_partial() {
        if !snapshot.has_data() {
            let reasons: Vec<String> = snapshot
                .omitted
                .iter()
                .map(|omitted| format!("{}: {}", omitted.field, omitted.error))
                .collect();
            return Err(ProbeError::Failed(format!(
                "snapshot failed ({})",
                reasons.join("; ")
            )));
        }
        warn!(
            event = "snapshot_partial",
            kind = ErrorKind::Partial.as_str(),
            key = %options.cache_key(),
            omitted = snapshot.omitted.len()
        );
    } else {
        debug!(event = "snapshot_built", key = %options.cache_key());
    }
    Ok(snapshot)
}

async fn requested<T, F, Fut>(wanted: bool, probe: F) -> Option<Result<T, ProbeError>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    if wanted {
        Some(probe().await)
    } else {
        None
    }
}

fn settle<T>(
    field: &str,
    outcome: Option<Result<T, ProbeError>>,
    omitted: &mut Vec<OmittedField>,
) -> Option<T> {
    match outcome? {
        Ok(value) => Some(value),
        Err(err) => {
            omitted.push(OmittedField {
                field: field.to_string(),
                error: err.to_string(),
                kind: err.kind(),
            });
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ter_core::model::{CpuInfo, MemoryInfo, ProviderStatus};

    /// Canned probe results with call counters.
    #[derive(Default)]
    pub(crate) struct FakeSources {
        pub(crate) session_calls: Arc<AtomicUsize>,
        pub(crate) docker_calls: Arc<AtomicUsize>,
        pub(crate) fail_sessions: bool,
        pub(crate) fail_host: bool,
    }

    pub(crate) fn session(name: &str) -> Session {
        Session {
            name: name.to_string(),
            windows: 1,
            created: 1_760_000_000,
            attached: false,
            last_attached: None,
            preview: None,
            insights: None,
        }
    }

    pub(crate) fn host_info() -> HostInfo {
        HostInfo {
            hostname: "devbox".to_string(),
            platform: "linux".to_string(),
            release: "6.8.0".to_string(),
            arch: "x86_64".to_string(),
            uptime: 10,
            load: vec![0.1, 0.2, 0.3],
            cpu: CpuInfo {
                model: None,
                cores: 4,
                usage: None,
            },
            memory: MemoryInfo {
                total: 100,
                free: 50,
                used: 50,
                used_percent: 50.0,
            },
        }
    }

    impl LiveSources for FakeSources {
        fn sessions(&self, query: SessionQuery) -> BoxFuture<'static, Result<Vec<Session>, ProbeError>> {
            let calls = self.session_calls.clone();
            let fail = self.fail_sessions;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(ProbeError::ToolMissing("tmux not installed".to_string()));
                }
                let mut main = session("main");
                if query.preview {
                    main.preview = Some(vec!["$ cargo test".to_string()]);
                }
                Ok(vec![main])
            }
            .boxed()
        }

        fn host(&self) -> BoxFuture<'static, Result<HostInfo, ProbeError>> {
            let fail = self.fail_host;
            async move {
                if fail {
                    Err(ProbeError::Failed("proc unreadable".to_string()))
                } else {
                    Ok(host_info())
                }
            }
            .boxed()
        }

        fn docker(&self) -> BoxFuture<'static, Result<DockerSnapshot, ProbeError>> {
            let calls = self.docker_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(DockerSnapshot::unavailable("docker not installed"))
            }
            .boxed()
        }

        fn usage(&self) -> BoxFuture<'static, UsageSnapshot> {
            let missing = || ProviderStatus::Unavailable {
                error: "not configured".to_string(),
                kind: ErrorKind::NotConnected,
            };
            let snapshot = UsageSnapshot {
                codex: missing(),
                copilot: missing(),
                cursor: missing(),
                tokens: None,
                updated_at: 0,
            };
            async move { snapshot }.boxed()
        }

        fn multiplexer_version(&self) -> BoxFuture<'static, Result<String, ProbeError>> {
            async { Ok("tmux 3.4".to_string()) }.boxed()
        }
    }

    fn options(query: &str) -> LiveOptions {
        LiveOptions::from_query(query)
    }

    #[tokio::test]
    async fn flag_sets_do_not_share_cache_entries() {
        let sources = FakeSources::default();
        let docker_calls = sources.docker_calls.clone();
        let session_calls = sources.session_calls.clone();
        let aggregator = Aggregator::new(sources);

        let without = aggregator.snapshot(&options("sessions=1")).await.unwrap();
        let with = aggregator
            .snapshot(&options("sessions=1&docker=1"))
            .await
            .unwrap();

        assert!(without.docker.is_none());
        assert!(with.docker.is_some());
        assert!(with.sessions.is_some());
        assert_eq!(session_calls.load(Ordering::SeqCst), 2);
        assert_eq!(docker_calls.load(Ordering::SeqCst), 1);

        let payload = serde_json::to_value(&without).unwrap();
        assert!(payload.get("docker").is_none());
        assert!(payload.get("host").is_none());
    }

    #[tokio::test]
    async fn same_flags_within_ttl_share_one_build() {
        let sources = FakeSources::default();
        let calls = sources.session_calls.clone();
        let aggregator = Aggregator::new(sources);
        let live = options("sessions=1&interval=5000");

        let (first, second) = tokio::join!(aggregator.snapshot(&live), aggregator.snapshot(&live));
        assert_eq!(first.unwrap(), second.unwrap());
        aggregator.snapshot(&live).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        aggregator.refresh(&live).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_probe_is_omitted_from_partial_snapshot() {
        let aggregator = Aggregator::new(FakeSources {
            fail_sessions: true,
            ..FakeSources::default()
        });
        let snapshot = aggregator
            .snapshot(&options("sessions=1&host=1"))
            .await
            .unwrap();

        assert!(snapshot.sessions.is_none());
        assert_eq!(snapshot.host, Some(host_info()));
        assert!(snapshot.is_partial());
        assert_eq!(snapshot.omitted[0].field, "sessions");
        assert_eq!(snapshot.omitted[0].kind, ErrorKind::ToolMissing);
    }

    #[tokio::test]
    async fn total_failure_is_an_error() {
        let aggregator = Aggregator::new(FakeSources {
            fail_sessions: true,
            fail_host: true,
            ..FakeSources::default()
        });
        let err = aggregator
            .snapshot(&options("sessions=1&host=1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "snapshot failed (sessions: tmux not installed; host: proc unreadable)"
        );
    }

    #[tokio::test]
    async fn nothing_requested_is_an_empty_snapshot() {
        let aggregator = Aggregator::new(FakeSources::default());
        let snapshot = aggregator.snapshot(&LiveOptions::default()).await.unwrap();
        assert!(!snapshot.has_data());
        assert!(!snapshot.is_partial());
        assert!(snapshot.ts > 0);
    }

    #[tokio::test]
    async fn preview_flag_reaches_the_session_probe() {
        let aggregator = Aggregator::new(FakeSources::default());
        let snapshot = aggregator
            .snapshot(&options("sessions=1&preview=1&previewLines=3"))
            .await
            .unwrap();
        let sessions = snapshot.sessions.unwrap();
        assert_eq!(sessions[0].preview.as_deref(), Some(&["$ cargo test".to_string()][..]));
    }
}
