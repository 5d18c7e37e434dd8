//! Keeps one live feed open per subscribed host.
//!
//! Every transport and reconnect timer reports into a single channel, and all
//! state changes happen in [`LiveManager::handle`], so the per-host state
//! machine can be driven without a network.

use crate::state::{HostLiveState, HostStatus, LiveEvent};
use crate::transport::{Connector, EventSink, ManagerEvent, ManagerEventKind, TransportEvent};
use std::collections::HashMap;
use std::time::Duration;
use ter_core::live::{ClientMessage, LiveOptions};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

pub const RECONNECT_BASE: Duration = Duration::from_millis(1_000);
pub const RECONNECT_CAP: Duration = Duration::from_millis(10_000);
const OUTBOUND_QUEUE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("Invalid URL")]
    InvalidUrl,
}

/// A host to watch: its agent base URL and optional auth token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub id: String,
    pub base_url: String,
    pub auth_token: Option<String>,
}

/// `ws(s)://<host>/events?<flags>&token=<token>`; `https` maps to `wss`.
pub fn events_url(target: &HostTarget, options: &LiveOptions) -> Result<Url, WatchError> {
    let base = Url::parse(target.base_url.trim()).map_err(|_| WatchError::InvalidUrl)?;
    let host = base.host_str().ok_or(WatchError::InvalidUrl)?;
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let authority = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut url =
        Url::parse(&format!("{scheme}://{authority}/events")).map_err(|_| WatchError::InvalidUrl)?;

    let mut pairs = options.to_query_pairs();
    if let Some(token) = target.auth_token.as_deref().filter(|token| !token.is_empty()) {
        pairs.push(("token", token.to_string()));
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}

/// Delay before the reconnect that follows `attempts` earlier ones:
/// `min(cap, base * 2^attempts)`.
pub fn reconnect_delay(attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    RECONNECT_BASE.saturating_mul(factor).min(RECONNECT_CAP)
}

struct ConnectionEntry {
    options_key: String,
    generation: u64,
    attempts: u32,
    outbound: mpsc::Sender<ClientMessage>,
    open: bool,
    transport: JoinHandle<()>,
    reconnect: Option<(Duration, JoinHandle<()>)>,
}

impl ConnectionEntry {
    fn teardown(self) {
        if let Some((_, timer)) = self.reconnect {
            timer.abort();
        }
        self.transport.abort();
    }
}

pub struct LiveManager<C> {
    connector: C,
    options: LiveOptions,
    hosts: HashMap<String, HostTarget>,
    states: HashMap<String, HostLiveState>,
    connections: HashMap<String, ConnectionEntry>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    next_generation: u64,
}

impl<C: Connector> LiveManager<C> {
    /// Must be created inside a tokio runtime; transports are spawned tasks.
    pub fn new(connector: C, options: LiveOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            options,
            hosts: HashMap::new(),
            states: HashMap::new(),
            connections: HashMap::new(),
            events_tx,
            events_rx,
            next_generation: 0,
        }
    }

    pub fn options(&self) -> &LiveOptions {
        &self.options
    }

    pub fn state(&self, host_id: &str) -> Option<&HostLiveState> {
        self.states.get(host_id)
    }

    pub fn states(&self) -> &HashMap<String, HostLiveState> {
        &self.states
    }

    /// Delay of the reconnect currently waiting for `host_id`, if any.
    pub fn pending_reconnect(&self, host_id: &str) -> Option<Duration> {
        self.connections
            .get(host_id)
            .and_then(|entry| entry.reconnect.as_ref())
            .map(|(delay, _)| *delay)
    }

    pub fn is_open(&self, host_id: &str) -> bool {
        self.connections
            .get(host_id)
            .is_some_and(|entry| entry.open)
    }

    /// Makes the subscribed set exactly `hosts`, tearing down anything that
    /// is no longer wanted or was opened under other options.
    pub fn set_hosts(&mut self, hosts: Vec<HostTarget>) {
        self.hosts = hosts
            .into_iter()
            .map(|host| (host.id.clone(), host))
            .collect();
        self.reconcile();
    }

    pub fn subscribe(&mut self, host: HostTarget) {
        if let Some(existing) = self.hosts.get(&host.id) {
            if *existing != host {
                if let Some(entry) = self.connections.remove(&host.id) {
                    entry.teardown();
                }
            }
        }
        self.hosts.insert(host.id.clone(), host);
        self.reconcile();
    }

    pub fn unsubscribe(&mut self, host_id: &str) {
        self.hosts.remove(host_id);
        self.reconcile();
    }

    /// Switches every host to `options`. Connections opened under a different
    /// options key are replaced at once, even while waiting to reconnect.
    pub fn set_options(&mut self, options: LiveOptions) {
        self.options = options;
        self.reconcile();
    }

    /// Best-effort: dropped unless the host's transport is open.
    pub fn refresh_host(&self, host_id: &str) -> bool {
        let Some(entry) = self.connections.get(host_id).filter(|entry| entry.open) else {
            return false;
        };
        entry.outbound.try_send(ClientMessage::Refresh).is_ok()
    }

    pub fn refresh_all(&self) -> usize {
        self.connections
            .keys()
            .filter(|host_id| self.refresh_host(host_id))
            .count()
    }

    /// Waits for the next event that changes a host and returns that host's id.
    pub async fn next_update(&mut self) -> String {
        loop {
            let Some(event) = self.events_rx.recv().await else {
                // the manager holds a sender, so the channel never closes
                return std::future::pending().await;
            };
            if let Some(host_id) = self.handle(event) {
                return host_id;
            }
        }
    }

    /// Applies every event already queued and returns the hosts that changed.
    pub fn process_pending(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(host_id) = self.handle(event) {
                changed.push(host_id);
            }
        }
        changed
    }

    fn reconcile(&mut self) {
        self.states.retain(|host_id, _| self.hosts.contains_key(host_id));

        let options_key = self.options.options_key();
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|(host_id, entry)| {
                !self.hosts.contains_key(*host_id) || entry.options_key != options_key
            })
            .map(|(host_id, _)| host_id.clone())
            .collect();
        for host_id in stale {
            if let Some(entry) = self.connections.remove(&host_id) {
                debug!(event = "live_teardown", host = %host_id);
                entry.teardown();
            }
        }

        let missing: Vec<String> = self
            .hosts
            .keys()
            .filter(|host_id| !self.connections.contains_key(*host_id))
            .cloned()
            .collect();
        for host_id in missing {
            self.connect(&host_id, 0);
        }
    }

    fn connect(&mut self, host_id: &str, attempts: u32) {
        let Some(target) = self.hosts.get(host_id) else {
            return;
        };
        let state = self.states.entry(host_id.to_string()).or_default();
        let url = match events_url(target, &self.options) {
            Ok(url) => url,
            Err(err) => {
                warn!(event = "live_invalid_url", host = %host_id, base_url = %target.base_url);
                state.status = HostStatus::Offline;
                state.error = Some(err.to_string());
                return;
            }
        };
        state.begin_checking();

        self.next_generation += 1;
        let generation = self.next_generation;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sink = EventSink::new(host_id.to_string(), generation, self.events_tx.clone());
        let transport = tokio::spawn(self.connector.run(url, sink, outbound_rx));
        info!(event = "live_connect", host = %host_id, generation, attempts);

        self.connections.insert(
            host_id.to_string(),
            ConnectionEntry {
                options_key: self.options.options_key(),
                generation,
                attempts,
                outbound,
                open: false,
                transport,
                reconnect: None,
            },
        );
    }

    fn handle(&mut self, event: ManagerEvent) -> Option<String> {
        let ManagerEvent {
            host_id,
            generation,
            kind,
        } = event;
        let entry = self
            .connections
            .get_mut(&host_id)
            .filter(|entry| entry.generation == generation)?;

        match kind {
            ManagerEventKind::ReconnectDue => {
                let attempts = entry.attempts;
                self.connections.remove(&host_id);
                self.connect(&host_id, attempts);
            }
            ManagerEventKind::Transport(TransportEvent::Opened) => {
                entry.open = true;
                return None;
            }
            ManagerEventKind::Transport(TransportEvent::Live(live)) => {
                let closed = matches!(live, LiveEvent::Closed(_));
                if matches!(live, LiveEvent::Snapshot(_)) {
                    entry.attempts = 0;
                }
                if closed {
                    entry.open = false;
                    let delay = reconnect_delay(entry.attempts);
                    entry.attempts += 1;
                    let timer = spawn_reconnect_timer(
                        self.events_tx.clone(),
                        host_id.clone(),
                        generation,
                        delay,
                    );
                    entry.reconnect = Some((delay, timer));
                    info!(event = "live_closed", host = %host_id, delay_ms = delay.as_millis() as u64, attempts = entry.attempts);
                }
                let now_ms = unix_now_ms();
                self.states.entry(host_id.clone()).or_default().apply(live, now_ms);
            }
        }
        Some(host_id)
    }
}

impl<C> Drop for LiveManager<C> {
    fn drop(&mut self) {
        for (_, entry) in self.connections.drain() {
            entry.teardown();
        }
    }
}

fn spawn_reconnect_timer(
    events: mpsc::UnboundedSender<ManagerEvent>,
    host_id: String,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(ManagerEvent {
            host_id,
            generation,
            kind: ManagerEventKind::ReconnectDue,
        });
    })
}

fn unix_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{BoxFuture, FutureExt};
    use std::sync::{Arc, Mutex};
    use ter_core::live::{ServerMessage, Snapshot};

    struct OpenedTransport {
        url: Url,
        events: EventSink,
        outbound: mpsc::Receiver<ClientMessage>,
    }

    /// Records every transport it is asked to open and never finishes on its
    /// own; tests push events through the recorded sinks.
    #[derive(Clone, Default)]
    struct FakeConnector {
        opened: Arc<Mutex<Vec<OpenedTransport>>>,
    }

    impl FakeConnector {
        fn count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn sink(&self, index: usize) -> EventSink {
            self.opened.lock().unwrap()[index].events.clone()
        }

        fn url(&self, index: usize) -> Url {
            self.opened.lock().unwrap()[index].url.clone()
        }

        fn try_recv(&self, index: usize) -> Option<ClientMessage> {
            self.opened.lock().unwrap()[index].outbound.try_recv().ok()
        }
    }

    impl Connector for FakeConnector {
        fn run(
            &self,
            url: Url,
            events: EventSink,
            outbound: mpsc::Receiver<ClientMessage>,
        ) -> BoxFuture<'static, ()> {
            self.opened.lock().unwrap().push(OpenedTransport {
                url,
                events,
                outbound,
            });
            std::future::pending().boxed()
        }
    }

    fn target(id: &str) -> HostTarget {
        HostTarget {
            id: id.to_string(),
            base_url: "http://devbox:8787".to_string(),
            auth_token: None,
        }
    }

    fn sessions_only() -> LiveOptions {
        LiveOptions {
            sessions: true,
            ..LiveOptions::default()
        }
    }

    fn snapshot() -> ServerMessage {
        ServerMessage::Snapshot(Snapshot {
            ts: 42,
            sessions: Some(Vec::new()),
            ..Snapshot::default()
        })
    }

    #[test]
    fn reconnect_delay_doubles_up_to_cap() {
        let delays: Vec<u64> = (0..6).map(|n| reconnect_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
        assert_eq!(reconnect_delay(40), RECONNECT_CAP);
    }

    #[test]
    fn events_url_carries_flags_and_token() {
        let mut host = target("a");
        host.base_url = "https://agent.example.com:8443/ignored/path".to_string();
        host.auth_token = Some("s3cret".to_string());
        let url = events_url(&host, &sessions_only()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://agent.example.com:8443/events?sessions=1&previewLines=6&interval=5000&token=s3cret"
        );

        host.base_url = "http://10.0.0.5".to_string();
        host.auth_token = None;
        assert!(events_url(&host, &sessions_only())
            .unwrap()
            .as_str()
            .starts_with("ws://10.0.0.5/events?"));

        host.base_url = "not a url".to_string();
        assert_eq!(events_url(&host, &sessions_only()), Err(WatchError::InvalidUrl));
    }

    #[tokio::test]
    async fn invalid_url_goes_offline_without_connecting() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        let mut host = target("bad");
        host.base_url = "::nope::".to_string();
        manager.subscribe(host);

        let state = manager.state("bad").unwrap();
        assert_eq!(state.status, HostStatus::Offline);
        assert_eq!(state.error.as_deref(), Some("Invalid URL"));
        assert_eq!(connector.count(), 0);
        assert_eq!(manager.pending_reconnect("bad"), None);
    }

    #[tokio::test]
    async fn snapshot_brings_host_online() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        manager.subscribe(target("a"));
        assert_eq!(manager.state("a").unwrap().status, HostStatus::Checking);

        connector.sink(0).opened();
        connector.sink(0).message(snapshot());
        assert_eq!(manager.process_pending(), vec!["a".to_string()]);

        let state = manager.state("a").unwrap();
        assert_eq!(state.status, HostStatus::Online);
        assert_eq!(state.last_update, Some(42));
        assert!(manager.is_open("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_closures_back_off_exponentially() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        manager.subscribe(target("a"));

        let mut observed = Vec::new();
        for n in 1..=5 {
            connector.sink(n - 1).closed(None);
            assert_eq!(manager.next_update().await, "a");
            assert_eq!(manager.state("a").unwrap().status, HostStatus::Offline);
            observed.push(manager.pending_reconnect("a").unwrap().as_millis() as u64);

            assert_eq!(manager.next_update().await, "a");
            assert_eq!(connector.count(), n + 1);
            assert_eq!(manager.state("a").unwrap().status, HostStatus::Checking);
        }
        assert_eq!(observed, vec![1_000, 2_000, 4_000, 8_000, 10_000]);

        // a good snapshot on the new connection starts the count over
        connector.sink(5).message(snapshot());
        manager.process_pending();
        connector.sink(5).closed(None);
        manager.process_pending();
        assert_eq!(manager.pending_reconnect("a"), Some(RECONNECT_BASE));
    }

    #[tokio::test(start_paused = true)]
    async fn options_change_mid_backoff_reconnects_immediately() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        manager.subscribe(target("a"));
        connector.sink(0).closed(Some("refused".to_string()));
        manager.process_pending();
        assert!(manager.pending_reconnect("a").is_some());

        manager.set_options(LiveOptions {
            docker: true,
            ..sessions_only()
        });
        assert_eq!(connector.count(), 2);
        assert!(connector.url(1).as_str().contains("docker=1"));
        assert_eq!(manager.pending_reconnect("a"), None);
        assert_eq!(manager.state("a").unwrap().status, HostStatus::Checking);

        // the cancelled timer never fires a second connection
        tokio::time::sleep(RECONNECT_CAP * 2).await;
        manager.process_pending();
        assert_eq!(connector.count(), 2);

        // events from the replaced transport are ignored
        connector.sink(0).message(snapshot());
        assert!(manager.process_pending().is_empty());
        assert_eq!(manager.state("a").unwrap().status, HostStatus::Checking);
    }

    #[tokio::test]
    async fn refresh_is_dropped_unless_open() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        manager.set_hosts(vec![target("a"), target("b")]);

        assert!(!manager.refresh_host("a"));
        assert_eq!(manager.refresh_all(), 0);

        let index_of = |id: &str| (0..2).find(|i| connector.sink(*i).host_id() == id).unwrap();
        let a = index_of("a");
        connector.sink(a).opened();
        manager.process_pending();

        assert_eq!(manager.refresh_all(), 1);
        assert_eq!(connector.try_recv(a), Some(ClientMessage::Refresh));
        assert_eq!(connector.try_recv(1 - a), None);
        assert!(!manager.refresh_host("missing"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_state_and_connection() {
        let connector = FakeConnector::default();
        let mut manager = LiveManager::new(connector.clone(), sessions_only());
        manager.set_hosts(vec![target("a"), target("b")]);
        connector.sink(0).closed(None);
        manager.process_pending();

        manager.unsubscribe("a");
        manager.unsubscribe("b");
        assert!(manager.states().is_empty());
        assert_eq!(manager.pending_reconnect("a"), None);
        assert!(!manager.is_open("b"));

        connector.sink(1).message(snapshot());
        assert!(manager.process_pending().is_empty());
    }
}
