use serde::Serialize;
use ter_core::live::{ServerMessage, Snapshot};
use ter_core::model::{DockerSnapshot, HostInfo, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
    Checking,
}

/// What a client currently knows about one subscribed host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostLiveState {
    pub status: HostStatus,
    pub sessions: Vec<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<i64>,
}

impl Default for HostLiveState {
    fn default() -> Self {
        Self {
            status: HostStatus::Checking,
            sessions: Vec::new(),
            host_info: None,
            docker: None,
            error: None,
            last_update: None,
        }
    }
}

/// Something that happened on one host's transport.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Snapshot(Snapshot),
    Error(String),
    Closed(Option<String>),
}

impl From<ServerMessage> for LiveEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Snapshot(snapshot) => LiveEvent::Snapshot(snapshot),
            ServerMessage::Error { message } => LiveEvent::Error(message),
        }
    }
}

impl HostLiveState {
    /// A connection attempt is starting; the old data stays visible.
    pub fn begin_checking(&mut self) {
        self.status = HostStatus::Checking;
        self.error = None;
    }

    /// Applies one transport event. Fields a snapshot leaves out keep their
    /// previous values, and a feed error never takes an online host offline.
    pub fn apply(&mut self, event: LiveEvent, now_ms: i64) {
        match event {
            LiveEvent::Snapshot(snapshot) => {
                self.status = HostStatus::Online;
                if let Some(sessions) = snapshot.sessions {
                    self.sessions = sessions;
                }
                if let Some(host) = snapshot.host {
                    self.host_info = Some(host);
                }
                if let Some(docker) = snapshot.docker {
                    self.docker = Some(docker);
                }
                self.last_update = Some(if snapshot.ts > 0 { snapshot.ts } else { now_ms });
                self.error = None;
            }
            LiveEvent::Error(message) => {
                if self.status != HostStatus::Online {
                    self.status = HostStatus::Offline;
                }
                self.error = Some(if message.is_empty() {
                    "Live feed error".to_string()
                } else {
                    message
                });
            }
            LiveEvent::Closed(reason) => {
                self.status = HostStatus::Offline;
                if reason.is_some() {
                    self.error = reason;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ter_core::model::DockerSnapshot;

    fn session(name: &str) -> Session {
        Session {
            name: name.to_string(),
            windows: 1,
            created: 0,
            attached: false,
            last_attached: None,
            preview: None,
            insights: None,
        }
    }

    #[test]
    fn partial_snapshot_keeps_missing_fields() {
        let mut state = HostLiveState::default();
        state.apply(
            LiveEvent::Snapshot(Snapshot {
                ts: 10,
                sessions: Some(vec![session("main")]),
                docker: Some(DockerSnapshot::unavailable("docker not installed")),
                ..Snapshot::default()
            }),
            99,
        );
        state.apply(
            LiveEvent::Snapshot(Snapshot {
                ts: 20,
                sessions: Some(vec![session("main"), session("logs")]),
                ..Snapshot::default()
            }),
            99,
        );
        assert_eq!(state.status, HostStatus::Online);
        assert_eq!(state.sessions.len(), 2);
        assert!(state.docker.is_some());
        assert_eq!(state.last_update, Some(20));
    }

    #[test]
    fn feed_error_keeps_online_host_online() {
        let mut state = HostLiveState::default();
        state.apply(LiveEvent::Snapshot(Snapshot::default()), 5);
        assert_eq!(state.last_update, Some(5));
        state.apply(LiveEvent::Error("snapshot failed".to_string()), 6);
        assert_eq!(state.status, HostStatus::Online);
        assert_eq!(state.error.as_deref(), Some("snapshot failed"));

        let mut fresh = HostLiveState::default();
        fresh.apply(LiveEvent::Error(String::new()), 6);
        assert_eq!(fresh.status, HostStatus::Offline);
        assert_eq!(fresh.error.as_deref(), Some("Live feed error"));
    }

    #[test]
    fn close_goes_offline_and_checking_clears_error() {
        let mut state = HostLiveState::default();
        state.apply(LiveEvent::Snapshot(Snapshot::default()), 1);
        state.apply(LiveEvent::Closed(Some("connection reset".to_string())), 2);
        assert_eq!(state.status, HostStatus::Offline);
        assert_eq!(state.error.as_deref(), Some("connection reset"));

        state.begin_checking();
        assert_eq!(state.status, HostStatus::Checking);
        assert!(state.error.is_none());
    }

    #[test]
    fn state_serializes_for_display() {
        let value = serde_json::to_value(HostLiveState::default()).unwrap();
        assert_eq!(value, serde_json::json!({ "status": "checking", "sessions": [] }));
    }
}
