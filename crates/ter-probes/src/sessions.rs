//! Terminal multiplexer sessions, with optional pane previews and insights.

use crate::command::{run_checked, run_command};
use crate::error::ProbeError;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use ter_core::model::{Session, SessionInsights, UsageSnapshot};
use tracing::debug;

pub const TMUX_TIMEOUT: Duration = Duration::from_secs(5);
const FIELD_SEPARATOR: &str = "||";
const SESSION_FORMAT: &str = "#{session_name}||#{session_windows}||#{session_created}||#{session_attached}||#{session_last_attached}";
const PANE_FORMAT: &str = "#{pane_active}||#{pane_current_command}||#{pane_current_path}";
const NO_SERVER_MARKERS: [&str; 3] = ["no server running", "no sessions", "error connecting"];

/// Per-request extras on top of the bare session list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionQuery {
    pub preview: bool,
    pub preview_lines: u32,
    pub insights: bool,
}

pub fn parse_session_list(raw: &str) -> Vec<Session> {
    raw.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim_end().split(FIELD_SEPARATOR).collect();
            let name = fields.first().copied().filter(|name| !name.is_empty())?;
            let number = |index: usize| -> Option<i64> {
                fields.get(index).and_then(|field| field.trim().parse().ok())
            };
            Some(Session {
                name: name.to_string(),
                windows: number(1).and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
                created: number(2).unwrap_or(0),
                attached: number(3).is_some_and(|n| n > 0),
                last_attached: number(4).filter(|n| *n > 0),
                preview: None,
                insights: None,
            })
        })
        .collect()
}

/// The last `limit` non-blank lines of a pane capture.
pub fn preview_tail(raw: &str, limit: u32) -> Vec<String> {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let skip = lines.len().saturating_sub(limit as usize);
    lines[skip..].iter().map(|line| line.to_string()).collect()
}

/// Current command and path of the active pane, falling back to the first.
pub fn parse_active_pane(raw: &str) -> (Option<String>, Option<String>) {
    let panes: Vec<Vec<&str>> = raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.splitn(3, FIELD_SEPARATOR).collect())
        .collect();
    let pane = panes
        .iter()
        .find(|fields| fields.first() == Some(&"1"))
        .or_else(|| panes.first());
    let field = |index: usize| {
        pane.and_then(|fields| fields.get(index))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    (field(1), field(2))
}

fn is_no_server(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    NO_SERVER_MARKERS.iter().any(|marker| stderr.contains(marker))
}

#[derive(Clone)]
pub struct SessionProbe {
    binary: Arc<str>,
}

impl Default for SessionProbe {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl SessionProbe {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: Arc::from(binary),
        }
    }

    pub async fn version(&self) -> Result<String, ProbeError> {
        run_checked(&self.binary, &["-V"], TMUX_TIMEOUT)
            .await
            .map(|out| out.trim().to_string())
    }

    /// Lists sessions. A multiplexer with no server is an empty list.
    pub async fn list(&self) -> Result<Vec<Session>, ProbeError> {
        let output = run_command(&self.binary, &["list-sessions", "-F", SESSION_FORMAT], TMUX_TIMEOUT)
            .await?;
        if output.success {
            return Ok(parse_session_list(&output.stdout));
        }
        if is_no_server(&output.stderr) {
            debug!(event = "tmux_no_server");
            return Ok(Vec::new());
        }
        let reason = output.stderr.lines().next().unwrap_or("tmux failed").trim();
        Err(ProbeError::Failed(format!("tmux: {reason}")))
    }

    /// Adds previews and insights per `query`. Lookups that fail leave the
    /// field empty rather than failing the list.
    pub async fn decorate(
        &self,
        sessions: Vec<Session>,
        query: SessionQuery,
        usage: Option<UsageSnapshot>,
    ) -> Vec<Session> {
        if !query.preview && !query.insights {
            return sessions;
        }
        let decorated = sessions.into_iter().map(|mut session| {
            let usage = usage.clone();
            async move {
                if query.preview {
                    session.preview = self.preview(&session.name, query.preview_lines).await.ok();
                }
                if query.insights {
                    let (current_command, current_path) = self
                        .active_pane(&session.name)
                        .await
                        .unwrap_or((None, None));
                    session.insights = Some(SessionInsights {
                        current_command,
                        current_path,
                        usage,
                    });
                }
                session
            }
        });
        join_all(decorated).await
    }

    async fn preview(&self, session: &str, lines: u32) -> Result<Vec<String>, ProbeError> {
        let raw = run_checked(
            &self.binary,
            &["capture-pane", "-p", "-J", "-t", session],
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(preview_tail(&raw, lines))
    }

    async fn active_pane(
        &self,
        session: &str,
    ) -> Result<(Option<String>, Option<String>), ProbeError> {
        let raw = run_checked(
            &self.binary,
            &["list-panes", "-t", session, "-F", PANE_FORMAT],
            TMUX_TIMEOUT,
        )
        .await?;
        Ok(parse_active_pane(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lines_are_parsed() {
        let raw = "main||3||1760000000||1||1760000500\nscratch||1||1760001000||0||\n\n";
        let sessions = parse_session_list(raw);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "main");
        assert_eq!(sessions[0].windows, 3);
        assert!(sessions[0].attached);
        assert_eq!(sessions[0].last_attached, Some(1760000500));
        assert!(!sessions[1].attached);
        assert_eq!(sessions[1].last_attached, None);
    }

    #[test]
    fn preview_keeps_last_non_blank_lines() {
        let raw = "one\n\ntwo   \nthree\n   \nfour\n\n\n";
        assert_eq!(preview_tail(raw, 2), vec!["three", "four"]);
        assert_eq!(preview_tail(raw, 10), vec!["one", "two", "three", "four"]);
        assert!(preview_tail(raw, 0).is_empty());
    }

    #[test]
    fn active_pane_is_preferred() {
        let raw = "0||zsh||/home/dev\n1||vim||/home/dev/project\n";
        assert_eq!(
            parse_active_pane(raw),
            (Some("vim".to_string()), Some("/home/dev/project".to_string()))
        );
        assert_eq!(
            parse_active_pane("0||bash||/tmp\n"),
            (Some("bash".to_string()), Some("/tmp".to_string()))
        );
        assert_eq!(parse_active_pane(""), (None, None));
    }

    #[test]
    fn no_server_messages_are_recognised() {
        assert!(is_no_server("no server running on /tmp/tmux-1000/default\n"));
        assert!(is_no_server("error connecting to /tmp/tmux-0/default (No such file or directory)"));
        assert!(!is_no_server("unknown option -- Z"));
    }

    #[tokio::test]
    async fn missing_multiplexer_is_tool_missing() {
        let probe = SessionProbe::new("ter-no-such-tmux");
        assert!(matches!(probe.list().await, Err(ProbeError::ToolMissing(_))));
    }

    #[tokio::test]
    async fn failed_preview_lookup_keeps_the_session() {
        let probe = SessionProbe::new("ter-no-such-tmux");
        let sessions = parse_session_list("main||1||1760000000||0||\n");
        let query = SessionQuery {
            preview: true,
            preview_lines: 3,
            insights: false,
        };
        let decorated = probe.decorate(sessions, query, None).await;
        assert_eq!(decorated.len(), 1);
        assert_eq!(decorated[0].name, "main");
        assert_eq!(decorated[0].preview, None);
    }
}
