use crate::codex::CodexProbe;
use crate::copilot::CopilotProbe;
use crate::cursor::CursorProbe;
use crate::error::ProbeError;
use crate::tokens::TokenProbe;
use ter_core::model::{ProviderStatus, ProviderUsage, UsageSnapshot};
use tracing::debug;

pub fn provider_status(provider: &str, result: Result<ProviderUsage, ProbeError>) -> ProviderStatus {
    match result {
        Ok(usage) => ProviderStatus::Ready(usage),
        Err(err) => {
            debug!(event = "usage_unavailable", provider, kind = err.kind().as_str(), error = %err);
            ProviderStatus::Unavailable {
                kind: err.kind(),
                error: err.to_string(),
            }
        }
    }
}

/// Every usage source the agent knows about. Each keeps its own cache, so
/// building a snapshot is cheap between provider TTLs.
#[derive(Clone, Default)]
pub struct UsageProbes {
    pub codex: CodexProbe,
    pub copilot: CopilotProbe,
    pub cursor: CursorProbe,
    pub tokens: TokenProbe,
}

impl UsageProbes {
    pub async fn snapshot(&self) -> UsageSnapshot {
        let (codex, copilot, cursor, tokens) = tokio::join!(
            self.codex.usage(),
            self.copilot.usage(),
            self.cursor.usage(),
            self.tokens.usage(),
        );
        UsageSnapshot {
            codex: provider_status("codex", codex),
            copilot: provider_status("copilot", copilot),
            cursor: provider_status("cursor", cursor),
            tokens,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
