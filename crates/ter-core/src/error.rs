use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure classes shared by every probe and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Timeout,
    Unauthorized,
    NotFound,
    ToolMissing,
    Protocol,
    Partial,
    NotConnected,
    Failed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ToolMissing => "tool_missing",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Partial => "partial",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::Failed => "failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "unreachable" => Ok(ErrorKind::Unreachable),
            "timeout" => Ok(ErrorKind::Timeout),
            "unauthorized" => Ok(ErrorKind::Unauthorized),
            "not_found" => Ok(ErrorKind::NotFound),
            "tool_missing" => Ok(ErrorKind::ToolMissing),
            "protocol" => Ok(ErrorKind::Protocol),
            "partial" => Ok(ErrorKind::Partial),
            "not_connected" => Ok(ErrorKind::NotConnected),
            "failed" => Ok(ErrorKind::Failed),
            other => Err(format!("Unknown error kind: {other}")),
        }
    }
}
