//! Probes for the facts the agent reports: multiplexer sessions, host
//! metrics, containers and coding-assistant usage.

pub mod codex;
pub mod command;
pub mod copilot;
pub mod cursor;
pub mod docker;
pub mod error;
pub mod host;
pub mod oauth;
pub mod sessions;
pub mod tokens;
pub mod usage;

pub use docker::DockerProbe;
pub use error::ProbeError;
pub use host::HostProbe;
pub use sessions::{SessionProbe, SessionQuery};
pub use usage::UsageProbes;
