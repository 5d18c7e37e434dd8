//! Client side of the live feed: keeps per-host state for every watched agent.

pub mod manager;
pub mod state;
pub mod transport;

pub use manager::{events_url, reconnect_delay, HostTarget, LiveManager, WatchError};
pub use state::{HostLiveState, HostStatus, LiveEvent};
pub use transport::{Connector, EventSink, TransportEvent, WsConnector};
