//! Building blocks shared by the agent, the probes, and the watch client.

pub mod cache;
pub mod error;
pub mod frame;
pub mod live;
pub mod model;
pub mod pty;
pub mod rpc;

pub use cache::TtlCache;
pub use error::ErrorKind;
