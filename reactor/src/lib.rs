//! Event-driven RPC I/O core.
//!
//! A process runs N reactors, each a single-threaded event loop that owns a
//! disjoint set of TCP connections (inbound and outbound), dispatches
//! outbound calls onto them, and runs periodic maintenance (idle reaping,
//! timers, scheduled tasks). External threads interact with a reactor only
//! through two lock-protected queues and an async wake signal.

pub mod call;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod logging;
pub mod messenger;
pub mod metrics;
pub mod negotiation;
pub mod reactor;
pub mod restrictions;
pub mod task;
pub mod types;

pub use call::{CallState, OutboundCall, OutboundCallPtr};
pub use config::{ConnectionType, MessengerBuilder};
pub use connection::{Connection, ConnectionPtr};
pub use context::{ConnectionContext, InFlightCall};
pub use error::{Error, Result};
pub use messenger::Messenger;
pub use metrics::ReactorMetrics;
pub use reactor::{Reactor, ReactorCore};
pub use task::{DelayedTask, ReactorTask, ReactorTaskPtr};
pub use types::{
    ConnectionId, ConnectionInfo, Direction, DumpRunningRpcsRequest, DumpRunningRpcsResponse,
    ServerEvent, UserCredentials,
};
