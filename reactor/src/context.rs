//! Per-protocol connection contexts.
//!
//! The reactor is protocol-agnostic; what varies per connection type is
//! whether shutdown must wait for in-flight inbound calls, and what (if
//! anything) the blocking negotiation stage has to do. Framing and call
//! parsing belong to the service layer above this crate.

use crate::config::ConnectionType;
use crate::error::{Error, Result};
use crate::restrictions;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Guard for an inbound call being processed by the service layer. The
/// owning context is not ready to stop while any guard is alive.
pub struct InFlightCall {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightCall {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
pub struct YbContext {
    bytes_received: AtomicU64,
}

/// Redis connections must not be torn down while a command is still being
/// handled; responses would otherwise be dropped on the floor.
#[derive(Default)]
pub struct RedisContext {
    bytes_received: AtomicU64,
    calls_being_handled: Arc<AtomicUsize>,
}

#[derive(Default)]
pub struct CqlContext {
    bytes_received: AtomicU64,
    calls_being_handled: Arc<AtomicUsize>,
}

/// Tagged variant over the protocol contexts.
pub enum ConnectionContext {
    Yb(YbContext),
    Redis(RedisContext),
    Cql(CqlContext),
}

impl ConnectionContext {
    pub fn for_type(connection_type: ConnectionType) -> Self {
        match connection_type {
            ConnectionType::Yb => ConnectionContext::Yb(YbContext::default()),
            ConnectionType::Redis => ConnectionContext::Redis(RedisContext::default()),
            ConnectionType::Cql => ConnectionContext::Cql(CqlContext::default()),
        }
    }

    pub fn connection_type(&self) -> ConnectionType {
        match self {
            ConnectionContext::Yb(_) => ConnectionType::Yb,
            ConnectionContext::Redis(_) => ConnectionType::Redis,
            ConnectionContext::Cql(_) => ConnectionType::Cql,
        }
    }

    /// True once all in-flight state has been surfaced and the connection can
    /// be destroyed.
    pub fn ready_to_stop(&self) -> bool {
        match self {
            ConnectionContext::Yb(_) => true,
            ConnectionContext::Redis(ctx) => ctx.calls_being_handled.load(Ordering::Acquire) == 0,
            ConnectionContext::Cql(ctx) => ctx.calls_being_handled.load(Ordering::Acquire) == 0,
        }
    }

    /// A context with calls in flight is not idle.
    pub fn idle(&self) -> bool {
        self.ready_to_stop()
    }

    /// Track an inbound call handed to the service layer. YB calls are
    /// tracked by the call objects themselves, not the context.
    pub fn begin_call(&self) -> Option<InFlightCall> {
        let count = match self {
            ConnectionContext::Yb(_) => return None,
            ConnectionContext::Redis(ctx) => &ctx.calls_being_handled,
            ConnectionContext::Cql(ctx) => &ctx.calls_being_handled,
        };
        count.fetch_add(1, Ordering::AcqRel);
        Some(InFlightCall {
            count: count.clone(),
        })
    }

    /// Sink for inbound bytes. Parsing happens above this crate; the reactor
    /// only needs the activity signal.
    pub(crate) fn consume(&self, data: &[u8]) {
        let bytes = match self {
            ConnectionContext::Yb(ctx) => &ctx.bytes_received,
            ConnectionContext::Redis(ctx) => &ctx.bytes_received,
            ConnectionContext::Cql(ctx) => &ctx.bytes_received,
        };
        bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        match self {
            ConnectionContext::Yb(ctx) => ctx.bytes_received.load(Ordering::Relaxed),
            ConnectionContext::Redis(ctx) => ctx.bytes_received.load(Ordering::Relaxed),
            ConnectionContext::Cql(ctx) => ctx.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Blocking handshake hook, run on the negotiation pool with the socket
    /// in blocking mode. Protocol handshakes (SASL, startup exchanges) are
    /// driven by the service layer; Redis and CQL clients negotiate in-band,
    /// so the stage only enforces the deadline here.
    pub(crate) fn negotiate(&self, _stream: &TcpStream, deadline: Instant) -> Result<()> {
        restrictions::assert_io_allowed("connection negotiation");
        if Instant::now() >= deadline {
            return Err(Error::timed_out("connection negotiation timed out"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yb_context_always_ready() {
        let ctx = ConnectionContext::for_type(ConnectionType::Yb);
        assert!(ctx.ready_to_stop());
        assert!(ctx.begin_call().is_none());
        assert!(ctx.ready_to_stop());
    }

    #[test]
    fn test_cql_context_waits_for_in_flight_calls() {
        let ctx = ConnectionContext::for_type(ConnectionType::Cql);
        assert!(ctx.ready_to_stop());

        let first = ctx.begin_call().unwrap();
        let second = ctx.begin_call().unwrap();
        assert!(!ctx.ready_to_stop());
        assert!(!ctx.idle());

        drop(first);
        assert!(!ctx.ready_to_stop());
        drop(second);
        assert!(ctx.ready_to_stop());
    }

    #[test]
    fn test_consume_counts_bytes() {
        let ctx = ConnectionContext::for_type(ConnectionType::Redis);
        ctx.consume(b"*1\r\n$4\r\nPING\r\n");
        ctx.consume(b"x");
        assert_eq!(ctx.bytes_received(), 15);
    }
}
