//! Messenger-side services the reactor depends on.
//!
//! The full messenger (listener threads, reactor fleet, call routing) lives
//! above this crate; reactors only need the pieces below: the negotiation
//! pool, the connection type for new contexts, optional outbound bind
//! addresses, and the scheduled-task id registry.

use crate::config::{ConnectionType, MessengerBuilder};
use crate::negotiation::NegotiationPool;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Messenger {
    name: String,
    connection_type: ConnectionType,
    negotiation_pool: NegotiationPool,
    outbound_address_v4: Option<Ipv4Addr>,
    outbound_address_v6: Option<Ipv6Addr>,
    local_ip_for_outbound_sockets: String,
    num_connections_to_server: u8,
    /// Runtime-tunable handshake deadline.
    rpc_negotiation_timeout_ms: AtomicU64,
    next_task_id: AtomicU64,
    scheduled_tasks: Mutex<HashSet<u64>>,
}

impl Messenger {
    pub fn new(builder: &MessengerBuilder) -> Arc<Messenger> {
        Arc::new(Messenger {
            name: builder.name.clone(),
            connection_type: builder.connection_type,
            negotiation_pool: NegotiationPool::new(&builder.name, builder.negotiation_threads),
            outbound_address_v4: builder.outbound_address_v4,
            outbound_address_v6: builder.outbound_address_v6,
            local_ip_for_outbound_sockets: builder.local_ip_for_outbound_sockets.clone(),
            num_connections_to_server: builder.num_connections_to_server,
            rpc_negotiation_timeout_ms: AtomicU64::new(builder.rpc_negotiation_timeout_ms),
            next_task_id: AtomicU64::new(1),
            scheduled_tasks: Mutex::new(HashSet::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn negotiation_pool(&self) -> &NegotiationPool {
        &self.negotiation_pool
    }

    pub fn outbound_address_v4(&self) -> Option<Ipv4Addr> {
        self.outbound_address_v4
    }

    pub fn outbound_address_v6(&self) -> Option<Ipv6Addr> {
        self.outbound_address_v6
    }

    /// Whether reactors should auto-bind outbound sockets. Disabled when an
    /// explicit local IP is configured for them.
    pub(crate) fn bind_outbound_sockets(&self) -> bool {
        self.local_ip_for_outbound_sockets.is_empty()
    }

    pub fn num_connections_to_server(&self) -> u8 {
        self.num_connections_to_server
    }

    pub fn rpc_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_negotiation_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_rpc_negotiation_timeout_ms(&self, ms: u64) {
        self.rpc_negotiation_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_scheduled_task(&self, id: u64) {
        self.scheduled_tasks.lock().insert(id);
    }

    /// Called by a delayed task when its timer fires.
    pub fn remove_scheduled_task(&self, id: u64) {
        self.scheduled_tasks.lock().remove(&id);
    }

    pub fn num_scheduled_tasks(&self) -> usize {
        self.scheduled_tasks.lock().len()
    }

    /// Stop the negotiation pool. Reactors shut down separately.
    pub fn shutdown(&self) {
        self.negotiation_pool.shutdown();
    }
}
