//! Reactor metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "reactor_connections_accepted",
    description = "Inbound connections registered with a reactor"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "reactor_connections_created",
    description = "Outbound connections started by a reactor"
)]
pub static CONNECTIONS_CREATED: Counter = Counter::new();

#[metric(
    name = "reactor_connections_active",
    description = "Connections currently owned by reactor collections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "reactor_connections_timed_out",
    description = "Inbound connections reaped by the idle scan"
)]
pub static CONNECTIONS_TIMED_OUT: Counter = Counter::new();

#[metric(
    name = "reactor_tasks_scheduled",
    description = "Tasks accepted onto reactor pending queues"
)]
pub static TASKS_SCHEDULED: Counter = Counter::new();

#[metric(
    name = "reactor_tasks_aborted",
    description = "Tasks aborted instead of run"
)]
pub static TASKS_ABORTED: Counter = Counter::new();

#[metric(
    name = "reactor_outbound_calls_queued",
    description = "Outbound calls accepted for dispatch"
)]
pub static OUTBOUND_CALLS_QUEUED: Counter = Counter::new();

#[metric(
    name = "reactor_wakeups",
    description = "Async wake signals sent to reactor loops"
)]
pub static WAKEUPS: Counter = Counter::new();

/// Connection counts sampled on the reactor thread via
/// [`Reactor::get_metrics`](crate::Reactor::get_metrics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactorMetrics {
    pub num_client_connections: usize,
    pub num_server_connections: usize,
}
