//! The reactor: a single-threaded event loop owning a disjoint set of
//! connections.
//!
//! External producers interact with a reactor through exactly two
//! lock-protected queues (pending tasks and outbound calls) plus the async
//! wake signal; everything else — connection tables, timers, the waiting
//! list drained at shutdown — is touched only on the reactor thread.

use crate::call::OutboundCallPtr;
use crate::config::MessengerBuilder;
use crate::connection::{Connection, ConnectionPtr};
use crate::context::ConnectionContext;
use crate::error::{shutdown_error, Error, Result};
use crate::messenger::Messenger;
use crate::metrics::{self, ReactorMetrics};
use crate::negotiation;
use crate::restrictions;
use crate::task::{
    DelayedTask, FunctorTask, ProcessOutboundQueueTask, ReactorTaskPtr, RunFunctionTask,
};
use crate::types::{
    ConnectionId, Direction, DumpRunningRpcsRequest, DumpRunningRpcsResponse, ServerEvent,
    UserCredentials,
};
use ahash::AHashMap;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);
const READ_BUF_SIZE: usize = 64 * 1024;
const EVENTS_CAPACITY: usize = 1024;

/// Deadline used when a call carries no timeout; effectively forever.
const NO_TIMEOUT_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Task ids when the owning messenger is already gone.
static FALLBACK_TASK_ID: AtomicU64 = AtomicU64::new(1 << 62);

struct PendingTasks {
    tasks: Vec<ReactorTaskPtr>,
    closing: bool,
}

struct OutboundQueue {
    queue: Vec<OutboundCallPtr>,
    stopped: bool,
}

/// State shared between the reactor handle, the reactor thread, and
/// negotiation jobs posting completions back.
pub(crate) struct Inner {
    name: String,
    messenger: Weak<Messenger>,
    pending: Mutex<PendingTasks>,
    outbound: Mutex<OutboundQueue>,
    waker: Waker,
    process_outbound_queue_task: Arc<ProcessOutboundQueueTask>,
    connection_keepalive_time: Duration,
    coarse_timer_granularity: Duration,
    num_connections_to_server: u8,
}

impl Inner {
    /// Post a task; aborts it with ServiceUnavailable if the reactor is
    /// closing. The pending lock is released before the abort runs.
    fn schedule_task(&self, task: ReactorTaskPtr) {
        {
            let mut pending = self.pending.lock();
            if pending.closing {
                drop(pending);
                task.abort(shutdown_error(false));
                metrics::TASKS_ABORTED.increment();
                return;
            }
            pending.tasks.push(task);
        }
        metrics::TASKS_SCHEDULED.increment();
        self.wake();
    }

    fn schedule_functor(&self, func: impl FnOnce(&mut ReactorCore) + Send + 'static) {
        self.schedule_task(FunctorTask::new(func));
    }

    /// Signal the loop. Repeated sends before the loop wakes collapse into a
    /// single wakeup.
    fn wake(&self) {
        metrics::WAKEUPS.increment();
        if let Err(e) = self.waker.wake() {
            warn!(reactor = %self.name, "failed to wake reactor: {}", e);
        }
    }

    fn closing(&self) -> bool {
        self.pending.lock().closing
    }
}

/// Handle to one reactor, held by the messenger layer. One per worker
/// thread; the handle's surface is callable from any thread.
pub struct Reactor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Present between construction and init().
    core: Mutex<Option<ReactorCore>>,
}

impl Reactor {
    pub fn new(
        messenger: &Arc<Messenger>,
        index: usize,
        builder: &MessengerBuilder,
    ) -> io::Result<Reactor> {
        let name = format!("{}_R{:03}", builder.name, index);
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let inner = Arc::new(Inner {
            name: name.clone(),
            messenger: Arc::downgrade(messenger),
            pending: Mutex::new(PendingTasks {
                tasks: Vec::new(),
                closing: false,
            }),
            outbound: Mutex::new(OutboundQueue {
                queue: Vec::new(),
                stopped: false,
            }),
            waker,
            process_outbound_queue_task: Arc::new(ProcessOutboundQueueTask),
            connection_keepalive_time: builder.connection_keepalive_time(),
            coarse_timer_granularity: builder.coarse_timer_granularity(),
            num_connections_to_server: builder.num_connections_to_server,
        });
        info!(
            reactor = %name,
            keepalive = ?inner.connection_keepalive_time,
            granularity = ?inner.coarse_timer_granularity,
            "created reactor"
        );
        let core = ReactorCore::new(inner.clone(), poll);
        Ok(Reactor {
            inner,
            thread: Mutex::new(None),
            core: Mutex::new(Some(core)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn the reactor thread and start the event loop.
    pub fn init(&self) -> Result<()> {
        let core = self
            .core
            .lock()
            .take()
            .ok_or_else(|| Error::illegal_state("reactor already started"))?;
        let handle = std::thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || run_thread(core))
            .map_err(Error::from)?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Request shutdown. Idempotent, callable from any thread; the reactor
    /// thread tears everything down and exits once the waiting connections
    /// drain.
    pub fn shutdown(&self) {
        {
            let mut pending = self.inner.pending.lock();
            if pending.closing {
                return;
            }
            pending.closing = true;
        }
        debug!(reactor = %self.inner.name, "shutting down reactor thread");
        self.inner.wake();
    }

    /// Block until the reactor thread exits.
    pub fn join(&self) {
        restrictions::assert_wait_allowed("Reactor::join");
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn closing(&self) -> bool {
        self.inner.closing()
    }

    pub fn schedule_reactor_task(&self, task: ReactorTaskPtr) {
        self.inner.schedule_task(task);
    }

    pub fn schedule_reactor_functor(&self, func: impl FnOnce(&mut ReactorCore) + Send + 'static) {
        self.inner.schedule_functor(func);
    }

    /// Run `func` on the reactor thread and block until it completes (or the
    /// reactor refuses it because it is shutting down).
    pub fn run_on_reactor_thread<F, R>(&self, func: F) -> Result<R>
    where
        F: FnOnce(&mut ReactorCore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        restrictions::assert_wait_allowed("run_on_reactor_thread");
        let (task, rx) = RunFunctionTask::new(func);
        self.inner.schedule_task(task);
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(shutdown_error(false)),
        }
    }

    /// Connection counts, sampled on the reactor thread.
    pub fn get_metrics(&self) -> Result<ReactorMetrics> {
        self.run_on_reactor_thread(|core| {
            Ok(ReactorMetrics {
                num_client_connections: core.num_client_connections(),
                num_server_connections: core.num_server_connections(),
            })
        })
    }

    pub fn dump_running_rpcs(&self, req: DumpRunningRpcsRequest) -> Result<DumpRunningRpcsResponse> {
        self.run_on_reactor_thread(move |core| Ok(core.dump_running_rpcs(&req)))
    }

    /// Queue `event` on every inbound connection of this reactor.
    pub fn queue_event_on_all_connections(&self, event: ServerEvent) {
        self.inner
            .schedule_functor(move |core| core.broadcast_event(&event));
    }

    /// Half-close every connection whose peer IP equals `addr`.
    pub fn drop_with_remote_address(&self, addr: IpAddr) {
        self.inner
            .schedule_functor(move |core| core.drop_with_remote_address(addr));
    }

    /// Queue an outbound call for dispatch. The first producer to make the
    /// queue non-empty schedules the drain; later pushes piggy-back on it.
    pub fn queue_outbound_call(&self, call: OutboundCallPtr) {
        let was_empty;
        {
            let mut outbound = self.inner.outbound.lock();
            if outbound.stopped {
                drop(outbound);
                call.transferred(Err(shutdown_error(true)));
                return;
            }
            was_empty = outbound.queue.is_empty();
            outbound.queue.push(call);
        }
        metrics::OUTBOUND_CALLS_QUEUED.increment();
        if was_empty {
            self.inner
                .schedule_task(self.inner.process_outbound_queue_task.clone());
        }
    }

    /// Take ownership of an accepted socket and register it as a SERVER
    /// connection. Called from acceptor threads; if the reactor is already
    /// closing, the posted task is aborted and dropping it closes the socket.
    pub fn register_inbound_socket(&self, stream: TcpStream, remote: SocketAddr) {
        let messenger = match self.inner.messenger.upgrade() {
            Some(messenger) => messenger,
            None => {
                warn!(reactor = %self.inner.name, %remote,
                      "dropping inbound socket: messenger has shut down");
                return;
            }
        };
        trace!(reactor = %self.inner.name, %remote, "new inbound connection");
        let context = ConnectionContext::for_type(messenger.connection_type());
        let conn = Connection::new(
            context,
            remote,
            stream,
            Direction::Server,
            UserCredentials::default(),
        );
        self.inner
            .schedule_functor(move |core| core.register_connection(conn));
    }

    /// Schedule `func` to run on the reactor thread after `delay`. The
    /// returned handle can abort it; exactly one of timer-fire and abort
    /// invokes the callback.
    pub fn schedule_delayed_task(
        &self,
        func: impl FnOnce(Result<()>) + Send + 'static,
        delay: Duration,
    ) -> Arc<DelayedTask> {
        let id = match self.inner.messenger.upgrade() {
            Some(messenger) => {
                let id = messenger.next_task_id();
                messenger.register_scheduled_task(id);
                id
            }
            None => FALLBACK_TASK_ID.fetch_add(1, Ordering::Relaxed),
        };
        let task = DelayedTask::new(Box::new(func), delay, id, self.inner.messenger.clone());
        self.inner.schedule_task(task.clone());
        task
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
        // A reactor that was never initialized has no thread to drain its
        // queues; abort whatever was posted so every task still sees exactly
        // one of run/abort, and every queued call exactly one completion.
        let aborted = shutdown_error(true);
        let calls = {
            let mut outbound = self.inner.outbound.lock();
            outbound.stopped = true;
            std::mem::take(&mut outbound.queue)
        };
        for call in calls {
            call.transferred(Err(aborted.clone()));
        }
        let tasks = std::mem::take(&mut self.inner.pending.lock().tasks);
        for task in &tasks {
            task.abort(aborted.clone());
        }
    }
}

fn run_thread(mut core: ReactorCore) {
    restrictions::set_wait_allowed(false);
    restrictions::set_io_allowed(false);
    debug!(reactor = %core.inner.name, "reactor thread running");
    core.run();
    info!(reactor = %core.inner.name, "reactor thread exiting");
    restrictions::set_wait_allowed(true);
    restrictions::set_io_allowed(true);
}

/// Reactor-thread state. Functor tasks and run-on-reactor closures receive
/// `&mut ReactorCore`; nothing here is touched from other threads.
pub struct ReactorCore {
    inner: Arc<Inner>,
    poll: Poll,
    events: Events,
    event_scratch: Vec<(Token, bool, bool, bool)>,
    read_buf: Vec<u8>,
    /// Registered connections, keyed by poll token.
    tokens: Slab<ConnectionPtr>,
    server_conns: Vec<ConnectionPtr>,
    client_conns: AHashMap<ConnectionId, ConnectionPtr>,
    /// Armed delayed tasks, keyed by a loop-local sequence number.
    scheduled_tasks: AHashMap<u64, Arc<DelayedTask>>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_seq: u64,
    /// Connections shut down but not yet ready to stop.
    waiting_conns: Vec<ConnectionPtr>,
    /// Drain scratch for the pending-task queue.
    drained_tasks: Vec<ReactorTaskPtr>,
    processing_outbound_queue: Vec<OutboundCallPtr>,
    processing_connections: Vec<ConnectionPtr>,
    /// Coarse time, refreshed once per maintenance tick.
    cur_time: Instant,
    next_tick: Instant,
    stopping: bool,
    break_loop: bool,
}

impl ReactorCore {
    fn new(inner: Arc<Inner>, poll: Poll) -> ReactorCore {
        let now = Instant::now();
        let granularity = inner.coarse_timer_granularity;
        ReactorCore {
            inner,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            event_scratch: Vec::with_capacity(EVENTS_CAPACITY),
            read_buf: vec![0u8; READ_BUF_SIZE],
            tokens: Slab::new(),
            server_conns: Vec::new(),
            client_conns: AHashMap::new(),
            scheduled_tasks: AHashMap::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            waiting_conns: Vec::new(),
            drained_tasks: Vec::new(),
            processing_outbound_queue: Vec::new(),
            processing_connections: Vec::new(),
            cur_time: now,
            next_tick: now + granularity,
            stopping: false,
            break_loop: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn num_client_connections(&self) -> usize {
        self.client_conns.len()
    }

    pub fn num_server_connections(&self) -> usize {
        self.server_conns.len()
    }

    pub fn client_connections(&self) -> Vec<ConnectionPtr> {
        self.client_conns.values().cloned().collect()
    }

    pub fn server_connections(&self) -> Vec<ConnectionPtr> {
        self.server_conns.clone()
    }

    /// True once shutdown has begun on the reactor thread. Tasks that run
    /// while this is set should not start new work.
    pub fn stopping(&self) -> bool {
        self.stopping
    }

    pub fn dump_running_rpcs(&self, _req: &DumpRunningRpcsRequest) -> DumpRunningRpcsResponse {
        DumpRunningRpcsResponse {
            inbound_connections: self.server_conns.iter().map(|c| c.dump()).collect(),
            outbound_connections: self.client_conns.values().map(|c| c.dump()).collect(),
        }
    }

    // ── Event loop ─────────────────────────────────────────────────────

    fn run(&mut self) {
        let now = Instant::now();
        self.cur_time = now;
        self.next_tick = now + self.inner.coarse_timer_granularity;
        while !self.break_loop {
            let deadline = self.next_timer_deadline();
            let timeout = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = self.poll_once(timeout) {
                error!(reactor = %self.inner.name, "poll failed, exiting loop: {}", e);
                break;
            }
            self.dispatch_events();
            if self.break_loop {
                break;
            }
            self.process_timers();
        }
    }

    /// Earliest of the next maintenance tick and the nearest delayed task.
    fn next_timer_deadline(&self) -> Instant {
        let mut deadline = self.next_tick;
        if let Some(Reverse((when, _))) = self.timers.peek() {
            if *when < deadline {
                deadline = *when;
            }
        }
        deadline
    }

    fn poll_once(&mut self, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        self.event_scratch.clear();
        for event in self.events.iter() {
            self.event_scratch.push((
                event.token(),
                event.is_readable(),
                event.is_writable(),
                event.is_read_closed() || event.is_write_closed(),
            ));
        }
        Ok(())
    }

    // Events are collected into a scratch vector first so handlers can take
    // &mut self.
    fn dispatch_events(&mut self) {
        let scratch = std::mem::take(&mut self.event_scratch);
        for (token, readable, writable, closed) in &scratch {
            if *token == WAKER_TOKEN {
                self.async_handler();
                continue;
            }
            self.handle_connection_event(*token, *readable, *writable, *closed);
        }
        self.event_scratch = scratch;
    }

    fn handle_connection_event(&mut self, token: Token, readable: bool, writable: bool, closed: bool) {
        let conn = match self.tokens.get(token.0) {
            Some(conn) => conn.clone(),
            None => return, // retired earlier in this batch
        };
        if readable {
            if let Err(status) = conn.handle_read(&mut self.read_buf) {
                debug!(reactor = %self.inner.name, remote = %conn.remote(), %status,
                       "read failed");
                self.destroy_connection(&conn, status);
                return;
            }
        }
        if writable {
            let (completed, failure) = conn.handle_write(self.poll.registry());
            for call in completed {
                call.transferred(Ok(()));
            }
            if let Some(status) = failure {
                debug!(reactor = %self.inner.name, remote = %conn.remote(), %status,
                       "write failed");
                self.destroy_connection(&conn, status);
                return;
            }
        }
        if closed {
            self.destroy_connection(
                &conn,
                Error::network(format!("connection to {} closed by peer", conn.remote())),
            );
        }
    }

    // ── Task queue ─────────────────────────────────────────────────────

    /// Handle an async wake: drain the pending-task queue and run what was
    /// drained. A drain that observed the closing flag instead tears the
    /// reactor down and aborts the drained tasks, which never run.
    fn async_handler(&mut self) {
        if !self.drain_task_queue() {
            let tasks = std::mem::take(&mut self.drained_tasks);
            if !self.stopping {
                self.shutdown_internal();
            }
            for task in &tasks {
                task.abort(shutdown_error(true));
                metrics::TASKS_ABORTED.increment();
            }
            self.check_ready_to_stop();
            return;
        }
        let tasks = std::mem::take(&mut self.drained_tasks);
        for task in &tasks {
            task.run(self);
        }
    }

    /// Swap the shared pending queue into the drain scratch. Returns false
    /// when the reactor is closing.
    fn drain_task_queue(&mut self) -> bool {
        debug_assert!(self.drained_tasks.is_empty());
        let mut pending = self.inner.pending.lock();
        std::mem::swap(&mut self.drained_tasks, &mut pending.tasks);
        !pending.closing
    }

    // ── Timers ─────────────────────────────────────────────────────────

    fn process_timers(&mut self) {
        let now = Instant::now();
        if now >= self.next_tick {
            self.next_tick = now + self.inner.coarse_timer_granularity;
            self.timer_handler(now);
        }
        while let Some(Reverse((when, _))) = self.timers.peek().copied() {
            if when > now {
                break;
            }
            let Some(Reverse((_, seq))) = self.timers.pop() else {
                break;
            };
            // A missing entry was already aborted; the heap entry is stale.
            if let Some(task) = self.scheduled_tasks.remove(&seq) {
                task.fire();
            }
        }
    }

    /// Periodic maintenance: refresh the coarse clock and reap idle inbound
    /// connections. While stopping, ticks only check for loop exit.
    fn timer_handler(&mut self, now: Instant) {
        if self.stopping {
            self.check_ready_to_stop();
            return;
        }
        self.cur_time = now;
        trace!(reactor = %self.inner.name, "maintenance tick");
        self.scan_idle_connections();
    }

    fn scan_idle_connections(&mut self) {
        let keepalive = self.inner.connection_keepalive_time;
        let mut timed_out = 0u64;
        let mut idx = 0;
        while idx < self.server_conns.len() {
            let conn = self.server_conns[idx].clone();
            // A connection that became non-idle since the tick computed its
            // delta is skipped.
            if !conn.idle() {
                idx += 1;
                continue;
            }
            let delta = self
                .cur_time
                .saturating_duration_since(conn.last_activity_time());
            if delta > keepalive {
                info!(reactor = %self.inner.name, remote = %conn.remote(), ?delta,
                      "timing out idle connection");
                self.retire_connection(&conn);
                conn.shutdown(Error::network(format!(
                    "connection timed out after {:?}",
                    delta
                )));
                self.server_conns.remove(idx);
                metrics::CONNECTIONS_TIMED_OUT.increment();
                metrics::CONNECTIONS_ACTIVE.decrement();
                timed_out += 1;
            } else {
                idx += 1;
            }
        }
        if timed_out > 0 {
            debug!(reactor = %self.inner.name, timed_out, "timed out TCP connections");
        }
    }

    pub(crate) fn arm_delayed_task(&mut self, task: Arc<DelayedTask>, delay: Duration) {
        let when = Instant::now() + delay;
        let seq = self.timer_seq;
        self.timer_seq += 1;
        self.timers.push(Reverse((when, seq)));
        self.scheduled_tasks.insert(seq, task);
    }

    // ── Outbound dispatch ──────────────────────────────────────────────

    /// Drain the shared outbound queue, assign each call to a (possibly new)
    /// connection, and notify each touched connection exactly once.
    pub(crate) fn process_outbound_queue(&mut self) {
        {
            let mut outbound = self.inner.outbound.lock();
            std::mem::swap(&mut outbound.queue, &mut self.processing_outbound_queue);
        }
        if self.processing_outbound_queue.is_empty() {
            return;
        }
        let mut calls = std::mem::take(&mut self.processing_outbound_queue);
        self.processing_connections.reserve(calls.len());
        for call in calls.drain(..) {
            if let Some(conn) = self.assign_outbound_call(&call) {
                self.processing_connections.push(conn);
            }
        }
        self.processing_outbound_queue = calls;

        let mut conns = std::mem::take(&mut self.processing_connections);
        conns.sort_unstable_by_key(|conn| Arc::as_ptr(conn) as usize);
        conns.dedup_by(|a, b| Arc::ptr_eq(a, b));
        for conn in conns.drain(..) {
            conn.outbound_queued(self.poll.registry());
        }
        self.processing_connections = conns;
    }

    fn assign_outbound_call(&mut self, call: &OutboundCallPtr) -> Option<ConnectionPtr> {
        let deadline = match call.timeout() {
            Some(timeout) => Instant::now() + timeout,
            None => {
                warn!(reactor = %self.inner.name, conn_id = ?call.conn_id(),
                      "outbound call has no timeout set");
                Instant::now() + NO_TIMEOUT_DEADLINE
            }
        };
        call.set_deadline(deadline);
        let conn = match self.find_or_start_connection(call.conn_id(), deadline) {
            Ok(conn) => conn,
            Err(status) => {
                call.set_failed(status);
                return None;
            }
        };
        conn.queue_outbound_call(call.clone());
        Some(conn)
    }

    /// Look up the connection for `conn_id`, starting one if none exists.
    fn find_or_start_connection(
        &mut self,
        conn_id: &ConnectionId,
        deadline: Instant,
    ) -> Result<ConnectionPtr> {
        if let Some(conn) = self.client_conns.get(conn_id) {
            return Ok(conn.clone());
        }
        let messenger = self
            .inner
            .messenger
            .upgrade()
            .ok_or_else(|| Error::service_unavailable("Client RPC Messenger shutting down"))?;
        trace!(reactor = %self.inner.name, remote = %conn_id.remote(),
               "creating new connection");

        let socket = create_client_socket(conn_id.remote())?;
        if messenger.bind_outbound_sockets() {
            maybe_bind_outbound(&socket, &messenger, conn_id.remote());
        }
        start_connect(&socket, conn_id.remote())?;

        let stream: TcpStream = socket.into();
        let context = ConnectionContext::for_type(messenger.connection_type());
        let conn = Connection::new(
            context,
            conn_id.remote(),
            stream,
            Direction::Client,
            conn_id.user_credentials().clone(),
        );

        // Kick off blocking negotiation. An IllegalState from the pool means
        // the messenger is going away; surface that instead of the raw
        // status.
        if let Err(e) = self.start_connection_negotiation(&conn, deadline) {
            if e.is_illegal_state() {
                return Err(Error::service_unavailable(
                    "Client RPC Messenger shutting down",
                ));
            }
            return Err(e);
        }

        self.client_conns.insert(conn_id.clone(), conn.clone());
        metrics::CONNECTIONS_CREATED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        Ok(conn)
    }

    // ── Negotiation ────────────────────────────────────────────────────

    fn start_connection_negotiation(&self, conn: &ConnectionPtr, deadline: Instant) -> Result<()> {
        trace!(reactor = %self.inner.name, remote = %conn.remote(),
               "submitting negotiation task");
        let messenger = self
            .inner
            .messenger
            .upgrade()
            .ok_or_else(|| Error::illegal_state("messenger has shut down"))?;
        let inner = self.inner.clone();
        let conn = conn.clone();
        messenger.negotiation_pool().submit(move || {
            let status = negotiation::run_negotiation(&conn, deadline);
            // Posted back as a reactor task; if the reactor is closing the
            // task is aborted and the connection dropped with it.
            inner.schedule_functor(move |core| {
                core.complete_connection_negotiation(&conn, status);
            });
        })
    }

    /// Negotiation outcome, back on the reactor thread: destroy on error,
    /// otherwise flip the socket to non-blocking and register it.
    pub(crate) fn complete_connection_negotiation(
        &mut self,
        conn: &ConnectionPtr,
        status: Result<()>,
    ) {
        if let Err(status) = status {
            warn!(reactor = %self.inner.name, remote = %conn.remote(),
                  "connection negotiation failed: {}", status);
            self.destroy_connection(conn, status);
            return;
        }
        if let Err(e) = conn.set_nonblocking(true) {
            error!(reactor = %self.inner.name, remote = %conn.remote(),
                   "unable to set connection to non-blocking mode: {}", e);
            self.destroy_connection(
                conn,
                Error::network(format!("failed to set non-blocking mode: {}", e)),
            );
            return;
        }
        conn.mark_negotiation_complete();
        let key = self.tokens.insert(conn.clone());
        if let Err(e) = conn.register_with_poll(self.poll.registry(), Token(key)) {
            self.tokens.remove(key);
            warn!(reactor = %self.inner.name, remote = %conn.remote(),
                  "failed to register negotiated connection: {}", e);
            self.destroy_connection(
                conn,
                Error::network(format!("poll registration failed: {}", e)),
            );
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────────

    /// Register an accepted connection: start negotiation (which may destroy
    /// it on immediate failure) and append it to the server list regardless;
    /// the negotiation completion finishes the wiring or destroys it.
    pub(crate) fn register_connection(&mut self, conn: ConnectionPtr) {
        let timeout = self
            .inner
            .messenger
            .upgrade()
            .map(|m| m.rpc_negotiation_timeout())
            .unwrap_or_else(|| Duration::from_millis(3000));
        let deadline = Instant::now() + timeout;
        if let Err(e) = self.start_connection_negotiation(&conn, deadline) {
            error!(reactor = %self.inner.name, remote = %conn.remote(),
                   "server connection negotiation failed: {}", e);
            self.destroy_connection(&conn, e);
        }
        self.server_conns.push(conn);
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
    }

    /// Shut `conn` down with `status` and drop the reactor's references to
    /// it. A local strong reference keeps the object alive until the
    /// shutdown returns.
    pub(crate) fn destroy_connection(&mut self, conn: &ConnectionPtr, status: Error) {
        trace!(reactor = %self.inner.name, remote = %conn.remote(), %status,
               "destroying connection");
        let retained = conn.clone();
        self.retire_connection(&retained);
        retained.shutdown(status);

        match retained.direction() {
            Direction::Client => {
                // The caller does not know which index the connection was
                // registered under; probe them all. Finding none is a lost
                // invariant.
                let num_indices = self.inner.num_connections_to_server;
                let mut conn_id =
                    ConnectionId::new(retained.remote(), retained.user_credentials().clone());
                let mut erased = false;
                for idx in 0..num_indices.max(1) {
                    conn_id.set_idx(idx);
                    let matches = self
                        .client_conns
                        .get(&conn_id)
                        .map(|existing| Arc::ptr_eq(existing, &retained))
                        .unwrap_or(false);
                    if matches {
                        self.client_conns.remove(&conn_id);
                        erased = true;
                    }
                }
                assert!(
                    erased,
                    "could not find connection to {} under any index",
                    retained.remote()
                );
                metrics::CONNECTIONS_ACTIVE.decrement();
            }
            Direction::Server => {
                if let Some(pos) = self
                    .server_conns
                    .iter()
                    .position(|c| Arc::ptr_eq(c, &retained))
                {
                    self.server_conns.remove(pos);
                    metrics::CONNECTIONS_ACTIVE.decrement();
                }
            }
        }
    }

    /// Drop the poll-token bookkeeping for `conn`. The socket itself is
    /// closed by Connection::shutdown; dropping the fd removes it from the
    /// poller.
    fn retire_connection(&mut self, conn: &ConnectionPtr) {
        if let Some(token) = conn.take_token() {
            if self.tokens.contains(token.0) {
                self.tokens.remove(token.0);
            }
        }
    }

    pub(crate) fn broadcast_event(&mut self, event: &ServerEvent) {
        for conn in &self.server_conns {
            conn.queue_outbound_data(event);
            conn.enable_write_interest(self.poll.registry());
        }
    }

    pub(crate) fn drop_with_remote_address(&mut self, addr: IpAddr) {
        for conn in self.server_conns.iter().chain(self.client_conns.values()) {
            if conn.remote().ip() != addr {
                continue;
            }
            match conn.shutdown_socket() {
                Ok(()) => info!(reactor = %self.inner.name, remote = %conn.remote(),
                                "dropped connection"),
                Err(e) => warn!(reactor = %self.inner.name, remote = %conn.remote(),
                                "failed to shut down socket: {}", e),
            }
        }
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// Tear everything down on the reactor thread. Runs once; the loop
    /// breaks when the waiting connections report ready-to-stop.
    fn shutdown_internal(&mut self) {
        self.stopping = true;
        let service_unavailable = shutdown_error(false);

        debug!(reactor = %self.inner.name, "tearing down outbound connections");
        let client_conns = std::mem::take(&mut self.client_conns);
        for (_, conn) in client_conns {
            self.retire_connection(&conn);
            conn.shutdown(service_unavailable.clone());
            metrics::CONNECTIONS_ACTIVE.decrement();
            if !conn.ready_to_stop() {
                self.waiting_conns.push(conn);
            }
        }

        debug!(reactor = %self.inner.name, "tearing down inbound connections");
        let server_conns = std::mem::take(&mut self.server_conns);
        for conn in server_conns {
            self.retire_connection(&conn);
            conn.shutdown(service_unavailable.clone());
            metrics::CONNECTIONS_ACTIVE.decrement();
            if !conn.ready_to_stop() {
                debug!(reactor = %self.inner.name, remote = %conn.remote(),
                       "waiting for connection to become ready to stop");
                self.waiting_conns.push(conn);
            }
        }

        // Scheduled tasks are not in the pending queue; they were "run"
        // (armed) already.
        let aborted = shutdown_error(true);
        for (_, task) in self.scheduled_tasks.drain() {
            task.abort(aborted.clone());
            metrics::TASKS_ABORTED.increment();
        }
        self.timers.clear();

        {
            let mut outbound = self.inner.outbound.lock();
            outbound.stopped = true;
            std::mem::swap(&mut outbound.queue, &mut self.processing_outbound_queue);
        }
        for call in self.processing_outbound_queue.drain(..) {
            call.transferred(Err(aborted.clone()));
        }
    }

    /// Filter the waiting list and break the loop once it is empty.
    fn check_ready_to_stop(&mut self) {
        if !self.stopping {
            return;
        }
        self.waiting_conns.retain(|conn| !conn.ready_to_stop());
        if self.waiting_conns.is_empty() {
            debug!(reactor = %self.inner.name, "all connections drained, breaking loop");
            self.break_loop = true;
        }
    }
}

// ── Socket helpers ─────────────────────────────────────────────────────

fn create_client_socket(remote: SocketAddr) -> Result<socket2::Socket> {
    let domain = match remote {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let make = || -> io::Result<socket2::Socket> {
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        Ok(socket)
    };
    make().map_err(|e| {
        warn!(
            "failed to create an outbound connection because a new socket could not be created: {}",
            e
        );
        Error::network(format!("socket creation failed: {}", e))
    })
}

fn maybe_bind_outbound(socket: &socket2::Socket, messenger: &Messenger, remote: SocketAddr) {
    let bind_ip: Option<IpAddr> = if remote.is_ipv6() {
        messenger.outbound_address_v6().map(IpAddr::V6)
    } else {
        messenger.outbound_address_v4().map(IpAddr::V4)
    };
    if let Some(ip) = bind_ip {
        let addr = SocketAddr::new(ip, 0);
        if let Err(e) = socket.bind(&addr.into()) {
            warn!("bind {} failed: {}", addr, e);
        }
    }
}

/// Initiate a non-blocking connect. Immediate completion and
/// connect-in-progress are both success; anything else fails the call.
fn start_connect(socket: &socket2::Socket, remote: SocketAddr) -> Result<()> {
    match socket.connect(&remote.into()) {
        Ok(()) => {
            trace!("connect finished immediately for {}", remote);
            Ok(())
        }
        Err(e) if connect_in_progress(&e) => {
            trace!("connect in progress for {}", remote);
            Ok(())
        }
        Err(e) => {
            warn!(
                "failed to create an outbound connection to {} because connect failed: {}",
                remote, e
            );
            Err(Error::network(format!("connect to {} failed: {}", remote, e)))
        }
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}
