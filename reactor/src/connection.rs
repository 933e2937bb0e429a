//! One TCP connection plus its protocol context.
//!
//! A connection is shared (`Arc`) between the reactor's collections and any
//! transient user, but all mutation happens on the reactor thread. The
//! socket is owned exclusively: a `std` stream while negotiation is pending,
//! a mio stream once registered with the event loop.

use crate::call::OutboundCallPtr;
use crate::context::ConnectionContext;
use crate::error::Error;
use crate::types::{ConnectionInfo, Direction, ServerEvent, UserCredentials};
use bytes::Bytes;
use mio::net::TcpStream as MioTcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

pub type ConnectionPtr = Arc<Connection>;

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Negotiating,
    Open,
    ShutDown(Error),
}

enum Sock {
    /// Owned std stream; negotiation has not finished yet.
    Pending(TcpStream),
    /// Registered with the reactor's poll.
    Registered(MioTcpStream),
    Closed,
}

/// One frame queued for the wire. `call` is present when the frame carries an
/// outbound call whose completion fires once the frame is fully written.
struct Frame {
    data: Bytes,
    written: usize,
    call: Option<OutboundCallPtr>,
}

struct ConnState {
    sock: Sock,
    token: Option<Token>,
    interest: Interest,
    phase: Phase,
    /// Calls accepted by queue_outbound_call, not yet moved to the wire
    /// queue by outbound_queued.
    pending_calls: Vec<OutboundCallPtr>,
    write_queue: VecDeque<Frame>,
    last_activity: Instant,
}

/// Wire-level counters, sampled by tests and dumps.
#[derive(Default)]
pub struct ConnectionStats {
    pub calls_queued: AtomicU64,
    pub frames_flushed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// How many outbound-drain batches notified this connection. The reactor
    /// coalesces to at most one notify per batch.
    pub outbound_queued_batches: AtomicU64,
}

pub struct Connection {
    remote: SocketAddr,
    direction: Direction,
    credentials: UserCredentials,
    context: ConnectionContext,
    state: Mutex<ConnState>,
    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(
        context: ConnectionContext,
        remote: SocketAddr,
        stream: TcpStream,
        direction: Direction,
        credentials: UserCredentials,
    ) -> ConnectionPtr {
        Arc::new(Connection {
            remote,
            direction,
            credentials,
            context,
            state: Mutex::new(ConnState {
                sock: Sock::Pending(stream),
                token: None,
                interest: Interest::READABLE,
                phase: Phase::Negotiating,
                pending_calls: Vec::new(),
                write_queue: VecDeque::new(),
                last_activity: Instant::now(),
            }),
            stats: ConnectionStats::default(),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn user_credentials(&self) -> &UserCredentials {
        &self.credentials
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn last_activity_time(&self) -> Instant {
        self.state.lock().last_activity
    }

    /// A connection with nothing queued and no in-flight context work.
    pub fn idle(&self) -> bool {
        let state = self.state.lock();
        state.pending_calls.is_empty() && state.write_queue.is_empty() && self.context.idle()
    }

    pub fn ready_to_stop(&self) -> bool {
        self.context.ready_to_stop()
    }

    /// The status this connection was shut down with, if it was.
    pub fn shutdown_status(&self) -> Option<Error> {
        match &self.state.lock().phase {
            Phase::ShutDown(status) => Some(status.clone()),
            _ => None,
        }
    }

    pub fn negotiation_complete(&self) -> bool {
        !matches!(self.state.lock().phase, Phase::Negotiating)
    }

    /// Accept a call for this connection. Aborted immediately with the
    /// shutdown status if the connection is already down.
    pub(crate) fn queue_outbound_call(&self, call: OutboundCallPtr) {
        let rejected = {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::ShutDown(status) => Some(status.clone()),
                _ => {
                    state.pending_calls.push(call.clone());
                    None
                }
            }
        };
        match rejected {
            Some(status) => call.transferred(Err(status)),
            None => {
                self.stats.calls_queued.fetch_add(1, Relaxed);
            }
        }
    }

    /// Queue a server event payload. Dropped silently on a shut-down
    /// connection.
    pub(crate) fn queue_outbound_data(&self, event: &ServerEvent) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::ShutDown(_)) {
            return;
        }
        state.write_queue.push_back(Frame {
            data: event.data().clone(),
            written: 0,
            call: None,
        });
    }

    /// Coalesced notify after a drain batch assigned calls to this
    /// connection: move them onto the wire queue and enable write readiness.
    pub(crate) fn outbound_queued(&self, registry: &Registry) {
        self.stats.outbound_queued_batches.fetch_add(1, Relaxed);
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_calls);
        for call in pending {
            let data = call.payload().clone();
            state.write_queue.push_back(Frame {
                data,
                written: 0,
                call: Some(call),
            });
        }
        Self::update_interest(&mut state, registry);
    }

    pub(crate) fn enable_write_interest(&self, registry: &Registry) {
        let mut state = self.state.lock();
        Self::update_interest(&mut state, registry);
    }

    fn update_interest(state: &mut ConnState, registry: &Registry) {
        let want = if state.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if want == state.interest {
            return;
        }
        let token = match state.token {
            Some(token) => token,
            None => return,
        };
        if let Sock::Registered(stream) = &mut state.sock {
            match registry.reregister(stream, token, want) {
                Ok(()) => state.interest = want,
                Err(e) => warn!("failed to reregister connection: {}", e),
            }
        }
    }

    /// Flip the O_NONBLOCK flag. A no-op once the stream is registered (mio
    /// streams are always non-blocking).
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let state = self.state.lock();
        match &state.sock {
            Sock::Pending(stream) => stream.set_nonblocking(nonblocking),
            Sock::Registered(_) => Ok(()),
            Sock::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    /// A second handle to the pending socket for the negotiation stage. The
    /// clone shares the open file description, so blocking-mode flips through
    /// it are visible to the original.
    pub(crate) fn negotiation_stream(&self) -> io::Result<TcpStream> {
        let state = self.state.lock();
        match &state.sock {
            Sock::Pending(stream) => stream.try_clone(),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket is not in negotiation",
            )),
        }
    }

    pub(crate) fn mark_negotiation_complete(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Negotiating) {
            state.phase = Phase::Open;
        }
    }

    /// Hand the socket to the event loop. Write interest is requested when
    /// frames accumulated during negotiation.
    pub(crate) fn register_with_poll(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        let stream = match std::mem::replace(&mut state.sock, Sock::Closed) {
            Sock::Pending(stream) => {
                stream.set_nonblocking(true)?;
                MioTcpStream::from_std(stream)
            }
            other => {
                state.sock = other;
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "socket already registered or closed",
                ));
            }
        };
        let mut stream = stream;
        let want = if state.write_queue.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        let registered = registry.register(&mut stream, token, want);
        // Keep the stream either way so shutdown can close it.
        state.sock = Sock::Registered(stream);
        state.token = Some(token);
        state.interest = want;
        registered
    }

    pub(crate) fn take_token(&self) -> Option<Token> {
        self.state.lock().token.take()
    }

    /// Drain readable bytes into `buf`, feeding them to the context. Returns
    /// the status the connection must be destroyed with on EOF or error.
    pub(crate) fn handle_read(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut state = self.state.lock();
        let remote = self.remote;
        let stream = match &mut state.sock {
            Sock::Registered(stream) => stream,
            _ => return Ok(()),
        };
        let mut total = 0usize;
        let result = loop {
            match stream.read(buf) {
                Ok(0) => {
                    break Err(Error::network(format!(
                        "connection to {} closed by peer",
                        remote
                    )))
                }
                Ok(n) => {
                    total += n;
                    self.context.consume(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(Error::network(format!("read from {} failed: {}", remote, e))),
            }
        };
        if total > 0 {
            self.stats.bytes_read.fetch_add(total as u64, Relaxed);
            state.last_activity = Instant::now();
        }
        result
    }

    /// Flush queued frames. Returns the calls whose frames completed (their
    /// callbacks must run after the state lock is dropped, which is why this
    /// does not invoke them itself) and the error to destroy the connection
    /// with, if any.
    pub(crate) fn handle_write(
        &self,
        registry: &Registry,
    ) -> (Vec<OutboundCallPtr>, Option<Error>) {
        let mut completed = Vec::new();
        let mut failure = None;
        let mut state = self.state.lock();
        let mut wrote = 0u64;
        {
            let ConnState {
                sock, write_queue, ..
            } = &mut *state;
            let stream = match sock {
                Sock::Registered(stream) => stream,
                _ => return (completed, None),
            };
            'flush: while let Some(frame) = write_queue.front_mut() {
                while frame.written < frame.data.len() {
                    match stream.write(&frame.data[frame.written..]) {
                        Ok(0) => {
                            failure = Some(Error::network(format!(
                                "wrote zero bytes to {}",
                                self.remote
                            )));
                            break 'flush;
                        }
                        Ok(n) => {
                            frame.written += n;
                            wrote += n as u64;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 'flush,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            failure = Some(Error::network(format!(
                                "write to {} failed: {}",
                                self.remote, e
                            )));
                            break 'flush;
                        }
                    }
                }
                let frame = write_queue.pop_front().expect("frame was just peeked");
                self.stats.frames_flushed.fetch_add(1, Relaxed);
                if let Some(call) = frame.call {
                    completed.push(call);
                }
            }
        }
        if wrote > 0 {
            self.stats.bytes_written.fetch_add(wrote, Relaxed);
            state.last_activity = Instant::now();
        }
        if failure.is_none() {
            Self::update_interest(&mut state, registry);
        }
        (completed, failure)
    }

    /// Tear the connection down with `status`. Idempotent. Pending and
    /// queued-but-unwritten calls are aborted with the status; their
    /// callbacks run after the state lock is released.
    pub(crate) fn shutdown(&self, status: Error) {
        let to_abort: Vec<OutboundCallPtr> = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::ShutDown(_)) {
                return;
            }
            state.phase = Phase::ShutDown(status.clone());
            match std::mem::replace(&mut state.sock, Sock::Closed) {
                Sock::Pending(stream) => {
                    let _ = stream.shutdown(SocketShutdown::Both);
                }
                Sock::Registered(stream) => {
                    let _ = stream.shutdown(SocketShutdown::Both);
                }
                Sock::Closed => {}
            }
            let pending = std::mem::take(&mut state.pending_calls);
            let queued = std::mem::take(&mut state.write_queue);
            pending
                .into_iter()
                .chain(queued.into_iter().filter_map(|frame| frame.call))
                .collect()
        };
        for call in to_abort {
            call.transferred(Err(status.clone()));
        }
    }

    /// Half-duplex shutdown of the socket in both directions, leaving the
    /// connection in its collections. Used by drop-with-remote-address.
    pub(crate) fn shutdown_socket(&self) -> io::Result<()> {
        let state = self.state.lock();
        match &state.sock {
            Sock::Pending(stream) => stream.shutdown(SocketShutdown::Both),
            Sock::Registered(stream) => stream.shutdown(SocketShutdown::Both),
            Sock::Closed => Ok(()),
        }
    }

    pub(crate) fn dump(&self) -> ConnectionInfo {
        let state = self.state.lock();
        let queued_calls = state.pending_calls.len()
            + state
                .write_queue
                .iter()
                .filter(|frame| frame.call.is_some())
                .count();
        let phase = match &state.phase {
            Phase::Negotiating => "negotiating".to_string(),
            Phase::Open => "open".to_string(),
            Phase::ShutDown(status) => format!("shut down: {}", status),
        };
        ConnectionInfo {
            remote: self.remote,
            direction: self.direction,
            state: phase,
            queued_calls,
            last_activity_age: state.last_activity.elapsed(),
        }
    }
}
