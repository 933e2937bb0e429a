//! Core identity and interchange types for the reactor.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Opened by this process to dispatch outbound calls.
    Client,
    /// Accepted from a remote peer.
    Server,
}

/// Credentials an outbound connection is established under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct UserCredentials {
    pub real_user: String,
    pub effective_user: String,
}

impl UserCredentials {
    pub fn new(real_user: impl Into<String>, effective_user: impl Into<String>) -> Self {
        UserCredentials {
            real_user: real_user.into(),
            effective_user: effective_user.into(),
        }
    }
}

/// Identifies one client connection slot: remote endpoint, credentials, and a
/// multiplexing index in `[0, num_connections_to_server)`. All three fields
/// participate in equality and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    remote: SocketAddr,
    user_credentials: UserCredentials,
    idx: u8,
}

impl ConnectionId {
    pub fn new(remote: SocketAddr, user_credentials: UserCredentials) -> Self {
        ConnectionId {
            remote,
            user_credentials,
            idx: 0,
        }
    }

    pub fn with_idx(remote: SocketAddr, user_credentials: UserCredentials, idx: u8) -> Self {
        ConnectionId {
            remote,
            user_credentials,
            idx,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn user_credentials(&self) -> &UserCredentials {
        &self.user_credentials
    }

    pub fn idx(&self) -> u8 {
        self.idx
    }

    pub fn set_idx(&mut self, idx: u8) {
        self.idx = idx;
    }
}

/// Payload broadcast to every inbound connection of a reactor.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    data: Bytes,
}

impl ServerEvent {
    pub fn new(data: Bytes) -> Self {
        ServerEvent { data }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Request for a running-RPC dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpRunningRpcsRequest {
    /// Accepted for interface compatibility; trace capture is not wired up.
    pub include_traces: bool,
}

/// Point-in-time description of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub direction: Direction,
    pub state: String,
    pub queued_calls: usize,
    pub last_activity_age: Duration,
}

/// Snapshot of a reactor's connections, sampled on the reactor thread.
#[derive(Debug, Clone, Default)]
pub struct DumpRunningRpcsResponse {
    pub inbound_connections: Vec<ConnectionInfo>,
    pub outbound_connections: Vec<ConnectionInfo>,
}
