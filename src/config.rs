//! Server configuration

use std::net::{Ipv4Addr, SocketAddr};

pub const DEFAULT_PORT: u16 = 9000;

/// Longest line a client may send before its session is closed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Prefix chat lines with the local `HH:MM:SS` send time
    pub timestamps: bool,

    /// Lines buffered per session before it counts as stalled and is dropped
    pub outbound_buffer: usize,

    /// Capacity of the dispatcher queue
    pub dispatch_queue: usize,

    /// Longest accepted client line in bytes, excluding the terminator
    pub max_line_length: usize,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            timestamps: true,
            outbound_buffer: 256,
            dispatch_queue: 1024,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_connections: 0,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Set the per-session outbound buffer (at least one line)
    pub fn outbound_buffer(mut self, lines: usize) -> Self {
        self.outbound_buffer = lines.max(1);
        self
    }

    /// Set the dispatcher queue capacity (at least one message)
    pub fn dispatch_queue(mut self, messages: usize) -> Self {
        self.dispatch_queue = messages.max(1);
        self
    }

    pub fn max_line_length(mut self, bytes: usize) -> Self {
        self.max_line_length = bytes.max(1);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}
