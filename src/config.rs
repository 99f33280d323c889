//! Forwarding parameters.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{ForwardError, Result};

/// Relay buffer size used when none is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Largest relay buffer accepted. Each connection allocates two of these.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// One fixed `listen port -> destination host:port` mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    pub bind_addr: IpAddr,
    /// Port to listen on. `0` lets the OS pick one.
    pub listen_port: u16,
    pub dest_host: String,
    pub dest_port: u16,
    pub buffer_size: usize,
}

impl ForwardConfig {
    pub fn new(listen_port: u16, dest_host: impl Into<String>, dest_port: u16) -> Result<Self> {
        let dest_host = dest_host.into().trim().to_string();
        if dest_host.is_empty() {
            return Err(ForwardError::Config("destination host is empty".into()));
        }
        if dest_port == 0 {
            return Err(ForwardError::Config("destination port must be 1-65535".into()));
        }

        Ok(Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port,
            dest_host,
            dest_port,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    pub fn with_bind_addr(mut self, bind_addr: IpAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(ForwardError::Config("buffer size must be non-zero".into()));
        }
        if buffer_size > MAX_BUFFER_SIZE {
            return Err(ForwardError::Config(format!(
                "buffer size {} exceeds the maximum of {} bytes",
                buffer_size, MAX_BUFFER_SIZE
            )));
        }
        self.buffer_size = buffer_size;
        Ok(self)
    }

    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.listen_port)
    }

    /// `host:port` of the upstream, as dialed and as logged.
    pub fn destination(&self) -> Target {
        Target {
            host: self.dest_host.clone(),
            port: self.dest_port,
        }
    }
}

/// Upstream endpoint every connection is dialed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
