//! A single forwarded client: upstream dial, the two relays, and teardown.

use std::sync::{Arc, Mutex, MutexGuard};

use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Target;
use crate::error::{ForwardError, Result};
use crate::relay::{Direction, ExitReason, Relay, RelayExit};

/// Lifecycle of one forwarded connection.
///
/// `Created -> Dialing -> Active -> Closed`, or `Dialing -> Closed` when the
/// upstream cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    Dialing,
    Active,
    Closed,
}

/// Shared close handle for one connection.
///
/// Both relays hold a clone. The first `close()` flips the state to
/// `Closed` and wakes every relay still parked on I/O; later calls are no-ops.
#[derive(Clone)]
pub struct Teardown {
    inner: Arc<TeardownInner>,
}

struct TeardownInner {
    state: Mutex<LinkState>,
    closed: watch::Sender<bool>,
}

impl Teardown {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(TeardownInner {
                state: Mutex::new(LinkState::Created),
                closed,
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    /// Tear the connection down. Returns `true` only for the call that did it.
    pub fn close(&self) -> bool {
        {
            let mut state = self.lock();
            if *state == LinkState::Closed {
                return false;
            }
            *state = LinkState::Closed;
        }
        self.inner.closed.send_replace(true);
        true
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    fn begin_dial(&self) -> bool {
        self.advance(LinkState::Created, LinkState::Dialing)
    }

    fn activate(&self) -> bool {
        self.advance(LinkState::Dialing, LinkState::Active)
    }

    fn advance(&self, from: LinkState, to: LinkState) -> bool {
        let mut state = self.lock();
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        // The guarded value is a plain enum, a poisoned lock still holds a valid state.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

/// One accepted client waiting to be bridged to the upstream.
pub struct Connection {
    id: u64,
    client: TcpStream,
    target: Target,
    buffer_size: usize,
    teardown: Teardown,
}

impl Connection {
    pub fn new(id: u64, client: TcpStream, target: Target, buffer_size: usize) -> Self {
        Self {
            id,
            client,
            target,
            buffer_size,
            teardown: Teardown::new(),
        }
    }

    /// Close handle for this connection, usable from outside its tasks.
    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    /// Dial the upstream and relay in both directions until teardown.
    ///
    /// Resolves once both relays have exited, or right away when the dial
    /// fails (the client socket is closed on that path too).
    pub async fn run(self) {
        let Connection {
            id,
            client,
            target,
            buffer_size,
            teardown,
        } = self;

        if !teardown.begin_dial() {
            return;
        }

        let upstream = match dial(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                error!(conn = id, "{}", e);
                teardown.close();
                drop(client);
                return;
            }
        };

        enable_keepalive(id, &client);
        enable_keepalive(id, &upstream);

        let client_addr = endpoint(&client);
        let upstream_addr = endpoint(&upstream);

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let outbound = tokio::spawn(
            Relay::new(
                Direction::ClientToUpstream,
                client_read,
                upstream_write,
                teardown.clone(),
                buffer_size,
            )
            .run(),
        );
        let inbound = tokio::spawn(
            Relay::new(
                Direction::UpstreamToClient,
                upstream_read,
                client_write,
                teardown.clone(),
                buffer_size,
            )
            .run(),
        );

        // A relay may already have closed the link, in which case it stays closed.
        teardown.activate();
        info!(conn = id, "TCP Forwarding {} <--> {}", client_addr, upstream_addr);

        let (outbound, inbound) = tokio::join!(outbound, inbound);
        for exit in [outbound, inbound] {
            match exit {
                Ok(exit) => log_exit(id, &exit),
                Err(e) => warn!(conn = id, "relay task failed: {}", e),
            }
        }
        debug!(
            conn = id,
            "TCP Forwarding {} <--> {} stopped", client_addr, upstream_addr
        );
    }
}

async fn dial(target: &Target) -> Result<TcpStream> {
    TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|source| ForwardError::Connect {
            target: target.to_string(),
            source,
        })
}

fn enable_keepalive(id: u64, stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).set_keepalive(true) {
        debug!(conn = id, "keep-alive not enabled: {}", e);
    }
}

fn endpoint(stream: &TcpStream) -> String {
    match stream.peer_addr() {
        Ok(addr) => format!("{}:{}", addr.ip(), addr.port()),
        Err(_) => "unknown".to_string(),
    }
}

fn log_exit(id: u64, exit: &RelayExit) {
    match &exit.reason {
        ExitReason::Eof => debug!(conn = id, "{} reached EOF after {} bytes", exit.direction, exit.bytes),
        ExitReason::Failed(e) => debug!(
            conn = id,
            "{} broken after {} bytes: {}", exit.direction, exit.bytes, e
        ),
        ExitReason::TornDown => debug!(
            conn = id,
            "{} torn down after {} bytes", exit.direction, exit.bytes
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_close_is_idempotent() {
        let teardown = Teardown::new();
        assert_eq!(teardown.state(), LinkState::Created);

        assert!(teardown.close());
        assert!(!teardown.close());
        assert_eq!(teardown.state(), LinkState::Closed);
    }

    #[test]
    fn test_concurrent_close_runs_once() {
        let teardown = Teardown::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let teardown = teardown.clone();
                std::thread::spawn(move || teardown.close())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(teardown.is_closed());
    }

    #[test]
    fn test_no_activation_after_close() {
        let teardown = Teardown::new();
        assert!(teardown.begin_dial());
        teardown.close();
        assert!(!teardown.activate());
        assert_eq!(teardown.state(), LinkState::Closed);
    }

    #[test]
    fn test_state_progression() {
        let teardown = Teardown::new();
        assert!(teardown.begin_dial());
        assert_eq!(teardown.state(), LinkState::Dialing);
        assert!(teardown.activate());
        assert_eq!(teardown.state(), LinkState::Active);
        assert!(teardown.close());
    }

    /// Accepted/connecting socket pair over loopback.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connecting, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connecting.unwrap(), accepted.unwrap().0)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let (mut client, accepted) = socket_pair().await;
        let target = Target {
            host: "127.0.0.1".into(),
            port: unused_port().await,
        };

        let connection = Connection::new(1, accepted, target, 8192);
        let teardown = connection.teardown();
        timeout(WAIT, connection.run()).await.expect("timed out");

        assert!(teardown.is_closed());
        let mut buf = [0u8; 1];
        let read = timeout(WAIT, client.read(&mut buf)).await.expect("timed out");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_external_close_stops_both_relays() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target {
            host: "127.0.0.1".into(),
            port: upstream.local_addr().unwrap().port(),
        };
        let (mut client, accepted) = socket_pair().await;

        let connection = Connection::new(7, accepted, target, 8192);
        let teardown = connection.teardown();
        let running = tokio::spawn(connection.run());

        let (mut server, _) = timeout(WAIT, upstream.accept())
            .await
            .expect("timed out")
            .unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, server.read_exact(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(&buf, b"ping");

        assert!(teardown.close());
        timeout(WAIT, running).await.expect("timed out").unwrap();

        let read = timeout(WAIT, server.read(&mut buf)).await.expect("timed out");
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
