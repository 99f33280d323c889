//! Listening side: owns the listener and spawns one connection per client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ForwardConfig, Target};
use crate::connection::Connection;
use crate::error::{ForwardError, Result};

pub struct Forwarder {
    config: ForwardConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Forwarder {
    /// Bind the listening socket. Nothing is dialed until a client arrives.
    pub async fn bind(config: ForwardConfig) -> Result<Self> {
        let addr = config.listen_socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ForwardError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ForwardError::Bind { addr, source })?;

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the accept loop and return immediately.
    pub fn start(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ForwardError::Stopped);
        }
        let mut task = lock(&self.accept_task);
        if task.is_some() {
            return Err(ForwardError::AlreadyStarted);
        }
        let listener = lock(&self.listener).take().ok_or(ForwardError::Stopped)?;

        let target = self.config.destination();
        info!(":{} -> {}", self.local_addr.port(), target);

        *task = Some(tokio::spawn(accept_loop(
            listener,
            target,
            self.config.buffer_size,
            self.running.clone(),
            self.shutdown.clone(),
        )));
        Ok(())
    }

    /// Stop accepting and close the listener.
    ///
    /// Connections already accepted keep relaying until their own EOF or error.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Not started yet: the listener is still here, close it directly.
        drop(lock(&self.listener).take());
        self.shutdown.notify_one();
    }

    /// Wait for the accept loop to exit after `stop`.
    pub async fn join(&self) {
        let task = lock(&self.accept_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("accept loop failed: {}", e);
            }
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: Target,
    buffer_size: usize,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut next_id: u64 = 0;

    while running.load(Ordering::Acquire) {
        // Shutdown is polled first so a client still queued in the backlog
        // when stop() runs is never picked up.
        tokio::select! {
            biased;
            _ = shutdown.notified() => {}
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => {
                    if !running.load(Ordering::Acquire) {
                        debug!("dropping {} accepted during shutdown", peer);
                        drop(client);
                        break;
                    }
                    next_id += 1;
                    debug!(conn = next_id, "accepted {}", peer);
                    let connection = Connection::new(next_id, client, target.clone(), buffer_size);
                    tokio::spawn(connection.run());
                }
                Err(e) => {
                    if running.load(Ordering::Acquire) {
                        warn!("accept failed: {}", e);
                    }
                }
            },
        }
    }

    drop(listener);
    debug!("accept loop exited");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_config(dest_port: u16) -> ForwardConfig {
        ForwardConfig::new(0, "127.0.0.1", dest_port)
            .unwrap()
            .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let forwarder = Forwarder::bind(loopback_config(9)).await.unwrap();
        assert_ne!(forwarder.local_addr().port(), 0);
        assert!(forwarder.is_running());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Forwarder::bind(loopback_config(9)).await.unwrap();
        let taken = first.local_addr().port();

        let config = ForwardConfig::new(taken, "127.0.0.1", 9)
            .unwrap()
            .with_bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let result = Forwarder::bind(config).await;
        assert!(matches!(result, Err(ForwardError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_start_twice() {
        let forwarder = Forwarder::bind(loopback_config(9)).await.unwrap();
        forwarder.start().unwrap();
        assert!(matches!(forwarder.start(), Err(ForwardError::AlreadyStarted)));
        forwarder.stop();
        forwarder.join().await;
    }

    #[tokio::test]
    async fn test_start_after_stop() {
        let forwarder = Forwarder::bind(loopback_config(9)).await.unwrap();
        forwarder.stop();
        assert!(!forwarder.is_running());
        assert!(matches!(forwarder.start(), Err(ForwardError::Stopped)));
        // Stopping again is harmless.
        forwarder.stop();
        forwarder.join().await;
    }
}
