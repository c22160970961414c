// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Forward tunnel: listen locally and relay each connection through a
//! direct channel to `remote_host:remote_port` on the far side.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use ssh_relay_common::{format_host_port, is_loopback_address};

use crate::error::{Result, TunnelError};
use crate::handle::TunnelHandle;
use crate::limit::{ConnectionLimit, ConnectionPermit};
use crate::relay::{relay, RelayConfig};

/// Opens outbound channels over the shared transport
#[async_trait]
pub trait ChannelOpener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a channel to `host:port`; `originator` is the local peer being relayed
    async fn open_channel(&self, host: &str, port: u16, originator: SocketAddr)
        -> Result<Self::Stream>;
}

pub struct ForwardTunnel<O: ChannelOpener> {
    opener: Arc<O>,
    name: String,
    bind_address: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    relay: RelayConfig,
    limit: ConnectionLimit,
    parent: Option<CancellationToken>,
}

impl<O: ChannelOpener> ForwardTunnel<O> {
    pub fn new(
        opener: Arc<O>,
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            opener,
            name: name.into(),
            bind_address: "127.0.0.1".to_string(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            relay: RelayConfig::default(),
            limit: ConnectionLimit::unbounded(),
            parent: None,
        }
    }

    /// Local address to listen on (default 127.0.0.1)
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn relay_config(mut self, config: RelayConfig) -> Self {
        self.relay = config;
        self
    }

    /// Cap concurrent relays; 0 keeps the tunnel unbounded
    pub fn max_connections(mut self, max: usize) -> Self {
        self.limit = ConnectionLimit::new(max);
        self
    }

    /// Stop together with `token` in addition to the handle's own shutdown
    pub fn cancel_with(mut self, token: &CancellationToken) -> Self {
        self.parent = Some(token.clone());
        self
    }

    /// Whether the listener accepts connections from other hosts
    pub fn exposed(&self) -> bool {
        !is_loopback_address(&self.bind_address)
    }

    /// Bind the local listener and start accepting
    pub async fn start(self) -> Result<TunnelHandle> {
        let addr = format_host_port(&self.bind_address, self.local_port);
        if self.exposed() {
            warn!(
                "Forward tunnel {} binds {}, which is reachable from other hosts",
                self.name, addr
            );
        }
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                error!(
                    "Permission denied binding {}; ports below 1024 need elevated privileges",
                    addr
                );
            }
            TunnelError::LocalConnect { addr, source: e }
        })?;
        Ok(self.start_on(listener))
    }

    /// Start accepting on an already bound listener
    pub fn start_on(self, listener: TcpListener) -> TunnelHandle {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| format_host_port(&self.bind_address, self.local_port));
        let endpoint = format!(
            "{} -> {}",
            local,
            format_host_port(&self.remote_host, self.remote_port)
        );
        info!("Forward tunnel {} listening: {}", self.name, endpoint);

        let name = self.name.clone();
        let task = tokio::spawn(self.accept_loop(listener, cancel.clone()));
        TunnelHandle::new(name, endpoint, cancel, task)
    }

    async fn accept_loop(self, listener: TcpListener, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.limit.acquire() => permit,
            };

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Forward tunnel {}: failed to accept connection: {}", self.name, e);
                        continue;
                    }
                },
            };

            debug!(
                "Forward tunnel {}: accepted {} ({} active)",
                self.name,
                peer,
                self.limit.active()
            );

            tracker.spawn(serve_connection(
                self.opener.clone(),
                stream,
                peer,
                self.remote_host.clone(),
                self.remote_port,
                self.relay,
                cancel.clone(),
                permit,
            ));
        }

        tracker.close();
        tracker.wait().await;
        info!("Forward tunnel {} stopped", self.name);
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection<O: ChannelOpener>(
    opener: Arc<O>,
    stream: TcpStream,
    peer: SocketAddr,
    remote_host: String,
    remote_port: u16,
    config: RelayConfig,
    cancel: CancellationToken,
    _permit: ConnectionPermit,
) {
    let channel = match opener.open_channel(&remote_host, remote_port, peer).await {
        Ok(channel) => channel,
        Err(e) => {
            // Dropping the socket closes the local side; no retry here
            warn!(
                "Failed to open channel to {} for {}: {}",
                format_host_port(&remote_host, remote_port),
                peer,
                e
            );
            return;
        }
    };

    let stats = relay(stream, channel, config, &cancel).await;
    debug!(
        "Forward connection {} closed ({:?}): {} bytes out, {} bytes in",
        peer, stats.end, stats.a_to_b, stats.b_to_a
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Opens in-memory channels whose far end echoes everything back
    #[derive(Default)]
    struct EchoOpener {
        opened: AtomicUsize,
        targets: std::sync::Mutex<Vec<(String, u16)>>,
    }

    #[async_trait]
    impl ChannelOpener for EchoOpener {
        type Stream = DuplexStream;

        async fn open_channel(&self, host: &str, port: u16, _originator: SocketAddr) -> Result<DuplexStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push((host.to_string(), port));
            let (ours, mut theirs) = duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match theirs.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if theirs.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(ours)
        }
    }

    struct RefusingOpener;

    #[async_trait]
    impl ChannelOpener for RefusingOpener {
        type Stream = DuplexStream;

        async fn open_channel(&self, host: &str, port: u16, _originator: SocketAddr) -> Result<DuplexStream> {
            Err(TunnelError::ChannelOpen {
                target: format_host_port(host, port),
                reason: "connect failed".to_string(),
            })
        }
    }

    async fn loopback_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_exposed_bind_address() {
        let tunnel = || ForwardTunnel::new(Arc::new(RefusingOpener), "db", 15432, "db.internal", 5432);
        assert!(!tunnel().exposed());
        assert!(!tunnel().bind_address("::1").exposed());
        assert!(!tunnel().bind_address("localhost").exposed());
        assert!(tunnel().bind_address("0.0.0.0").exposed());
        assert!(tunnel().bind_address("192.168.1.20").exposed());
    }

    #[tokio::test]
    async fn test_forward_relays_through_channel() {
        let opener = Arc::new(EchoOpener::default());
        let (listener, addr) = loopback_listener().await;
        let handle = ForwardTunnel::new(opener.clone(), "db", 0, "db.internal", 5432).start_on(listener);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"SELECT 1").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SELECT 1");

        assert_eq!(opener.opened.load(Ordering::SeqCst), 1);
        assert_eq!(
            opener.targets.lock().unwrap()[0],
            ("db.internal".to_string(), 5432)
        );

        drop(client);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_channel() {
        let opener = Arc::new(EchoOpener::default());
        let (listener, addr) = loopback_listener().await;
        let handle = ForwardTunnel::new(opener.clone(), "web", 0, "10.0.0.2", 80).start_on(listener);

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();

        let mut buf = [0u8; 3];
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        assert_eq!(opener.opened.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_channel_open_failure_closes_local_connection() {
        let (listener, addr) = loopback_listener().await;
        let handle = ForwardTunnel::new(Arc::new(RefusingOpener), "api", 0, "10.0.0.3", 8080).start_on(listener);

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("local connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The listener keeps accepting after a failed open
        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_relays() {
        let opener = Arc::new(EchoOpener::default());
        let (listener, addr) = loopback_listener().await;
        let handle = ForwardTunnel::new(opener, "web", 0, "10.0.0.2", 80).start_on(listener);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), handle.shutdown())
            .await
            .expect("shutdown should finish within a couple of poll intervals");

        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_parent_token_cancels_tunnel() {
        let parent = CancellationToken::new();
        let (listener, _) = loopback_listener().await;
        let handle = ForwardTunnel::new(Arc::new(EchoOpener::default()), "web", 0, "10.0.0.2", 80)
            .cancel_with(&parent)
            .start_on(listener);

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("tunnel should stop with its parent");
    }

    #[tokio::test]
    async fn test_start_reports_bind_failure() {
        let (_listener, addr) = loopback_listener().await;
        let err = ForwardTunnel::new(Arc::new(EchoOpener::default()), "dup", addr.port(), "h", 1)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::LocalConnect { .. }));
    }
}
