// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Reverse tunnel: ask the remote side to bind a port, then relay every
//! channel it pushes back to a local service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use ssh_relay_common::{format_host_port, ConnectionConfig, ReverseMapping};

use crate::error::Result;
use crate::handle::TunnelHandle;
use crate::limit::{ConnectionLimit, ConnectionPermit};
use crate::relay::{relay, RelayConfig};

/// Upper bound on one wait for a pushed channel
pub const ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Remote bind requests over the shared transport
#[async_trait]
pub trait RemoteBinder: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Ask the remote side to listen on `address:port`. Channels it pushes
    /// for that bind arrive on the returned receiver, which yields `None`
    /// once the transport is gone.
    async fn request_bind(&self, address: &str, port: u16) -> Result<mpsc::Receiver<Self::Stream>>;

    /// Release a bind made with `request_bind`
    async fn cancel_bind(&self, address: &str, port: u16) -> Result<()>;
}

/// Knobs shared by every reverse tunnel of a run
#[derive(Debug, Clone)]
pub struct ReverseSettings {
    /// Local host pushed connections are delivered to
    pub forward_host: String,
    /// Remote address to bind on ("" = all interfaces)
    pub bind_address: String,
    pub accept_poll: Duration,
    pub relay: RelayConfig,
    /// 0 = unbounded
    pub max_connections: usize,
}

impl Default for ReverseSettings {
    fn default() -> Self {
        Self {
            forward_host: "localhost".to_string(),
            bind_address: String::new(),
            accept_poll: ACCEPT_POLL,
            relay: RelayConfig::default(),
            max_connections: 0,
        }
    }
}

impl ReverseSettings {
    pub fn from_connection(config: &ConnectionConfig) -> Self {
        Self {
            forward_host: config.forward_host.clone(),
            bind_address: config.remote_bind_address.clone(),
            ..Self::default()
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

pub struct ReverseTunnel<B: RemoteBinder> {
    binder: Arc<B>,
    mapping: ReverseMapping,
    settings: ReverseSettings,
    limit: ConnectionLimit,
    parent: Option<CancellationToken>,
}

impl<B: RemoteBinder> ReverseTunnel<B> {
    pub fn new(binder: Arc<B>, mapping: ReverseMapping, settings: ReverseSettings) -> Self {
        let limit = ConnectionLimit::new(settings.max_connections);
        Self {
            binder,
            mapping,
            settings,
            limit,
            parent: None,
        }
    }

    /// Stop together with `token` in addition to the handle's own shutdown
    pub fn cancel_with(mut self, token: &CancellationToken) -> Self {
        self.parent = Some(token.clone());
        self
    }

    /// Issue the remote bind and start accepting pushed channels.
    /// Fails if the bind request is rejected or times out.
    pub async fn start(self) -> Result<TunnelHandle> {
        let incoming = self
            .binder
            .request_bind(&self.settings.bind_address, self.mapping.bind_port)
            .await?;

        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let endpoint = format!(
            "remote :{} -> {}",
            self.mapping.bind_port,
            format_host_port(&self.settings.forward_host, self.mapping.local_port)
        );
        info!("Reverse tunnel {} bound: {}", self.mapping.name, endpoint);

        let name = self.mapping.name.clone();
        let task = tokio::spawn(self.accept_loop(incoming, cancel.clone()));
        Ok(TunnelHandle::new(name, endpoint, cancel, task))
    }

    async fn accept_loop(self, mut incoming: mpsc::Receiver<B::Stream>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let name = &self.mapping.name;

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.limit.acquire() => permit,
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(self.settings.accept_poll, incoming.recv()) => next,
            };

            let channel = match next {
                // Empty poll
                Err(_) => continue,
                Ok(None) => {
                    warn!(
                        "Reverse tunnel {}: transport closed, remote port {} is no longer served",
                        name, self.mapping.bind_port
                    );
                    break;
                }
                Ok(Some(channel)) => channel,
            };

            debug!(
                "Reverse tunnel {}: inbound connection on remote port {} ({} active)",
                name,
                self.mapping.bind_port,
                self.limit.active()
            );

            tracker.spawn(serve_channel(
                channel,
                self.settings.forward_host.clone(),
                self.mapping.local_port,
                self.settings.relay,
                cancel.clone(),
                permit,
            ));
        }

        incoming.close();
        tracker.close();
        tracker.wait().await;

        if let Err(e) = self
            .binder
            .cancel_bind(&self.settings.bind_address, self.mapping.bind_port)
            .await
        {
            debug!("Reverse tunnel {}: cancel bind failed: {}", name, e);
        }
        info!("Reverse tunnel {} stopped", name);
    }
}

async fn serve_channel<S>(
    mut channel: S,
    local_host: String,
    local_port: u16,
    config: RelayConfig,
    cancel: CancellationToken,
    _permit: ConnectionPermit,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let addr = format_host_port(&local_host, local_port);
    let local = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to connect to local service {}: {}", addr, e);
            if let Err(e) = channel.shutdown().await {
                debug!("Closing pushed channel failed: {}", e);
            }
            return;
        }
    };

    let stats = relay(channel, local, config, &cancel).await;
    debug!(
        "Reverse connection to {} closed ({:?}): {} bytes in, {} bytes out",
        addr, stats.end, stats.a_to_b, stats.b_to_a
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Remote side stand-in: keeps one sender per bound port and lets the
    /// test push connections as if a public client had connected
    #[derive(Default)]
    struct FakeRemote {
        binds: Mutex<HashMap<u16, mpsc::Sender<DuplexStream>>>,
        rejected: Vec<u16>,
        cancelled: Mutex<Vec<u16>>,
    }

    impl FakeRemote {
        async fn push(&self, port: u16) -> DuplexStream {
            let (public, pushed) = duplex(1024);
            let sender = self.binds.lock().unwrap().get(&port).cloned().expect("port not bound");
            sender.send(pushed).await.unwrap();
            public
        }

        fn drop_transport(&self) {
            self.binds.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl RemoteBinder for FakeRemote {
        type Stream = DuplexStream;

        async fn request_bind(&self, _address: &str, port: u16) -> Result<mpsc::Receiver<DuplexStream>> {
            if self.rejected.contains(&port) {
                return Err(TunnelError::BindRejected {
                    port,
                    reason: "request denied".to_string(),
                });
            }
            let (tx, rx) = mpsc::channel(8);
            self.binds.lock().unwrap().insert(port, tx);
            Ok(rx)
        }

        async fn cancel_bind(&self, _address: &str, port: u16) -> Result<()> {
            self.binds.lock().unwrap().remove(&port);
            self.cancelled.lock().unwrap().push(port);
            Ok(())
        }
    }

    async fn echo_service() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    fn settings() -> ReverseSettings {
        ReverseSettings {
            forward_host: "127.0.0.1".to_string(),
            ..ReverseSettings::default()
        }
    }

    #[tokio::test]
    async fn test_pushed_channel_reaches_local_service() {
        let remote = Arc::new(FakeRemote::default());
        let local_port = echo_service().await;
        let mapping = ReverseMapping::new("web", local_port, 8080).unwrap();

        let handle = ReverseTunnel::new(remote.clone(), mapping, settings())
            .start()
            .await
            .unwrap();
        assert_eq!(handle.name(), "web");

        let mut public = remote.push(8080).await;
        public.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 18];
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

        drop(public);
        handle.shutdown().await;
        assert_eq!(*remote.cancelled.lock().unwrap(), vec![8080]);
    }

    #[tokio::test]
    async fn test_local_connect_failure_closes_pushed_channel() {
        let remote = Arc::new(FakeRemote::default());
        // Reserve a port and release it so nothing listens there
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mapping = ReverseMapping::new("dead", closed_port, 9090).unwrap();
        let handle = ReverseTunnel::new(remote.clone(), mapping, settings())
            .start()
            .await
            .unwrap();

        let mut public = remote.push(9090).await;
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), public.read(&mut buf))
            .await
            .expect("pushed channel should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_bind_is_an_error() {
        let remote = Arc::new(FakeRemote {
            rejected: vec![22],
            ..Default::default()
        });
        let mapping = ReverseMapping::new("ssh", 2222, 22).unwrap();
        let err = ReverseTunnel::new(remote, mapping, settings())
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BindRejected { port: 22, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_polls_observe_shutdown() {
        let remote = Arc::new(FakeRemote::default());
        let mapping = ReverseMapping::new("idle", 5000, 5000).unwrap();
        let handle = ReverseTunnel::new(remote.clone(), mapping, settings())
            .start()
            .await
            .unwrap();

        // Several empty accept polls are not errors
        tokio::time::sleep(ACCEPT_POLL * 5).await;
        assert!(!handle.is_finished());

        handle.shutdown().await;
        assert_eq!(*remote.cancelled.lock().unwrap(), vec![5000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_ends_accept_loop() {
        let remote = Arc::new(FakeRemote::default());
        let mapping = ReverseMapping::new("web", 5000, 5000).unwrap();
        let handle = ReverseTunnel::new(remote.clone(), mapping, settings())
            .start()
            .await
            .unwrap();

        remote.drop_transport();
        tokio::time::timeout(ACCEPT_POLL * 3, handle.wait())
            .await
            .expect("accept loop should end when the transport goes away");
    }

    #[test]
    fn test_settings_from_connection() {
        let config = ConnectionConfig {
            forward_host: "10.1.1.1".to_string(),
            remote_bind_address: "0.0.0.0".to_string(),
            ..ConnectionConfig::default()
        };
        let settings = ReverseSettings::from_connection(&config).max_connections(16);
        assert_eq!(settings.forward_host, "10.1.1.1");
        assert_eq!(settings.bind_address, "0.0.0.0");
        assert_eq!(settings.max_connections, 16);
        assert_eq!(settings.accept_poll, ACCEPT_POLL);
    }
}
