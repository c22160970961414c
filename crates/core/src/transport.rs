// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// SSH Relay - Transport Module
// One authenticated russh session shared by every tunnel of a run

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult, Config, Handle, Msg, Session};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, ChannelStream, Disconnect};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use ssh_relay_common::{format_host_port, ConnectionConfig, HostKeyPolicy};

use crate::diagnostics::{ExecOutput, RemoteExec};
use crate::error::{Result, TunnelError};
use crate::forward::ChannelOpener;
use crate::known_hosts::KnownHosts;
use crate::reverse::RemoteBinder;

/// Missed keepalives before the session is considered dead
const KEEPALIVE_MAX: usize = 3;

/// Pushed channels buffered per bind before new ones are refused
const FORWARDED_BACKLOG: usize = 64;

/// Upper bound for a single remote diagnostics command
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Senders for channels the server pushes back, keyed by bound port
type ForwardedRegistry = Arc<std::sync::Mutex<HashMap<u32, mpsc::Sender<ChannelStream<Msg>>>>>;

/// russh client handler: host key verification and forwarded-channel routing
struct ClientHandler {
    host: String,
    port: u16,
    known_hosts_path: PathBuf,
    policy: HostKeyPolicy,
    forwarded: ForwardedRegistry,
    host_key_rejected: Arc<AtomicBool>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let path = self.known_hosts_path.clone();
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy;
        let key = server_public_key.clone();

        // known_hosts is read and possibly rewritten on disk
        let accepted = tokio::task::spawn_blocking(move || {
            let mut known_hosts = KnownHosts::load_from(&path)?;
            known_hosts.check(&host, port, &key, policy)
        })
        .await
        .map_err(|e| russh::Error::from(std::io::Error::other(e)))?
        .map_err(to_ssh_error)?;
        if !accepted {
            self.host_key_rejected.store(true, Ordering::SeqCst);
        }
        Ok(accepted)
    }

    // Runs on the session task: route synchronously, never await channel I/O here
    fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> impl std::future::Future<Output = std::result::Result<(), Self::Error>> + Send {
        debug!(
            "Forwarded connection from {}:{} on {}:{}",
            originator_address, originator_port, connected_address, connected_port
        );
        self.route_forwarded(channel, connected_port);
        async { Ok(()) }
    }
}

impl ClientHandler {
    fn route_forwarded(&self, channel: Channel<Msg>, connected_port: u32) {
        let sender = self
            .forwarded
            .lock()
            .ok()
            .and_then(|registry| registry.get(&connected_port).cloned());

        let Some(sender) = sender else {
            warn!("Server pushed a channel for unbound port {}, closing it", connected_port);
            tokio::spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!("Closing unrouted channel failed: {}", e);
                }
            });
            return;
        };

        if let Err(e) = sender.try_send(channel.into_stream()) {
            warn!(
                "Tunnel on port {} is not accepting connections, dropping one",
                connected_port
            );
            let mut stream = e.into_inner();
            tokio::spawn(async move {
                if let Err(e) = stream.shutdown().await {
                    debug!("Closing refused channel failed: {}", e);
                }
            });
        }
    }
}

impl Drop for ClientHandler {
    // The session task owns the handler, so this runs once the session is
    // gone. Dropping the senders ends every accept loop waiting on a bind.
    fn drop(&mut self) {
        close_forwarded(&self.forwarded);
    }
}

fn close_forwarded(registry: &ForwardedRegistry) {
    let mut registry = match registry.lock() {
        Ok(registry) => registry,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !registry.is_empty() {
        debug!("Session ended, closing {} remote bind(s)", registry.len());
        registry.clear();
    }
}

fn to_ssh_error(e: TunnelError) -> russh::Error {
    russh::Error::from(std::io::Error::other(e.to_string()))
}

/// Client settings derived from the connection descriptor
fn client_config(config: &ConnectionConfig) -> Config {
    let mut cfg = Config::default();
    cfg.nodelay = true;
    if config.keepalive_interval > 0 {
        cfg.keepalive_interval = Some(Duration::from_secs(config.keepalive_interval));
        cfg.keepalive_max = KEEPALIVE_MAX;
    }
    cfg
}

/// The shared transport connection. Control operations (channel open, bind,
/// exec session open) are serialized through one lock; data on open channels
/// flows without it.
pub struct SshTransport {
    session: Mutex<Handle<ClientHandler>>,
    forwarded: ForwardedRegistry,
    target: String,
    control_timeout: Duration,
}

impl SshTransport {
    /// Connect, verify the host key and authenticate with the configured key
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let key_path = config.key_path.as_deref().ok_or_else(|| {
            ssh_relay_common::Error::Config("Private key path is not set".to_string())
        })?;

        let forwarded: ForwardedRegistry = Arc::default();
        let host_key_rejected = Arc::new(AtomicBool::new(false));
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            known_hosts_path: config.known_hosts_path.clone(),
            policy: config.host_key_policy,
            forwarded: forwarded.clone(),
            host_key_rejected: host_key_rejected.clone(),
        };

        let addr = format_host_port(&config.host, config.port);
        let connect_timeout = Duration::from_secs(config.connect_timeout.max(1));
        info!("Connecting to SSH server: {}", config.display_target());

        let mut session = match tokio::time::timeout(
            connect_timeout,
            client::connect(Arc::new(client_config(config)), addr.as_str(), handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                if host_key_rejected.load(Ordering::SeqCst) {
                    return Err(TunnelError::HostKeyRejected(addr));
                }
                return Err(TunnelError::Connect {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TunnelError::timeout(
                    format!("Connection to {}", addr),
                    connect_timeout,
                ))
            }
        };

        authenticate(&mut session, &config.user, key_path).await?;
        info!("SSH authentication successful for {}", config.display_target());

        Ok(Self {
            session: Mutex::new(session),
            forwarded,
            target: config.display_target(),
            control_timeout: connect_timeout,
        })
    }

    /// Connect, authenticate and disconnect again
    pub async fn test_connection(config: &ConnectionConfig) -> Result<()> {
        let transport = Self::connect(config).await?;
        transport.disconnect().await
    }

    /// "user@host:port"
    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.is_closed()
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.session
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        debug!("Disconnected from {}", self.target);
        Ok(())
    }

    fn unregister(&self, port: u16) {
        if let Ok(mut registry) = self.forwarded.lock() {
            registry.remove(&u32::from(port));
        }
    }
}

async fn authenticate(session: &mut Handle<ClientHandler>, user: &str, key_path: &Path) -> Result<()> {
    let key = load_secret_key(key_path, None).map_err(|e| {
        error!("Failed to load SSH key from {}: {}", key_path.display(), e);
        e
    })?;

    // RSA keys need the hash algorithm the server prefers; others ignore it
    let key_with_alg = PrivateKeyWithHashAlg::new(
        Arc::new(key),
        session.best_supported_rsa_hash().await?.flatten(),
    );

    match session.authenticate_publickey(user, key_with_alg).await? {
        AuthResult::Success => Ok(()),
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } => {
            let methods: Vec<String> = remaining_methods
                .iter()
                .map(|m| {
                    let s: &str = m.into();
                    s.to_string()
                })
                .collect();

            let reason = if partial_success {
                format!(
                    "key accepted but server requires more: {}",
                    methods.join(", ")
                )
            } else if methods.is_empty() {
                "public key rejected, no authentication methods left".to_string()
            } else {
                format!("public key rejected, server allows: {}", methods.join(", "))
            };
            Err(TunnelError::Authentication(reason))
        }
    }
}

#[async_trait]
impl ChannelOpener for SshTransport {
    type Stream = ChannelStream<Msg>;

    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<Self::Stream> {
        let channel = self
            .session
            .lock()
            .await
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| TunnelError::ChannelOpen {
                target: format_host_port(host, port),
                reason: e.to_string(),
            })?;
        Ok(channel.into_stream())
    }
}

#[async_trait]
impl RemoteBinder for SshTransport {
    type Stream = ChannelStream<Msg>;

    async fn request_bind(
        &self,
        address: &str,
        port: u16,
    ) -> Result<mpsc::Receiver<Self::Stream>> {
        let (tx, rx) = mpsc::channel(FORWARDED_BACKLOG);
        {
            let mut registry = self
                .forwarded
                .lock()
                .map_err(|_| TunnelError::BindRejected {
                    port,
                    reason: "forwarding registry is unavailable".to_string(),
                })?;
            if registry.contains_key(&u32::from(port)) {
                return Err(TunnelError::BindRejected {
                    port,
                    reason: "port is already bound on this connection".to_string(),
                });
            }
            registry.insert(u32::from(port), tx);
        }

        debug!("Requesting remote bind on {}", format_host_port(address, port));
        let requested = tokio::time::timeout(
            self.control_timeout,
            async {
                self.session
                    .lock()
                    .await
                    .tcpip_forward(address, u32::from(port))
                    .await
            },
        )
        .await;

        match requested {
            Ok(Ok(_)) => Ok(rx),
            Ok(Err(e)) => {
                self.unregister(port);
                let reason = match e {
                    russh::Error::RequestDenied => {
                        "request denied (port in use or not permitted)".to_string()
                    }
                    other => other.to_string(),
                };
                Err(TunnelError::BindRejected { port, reason })
            }
            Err(_) => {
                self.unregister(port);
                Err(TunnelError::timeout(
                    format!("Remote bind on port {}", port),
                    self.control_timeout,
                ))
            }
        }
    }

    async fn cancel_bind(&self, address: &str, port: u16) -> Result<()> {
        self.unregister(port);
        self.session
            .lock()
            .await
            .cancel_tcpip_forward(address, u32::from(port))
            .await?;
        debug!("Released remote bind on {}", format_host_port(address, port));
        Ok(())
    }
}

#[async_trait]
impl RemoteExec for SshTransport {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .session
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::Exec(format!("failed to open session channel: {}", e)))?;

        debug!("Remote exec: {}", command);
        channel
            .exec(true, command)
            .await
            .map_err(|e| TunnelError::Exec(format!("failed to run '{}': {}", command, e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        let collect = async {
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(EXEC_TIMEOUT, collect).await.is_err() {
            return Err(TunnelError::timeout(
                format!("Remote command '{}'", command),
                EXEC_TIMEOUT,
            ));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }
}
