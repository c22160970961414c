// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

// SSH Relay - Core Library
// Byte relay, forward/reverse tunnels, orchestration and zombie detection
// over one shared SSH transport

pub mod diagnostics;
pub mod error;
pub mod forward;
pub mod handle;
pub mod known_hosts;
pub mod limit;
pub mod orchestrator;
pub mod relay;
pub mod reverse;
pub mod transport;
pub mod zombie;

pub use diagnostics::{ExecOutput, RemoteExec, SocketProbe};
pub use error::{ErrorKind, Result, TunnelError};
pub use forward::{ChannelOpener, ForwardTunnel};
pub use handle::TunnelHandle;
pub use limit::ConnectionLimit;
pub use orchestrator::{
    MappingOutcome, Orchestration, OrchestrationReport, OrchestratorPolicy, ReverseStarter,
    TunnelOrchestrator, TunnelStarter,
};
pub use relay::{relay, RelayConfig, RelayEnd, RelayStats};
pub use reverse::{RemoteBinder, ReverseSettings, ReverseTunnel};
pub use transport::SshTransport;
pub use zombie::{BindingState, KillOutcome, Preflight, ZombieDetector};
