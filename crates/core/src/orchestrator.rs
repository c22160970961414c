// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Relay Contributors

//! Starts one reverse tunnel per mapping over a shared transport.
//!
//! Mappings are started strictly one after another with a stagger between
//! them, since concurrent bind requests on one transport are unreliable.
//! Each mapping gets a bounded number of attempts with a fixed backoff; a
//! mapping that never starts is recorded and the pass continues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ssh_relay_common::{ensure_unique_bind_ports, ReverseMapping};

use crate::error::{ErrorKind, Result};
use crate::handle::TunnelHandle;
use crate::reverse::{RemoteBinder, ReverseSettings, ReverseTunnel};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(1);

/// Starts the tunnel for one mapping
#[async_trait]
pub trait TunnelStarter: Send + Sync {
    async fn start(&self, mapping: &ReverseMapping) -> Result<TunnelHandle>;
}

/// Starts real reverse tunnels through a `RemoteBinder`
pub struct ReverseStarter<B: RemoteBinder> {
    binder: Arc<B>,
    settings: ReverseSettings,
    parent: Option<CancellationToken>,
}

impl<B: RemoteBinder> ReverseStarter<B> {
    pub fn new(binder: Arc<B>, settings: ReverseSettings) -> Self {
        Self {
            binder,
            settings,
            parent: None,
        }
    }

    /// Tie every started tunnel to `token`
    pub fn cancel_with(mut self, token: &CancellationToken) -> Self {
        self.parent = Some(token.clone());
        self
    }
}

#[async_trait]
impl<B: RemoteBinder> TunnelStarter for ReverseStarter<B> {
    async fn start(&self, mapping: &ReverseMapping) -> Result<TunnelHandle> {
        let mut tunnel =
            ReverseTunnel::new(self.binder.clone(), mapping.clone(), self.settings.clone());
        if let Some(parent) = &self.parent {
            tunnel = tunnel.cancel_with(parent);
        }
        tunnel.start().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorPolicy {
    /// Total attempts per mapping, including the first
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Pause between finishing one mapping and starting the next
    pub stagger: Duration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            stagger: DEFAULT_STAGGER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappingOutcome {
    pub mapping: ReverseMapping,
    pub attempts: u32,
    /// Last failure, if the mapping never started
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl MappingOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl std::fmt::Display for MappingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            None => write!(f, "{}", self.mapping),
            Some(error) => write!(
                f,
                "{}: {} (after {} attempt(s))",
                self.mapping, error, self.attempts
            ),
        }
    }
}

/// Per-mapping results of one orchestration pass, in mapping order
#[derive(Debug, Clone, Default)]
pub struct OrchestrationReport {
    pub outcomes: Vec<MappingOutcome>,
}

impl OrchestrationReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.total() - self.succeeded_count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn failed_names(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.mapping.name.as_str())
            .collect()
    }

    /// One-line accounting for the end-of-run summary
    pub fn summary_line(&self) -> String {
        if self.all_succeeded() {
            format!("All {} tunnel(s) started", self.total())
        } else {
            format!(
                "{}/{} tunnel(s) started; failed: {}",
                self.succeeded_count(),
                self.total(),
                self.failed_names().join(", ")
            )
        }
    }
}

/// Report plus the handles of the tunnels that started
#[derive(Debug)]
pub struct Orchestration {
    pub report: OrchestrationReport,
    pub handles: Vec<TunnelHandle>,
}

impl Orchestration {
    /// Every started tunnel has stopped on its own, e.g. after the transport was lost
    pub fn all_finished(&self) -> bool {
        self.handles.iter().all(TunnelHandle::is_finished)
    }

    /// Stop every started tunnel
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
    }
}

pub struct TunnelOrchestrator<S: TunnelStarter> {
    starter: S,
    policy: OrchestratorPolicy,
}

impl<S: TunnelStarter> TunnelOrchestrator<S> {
    pub fn new(starter: S, policy: OrchestratorPolicy) -> Self {
        Self { starter, policy }
    }

    pub fn policy(&self) -> &OrchestratorPolicy {
        &self.policy
    }

    /// Start every mapping in order. Only a plan with duplicate bind ports is
    /// an error; individual start failures end up in the report. When
    /// `cancel` fires, remaining mappings are recorded as not started.
    pub async fn run(
        &self,
        mappings: &[ReverseMapping],
        cancel: &CancellationToken,
    ) -> Result<Orchestration> {
        ensure_unique_bind_ports(mappings)?;

        let mut report = OrchestrationReport::default();
        let mut handles = Vec::with_capacity(mappings.len());

        for (idx, mapping) in mappings.iter().enumerate() {
            if cancel.is_cancelled() {
                report.outcomes.push(not_started(mapping));
                continue;
            }

            let (outcome, handle) = self.start_with_retry(mapping, cancel).await;
            report.outcomes.push(outcome);
            handles.extend(handle);

            let is_last = idx + 1 == mappings.len();
            if !is_last {
                pause(self.policy.stagger, cancel).await;
            }
        }

        if report.all_succeeded() {
            info!("{}", report.summary_line());
        } else {
            warn!("{}", report.summary_line());
        }

        Ok(Orchestration { report, handles })
    }

    async fn start_with_retry(
        &self,
        mapping: &ReverseMapping,
        cancel: &CancellationToken,
    ) -> (MappingOutcome, Option<TunnelHandle>) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut outcome = MappingOutcome {
            mapping: mapping.clone(),
            attempts: 0,
            error: None,
            error_kind: None,
        };

        for attempt in 1..=max_attempts {
            outcome.attempts = attempt;
            info!("Starting {} (attempt {}/{})", mapping, attempt, max_attempts);

            match self.starter.start(mapping).await {
                Ok(handle) => {
                    outcome.error = None;
                    outcome.error_kind = None;
                    return (outcome, Some(handle));
                }
                Err(e) => {
                    warn!(
                        "Starting {} failed on attempt {}/{} ({:?}): {}",
                        mapping.name,
                        attempt,
                        max_attempts,
                        e.kind(),
                        e
                    );
                    outcome.error = Some(e.to_string());
                    outcome.error_kind = Some(e.kind());
                }
            }

            if attempt < max_attempts && !pause(self.policy.retry_backoff, cancel).await {
                break;
            }
        }

        (outcome, None)
    }
}

fn not_started(mapping: &ReverseMapping) -> MappingOutcome {
    MappingOutcome {
        mapping: mapping.clone(),
        attempts: 0,
        error: Some("not started: shutdown requested".to_string()),
        error_kind: None,
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
