//! Periodic reclamation of stale agents and idle coordination channels.
//!
//! A sweep looks for two kinds of leftovers:
//! - agents that are not terminal but have not sent a heartbeat within the
//!   stale threshold; these are terminated with reason `stale`
//! - open channels with no active participant whose last activity is older
//!   than the inactivity threshold; these are closed
//!
//! Each item is handled on its own, so one failure never stops the sweep.
//! In dry-run mode candidates are reported and nothing is changed.

use crate::config::{timer_period, CleanupConfig};
use crate::core::agent::{Agent, AgentId, AgentStatus};
use crate::error::{Error, Result};
use crate::orchestration::AgentLifecycleManager;
use crate::ports::{ChannelInfo, CoordinationChannel};
use crate::store::AgentQuery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Termination reason recorded on agents reclaimed by a sweep.
pub const STALE_REASON: &str = "stale";

const SWEEP_SENDER: &str = "conductor";

/// Parameters of a single sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOptions {
    pub agent_stale_minutes: u64,
    pub room_inactive_minutes: u64,
    /// Report candidates without acting on them.
    pub dry_run: bool,
    /// Restrict the sweep to one scope.
    pub scope: Option<String>,
    /// Post a notice on a reclaimed agent's channel.
    pub notify_channels: bool,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self::from_config(&CleanupConfig::default())
    }
}

impl SweepOptions {
    pub fn from_config(config: &CleanupConfig) -> Self {
        Self {
            agent_stale_minutes: config.agent_stale_minutes,
            room_inactive_minutes: config.room_inactive_minutes,
            dry_run: false,
            scope: None,
            notify_channels: true,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn scoped(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        minutes_before(now, self.agent_stale_minutes)
    }

    fn inactive_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        minutes_before(now, self.room_inactive_minutes)
    }
}

/// `now` minus `m` minutes, saturating at the earliest representable time.
fn minutes_before(now: DateTime<Utc>, m: u64) -> DateTime<Utc> {
    i64::try_from(m)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One item a sweep could not reclaim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupFailure {
    /// Agent id or channel name.
    pub target: String,
    pub message: String,
}

impl CleanupFailure {
    fn new(target: impl ToString, error: &Error) -> Self {
        Self {
            target: target.to_string(),
            message: error.to_string(),
        }
    }
}

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    /// Agents found stale.
    pub stale_agents: Vec<AgentId>,
    /// Stale agents actually terminated.
    pub terminated_agents: Vec<AgentId>,
    /// Channels found inactive.
    pub inactive_channels: Vec<String>,
    /// Inactive channels actually closed.
    pub closed_channels: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Default::default()
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.stale_agents.len() + self.inactive_channels.len()
    }

    pub fn acted_count(&self) -> usize {
        self.terminated_agents.len() + self.closed_channels.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Merge another report into this one.
    pub fn merge(&mut self, other: CleanupReport) {
        self.dry_run |= other.dry_run;
        self.stale_agents.extend(other.stale_agents);
        self.terminated_agents.extend(other.terminated_agents);
        self.inactive_channels.extend(other.inactive_channels);
        self.closed_channels.extend(other.closed_channels);
        self.failures.extend(other.failures);
    }

    /// `CleanupPartialFailure` when any item failed.
    pub fn into_result(self) -> Result<CleanupReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::CleanupPartialFailure {
                failures: self.failures,
            })
        }
    }
}

pub struct CleanupScheduler {
    lifecycle: Arc<AgentLifecycleManager>,
    channels: Arc<dyn CoordinationChannel>,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        lifecycle: Arc<AgentLifecycleManager>,
        channels: Arc<dyn CoordinationChannel>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            lifecycle,
            channels,
            config,
        }
    }

    /// Configured thresholds.
    pub fn thresholds(&self) -> &CleanupConfig {
        &self.config
    }

    /// Sweep options built from the configured thresholds.
    pub fn default_options(&self) -> SweepOptions {
        SweepOptions::from_config(&self.config)
    }

    pub async fn sweep(&self, options: &SweepOptions) -> CleanupReport {
        let now = Utc::now();
        let mut report = CleanupReport::new(options.dry_run);

        self.sweep_agents(options, now, &mut report).await;
        self.sweep_channels(options, now, &mut report).await;

        if report.candidate_count() > 0 || !report.is_success() {
            info!(
                dry_run = options.dry_run,
                candidates = report.candidate_count(),
                acted = report.acted_count(),
                failures = report.failures.len(),
                "cleanup sweep finished"
            );
        } else {
            debug!("cleanup sweep found nothing");
        }
        report
    }

    async fn sweep_agents(&self, options: &SweepOptions, now: DateTime<Utc>, report: &mut CleanupReport) {
        let query = options
            .scope
            .as_deref()
            .map(AgentQuery::scope)
            .unwrap_or_default()
            .with_statuses(&[AgentStatus::Pending, AgentStatus::Active]);

        let agents = match self.lifecycle.list(&query).await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "cleanup: failed to list agents");
                report.failures.push(CleanupFailure::new("agents", &e));
                return;
            }
        };

        let cutoff = options.stale_cutoff(now);
        for agent in agents.iter().filter(|a| a.is_stale(cutoff)) {
            debug!(
                agent = %agent.id.short(),
                last_heartbeat = %agent.last_heartbeat,
                cutoff = %cutoff,
                "stale agent"
            );
            report.stale_agents.push(agent.id);
            if options.dry_run {
                continue;
            }

            match self.lifecycle.terminate(agent.id, STALE_REASON).await {
                Ok(true) => {
                    report.terminated_agents.push(agent.id);
                    if options.notify_channels {
                        self.notify(agent).await;
                    }
                }
                // Finished on its own since the listing.
                Ok(false) => {}
                Err(e) => {
                    warn!(agent = %agent.id.short(), error = %e, "cleanup: failed to terminate agent");
                    report.failures.push(CleanupFailure::new(agent.id, &e));
                }
            }
        }
    }

    async fn notify(&self, agent: &Agent) {
        let Some(channel) = &agent.channel else {
            return;
        };
        let body = format!(
            "agent {} ({}) terminated: no heartbeat since {}",
            agent.id.short(),
            agent.role,
            agent.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if let Err(e) = self.channels.send_message(channel, SWEEP_SENDER, &body).await {
            warn!(channel = %channel, error = %e, "cleanup: failed to post notice");
        }
    }

    async fn sweep_channels(&self, options: &SweepOptions, now: DateTime<Utc>, report: &mut CleanupReport) {
        let channels = match self.channels.list_channels(options.scope.as_deref()).await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "cleanup: failed to list channels");
                report.failures.push(CleanupFailure::new("channels", &e));
                return;
            }
        };

        let cutoff = options.inactive_cutoff(now);
        for channel in channels {
            match self.is_inactive(&channel, cutoff).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    report.failures.push(CleanupFailure::new(&channel.name, &e));
                    continue;
                }
            }

            debug!(channel = %channel.name, last_activity = %channel.last_activity, "inactive channel");
            report.inactive_channels.push(channel.name.clone());
            if options.dry_run {
                continue;
            }
            match self.channels.close(&channel.name).await {
                Ok(()) => report.closed_channels.push(channel.name),
                Err(e) => {
                    warn!(channel = %channel.name, error = %e, "cleanup: failed to close channel");
                    report.failures.push(CleanupFailure::new(&channel.name, &e));
                }
            }
        }
    }

    async fn is_inactive(&self, channel: &ChannelInfo, cutoff: DateTime<Utc>) -> Result<bool> {
        if channel.last_activity >= cutoff {
            return Ok(false);
        }
        let participants = self.channels.list_participants(&channel.name).await?;
        Ok(!participants.iter().any(|p| p.active))
    }

    /// Run a sweep every `interval` until `cancel` fires.
    ///
    /// The first sweep runs immediately.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        options: SweepOptions,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timer_period(interval));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep(&options).await;
                        for failure in &report.failures {
                            warn!(target_item = %failure.target, error = %failure.message, "periodic cleanup failure");
                        }
                    }
                }
            }
            debug!("periodic cleanup stopped");
        })
    }
}
