//! Supervision state machine over agent heartbeats.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::heartbeat::{
    HealthError, append_check_entry, read_heartbeat, recent_check_entries,
};
use crate::config::HealthConfig;

/// How many stale reasons are kept per agent.
pub const RECENT_ERRORS_CAP: usize = 5;

/// Supervision state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Never checked.
    Unknown,
    /// Heartbeat is fresh.
    Healthy,
    /// Heartbeat is stale or unreadable.
    Unhealthy,
    /// Stale, and a restart has been requested this check.
    Restarting,
    /// Restarts did not help; an operator has been notified.
    Escalated,
}

impl AgentState {
    /// Lowercase name for logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Escalated => "escalated",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the monitor knows about one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent name.
    pub agent: String,
    /// Current supervision state.
    pub state: AgentState,
    /// Timestamp of the last fresh heartbeat seen.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Restarts requested since the monitor started.
    pub restart_count: u32,
    /// Most recent stale reasons, oldest first, capped at
    /// [`RECENT_ERRORS_CAP`].
    pub recent_errors: Vec<String>,
}

impl AgentHealth {
    /// Fresh tracking state for an agent.
    #[must_use]
    pub fn new(agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            state: AgentState::Unknown,
            last_heartbeat: None,
            restart_count: 0,
            recent_errors: Vec::new(),
        }
    }
}

/// Notifies a human when an agent escalates.
pub trait OperatorNotifier {
    /// Deliver one escalation message.
    fn notify(&self, message: &str);
}

/// Requests an agent restart from whatever runs the agents.
pub trait ProcessControl {
    /// Ask for `agent` to be restarted.
    fn request_restart(&self, agent: &str);
}

/// Notifier that emits escalations as error-level log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl OperatorNotifier for TracingNotifier {
    fn notify(&self, message: &str) {
        error!(%message, "operator escalation");
    }
}

/// Process control that records restart requests in a JSONL file for
/// an external supervisor to act on.
///
/// The trait is infallible, so append failures are logged rather than
/// propagated; a broken request log must not stop monitoring.
#[derive(Debug, Clone)]
pub struct RestartRequestLog {
    path: PathBuf,
}

impl RestartRequestLog {
    /// Create a handle; the file is created on first request.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProcessControl for RestartRequestLog {
    fn request_restart(&self, agent: &str) {
        let line = json!({"agent": agent, "requested_at": Utc::now()}).to_string();
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
                file.sync_all()
            });
        if let Err(e) = result {
            warn!(agent, path = %self.path.display(), error = %e, "failed to record restart request");
        }
    }
}

/// Watches heartbeat files and walks each agent through
/// healthy/unhealthy/restarting/escalated.
///
/// Escalation requires the configured number of consecutive stale
/// checks in the agent's history; below that, each stale check
/// requests one restart. The operator is notified exactly once per
/// escalation episode; recovery re-arms the notification.
pub struct HeartbeatMonitor {
    heartbeat_dir: PathBuf,
    timeout: Duration,
    escalation_threshold: u32,
    history_window: usize,
    notifier: Box<dyn OperatorNotifier>,
    control: Box<dyn ProcessControl>,
    agents: BTreeMap<String, AgentHealth>,
    notified_escalations: BTreeSet<String>,
}

impl fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("heartbeat_dir", &self.heartbeat_dir)
            .field("timeout", &self.timeout)
            .field("escalation_threshold", &self.escalation_threshold)
            .field("history_window", &self.history_window)
            .field("agents", &self.agents)
            .field("notified_escalations", &self.notified_escalations)
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Build a monitor over `heartbeat_dir`, pre-seeding the agents
    /// named in the config.
    #[must_use]
    pub fn new(
        heartbeat_dir: impl Into<PathBuf>,
        config: &HealthConfig,
        notifier: Box<dyn OperatorNotifier>,
        control: Box<dyn ProcessControl>,
    ) -> Self {
        let mut agents = BTreeMap::new();
        for agent in &config.agents {
            agents.insert(agent.clone(), AgentHealth::new(agent));
        }
        Self {
            heartbeat_dir: heartbeat_dir.into(),
            timeout: config.heartbeat_timeout,
            escalation_threshold: config.escalation_threshold,
            history_window: config.history_window,
            notifier,
            control,
            agents,
            notified_escalations: BTreeSet::new(),
        }
    }

    /// Start tracking an agent not named in the config.
    pub fn register_agent(&mut self, agent: &str) {
        self.agents
            .entry(agent.to_string())
            .or_insert_with(|| AgentHealth::new(agent));
    }

    /// Current tracking state of one agent, if known.
    #[must_use]
    pub fn agent_health(&self, agent: &str) -> Option<&AgentHealth> {
        self.agents.get(agent)
    }

    /// Tracking state of every agent, sorted by name.
    #[must_use]
    pub fn all_health(&self) -> Vec<AgentHealth> {
        self.agents.values().cloned().collect()
    }

    /// Check every tracked agent once.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError`] if a check history cannot be written or
    /// read.
    pub fn check_all(&mut self) -> Result<Vec<AgentHealth>, HealthError> {
        let names: Vec<String> = self.agents.keys().cloned().collect();
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            results.push(self.check_agent(&name)?);
        }
        Ok(results)
    }

    /// Check one agent and advance its supervision state.
    ///
    /// Any failure to read the heartbeat (missing, oversized, corrupt,
    /// wrong schema) counts as a stale check with the failure as the
    /// recorded reason; only history I/O aborts the check itself.
    ///
    /// # Errors
    ///
    /// Returns [`HealthError`] if the check history cannot be written
    /// or read.
    pub fn check_agent(&mut self, agent: &str) -> Result<AgentHealth, HealthError> {
        self.register_agent(agent);
        let mut health = self
            .agents
            .get(agent)
            .cloned()
            .unwrap_or_else(|| AgentHealth::new(agent));

        let stale_reason = match read_heartbeat(&self.heartbeat_dir, agent) {
            Ok(Some(heartbeat)) => {
                health.last_heartbeat = Some(heartbeat.written_at);
                let age = Utc::now().signed_duration_since(heartbeat.written_at);
                let timeout =
                    chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
                if age <= timeout {
                    None
                } else {
                    Some(format!(
                        "heartbeat written {} is older than the {} timeout",
                        heartbeat.written_at.to_rfc3339(),
                        humantime::format_duration(self.timeout)
                    ))
                }
            },
            Ok(None) => Some("heartbeat file missing".to_string()),
            Err(e) => Some(format!("heartbeat unreadable: {e}")),
        };

        let Some(reason) = stale_reason else {
            health.state = AgentState::Healthy;
            health.recent_errors.clear();
            self.notified_escalations.remove(agent);
            append_check_entry(&self.heartbeat_dir, agent, false)?;
            debug!(agent, "heartbeat fresh");
            self.agents.insert(agent.to_string(), health.clone());
            return Ok(health);
        };

        if health.recent_errors.len() >= RECENT_ERRORS_CAP {
            health.recent_errors.remove(0);
        }
        health.recent_errors.push(reason.clone());
        health.state = AgentState::Unhealthy;
        append_check_entry(&self.heartbeat_dir, agent, true)?;

        // Stale checks strictly before this one, counted backwards
        // until the first fresh entry.
        let entries = recent_check_entries(&self.heartbeat_dir, agent, self.history_window)?;
        let consecutive_before = entries
            .iter()
            .rev()
            .skip(1)
            .take_while(|entry| entry.stale)
            .count();

        if consecutive_before >= self.escalation_threshold as usize {
            health.state = AgentState::Escalated;
            if self.notified_escalations.insert(agent.to_string()) {
                let message = format!(
                    "agent {agent} unresponsive after {} consecutive stale checks: {reason}",
                    consecutive_before + 1
                );
                self.notifier.notify(&message);
                warn!(agent, checks = consecutive_before + 1, "agent escalated");
            } else {
                debug!(agent, "escalation already notified");
            }
        } else {
            self.control.request_restart(agent);
            health.restart_count += 1;
            health.state = AgentState::Restarting;
            info!(
                agent,
                restart_count = health.restart_count,
                %reason,
                "restart requested"
            );
        }

        self.agents.insert(agent.to_string(), health.clone());
        Ok(health)
    }
}
