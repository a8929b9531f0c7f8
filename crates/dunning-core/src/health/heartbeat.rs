//! Heartbeat files written by agents and the check history the
//! monitor keeps per agent.

use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::store::is_safe_component;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Schema identifier embedded in every heartbeat file.
pub const HEARTBEAT_SCHEMA: &str = "dunning.agent_heartbeat.v1";

/// Maximum size of a heartbeat file accepted by reads.
pub const MAX_HEARTBEAT_FILE_SIZE: u64 = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from heartbeat and supervision operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HealthError {
    /// I/O failure.
    #[error("health I/O error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Heartbeat serialization failed.
    #[error("heartbeat serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Heartbeat file carries an unexpected schema.
    #[error("heartbeat schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch {
        /// The schema this build understands.
        expected: String,
        /// The schema found in the file.
        actual: String,
    },

    /// Heartbeat file exceeds [`MAX_HEARTBEAT_FILE_SIZE`].
    #[error("heartbeat file {path} exceeds the {limit}-byte limit")]
    Oversized {
        /// Path of the oversized file.
        path: String,
        /// The enforced limit.
        limit: u64,
    },

    /// Path is a symlink; reads refuse to follow it.
    #[error("refusing symlink at {path}")]
    SymlinkRefused {
        /// The offending path.
        path: String,
    },

    /// Path exists but is not a regular file.
    #[error("{path} is not a regular file")]
    NotRegularFile {
        /// The offending path.
        path: String,
    },

    /// Agent name failed validation.
    #[error("invalid agent name {name:?}")]
    InvalidAgentName {
        /// The rejected name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Heartbeat file
// ---------------------------------------------------------------------------

/// Liveness file an agent rewrites every work cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentHeartbeatV1 {
    /// Always [`HEARTBEAT_SCHEMA`].
    pub schema: String,
    /// Name of the writing agent.
    pub agent: String,
    /// Process id of the writer.
    pub pid: u32,
    /// When the heartbeat was written.
    pub written_at: DateTime<Utc>,
    /// Work cycles completed since the agent started.
    pub cycle_count: u64,
}

impl AgentHeartbeatV1 {
    /// A heartbeat for the current process, stamped now.
    #[must_use]
    pub fn new(agent: &str, cycle_count: u64) -> Self {
        Self {
            schema: HEARTBEAT_SCHEMA.to_string(),
            agent: agent.to_string(),
            pid: std::process::id(),
            written_at: Utc::now(),
            cycle_count,
        }
    }
}

/// Path of an agent's heartbeat file.
#[must_use]
pub fn heartbeat_path(dir: &Path, agent: &str) -> PathBuf {
    dir.join(format!("{agent}.json"))
}

/// Path of an agent's check-history log.
#[must_use]
pub fn history_path(dir: &Path, agent: &str) -> PathBuf {
    dir.join(format!("{agent}.log"))
}

/// Write (atomically replace) an agent's heartbeat file.
///
/// # Errors
///
/// Returns [`HealthError`] on invalid names or I/O failures.
pub fn write_heartbeat(
    dir: &Path,
    agent: &str,
    cycle_count: u64,
) -> Result<AgentHeartbeatV1, HealthError> {
    validate_agent_name(agent)?;
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

    let heartbeat = AgentHeartbeatV1::new(agent, cycle_count);
    let bytes = serde_json::to_vec_pretty(&heartbeat)?;
    let path = heartbeat_path(dir, agent);

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| io_error(dir, e))?;
    temp.as_file_mut()
        .write_all(&bytes)
        .map_err(|e| io_error(temp.path(), e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| io_error(temp.path(), e))?;
    temp.persist(&path).map_err(|e| io_error(&path, e.error))?;
    Ok(heartbeat)
}

/// Read an agent's heartbeat file.
///
/// # Errors
///
/// Returns [`HealthError`] for unsafe names, oversized files,
/// symlinks, parse failures, or schema mismatches. A missing file is
/// `Ok(None)`.
pub fn read_heartbeat(dir: &Path, agent: &str) -> Result<Option<AgentHeartbeatV1>, HealthError> {
    validate_agent_name(agent)?;
    let path = heartbeat_path(dir, agent);
    let Some(bytes) = read_bounded(&path)? else {
        return Ok(None);
    };
    let heartbeat: AgentHeartbeatV1 = serde_json::from_slice(&bytes)?;
    if heartbeat.schema != HEARTBEAT_SCHEMA {
        return Err(HealthError::SchemaMismatch {
            expected: HEARTBEAT_SCHEMA.to_string(),
            actual: heartbeat.schema,
        });
    }
    Ok(Some(heartbeat))
}

// ---------------------------------------------------------------------------
// Check history
// ---------------------------------------------------------------------------

/// One monitor check, as recorded in the per-agent history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatCheckEntry {
    /// When the monitor ran the check.
    pub checked_at: DateTime<Utc>,
    /// Whether the heartbeat was stale at that check.
    pub stale: bool,
}

/// Append one check result to an agent's history log.
///
/// # Errors
///
/// Returns [`HealthError`] on invalid names or I/O failures.
pub fn append_check_entry(
    dir: &Path,
    agent: &str,
    stale: bool,
) -> Result<HeartbeatCheckEntry, HealthError> {
    validate_agent_name(agent)?;
    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;

    let entry = HeartbeatCheckEntry {
        checked_at: Utc::now(),
        stale,
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');

    let path = history_path(dir, agent);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| io_error(&path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| io_error(&path, e))?;
    file.sync_all().map_err(|e| io_error(&path, e))?;
    Ok(entry)
}

/// The last `limit` check entries for an agent, oldest first.
/// Malformed lines are skipped with a warning.
///
/// # Errors
///
/// Returns [`HealthError`] on invalid names or I/O failures. A
/// missing history is empty.
pub fn recent_check_entries(
    dir: &Path,
    agent: &str,
    limit: usize,
) -> Result<Vec<HeartbeatCheckEntry>, HealthError> {
    validate_agent_name(agent)?;
    let path = history_path(dir, agent);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(&path, e)),
    };

    let mut entries = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<HeartbeatCheckEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(agent, line = index + 1, error = %e, "skipping malformed history line");
            },
        }
    }
    if entries.len() > limit {
        entries.drain(..entries.len() - limit);
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_agent_name(agent: &str) -> Result<(), HealthError> {
    if is_safe_component(agent) {
        Ok(())
    } else {
        Err(HealthError::InvalidAgentName {
            name: agent.to_string(),
        })
    }
}

fn io_error(path: &Path, source: std::io::Error) -> HealthError {
    HealthError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn read_bounded(path: &Path) -> Result<Option<Vec<u8>>, HealthError> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, e)),
    };
    if metadata.file_type().is_symlink() {
        return Err(HealthError::SymlinkRefused {
            path: path.display().to_string(),
        });
    }
    if !metadata.is_file() {
        return Err(HealthError::NotRegularFile {
            path: path.display().to_string(),
        });
    }

    let file = std::fs::File::open(path).map_err(|e| io_error(path, e))?;
    let mut bytes = Vec::new();
    file.take(MAX_HEARTBEAT_FILE_SIZE + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| io_error(path, e))?;
    if bytes.len() as u64 > MAX_HEARTBEAT_FILE_SIZE {
        return Err(HealthError::Oversized {
            path: path.display().to_string(),
            limit: MAX_HEARTBEAT_FILE_SIZE,
        });
    }
    Ok(Some(bytes))
}
