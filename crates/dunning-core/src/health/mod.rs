//! Agent liveness: heartbeat files, check history, and the
//! supervision monitor.
//!
//! Every long-running agent in the suite rewrites a small heartbeat
//! file each work cycle. The monitor reads those files on a schedule
//! and walks each agent through a state machine: fresh heartbeats are
//! healthy; a stale or unreadable heartbeat gets a restart request;
//! enough consecutive stale checks escalate to a human.
//!
//! # File Format
//!
//! `<heartbeat_dir>/<agent>.json`, atomically replaced each cycle:
//!
//! ```json
//! {
//!   "schema": "dunning.agent_heartbeat.v1",
//!   "agent": "email_parser",
//!   "pid": 41267,
//!   "written_at": "2026-02-01T09:30:00Z",
//!   "cycle_count": 5521
//! }
//! ```
//!
//! The monitor appends one JSONL entry per check to
//! `<heartbeat_dir>/<agent>.log`; that history is what escalation
//! decisions are made from, so they survive a monitor restart.
//!
//! # Invariants
//!
//! - [INV-HLT-001] A heartbeat that cannot be read for any reason is
//!   a stale check with a recorded reason, never a skipped check.
//! - [INV-HLT-002] Each escalation episode notifies the operator
//!   exactly once; a fresh heartbeat ends the episode and re-arms the
//!   notification.

mod heartbeat;
mod monitor;


pub use heartbeat::{
    AgentHeartbeatV1, HEARTBEAT_SCHEMA, HealthError, HeartbeatCheckEntry,
    MAX_HEARTBEAT_FILE_SIZE, append_check_entry, heartbeat_path, history_path,
    read_heartbeat, recent_check_entries, write_heartbeat,
};
pub use monitor::{
    AgentHealth, AgentState, HeartbeatMonitor, OperatorNotifier, ProcessControl,
    RECENT_ERRORS_CAP, RestartRequestLog, TracingNotifier,
};
