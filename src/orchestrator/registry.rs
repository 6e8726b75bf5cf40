//! In-memory registry records for active services.
//!
//! One [`ServiceRecord`] exists per logical service id. The orchestrator
//! owns all records exclusively; runtime providers and the job channel
//! never touch them.

use crate::channel::ServiceClient;
use crate::runtime::{RuntimeProvider, ServiceHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of one service record.
///
/// ```text
/// (absent) ──► Starting ──► Running ──► ShuttingDown ──► (deleted)
///                  │            │             │
///                  └────────────┴─────────────┴──► Zombie
/// ```
///
/// `Zombie` is terminal for the record instance, but a later start request
/// for the same id supersedes the record with a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Starting,
    Running,
    ShuttingDown,
    Zombie,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::ShuttingDown => write!(f, "shutting-down"),
            ServiceState::Zombie => write!(f, "zombie"),
        }
    }
}

/// Per-user job phase counters, kept for debugging multi-user runs.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UserCounters {
    pub pre_comp: u64,
    pub comp: u64,
    pub post_comp: u64,
}

/// Everything the orchestrator knows about one active service.
pub struct ServiceRecord {
    pub state: ServiceState,
    /// Host port, assigned at first launch and stable for the record's
    /// lifetime (bind-conflict retries during a launch are the one
    /// exception).
    pub port: u16,
    /// Backend handle, present once the workload is launched.
    pub handle: Option<ServiceHandle>,
    /// Job-channel client handed to callers.
    pub client: Option<ServiceClient>,
    /// The provider that launched this workload; teardown and inspection
    /// go through the same one even if the active provider changes later.
    pub runtime: Option<Arc<dyn RuntimeProvider>>,
    /// Callers currently depending on this service.
    pub users: HashMap<String, UserCounters>,
    /// Last fatal error; set only in the `Zombie` state.
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    /// Fresh record with no users yet, in the `Starting` state.
    pub fn empty() -> Self {
        Self {
            state: ServiceState::Starting,
            port: 0,
            handle: None,
            client: None,
            runtime: None,
            users: HashMap::new(),
            error: None,
            started_at: None,
        }
    }

    /// Fresh record for a first caller, in the `Starting` state.
    pub fn new(user_id: &str) -> Self {
        let mut record = Self::empty();
        record.add_user(user_id);
        record
    }

    /// Register a caller; existing registrations keep their counters.
    pub fn add_user(&mut self, user_id: &str) {
        self.users
            .entry(user_id.to_string())
            .or_insert_with(UserCounters::default);
    }

    /// Remove a caller. Returns true if no users remain.
    pub fn remove_user(&mut self, user_id: &str) -> bool {
        self.users.remove(user_id);
        self.users.is_empty()
    }
}

/// Point-in-time copy of a record, safe to hand outside the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub state: ServiceState,
    pub port: u16,
    pub users: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<&ServiceRecord> for ServiceSnapshot {
    fn from(record: &ServiceRecord) -> Self {
        let mut users: Vec<String> = record.users.keys().cloned().collect();
        users.sort();
        Self {
            state: record.state,
            port: record.port,
            users,
            error: record.error.clone(),
            started_at: record.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_registers_first_user() {
        let record = ServiceRecord::new("user-a");
        assert_eq!(record.state, ServiceState::Starting);
        assert!(record.users.contains_key("user-a"));
        assert!(record.handle.is_none());
    }

    #[test]
    fn remove_user_reports_emptiness() {
        let mut record = ServiceRecord::new("user-a");
        record.add_user("user-b");
        assert!(!record.remove_user("user-a"));
        assert!(record.remove_user("user-b"));
    }

    #[test]
    fn add_user_is_idempotent() {
        let mut record = ServiceRecord::new("user-a");
        record.users.get_mut("user-a").unwrap().comp = 3;
        record.add_user("user-a");
        assert_eq!(record.users["user-a"].comp, 3);
        assert_eq!(record.users.len(), 1);
    }

    #[test]
    fn state_display_matches_wire_names() {
        assert_eq!(ServiceState::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(ServiceState::Zombie.to_string(), "zombie");
    }
}
