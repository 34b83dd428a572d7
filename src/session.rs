//! Session lifecycle types
//!
//! A session is the unit of trace chaining and of agent identity. It moves
//! `created -> active -> ended`; only active sessions accept event emissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered but not yet accepting events
    Created,
    /// Accepting events
    Active,
    /// Terminal; rejects further emissions
    Ended,
}

/// Session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier
    pub session_id: String,

    /// Agent that owns this session
    pub agent_id: String,

    /// Initial goal, if stated at session start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Trace that collects this session's events
    pub trace_id: String,

    /// Lifecycle state
    pub state: SessionState,

    /// When the session was created
    pub created_at: DateTime<Utc>,

    /// When the session ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Resolutions issued in this session
    pub resolution_count: u64,

    /// Actions executed in this session
    pub action_count: u64,
}

impl SessionInfo {
    /// Create a session in the `Created` state
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        trace_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            goal: None,
            trace_id: trace_id.into(),
            state: SessionState::Created,
            created_at,
            ended_at: None,
            resolution_count: 0,
            action_count: 0,
        }
    }

    /// Set the initial goal
    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    /// Transition `created -> active`; no-op otherwise
    pub fn activate(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
    }

    /// Transition to `ended`; returns `false` if already ended
    pub fn end(&mut self, ended_at: DateTime<Utc>) -> bool {
        if self.state == SessionState::Ended {
            return false;
        }
        self.state = SessionState::Ended;
        self.ended_at = Some(ended_at);
        true
    }

    /// Whether the session accepts event emissions
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Session duration in milliseconds, up to `now` for open sessions
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.created_at).num_milliseconds()
    }
}

/// Partial update applied by `StorageAdapter::update_session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    /// New lifecycle state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,

    /// End timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// New resolution count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_count: Option<u64>,

    /// New action count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_count: Option<u64>,
}

impl SessionPatch {
    /// Apply this patch to a session record
    pub fn apply(&self, session: &mut SessionInfo) {
        if let Some(state) = self.state {
            session.state = state;
        }
        if let Some(ended_at) = self.ended_at {
            session.ended_at = Some(ended_at);
        }
        if let Some(count) = self.resolution_count {
            session.resolution_count = count;
        }
        if let Some(count) = self.action_count {
            session.action_count = count;
        }
    }
}

/// Filter for `StorageAdapter::list_sessions`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Restrict to one agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Restrict to one state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,

    /// Restrict to sessions created at or after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
}

impl SessionFilter {
    /// Whether `session` passes this filter
    pub fn matches(&self, session: &SessionInfo) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if &session.agent_id != agent_id {
                return false;
            }
        }
        if let Some(state) = self.state {
            if session.state != state {
                return false;
            }
        }
        if let Some(created_after) = self.created_after {
            if session.created_at < created_after {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_lifecycle() {
        let mut session = SessionInfo::new("session-1", "agent-1", "trace-1", instant(0));
        assert_eq!(session.state, SessionState::Created);
        assert!(!session.is_active());

        session.activate();
        assert!(session.is_active());

        assert!(session.end(instant(10)));
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.duration_ms(instant(99)), 10_000);

        // Ending twice is rejected
        assert!(!session.end(instant(20)));
        assert_eq!(session.ended_at, Some(instant(10)));
    }

    #[test]
    fn test_patch() {
        let mut session = SessionInfo::new("session-1", "agent-1", "trace-1", instant(0));
        session.activate();

        let patch = SessionPatch {
            state: Some(SessionState::Ended),
            ended_at: Some(instant(5)),
            resolution_count: Some(3),
            action_count: None,
        };
        patch.apply(&mut session);

        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.resolution_count, 3);
        assert_eq!(session.action_count, 0);
    }

    #[test]
    fn test_filter() {
        let mut session = SessionInfo::new("session-1", "agent-1", "trace-1", instant(0));
        session.activate();

        let filter = SessionFilter {
            agent_id: Some("agent-1".to_string()),
            state: Some(SessionState::Active),
            created_after: None,
        };
        assert!(filter.matches(&session));

        let filter = SessionFilter {
            agent_id: Some("agent-2".to_string()),
            ..SessionFilter::default()
        };
        assert!(!filter.matches(&session));
    }
}
