//! Call lifecycle states.
//!
//! ```text
//! RECEIVED          → EXTRACTING          first frame available
//! EXTRACTING        → AWAITING_DECISION   security context built
//! AWAITING_DECISION → FORWARDING          approved
//! AWAITING_DECISION → REJECTED            denied or rate limited
//! FORWARDING        → COMPLETED           backend stream closed normally
//! any non-terminal  → FAILED              oracle/backend failure, cancel, deadline
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Received,
    Extracting,
    AwaitingDecision,
    Forwarding,
    Completed,
    Rejected,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Rejected | CallState::Failed)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Received, Extracting)
            | (Extracting, AwaitingDecision)
            | (AwaitingDecision, Forwarding)
            | (AwaitingDecision, Rejected)
            | (Forwarding, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Received => "received",
            CallState::Extracting => "extracting",
            CallState::AwaitingDecision => "awaiting_decision",
            CallState::Forwarding => "forwarding",
            CallState::Completed => "completed",
            CallState::Rejected => "rejected",
            CallState::Failed => "failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
