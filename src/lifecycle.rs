//! Status transitions for session requests.
//!
//! ```text
//! PENDING  --assign--> ASSIGNED --approve--> APPROVED --complete--> COMPLETED
//!    |                  |   ^                   |
//!    |                  +---+ (reassign)        |
//!    +--reject--> REJECTED                      |
//!    +--cancel--> CANCELLED <--cancel-----------+ (also from ASSIGNED)
//! ```

use std::fmt;

use crate::models::RequestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Assign,
    Approve,
    Reject,
    Cancel,
    Complete,
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestAction::Assign => "assign",
            RequestAction::Approve => "approve",
            RequestAction::Reject => "reject",
            RequestAction::Cancel => "cancel",
            RequestAction::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} a session request that is {from:?}")]
pub struct TransitionError {
    pub from: RequestStatus,
    pub action: RequestAction,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Rejected | RequestStatus::Cancelled | RequestStatus::Completed
        )
    }

    /// Status reached by applying `action`, or an error if the pair is not allowed.
    pub fn apply(self, action: RequestAction) -> Result<RequestStatus, TransitionError> {
        use RequestAction::*;
        use RequestStatus::*;

        let next = match (self, action) {
            (Pending, Assign) | (Assigned, Assign) => Some(Assigned),
            (Pending, Reject) => Some(Rejected),
            (Assigned, Approve) => Some(Approved),
            (Pending, Cancel) | (Assigned, Cancel) | (Approved, Cancel) => Some(Cancelled),
            (Approved, Complete) => Some(Completed),
            _ => None,
        };
        next.ok_or(TransitionError { from: self, action })
    }
}

impl RequestAction {
    /// Transitions into these states put the request on a calendar.
    pub fn publishes_event(self) -> bool {
        matches!(self, RequestAction::Assign | RequestAction::Approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestAction::*;
    use RequestStatus::*;

    #[test]
    fn happy_path_reaches_completed() {
        let status = Pending.apply(Assign).unwrap();
        let status = status.apply(Approve).unwrap();
        let status = status.apply(Complete).unwrap();
        assert_eq!(status, Completed);
    }

    #[test]
    fn assigned_requests_can_be_reassigned() {
        assert_eq!(Assigned.apply(Assign), Ok(Assigned));
    }

    #[test]
    fn cancel_allowed_until_terminal() {
        for from in [Pending, Assigned, Approved] {
            assert_eq!(from.apply(Cancel), Ok(Cancelled));
        }
    }

    #[test]
    fn terminal_states_reject_every_action() {
        for from in [Rejected, Cancelled, Completed] {
            assert!(from.is_terminal());
            for action in [Assign, Approve, Reject, Cancel, Complete] {
                assert_eq!(from.apply(action), Err(TransitionError { from, action }));
            }
        }
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(Pending.apply(Approve).is_err());
        assert!(Pending.apply(Complete).is_err());
        assert!(Assigned.apply(Complete).is_err());
        assert!(Assigned.apply(Reject).is_err());
        assert!(Approved.apply(Assign).is_err());
    }

    #[test]
    fn error_message_names_action_and_state() {
        let err = Completed.apply(Cancel).unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot cancel a session request that is Completed"
        );
    }

    #[test]
    fn only_assign_and_approve_publish_events() {
        assert!(Assign.publishes_event());
        assert!(Approve.publishes_event());
        assert!(!Reject.publishes_event());
        assert!(!Cancel.publishes_event());
        assert!(!Complete.publishes_event());
    }
}
