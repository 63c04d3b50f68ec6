//! Action lifecycle state machine with validated transitions.
//!
//! ```text
//! pending -> ready -> executing -> executed
//!    |         |          `-----> failed
//!    |         |-> failed   (authorization revoked)
//!    |         `-> expired  (held by pause too long)
//!    |-> undone
//!    `-> expired
//! ```

use deputy_core::types::ActionState;

use crate::error::TransitionError;

/// Validate that a state transition is an edge of the lifecycle graph.
pub fn validate_transition(from: ActionState, to: ActionState) -> Result<(), TransitionError> {
    if is_edge(from, to) {
        Ok(())
    } else {
        Err(TransitionError::InvalidTransition(from, to))
    }
}

pub fn is_edge(from: ActionState, to: ActionState) -> bool {
    matches!(
        (from, to),
        (ActionState::Pending, ActionState::Ready)
            | (ActionState::Pending, ActionState::Undone)
            | (ActionState::Pending, ActionState::Expired)
            | (ActionState::Ready, ActionState::Executing)
            | (ActionState::Ready, ActionState::Failed)
            | (ActionState::Ready, ActionState::Expired)
            | (ActionState::Executing, ActionState::Executed)
            | (ActionState::Executing, ActionState::Failed)
    )
}
