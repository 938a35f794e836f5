//! Events merged by the coordinator and its state machine.

use tracing::debug;

use crate::error::StreamError;
use crate::progress::ProgressSnapshot;

/// Everything the producers can report to the merge point.
#[derive(Debug)]
pub enum ExecutionEvent {
    /// HTTP status of the primary request.
    Status(u16),
    /// One unit (line) of result data, verbatim.
    Data(Vec<u8>),
    /// A progress reading.
    Progress(ProgressSnapshot),
    /// Fatal producer failure.
    Error(StreamError),
    /// End of the result stream.
    End,
}

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Starting,
    Running,
    Completing,
    Cancelling,
    Terminated,
}

impl ExecutionState {
    /// Whether `next` may follow `self`.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Terminated)
                | (Running, Completing)
                | (Running, Cancelling)
                | (Running, Terminated)
                | (Completing, Terminated)
                | (Cancelling, Terminated)
        )
    }
}

/// Tracks the current state of an execution.
#[derive(Debug)]
pub(crate) struct StateMachine {
    query_id: String,
    state: ExecutionState,
}

impl StateMachine {
    pub(crate) fn new(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            state: ExecutionState::Starting,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ExecutionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: ExecutionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(query_id = %self.query_id, from = ?self.state, to = ?next, "execution state");
        self.state = next;
    }
}
