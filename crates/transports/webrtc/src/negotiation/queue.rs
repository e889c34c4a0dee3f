//! Pending ICE candidates

use crate::signaling::IceCandidate;
use std::collections::VecDeque;

/// Result of handing a candidate to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateAction {
    /// Held until the remote description is applied
    Deferred,
    /// Remote description present, apply now
    ApplyNow(IceCandidate),
}

/// Remote candidates that arrived before the remote description
///
/// Drained exactly once, in receipt order, when the remote description is
/// applied; afterwards every candidate passes straight through.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
    ready: bool,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) -> CandidateAction {
        if self.ready {
            CandidateAction::ApplyNow(candidate)
        } else {
            self.pending.push_back(candidate);
            CandidateAction::Deferred
        }
    }

    /// Mark the remote description as applied and take the queued candidates
    ///
    /// Only the first call returns anything.
    pub fn drain_ready(&mut self) -> Vec<IceCandidate> {
        self.ready = true;
        self.pending.drain(..).collect()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
