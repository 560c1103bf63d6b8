//! Candidate buffering.

use std::collections::VecDeque;

/// Serialized `RTCIceCandidateInit` JSON. Opaque outside the peer adapter.
pub type Candidate = String;

/// FIFO buffer for candidates that cannot be used yet.
///
/// Outbound local candidates wait here until the remote description is
/// acknowledged; inbound remote candidates wait until it has been applied.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    items: VecDeque<Candidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: Candidate) {
        self.items.push_back(candidate);
    }

    /// Take every queued candidate in insertion order, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Candidate> {
        self.items.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
