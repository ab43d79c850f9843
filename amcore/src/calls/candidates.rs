//! Ordering and de-duplication of remote network-path candidates.
//!
//! Offer/answer and candidates travel over independent feeds, so a remote
//! candidate can arrive before the description it belongs to has been set
//! locally. Such candidates wait here until the description is applied.

use std::collections::{HashSet, VecDeque};

use log::debug;

use super::error::ProtocolError;
use crate::types::{CandidateRecord, IceCandidate, RecordId, UserId};

/// Outcome of offering a remote candidate to the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Remote description is in place; apply this candidate now.
    Apply(IceCandidate),
    /// Queued until the remote description is applied.
    Buffered,
    /// Already applied or already queued.
    Duplicate,
    /// Authored by the local user.
    Own,
}

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    remote_description_applied: bool,
    pending: VecDeque<(RecordId, IceCandidate)>,
    pending_ids: HashSet<RecordId>,
    applied: HashSet<RecordId>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn applied_len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_applied(&self, id: RecordId) -> bool {
        self.applied.contains(&id)
    }

    pub fn admit(&mut self, record: &CandidateRecord, self_id: &UserId) -> Admission {
        if &record.author_id == self_id {
            return Admission::Own;
        }
        let id = record.record_id;
        if self.applied.contains(&id) || self.pending_ids.contains(&id) {
            debug!("Dropping redelivered candidate {id}");
            return Admission::Duplicate;
        }
        if self.remote_description_applied {
            self.applied.insert(id);
            Admission::Apply(record.candidate.clone())
        } else {
            self.pending_ids.insert(id);
            self.pending.push_back((id, record.candidate.clone()));
            Admission::Buffered
        }
    }

    /// Marks the remote description as applied and drains the queue, in
    /// arrival order. Only valid once per call attempt.
    pub fn flush(&mut self) -> Result<Vec<(RecordId, IceCandidate)>, ProtocolError> {
        if self.remote_description_applied {
            return Err(ProtocolError::DuplicateRemoteDescription);
        }
        self.remote_description_applied = true;
        self.pending_ids.clear();
        let drained: Vec<_> = self.pending.drain(..).collect();
        self.applied.extend(drained.iter().map(|(id, _)| *id));
        Ok(drained)
    }

    pub fn clear(&mut self) {
        self.remote_description_applied = false;
        self.pending.clear();
        self.pending_ids.clear();
        self.applied.clear();
    }
}
