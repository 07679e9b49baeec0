//! # Change Participants
//!
//! Observers that see every committed content change of every document,
//! after the transaction that produced it has closed (and after each undo
//! or redo).
//!
//! Participants run in registration order and cannot mutate the model from
//! inside the callback; follow-up edits go through a new transaction.

use crate::tracker::Patch;
use crate::undo_redo::ContentChangedEvent;
use canvas_common::Scope;

/// What a participant is told about one document's change
#[derive(Debug, Clone, Copy)]
pub struct ModelChange<'a> {
    pub scope: &'a Scope,
    pub event: &'a ContentChangedEvent,
    /// Patches of the commit; empty for undo/redo
    pub patches: &'a [Patch],
}

pub trait ChangeParticipant {
    fn participate(&mut self, change: &ModelChange<'_>);
}

impl<F> ChangeParticipant for F
where
    F: FnMut(&ModelChange<'_>),
{
    fn participate(&mut self, change: &ModelChange<'_>) {
        self(change)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId(u64);

/// Registered participants, notified in order
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: Vec<(ParticipantId, Box<dyn ChangeParticipant>)>,
    next_id: u64,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, participant: Box<dyn ChangeParticipant>) -> ParticipantId {
        let id = ParticipantId(self.next_id);
        self.next_id += 1;
        self.participants.push((id, participant));
        id
    }

    pub fn remove(&mut self, id: ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|(participant_id, _)| *participant_id != id);
        self.participants.len() != before
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn notify(&mut self, change: &ModelChange<'_>) {
        for (_, participant) in self.participants.iter_mut() {
            participant.participate(change);
        }
    }
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistry")
            .field("participants", &self.participants.len())
            .finish()
    }
}
