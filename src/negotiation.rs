//! Per-peer offer/answer/ICE state machine.
//!
//! Offering side: `Idle -> LocalOfferPending -> LocalOfferSet -> RemoteAnswerApplied`.
//! Answering side: `Idle -> RemoteOfferApplied -> LocalAnswerSet`.
//! `RemoteAnswerApplied` and `LocalAnswerSet` are stable; a renegotiation re-enters
//! `LocalOfferPending` from stable. `Failed` is terminal.
//!
//! This type holds no transport handle. The peer connection manager performs the
//! description work and reports each step back here.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    Idle,
    LocalOfferPending,
    LocalOfferSet,
    RemoteAnswerApplied,
    RemoteOfferApplied,
    LocalAnswerSet,
    Failed,
}

impl NegotiationState {
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            NegotiationState::RemoteAnswerApplied | NegotiationState::LocalAnswerSet
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LocalOfferPending => "local-offer-pending",
            NegotiationState::LocalOfferSet => "local-offer-set",
            NegotiationState::RemoteAnswerApplied => "remote-answer-applied",
            NegotiationState::RemoteOfferApplied => "remote-offer-applied",
            NegotiationState::LocalAnswerSet => "local-answer-set",
            NegotiationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How to treat an offer that arrives for an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept,
    /// Both sides offered at once and the local side loses the tie-break: drop the
    /// local entry and answer as a fresh answerer.
    Yield,
    /// Both sides offered at once and the local side wins: drop the remote offer.
    Ignore,
}

#[derive(Debug)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// Set after a colliding remote offer was ignored. Remote candidates seen before
    /// the answer belong to the connection the remote side is closing.
    stale_remote_candidates: bool,
    follow_up: bool,
    completed_cycles: u32,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            stale_remote_candidates: false,
            follow_up: false,
            completed_cycles: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_stable(&self) -> bool {
        self.state.is_stable()
    }

    /// Idle or stable: nothing is in flight.
    pub fn is_settled(&self) -> bool {
        self.state == NegotiationState::Idle || self.is_stable()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn follow_up_queued(&self) -> bool {
        self.follow_up
    }

    /// Number of offer/answer exchanges that reached a stable state.
    pub fn completed_cycles(&self) -> u32 {
        self.completed_cycles
    }

    /// Enters `LocalOfferPending`.
    ///
    /// Only the offering side may do this, and only when settled. A request while a
    /// negotiation is in flight is rejected with [`Error::NegotiationBusy`] and folded
    /// into a single follow-up negotiation.
    pub fn begin_local_offer(&mut self, peer_id: &str) -> Result<()> {
        if self.role != Role::Offerer {
            return Err(Error::negotiation(peer_id, "answering side cannot start an offer"));
        }
        match self.state {
            NegotiationState::Failed => Err(Error::negotiation(peer_id, "negotiation already failed")),
            state if state == NegotiationState::Idle || state.is_stable() => {
                self.state = NegotiationState::LocalOfferPending;
                Ok(())
            }
            _ => {
                self.follow_up = true;
                Err(Error::NegotiationBusy(peer_id.to_string()))
            }
        }
    }

    pub fn local_offer_set(&mut self) {
        self.state = NegotiationState::LocalOfferSet;
    }

    /// Decides what to do with a remote offer. `local_id` and `remote_id` break ties
    /// when both sides have an offer outstanding; the smaller id yields.
    pub fn offer_decision(&self, local_id: &str, remote_id: &str) -> OfferDecision {
        match self.state {
            NegotiationState::LocalOfferPending | NegotiationState::LocalOfferSet => {
                if local_id < remote_id {
                    OfferDecision::Yield
                } else {
                    OfferDecision::Ignore
                }
            }
            NegotiationState::RemoteOfferApplied | NegotiationState::Failed => OfferDecision::Ignore,
            _ => OfferDecision::Accept,
        }
    }

    pub fn remote_offer_applied(&mut self) {
        self.state = NegotiationState::RemoteOfferApplied;
        self.remote_description_set = true;
    }

    pub fn local_answer_set(&mut self) {
        self.state = NegotiationState::LocalAnswerSet;
        self.completed_cycles += 1;
    }

    /// Answers are only meaningful while our offer is outstanding.
    pub fn accepts_answer(&self) -> bool {
        self.state == NegotiationState::LocalOfferSet
    }

    pub fn remote_answer_applied(&mut self) {
        self.state = NegotiationState::RemoteAnswerApplied;
        self.remote_description_set = true;
        self.stale_remote_candidates = false;
        self.completed_cycles += 1;
    }

    /// Records that a colliding remote offer was ignored. Queued candidates are
    /// dropped, and so is every candidate that arrives before the answer.
    ///
    /// Returns how many queued candidates were dropped. No-op unless our own offer
    /// is outstanding.
    pub fn remote_offer_ignored(&mut self) -> usize {
        if !matches!(
            self.state,
            NegotiationState::LocalOfferPending | NegotiationState::LocalOfferSet
        ) {
            return 0;
        }
        self.stale_remote_candidates = true;
        let dropped = self.pending_candidates.len();
        self.pending_candidates.clear();
        dropped
    }

    pub fn discards_remote_candidates(&self) -> bool {
        self.stale_remote_candidates
    }

    /// Queues `candidate` until a remote description exists. Returns it back when it
    /// can be applied right away.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.stale_remote_candidates {
            return None;
        }
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_candidates.push_back(candidate);
            None
        }
    }

    /// Drains queued candidates in receipt order.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_candidates.drain(..).collect()
    }

    pub fn request_follow_up(&mut self) {
        self.follow_up = true;
    }

    /// Returns true once, when a coalesced follow-up is due.
    pub fn take_follow_up(&mut self) -> bool {
        if self.follow_up && self.is_stable() {
            self.follow_up = false;
            true
        } else {
            false
        }
    }

    pub fn fail(&mut self) {
        self.state = NegotiationState::Failed;
        self.pending_candidates.clear();
        self.follow_up = false;
    }
}
